use thiserror::Error;

use crate::message::{Message, status};

/// Error taxonomy shared by the host and the pub/sub fabric.
///
/// Every variant maps to exactly one surface status; the full detail is
/// recorded to the log while [`CoreError::response`] keeps the wire minimal.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("not authorized: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method '{verb}' not allowed")]
    MethodNotAllowed { verb: String, allow: Vec<String> },

    #[error("conflict with existing resource at {location}")]
    Conflict { location: String },

    #[error("submitted version is older than the stored version")]
    VersionStale,

    #[error("request '{0}' exceeded the reentrancy limit")]
    Reentrancy(String),

    #[error("call to '{0}' timed out")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(location: impl Into<String>) -> Self {
        Self::Conflict {
            location: location.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn timeout(target: impl Into<String>) -> Self {
        Self::Timeout(target.into())
    }

    /// The status this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            Self::Input(_) | Self::Json(_) => status::BAD_REQUEST,
            Self::Auth(_) => status::FORBIDDEN,
            Self::NotFound(_) => status::NOT_FOUND,
            Self::MethodNotAllowed { .. } => status::METHOD_NOT_ALLOWED,
            Self::Conflict { .. } => status::CONFLICT,
            Self::VersionStale => status::NOT_MODIFIED,
            Self::Reentrancy(_) => status::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => status::GATEWAY_TIMEOUT,
            Self::Internal(_) | Self::Io(_) => status::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Convert into a reply message, attaching the headers the status
    /// requires (`Allow` on 405, `Content-Location` on 409).
    pub fn response(&self) -> Message {
        match self {
            Self::MethodNotAllowed { verb, allow } => {
                let mut msg =
                    Message::error(status::METHOD_NOT_ALLOWED, &format!("method '{verb}' not allowed"));
                msg.headers.set(crate::headers::ALLOW, allow.join(", "));
                msg
            }
            Self::Conflict { location } => {
                let mut msg = Message::error(status::CONFLICT, "conflict with existing resource");
                msg.headers.set(crate::headers::CONTENT_LOCATION, location);
                msg
            }
            Self::VersionStale => Message::with_status(status::NOT_MODIFIED),
            Self::Internal(_) | Self::Io(_) => {
                // Detail stays in the log.
                Message::error(status::INTERNAL_SERVER_ERROR, "internal error")
            }
            other => Message::error(other.status(), &other.to_string()),
        }
    }
}

/// Convenience result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(CoreError::input("x").status(), 400);
        assert_eq!(CoreError::auth("x").status(), 403);
        assert_eq!(CoreError::not_found("x").status(), 404);
        assert_eq!(CoreError::conflict("http://x").status(), 409);
        assert_eq!(CoreError::VersionStale.status(), 304);
        assert_eq!(CoreError::Reentrancy("id".into()).status(), 503);
        assert_eq!(CoreError::timeout("http://x").status(), 504);
        assert_eq!(CoreError::internal("x").status(), 500);
    }

    #[test]
    fn method_not_allowed_carries_allow_header() {
        let err = CoreError::MethodNotAllowed {
            verb: "PATCH".into(),
            allow: vec!["GET".into(), "POST".into()],
        };
        let msg = err.response();
        assert_eq!(msg.status, 405);
        assert_eq!(msg.headers.get(crate::headers::ALLOW), Some("GET, POST"));
    }

    #[test]
    fn conflict_carries_content_location() {
        let msg = CoreError::conflict("http://host/subscribers/abc").response();
        assert_eq!(msg.status, 409);
        assert_eq!(
            msg.headers.get(crate::headers::CONTENT_LOCATION),
            Some("http://host/subscribers/abc")
        );
    }

    #[test]
    fn internal_error_hides_detail() {
        let msg = CoreError::internal("secret backtrace").response();
        let doc = msg.document().unwrap();
        assert_eq!(doc["error"]["reason"], "internal error");
    }
}

//! Messages exchanged between plugs, pipelines and services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::headers::{self, Headers};

/// Status codes the host and fabric surface. Plain `u16` so translated or
/// proxied statuses pass through unmodified.
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const ACCEPTED: u16 = 202;
    pub const NO_CONTENT: u16 = 204;
    pub const NOT_MODIFIED: u16 = 304;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

pub const MIME_JSON: &str = "application/json";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// A cookie carried on a message, ordered with its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The `access-key` cookie scoped to a subscription-set location.
    pub fn access_key(value: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("access-key", value).with_path(path)
    }
}

/// Message payload: a structured document, raw bytes, or nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Document(Value),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Known byte length of the payload, when one exists without encoding.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            Body::Document(_) => None,
        }
    }
}

/// Status + headers + body + cookies. Requests carry status `0`.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
    pub cookies: Vec<Cookie>,
}

impl Message {
    /// An empty request message.
    pub fn request() -> Self {
        Self::default()
    }

    /// A request carrying a structured document.
    pub fn request_document(doc: Value) -> Self {
        let mut msg = Self::default();
        msg.set_document(doc);
        msg
    }

    /// A request carrying raw bytes with the given content type.
    pub fn request_bytes(bytes: Vec<u8>, content_type: &str) -> Self {
        let mut msg = Self::default();
        msg.set_bytes(bytes, content_type);
        msg
    }

    /// 200 with no body.
    pub fn ok() -> Self {
        Self {
            status: status::OK,
            ..Self::default()
        }
    }

    /// 200 carrying a structured document.
    pub fn ok_document(doc: Value) -> Self {
        let mut msg = Self::ok();
        msg.set_document(doc);
        msg
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// An error reply with a minimal structured body. Detail beyond the
    /// reason string belongs in the log, not on the wire.
    pub fn error(status: u16, reason: &str) -> Self {
        let mut msg = Self::with_status(status);
        msg.set_document(serde_json::json!({
            "error": { "status": status, "reason": reason }
        }));
        msg
    }

    pub fn not_found(reason: &str) -> Self {
        Self::error(status::NOT_FOUND, reason)
    }

    pub fn forbidden(reason: &str) -> Self {
        Self::error(status::FORBIDDEN, reason)
    }

    pub fn bad_request(reason: &str) -> Self {
        Self::error(status::BAD_REQUEST, reason)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn set_document(&mut self, doc: Value) {
        self.body = Body::Document(doc);
        self.headers.set(headers::CONTENT_TYPE, MIME_JSON);
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>, content_type: &str) {
        self.headers.set(headers::CONTENT_LENGTH, bytes.len().to_string());
        self.headers.set(headers::CONTENT_TYPE, content_type);
        self.body = Body::Bytes(bytes);
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(headers::CONTENT_TYPE)
    }

    /// The structured document, if the body holds (or parses as) one.
    pub fn document(&self) -> Option<Value> {
        match &self.body {
            Body::Document(doc) => Some(doc.clone()),
            Body::Bytes(bytes)
                if self
                    .content_type()
                    .is_some_and(|ct| ct.starts_with(MIME_JSON)) =>
            {
                serde_json::from_slice(bytes).ok()
            }
            _ => None,
        }
    }

    /// The body as bytes; documents serialize to canonical JSON.
    pub fn bytes(&self) -> Vec<u8> {
        match &self.body {
            Body::Empty => Vec::new(),
            Body::Bytes(bytes) => bytes.clone(),
            Body::Document(doc) => serde_json::to_vec(doc).unwrap_or_default(),
        }
    }

    pub fn text(&self) -> Option<String> {
        match &self.body {
            Body::Empty => Some(String::new()),
            Body::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            Body::Document(doc) => Some(doc.to_string()),
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(headers::REQUEST_ID)
    }

    pub fn set_request_id(&mut self, id: &str) {
        self.headers.set(headers::REQUEST_ID, id);
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// Fluent header attachment for request construction.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.add_cookie(cookie);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_has_no_status() {
        let msg = Message::request();
        assert_eq!(msg.status, 0);
        assert!(!msg.is_success());
    }

    #[test]
    fn document_body_sets_content_type() {
        let msg = Message::ok_document(json!({"a": 1}));
        assert_eq!(msg.content_type(), Some(MIME_JSON));
        assert_eq!(msg.document(), Some(json!({"a": 1})));
    }

    #[test]
    fn bytes_with_json_content_type_parse_as_document() {
        let msg = Message::request_bytes(br#"{"x":"y"}"#.to_vec(), MIME_JSON);
        assert_eq!(msg.document(), Some(json!({"x": "y"})));
        assert_eq!(msg.headers.get(crate::headers::CONTENT_LENGTH), Some("9"));
    }

    #[test]
    fn error_body_carries_minimal_detail() {
        let msg = Message::error(status::NOT_FOUND, "no such feature");
        assert_eq!(msg.status, 404);
        let doc = msg.document().unwrap();
        assert_eq!(doc["error"]["reason"], "no such feature");
    }

    #[test]
    fn cookies_are_ordered_and_found_by_name() {
        let mut msg = Message::ok();
        msg.add_cookie(Cookie::new("a", "1"));
        msg.add_cookie(Cookie::access_key("s3cret", "/pubsub/subscribers/x"));
        let cookie = msg.cookie("access-key").unwrap();
        assert_eq!(cookie.value, "s3cret");
        assert_eq!(cookie.path.as_deref(), Some("/pubsub/subscribers/x"));
    }
}

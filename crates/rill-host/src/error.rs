use rill_core::{CoreError, Message};
use thiserror::Error;

/// Errors flowing through a feature pipeline.
///
/// `AbortedWithResponse` and `CachedResponse` are control sentinels, not
/// failures: the pipeline driver matches on them instead of translating.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Carries a canned response the pipeline forwards verbatim, skipping
    /// exception translation.
    #[error("aborted with canned response")]
    AbortedWithResponse(Message),

    /// Carries a response that bypasses every remaining stage.
    #[error("cached response")]
    CachedResponse(Message),
}

impl HostError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Core(CoreError::input(message))
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Core(CoreError::auth(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Core(CoreError::not_found(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Core(CoreError::internal(message))
    }

    pub fn conflict(location: impl Into<String>) -> Self {
        Self::Core(CoreError::conflict(location))
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(CoreError::Json(err))
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

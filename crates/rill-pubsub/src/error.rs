use rill_core::CoreError;
use rill_host::HostError;
use thiserror::Error;

/// Errors raised by the pub/sub fabric.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("subscription set is invalid: {0}")]
    InvalidSet(String),

    #[error("access key does not match")]
    AccessDenied,

    #[error("owner mismatch for subscription set")]
    OwnerMismatch,

    #[error("no subscription set at '{0}'")]
    SetNotFound(String),

    #[error("owner already has a set at '{0}'")]
    DuplicateOwner(String),

    #[error("submitted set version is older than the stored version")]
    StaleVersion,

    #[error("event already passed through this dispatcher")]
    LoopDetected,

    #[error("queue record version {0} is not supported")]
    UnsupportedRecordVersion(u8),

    #[error("corrupt queue record: {0}")]
    CorruptRecord(String),

    #[error("queue storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PubSubError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSet(message.into())
    }
}

impl From<PubSubError> for HostError {
    fn from(err: PubSubError) -> Self {
        match err {
            PubSubError::InvalidSet(m) => HostError::input(m),
            PubSubError::AccessDenied => HostError::auth("access key does not match"),
            PubSubError::OwnerMismatch => HostError::auth("owner mismatch"),
            PubSubError::SetNotFound(loc) => {
                HostError::not_found(format!("no subscription set at '{loc}'"))
            }
            PubSubError::DuplicateOwner(location) => HostError::conflict(location),
            PubSubError::StaleVersion => HostError::Core(CoreError::VersionStale),
            PubSubError::LoopDetected => {
                HostError::input("event already passed through this dispatcher")
            }
            PubSubError::Core(core) => HostError::Core(core),
            other => HostError::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PubSubError>;

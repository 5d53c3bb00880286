use thiserror::Error;

/// Errors surfaced by the queue store to producers and operators.
///
/// Consumer-side processing never returns these to the driver for per-message
/// failures; those degrade into row-state transitions instead.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True for errors the caller caused (bad arguments, unknown host).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::HostNotFound(_) | Self::InvalidArgument(_))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

use thiserror::Error;

use parley_store::StoreError;

/// Errors surfaced in feed and reaction views, and by handle calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The conversation does not exist. Rendered as an empty state.
    #[error("conversation not found: {0}")]
    NotFound(String),

    /// Fetch, send or subscribe failed; retryable.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// An optimistic message was never confirmed.
    #[error("message {local_id} was not confirmed")]
    Conflict { local_id: String },

    #[error("no failed local message with id {0}")]
    UnknownMessage(String),

    #[error("no active conversation")]
    Inactive,

    #[error("synchronizer has stopped")]
    Closed,
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::TransientNetwork(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

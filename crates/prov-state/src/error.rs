//! Error types for the key-value layer.

use thiserror::Error;

/// Result type alias for key-value operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during key-value operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The entry's revision moved on since the caller read it.
    #[error("update conflict on {bucket}/{key}: expected revision {expected}, found {current:?}")]
    UpdateConflict {
        bucket: String,
        key: String,
        expected: u64,
        current: Option<u64>,
    },

    #[error("key-value backend error: {0}")]
    Backend(String),

    #[error("watch error: {0}")]
    Watch(String),
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::UpdateConflict { .. })
    }

    /// Connection-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Backend(_) | StateError::Watch(_))
    }
}

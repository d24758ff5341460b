//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("message {seq} not found in stream {stream}")]
    MessageNotFound { stream: String, seq: u64 },

    #[error("stream already exists: {0}")]
    StreamExists(String),

    /// The broker refused a stream configuration change.
    #[error("stream {stream} rejected update: {reason}")]
    Rejected { stream: String, reason: String },

    #[error("stream {0} is sealed")]
    Sealed(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl QueueError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueueError::StreamNotFound(_)
                | QueueError::ConsumerNotFound { .. }
                | QueueError::MessageNotFound { .. }
        )
    }

    /// Connection-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Broker(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Codec(e.to_string())
    }
}

use prov_core::ModelError;
use prov_queue::QueueError;
use prov_state::StateError;
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The inbound payload is not a valid event envelope.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ModelError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("subscription watch ended")]
    WatchClosed,
}

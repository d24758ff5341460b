//! Error types for the subscription registry.

use prov_core::ModelError;
use prov_queue::QueueError;
use prov_state::StateError;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("subscription `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error("invalid credentials for `{0}`")]
    Unauthorized(String),

    /// Creation failed after some resources were made; they were rolled back.
    #[error("provisioning of subscription `{name}` failed: {reason}")]
    Provisioning { name: String, reason: String },

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl RegistryError {
    /// HTTP status the REST layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::Conflict(_) => 409,
            RegistryError::State(e) if e.is_conflict() => 409,
            RegistryError::NotFound(_) => 404,
            RegistryError::Queue(e) if e.is_not_found() => 404,
            RegistryError::Invalid(_) => 422,
            RegistryError::Unauthorized(_) => 401,
            _ => 500,
        }
    }
}

//! Validation errors for the shared model.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

/// A payload or request that does not satisfy the model's invariants.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("event body has neither an old nor a new object")]
    EmptyBody,

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("invalid subscription name `{0}`")]
    InvalidName(String),

    #[error("invalid topic pattern `{pattern}`: {reason}")]
    InvalidTopic { pattern: String, reason: String },
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Malformed(e.to_string())
    }
}

use prov_core::ModelError;
use prov_queue::QueueError;
use thiserror::Error;

use crate::source::SourceError;
use crate::status::ReportError;

pub type PrefillResult<T> = Result<T, PrefillError>;

#[derive(Debug, Error)]
pub enum PrefillError {
    #[error("invalid prefill request: {0}")]
    InvalidRequest(#[from] ModelError),

    #[error("object source: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("status update: {0}")]
    Status(#[from] ReportError),
}

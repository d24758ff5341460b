//! Where the prefill reports a subscription's progress.

use async_trait::async_trait;
use prov_core::FillQueueStatus;
use prov_registry::{RegistryError, SubscriptionRegistry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("subscription `{0}` not found")]
    NotFound(String),

    /// The status may not move there, e.g. out of `failed`.
    #[error("status change rejected: {0}")]
    Rejected(String),

    #[error("status update failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, subscription: &str, status: FillQueueStatus) -> Result<(), ReportError>;
}

#[async_trait]
impl StatusReporter for SubscriptionRegistry {
    async fn report(&self, subscription: &str, status: FillQueueStatus) -> Result<(), ReportError> {
        match self.set_prefill_status(subscription, status).await {
            Ok(_) => Ok(()),
            Err(RegistryError::NotFound(name)) => Err(ReportError::NotFound(name)),
            Err(RegistryError::Conflict(reason)) => Err(ReportError::Rejected(reason)),
            Err(e) => Err(ReportError::Failed(e.to_string())),
        }
    }
}

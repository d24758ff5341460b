//! Subscriber read path.
//!
//! A subscriber sees its backfill before any live event: until the
//! `<name>.prefill` subject has been read empty once, reads wait for the
//! prefill to finish and are served from it, each with the caller's whole
//! timeout. After that every read goes to `<name>.main`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use prov_core::constants::{main_subject, prefill_subject};
use prov_core::{MessageProcessingStatus, ProvisioningMessage};
use prov_queue::{QueueAdapter, QueueSpec};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RegistryResult;
use crate::registry::SubscriptionRegistry;

#[derive(Clone)]
pub struct MessageReader {
    registry: SubscriptionRegistry,
    queues: QueueAdapter,
    // Local to this reader. Another replica keeps its own set.
    prefill_exhausted: Arc<Mutex<HashSet<String>>>,
}

impl MessageReader {
    pub fn new(registry: SubscriptionRegistry) -> Self {
        let queues = registry.queues().clone();
        Self {
            registry,
            queues,
            prefill_exhausted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Next message for subscription `name`, or `None` if nothing arrived
    /// within `timeout`. With `pop` the message is acknowledged on read.
    pub async fn next_message(
        &self,
        name: &str,
        timeout: Duration,
        pop: bool,
    ) -> RegistryResult<Option<ProvisioningMessage>> {
        let deadline = Instant::now() + timeout;
        let queue = QueueSpec::subscription(name);

        if !self.prefill_exhausted.lock().await.contains(name) {
            if !self.registry.wait_for_prefill(name, timeout).await? {
                debug!(subscription = %name, "prefill still running");
                return Ok(None);
            }
            let subject = prefill_subject(name);
            if let Some(message) = self
                .queues
                .get_message(&queue, &subject, remaining(deadline), pop)
                .await?
            {
                return Ok(Some(message));
            }
            self.prefill_exhausted.lock().await.insert(name.to_string());
            info!(subscription = %name, "prefill exhausted, switching to live events");
        } else {
            // Surface a deleted subscription as not-found rather than a missing stream.
            self.registry.get(name).await?;
        }

        let subject = main_subject(name);
        Ok(self
            .queues
            .get_message(&queue, &subject, remaining(deadline), pop)
            .await?)
    }

    /// Record the subscriber's verdict on a message. `Ok` removes it.
    pub async fn report_status(
        &self,
        name: &str,
        sequence_number: u64,
        status: MessageProcessingStatus,
    ) -> RegistryResult<()> {
        match status {
            MessageProcessingStatus::Ok => {
                self.queues
                    .delete_message(&QueueSpec::subscription(name), sequence_number)
                    .await?;
                debug!(subscription = %name, seq = sequence_number, "message processed");
            }
            MessageProcessingStatus::Error => {
                warn!(subscription = %name, seq = sequence_number, "subscriber failed to process message");
            }
        }
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

//! QueueAdapter — idempotent provisioning and message operations.
//!
//! Every administrative step looks at the broker's current state before
//! acting (create if absent, seal if not sealed, delete only once drained),
//! so several replicas can run the same provisioning concurrently.
//!
//! # Migration
//!
//! A retention change can not be applied to a live stream. With migration
//! enabled, `ensure_stream` seals the old stream and reports
//! [`QueueStatus::SealedForMigration`] while it still holds messages; the
//! caller keeps draining it through its existing consumer and asks again
//! later. Once the stream is empty it is deleted and recreated with the new
//! settings, and the status becomes [`QueueStatus::Ready`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prov_core::{Message, ProvisioningMessage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{AckHandle, Broker, Delivery, StreamInfo};
use crate::error::{QueueError, QueueResult};
use crate::queue::QueueSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Ready,
    SealedForMigration,
}

/// A message pulled from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqMessage {
    pub subject: String,
    pub data: Bytes,
    pub num_delivered: u64,
    pub sequence_number: u64,
}

/// Ack, nak and in-progress for one delivery.
#[derive(Clone)]
pub struct Acknowledgements {
    handle: Arc<dyn AckHandle>,
}

impl Acknowledgements {
    pub fn new(handle: Arc<dyn AckHandle>) -> Self {
        Self { handle }
    }

    pub async fn ack(&self) -> QueueResult<()> {
        self.handle.ack().await
    }

    pub async fn nak(&self) -> QueueResult<()> {
        self.handle.nak().await
    }

    pub async fn in_progress(&self) -> QueueResult<()> {
        self.handle.in_progress().await
    }
}

fn split(delivery: Delivery) -> (MqMessage, Acknowledgements) {
    (
        MqMessage {
            subject: delivery.subject,
            data: delivery.payload,
            num_delivered: delivery.num_delivered,
            sequence_number: delivery.sequence,
        },
        Acknowledgements::new(delivery.acker),
    )
}

/// A durable pull subscription on one queue.
#[derive(Clone)]
pub struct PullSubscription {
    broker: Arc<dyn Broker>,
    stream: String,
    durable: String,
}

impl PullSubscription {
    /// Pull one message. `None` is a normal poll miss.
    pub async fn get_one_message(
        &self,
        timeout: Duration,
    ) -> QueueResult<Option<(MqMessage, Acknowledgements)>> {
        let delivery = self
            .broker
            .fetch(&self.stream, &self.durable, None, timeout)
            .await?;
        Ok(delivery.map(split))
    }
}

#[derive(Clone)]
pub struct QueueAdapter {
    broker: Arc<dyn Broker>,
    num_replicas: usize,
    ack_wait: Duration,
}

impl QueueAdapter {
    pub fn new(broker: Arc<dyn Broker>, num_replicas: usize, ack_wait: Duration) -> Self {
        Self {
            broker,
            num_replicas,
            ack_wait,
        }
    }

    // ── Provisioning ───────────────────────────────────────────────

    /// Create the queue's stream or bring it in line with `queue`.
    pub async fn ensure_stream(&self, queue: &QueueSpec, migrate: bool) -> QueueResult<QueueStatus> {
        let desired = queue.stream_config(self.num_replicas);
        let Some(existing) = self.broker.stream_info(&desired.name).await? else {
            return match self.broker.add_stream(&desired).await {
                Ok(()) => {
                    info!(stream = %desired.name, retention = ?desired.retention, "stream created");
                    Ok(QueueStatus::Ready)
                }
                // Another replica won the race.
                Err(QueueError::StreamExists(name)) => match self.broker.stream_info(&name).await? {
                    Some(info) if info.config.matches(&desired) => Ok(QueueStatus::Ready),
                    _ => Err(QueueError::StreamExists(name)),
                },
                Err(e) => Err(e),
            };
        };
        if existing.config.matches(&desired) {
            debug!(stream = %desired.name, "stream up to date");
            return Ok(QueueStatus::Ready);
        }
        match self.broker.update_stream(&desired).await {
            Ok(()) => {
                info!(stream = %desired.name, "stream updated in place");
                Ok(QueueStatus::Ready)
            }
            Err(QueueError::Rejected { reason, .. }) if migrate => {
                info!(stream = %desired.name, %reason, "stream update rejected, migrating");
                self.migrate_stream(queue, existing).await
            }
            Err(e) => Err(e),
        }
    }

    /// Run one step of the migration protocol for `queue`.
    pub async fn migrate_stream(
        &self,
        queue: &QueueSpec,
        existing: StreamInfo,
    ) -> QueueResult<QueueStatus> {
        let desired = queue.stream_config(self.num_replicas);
        let name = desired.name.clone();

        if !existing.config.sealed {
            let mut sealed = existing.config.clone();
            sealed.sealed = true;
            match self.broker.update_stream(&sealed).await {
                Ok(()) => info!(stream = %name, "stream sealed for migration"),
                Err(e) => {
                    // A concurrent replica may have sealed or replaced it already.
                    match self.broker.stream_info(&name).await? {
                        Some(info) if info.config.sealed || info.config.matches(&desired) => {}
                        None => {}
                        Some(_) => return Err(e),
                    }
                }
            }
        }

        match self.broker.stream_info(&name).await? {
            Some(info) if info.config.matches(&desired) => return Ok(QueueStatus::Ready),
            Some(info) if !info.config.sealed => {
                return Err(QueueError::Rejected {
                    stream: name,
                    reason: "stream could not be sealed".to_string(),
                });
            }
            Some(info) if info.messages > 0 => {
                info!(stream = %name, pending = info.messages, "sealed stream still draining");
                return Ok(QueueStatus::SealedForMigration);
            }
            Some(_) => {
                self.broker.delete_stream(&name).await?;
                info!(stream = %name, "drained stream deleted");
            }
            None => {}
        }

        match self.broker.add_stream(&desired).await {
            Ok(()) => {
                info!(stream = %name, retention = ?desired.retention, "stream recreated");
                Ok(QueueStatus::Ready)
            }
            Err(QueueError::StreamExists(_)) => match self.broker.stream_info(&name).await? {
                Some(info) if info.config.matches(&desired) => Ok(QueueStatus::Ready),
                Some(info) if info.config.sealed => Ok(QueueStatus::SealedForMigration),
                _ => Err(QueueError::StreamExists(name)),
            },
            Err(e) => Err(e),
        }
    }

    /// Create the queue's durable consumer if it does not exist.
    pub async fn ensure_consumer(&self, queue: &QueueSpec) -> QueueResult<()> {
        let stream = queue.stream_name();
        let config = queue.consumer_config(self.ack_wait);
        if self
            .broker
            .consumer_info(&stream, &config.durable_name)
            .await?
            .is_some()
        {
            return Ok(());
        }
        self.broker.add_consumer(&stream, &config).await?;
        info!(%stream, consumer = %config.durable_name, "consumer created");
        Ok(())
    }

    /// Provision stream and consumer and bind a pull subscription.
    pub async fn initialize_subscription(
        &self,
        queue: &QueueSpec,
        migrate: bool,
    ) -> QueueResult<(QueueStatus, PullSubscription)> {
        let status = self.ensure_stream(queue, migrate).await?;
        self.ensure_consumer(queue).await?;
        let subscription = PullSubscription {
            broker: self.broker.clone(),
            stream: queue.stream_name(),
            durable: queue.durable_name(),
        };
        Ok((status, subscription))
    }

    pub async fn stream_info(&self, queue: &QueueSpec) -> QueueResult<Option<StreamInfo>> {
        self.broker.stream_info(&queue.stream_name()).await
    }

    pub async fn stream_exists(&self, queue: &QueueSpec) -> QueueResult<bool> {
        Ok(self.stream_info(queue).await?.is_some())
    }

    pub async fn consumer_exists(&self, queue: &QueueSpec) -> QueueResult<bool> {
        match self
            .broker
            .consumer_info(&queue.stream_name(), &queue.durable_name())
            .await
        {
            Ok(info) => Ok(info.is_some()),
            Err(QueueError::StreamNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Absence counts as success.
    pub async fn delete_stream(&self, queue: &QueueSpec) -> QueueResult<()> {
        let stream = queue.stream_name();
        if self.broker.delete_stream(&stream).await? {
            info!(%stream, "stream deleted");
        } else {
            debug!(%stream, "stream already gone");
        }
        Ok(())
    }

    /// Absence of the consumer or its stream counts as success.
    pub async fn delete_consumer(&self, queue: &QueueSpec) -> QueueResult<()> {
        let stream = queue.stream_name();
        let durable = queue.durable_name();
        match self.broker.delete_consumer(&stream, &durable).await {
            Ok(true) => info!(%stream, consumer = %durable, "consumer deleted"),
            Ok(false) | Err(QueueError::StreamNotFound(_)) => {
                debug!(%stream, consumer = %durable, "consumer already gone")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────

    pub async fn add_raw(&self, queue: &QueueSpec, subject: &str, payload: Bytes) -> QueueResult<u64> {
        let stream = queue.stream_name();
        let seq = self.broker.publish(&stream, subject, payload).await?;
        debug!(%stream, %subject, seq, "message published");
        Ok(seq)
    }

    pub async fn add_message<T: Serialize>(
        &self,
        queue: &QueueSpec,
        subject: &str,
        message: &T,
    ) -> QueueResult<u64> {
        let payload = serde_json::to_vec(message)?;
        self.add_raw(queue, subject, payload.into()).await
    }

    /// Read the next event on `subject` through the queue's consumer.
    ///
    /// With `pop` the delivery is acknowledged right away; otherwise it
    /// stays in flight until the subscriber reports it or ack-wait expires.
    pub async fn get_message(
        &self,
        queue: &QueueSpec,
        subject: &str,
        timeout: Duration,
        pop: bool,
    ) -> QueueResult<Option<ProvisioningMessage>> {
        let stream = queue.stream_name();
        let durable = queue.durable_name();
        if self.broker.stream_info(&stream).await?.is_none() {
            warn!(%stream, "stream not found");
            return Err(QueueError::StreamNotFound(stream));
        }
        if self.broker.consumer_info(&stream, &durable).await?.is_none() {
            warn!(%stream, consumer = %durable, "consumer not found");
            return Err(QueueError::ConsumerNotFound {
                stream,
                consumer: durable,
            });
        }
        let Some(delivery) = self
            .broker
            .fetch(&stream, &durable, Some(subject), timeout)
            .await?
        else {
            return Ok(None);
        };
        if pop {
            delivery.acker.ack().await?;
        }
        let message: Message = serde_json::from_slice(&delivery.payload)?;
        Ok(Some(ProvisioningMessage {
            sequence_number: delivery.sequence,
            num_delivered: delivery.num_delivered,
            message,
        }))
    }

    /// Remove a message by sequence. A missing message is an error.
    pub async fn delete_message(&self, queue: &QueueSpec, seq: u64) -> QueueResult<()> {
        let stream = queue.stream_name();
        if !self.broker.delete_msg(&stream, seq).await? {
            return Err(QueueError::MessageNotFound { stream, seq });
        }
        debug!(%stream, seq, "message deleted");
        Ok(())
    }

    pub async fn purge_subject(&self, queue: &QueueSpec, subject: &str) -> QueueResult<u64> {
        let stream = queue.stream_name();
        let purged = self.broker.purge(&stream, subject).await?;
        info!(%stream, %subject, purged, "subject purged");
        Ok(purged)
    }
}

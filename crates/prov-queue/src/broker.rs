//! The broker collaborator interface.
//!
//! Modelled on JetStream: append-only streams bound to subjects, durable
//! pull consumers, and acknowledgements bound to a single delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::QueueResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Bounded by limits; messages stay until deleted.
    Limits,
    /// A message is removed once any consumer acknowledges it.
    WorkQueue,
    /// A message is removed once every consumer acknowledged it.
    Interest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub num_replicas: usize,
    /// Sealed streams reject writes but keep serving their content.
    pub sealed: bool,
}

impl StreamConfig {
    /// Same settings, ignoring subject order.
    pub fn matches(&self, other: &StreamConfig) -> bool {
        let mut a = self.subjects.clone();
        let mut b = other.subjects.clone();
        a.sort();
        b.sort();
        self.name == other.name
            && a == b
            && self.retention == other.retention
            && self.num_replicas == other.num_replicas
            && self.sealed == other.sealed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Deliveries allowed in flight at once. `1` serializes processing.
    pub max_ack_pending: i64,
    pub ack_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
}

/// Acknowledgement operations bound to one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> QueueResult<()>;

    /// Ask for immediate redelivery.
    async fn nak(&self) -> QueueResult<()>;

    /// Restart the ack-wait timer for this delivery.
    async fn in_progress(&self) -> QueueResult<()>;
}

/// One message handed to one consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub num_delivered: u64,
    pub acker: Arc<dyn AckHandle>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("num_delivered", &self.num_delivered)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn stream_info(&self, stream: &str) -> QueueResult<Option<StreamInfo>>;

    /// Fails with `StreamExists` if a stream of that name is present.
    async fn add_stream(&self, config: &StreamConfig) -> QueueResult<()>;

    /// Fails with `Rejected` when the change is not allowed in place.
    async fn update_stream(&self, config: &StreamConfig) -> QueueResult<()>;

    /// Returns whether the stream existed.
    async fn delete_stream(&self, stream: &str) -> QueueResult<bool>;

    async fn consumer_info(&self, stream: &str, durable: &str)
    -> QueueResult<Option<ConsumerConfig>>;

    async fn add_consumer(&self, stream: &str, config: &ConsumerConfig) -> QueueResult<()>;

    /// Returns whether the consumer existed.
    async fn delete_consumer(&self, stream: &str, durable: &str) -> QueueResult<bool>;

    /// Append to `stream` under `subject`. Returns the stream sequence.
    async fn publish(&self, stream: &str, subject: &str, payload: Bytes) -> QueueResult<u64>;

    /// Pull at most one message, waiting up to `timeout`.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        filter_subject: Option<&str>,
        timeout: Duration,
    ) -> QueueResult<Option<Delivery>>;

    async fn get_msg(&self, stream: &str, seq: u64) -> QueueResult<Option<StoredMessage>>;

    /// Returns whether the message existed.
    async fn delete_msg(&self, stream: &str, seq: u64) -> QueueResult<bool>;

    /// Remove every message on `subject`. Returns the number removed.
    async fn purge(&self, stream: &str, subject: &str) -> QueueResult<u64>;
}

/// NATS subject matching with `*` (one token) and `>` (the rest).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("ox.main", "ox.main"));
        assert!(!subject_matches("ox.main", "ox.prefill"));
        assert!(subject_matches("ox.*", "ox.prefill"));
        assert!(subject_matches(">", "incoming"));
        assert!(subject_matches("ox.>", "ox.a.b"));
        assert!(!subject_matches("ox.>", "ox"));
        assert!(!subject_matches("ox.*", "ox.a.b"));
    }

    #[test]
    fn test_stream_config_matches_ignores_order() {
        let a = StreamConfig {
            name: "stream:ox".into(),
            subjects: vec!["ox.main".into(), "ox.prefill".into()],
            retention: RetentionPolicy::Limits,
            num_replicas: 1,
            sealed: false,
        };
        let mut b = a.clone();
        b.subjects.reverse();
        assert!(a.matches(&b));
        b.sealed = true;
        assert!(!a.matches(&b));
    }
}

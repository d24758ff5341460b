//! Logical queues and how they map onto streams and consumers.

use std::time::Duration;

use prov_core::constants::{
    INCOMING_QUEUE, PREFILL_FAILURES_QUEUE, PREFILL_QUEUE, durable_name, main_subject,
    prefill_subject, stream_name,
};

use crate::broker::{ConsumerConfig, RetentionPolicy, StreamConfig};

/// A logical queue: one stream, its subjects and one durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    subjects: Vec<String>,
    retention: RetentionPolicy,
}

impl QueueSpec {
    /// Per-subscriber queue with a live and a backfill subject.
    pub fn subscription(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subjects: vec![main_subject(name), prefill_subject(name)],
            retention: RetentionPolicy::Limits,
        }
    }

    /// Shared ingestion queue. Redundant dispatchers need interest retention
    /// so every replica's consumer sees each event.
    pub fn incoming(redundant_readers: bool) -> Self {
        let retention = if redundant_readers {
            RetentionPolicy::Interest
        } else {
            RetentionPolicy::WorkQueue
        };
        Self::single_subject(INCOMING_QUEUE, retention)
    }

    pub fn prefill() -> Self {
        Self::single_subject(PREFILL_QUEUE, RetentionPolicy::WorkQueue)
    }

    pub fn prefill_failures() -> Self {
        Self::single_subject(PREFILL_FAILURES_QUEUE, RetentionPolicy::Limits)
    }

    fn single_subject(name: &str, retention: RetentionPolicy) -> Self {
        Self {
            name: name.to_string(),
            subjects: vec![name.to_string()],
            retention,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// The subject plain publishes go to.
    pub fn default_subject(&self) -> &str {
        self.subjects.first().map(String::as_str).unwrap_or(&self.name)
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn stream_name(&self) -> String {
        stream_name(&self.name)
    }

    pub fn durable_name(&self) -> String {
        durable_name(&self.name)
    }

    pub fn stream_config(&self, num_replicas: usize) -> StreamConfig {
        StreamConfig {
            name: self.stream_name(),
            subjects: self.subjects.clone(),
            retention: self.retention,
            num_replicas,
            sealed: false,
        }
    }

    pub fn consumer_config(&self, ack_wait: Duration) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: self.durable_name(),
            max_ack_pending: 1,
            ack_wait,
        }
    }
}

//! MemoryBroker — an in-process broker for tests and single-process runs.
//!
//! Follows JetStream semantics closely enough to exercise the adapter:
//!
//! - retention: limits keeps acknowledged messages, work-queue drops a
//!   message on its first ack, interest drops it once every consumer acked;
//! - a consumer hands out at most `max_ack_pending` deliveries at a time;
//! - an unacknowledged delivery is redelivered once its ack-wait expires,
//!   `nak` makes it eligible immediately, `in_progress` restarts the timer;
//! - sealed streams refuse publishes, purges, message deletes and config
//!   updates, but can still be drained and deleted;
//! - changing a stream's retention in place is rejected.
//!
//! Time is `tokio::time`, so paused-clock tests drive ack-wait expiry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{
    AckHandle, Broker, ConsumerConfig, Delivery, RetentionPolicy, StoredMessage, StreamConfig,
    StreamInfo, subject_matches,
};
use crate::error::{QueueError, QueueResult};

/// Upper bound on a single wait inside `fetch`, so missed wakeups cost little.
const POLL_SLICE: Duration = Duration::from_millis(50);

struct InFlight {
    delivery_id: u64,
    deadline: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    acked: BTreeSet<u64>,
    delivered: HashMap<u64, u64>,
    in_flight: BTreeMap<u64, InFlight>,
}

impl ConsumerState {
    fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            acked: BTreeSet::new(),
            delivered: HashMap::new(),
            in_flight: BTreeMap::new(),
        }
    }

    fn has_capacity(&self) -> bool {
        self.config.max_ack_pending <= 0
            || (self.in_flight.len() as i64) < self.config.max_ack_pending
    }
}

struct StreamState {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn accepts(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn forget(&mut self, seq: u64) {
        for consumer in self.consumers.values_mut() {
            consumer.in_flight.remove(&seq);
        }
    }

    /// Drop a message that retention no longer requires.
    fn retire_if_done(&mut self, seq: u64) {
        let done = match self.config.retention {
            RetentionPolicy::Limits => false,
            RetentionPolicy::WorkQueue => true,
            RetentionPolicy::Interest => self.consumers.values().all(|c| c.acked.contains(&seq)),
        };
        if done {
            self.messages.remove(&seq);
            self.forget(seq);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    next_delivery_id: u64,
    progress_calls: u64,
}

impl BrokerState {
    fn stream_mut(&mut self, stream: &str) -> QueueResult<&mut StreamState> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| QueueError::StreamNotFound(stream.to_string()))
    }
}

/// Cheaply cloneable handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `in_progress` signals received across all deliveries.
    pub async fn in_progress_calls(&self) -> u64 {
        self.state.lock().await.progress_calls
    }

    /// Messages currently stored in a stream, in sequence order.
    pub async fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Try to hand out one delivery without waiting.
    fn try_deliver(
        &self,
        state: &mut BrokerState,
        stream_name: &str,
        durable: &str,
        filter: Option<&str>,
        now: Instant,
    ) -> QueueResult<Option<Delivery>> {
        let delivery_id = state.next_delivery_id;
        let stream = state.stream_mut(stream_name)?;
        let StreamState {
            messages,
            consumers,
            ..
        } = stream;
        let consumer = consumers
            .get_mut(durable)
            .ok_or_else(|| QueueError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: durable.to_string(),
            })?;

        // Expired deliveries become eligible again.
        consumer
            .in_flight
            .retain(|seq, flight| messages.contains_key(seq) && flight.deadline > now);
        if !consumer.has_capacity() {
            return Ok(None);
        }

        let candidate = messages.values().find(|m| {
            !consumer.acked.contains(&m.sequence)
                && !consumer.in_flight.contains_key(&m.sequence)
                && filter.is_none_or(|f| subject_matches(f, &m.subject))
        });
        let Some(message) = candidate else {
            return Ok(None);
        };

        let count = consumer.delivered.entry(message.sequence).or_insert(0);
        *count += 1;
        let num_delivered = *count;
        consumer.in_flight.insert(
            message.sequence,
            InFlight {
                delivery_id,
                deadline: now + consumer.config.ack_wait,
            },
        );
        let delivery = Delivery {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            sequence: message.sequence,
            num_delivered,
            acker: Arc::new(MemoryAcker {
                broker: self.clone(),
                stream: stream_name.to_string(),
                durable: durable.to_string(),
                seq: message.sequence,
                delivery_id,
            }),
        };
        state.next_delivery_id += 1;
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn stream_info(&self, stream: &str) -> QueueResult<Option<StreamInfo>> {
        let state = self.state.lock().await;
        Ok(state.streams.get(stream).map(|s| StreamInfo {
            config: s.config.clone(),
            messages: s.messages.len() as u64,
        }))
    }

    async fn add_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.streams.contains_key(&config.name) {
            return Err(QueueError::StreamExists(config.name.clone()));
        }
        state.streams.insert(
            config.name.clone(),
            StreamState {
                config: config.clone(),
                messages: BTreeMap::new(),
                last_seq: 0,
                consumers: HashMap::new(),
            },
        );
        debug!(stream = %config.name, retention = ?config.retention, "stream added");
        Ok(())
    }

    async fn update_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&config.name)?;
        let rejected = |reason: &str| QueueError::Rejected {
            stream: config.name.clone(),
            reason: reason.to_string(),
        };
        if stream.config.sealed {
            return Err(rejected("stream is sealed"));
        }
        if stream.config.retention != config.retention {
            return Err(rejected("retention policy can not be changed"));
        }
        stream.config = config.clone();
        debug!(stream = %config.name, sealed = config.sealed, "stream updated");
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> QueueResult<bool> {
        let existed = self.state.lock().await.streams.remove(stream).is_some();
        self.notify.notify_waiters();
        Ok(existed)
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> QueueResult<Option<ConsumerConfig>> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(stream)?;
        Ok(stream.consumers.get(durable).map(|c| c.config.clone()))
    }

    async fn add_consumer(&self, stream: &str, config: &ConsumerConfig) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(stream)?;
        stream
            .consumers
            .entry(config.durable_name.clone())
            .or_insert_with(|| ConsumerState::new(config.clone()));
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(stream)?;
        Ok(stream.consumers.remove(durable).is_some())
    }

    async fn publish(&self, stream: &str, subject: &str, payload: Bytes) -> QueueResult<u64> {
        let seq = {
            let mut state = self.state.lock().await;
            let target = state.stream_mut(stream)?;
            if target.config.sealed {
                return Err(QueueError::Sealed(stream.to_string()));
            }
            if !target.accepts(subject) {
                return Err(QueueError::Broker(format!(
                    "subject {subject} is not bound to stream {stream}"
                )));
            }
            target.last_seq += 1;
            let seq = target.last_seq;
            target.messages.insert(
                seq,
                StoredMessage {
                    subject: subject.to_string(),
                    payload,
                    sequence: seq,
                },
            );
            seq
        };
        self.notify.notify_waiters();
        Ok(seq)
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        filter_subject: Option<&str>,
        timeout: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(delivery) =
                    self.try_deliver(&mut state, stream, durable, filter_subject, now)?
                {
                    return Ok(Some(delivery));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn get_msg(&self, stream: &str, seq: u64) -> QueueResult<Option<StoredMessage>> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(stream)?;
        Ok(stream.messages.get(&seq).cloned())
    }

    async fn delete_msg(&self, stream: &str, seq: u64) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let target = state.stream_mut(stream)?;
        if target.config.sealed {
            return Err(QueueError::Sealed(stream.to_string()));
        }
        let existed = target.messages.remove(&seq).is_some();
        target.forget(seq);
        Ok(existed)
    }

    async fn purge(&self, stream: &str, subject: &str) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let target = state.stream_mut(stream)?;
        if target.config.sealed {
            return Err(QueueError::Sealed(stream.to_string()));
        }
        let doomed: Vec<u64> = target
            .messages
            .values()
            .filter(|m| subject_matches(subject, &m.subject))
            .map(|m| m.sequence)
            .collect();
        for seq in &doomed {
            target.messages.remove(seq);
            target.forget(*seq);
        }
        Ok(doomed.len() as u64)
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    stream: String,
    durable: String,
    seq: u64,
    delivery_id: u64,
}

impl MemoryAcker {
    fn current<'a>(&self, state: &'a mut BrokerState) -> Option<&'a mut StreamState> {
        state.streams.get_mut(&self.stream)
    }
}

#[async_trait]
impl AckHandle for MemoryAcker {
    async fn ack(&self) -> QueueResult<()> {
        {
            let mut state = self.broker.state.lock().await;
            let Some(stream) = self.current(&mut state) else {
                return Ok(());
            };
            if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
                consumer.in_flight.remove(&self.seq);
                consumer.acked.insert(self.seq);
            }
            stream.retire_if_done(self.seq);
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn nak(&self) -> QueueResult<()> {
        {
            let mut state = self.broker.state.lock().await;
            let Some(stream) = self.current(&mut state) else {
                return Ok(());
            };
            if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
                if consumer
                    .in_flight
                    .get(&self.seq)
                    .is_some_and(|f| f.delivery_id == self.delivery_id)
                {
                    consumer.in_flight.remove(&self.seq);
                }
            }
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn in_progress(&self) -> QueueResult<()> {
        let mut state = self.broker.state.lock().await;
        state.progress_calls += 1;
        let Some(stream) = self.current(&mut state) else {
            return Ok(());
        };
        if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
            let ack_wait = consumer.config.ack_wait;
            if let Some(flight) = consumer.in_flight.get_mut(&self.seq) {
                if flight.delivery_id == self.delivery_id {
                    flight.deadline = Instant::now() + ack_wait;
                }
            }
        }
        Ok(())
    }
}

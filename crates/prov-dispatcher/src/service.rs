//! Dispatcher service loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use prov_core::config::DispatcherConfig;
use prov_core::constants::main_subject;
use prov_core::{Message, Subscription};
use prov_queue::{
    AckWaitSupervisor, Acknowledgements, MqMessage, PullSubscription, QueueAdapter, QueueError,
    QueueSpec, QueueStatus,
};
use prov_state::adapter::ChangeStream;
use prov_state::{Bucket, KvAdapter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::routing::RoutingTable;

/// Deliveries of an invalid envelope before it is dropped instead of nak'ed.
const MAX_INVALID_DELIVERIES: u64 = 3;

/// Pause after a failed poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Dispatcher {
    queues: QueueAdapter,
    kv: KvAdapter,
    supervisor: AckWaitSupervisor,
    incoming: QueueSpec,
    migrate_stream: bool,
    poll_timeout: Duration,
    routes: Arc<ArcSwap<RoutingTable>>,
}

impl Dispatcher {
    pub fn new(
        queues: QueueAdapter,
        kv: KvAdapter,
        supervisor: AckWaitSupervisor,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            queues,
            kv,
            supervisor,
            incoming: QueueSpec::incoming(config.redundant_replicas),
            migrate_stream: config.migrate_stream,
            poll_timeout: config.poll_timeout(),
            routes: Arc::new(ArcSwap::from_pointee(RoutingTable::default())),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// The table currently used for routing.
    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.routes.load_full()
    }

    /// Rebuild the routing table from every stored subscription.
    pub async fn load_routes(&self) -> DispatchResult<BTreeMap<String, Subscription>> {
        let subscriptions: Vec<Subscription> = self.kv.all_json(Bucket::Subscriptions).await?;
        let known: BTreeMap<String, Subscription> = subscriptions
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        self.routes
            .store(Arc::new(RoutingTable::from_subscriptions(known.values())));
        info!(subscriptions = known.len(), "routing table loaded");
        Ok(known)
    }

    /// Run until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> DispatchResult<()> {
        // Subscribe before loading so no change falls between the two.
        let changes = self.kv.watch(Bucket::Subscriptions).await?;
        let known = self.load_routes().await?;
        let mut watcher = tokio::spawn(watch_routes(
            self.kv.clone(),
            self.routes.clone(),
            known,
            changes,
            shutdown.clone(),
        ));

        let result = self.pull_loop(shutdown, &mut watcher).await;
        watcher.abort();
        result
    }

    /// Pull and dispatch until shutdown. Stops with the watcher's error if
    /// the routing table can no longer be kept current.
    async fn pull_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        watcher: &mut JoinHandle<DispatchResult<()>>,
    ) -> DispatchResult<()> {
        let (mut status, mut subscription) = self
            .queues
            .initialize_subscription(&self.incoming, self.migrate_stream)
            .await?;
        info!(queue = %self.incoming.name(), ?status, "dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    break;
                }
                joined = &mut *watcher => {
                    return match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(error = %e, "routing watcher failed, stopping dispatcher");
                            Err(e)
                        }
                        Err(e) => {
                            error!(error = %e, "routing watcher aborted, stopping dispatcher");
                            Err(DispatchError::WatchClosed)
                        }
                    };
                }
                polled = subscription.get_one_message(self.poll_timeout) => match polled {
                    Ok(Some((message, acks))) => self.handle(message, acks).await,
                    Ok(None) => {
                        debug!("no inbound event");
                        if status == QueueStatus::SealedForMigration {
                            (status, subscription) = self.retry_migration(subscription).await;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to pull inbound event");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
        }
        Ok(())
    }

    /// Ask again whether the drained ingestion stream can be recreated.
    async fn retry_migration(
        &self,
        current: PullSubscription,
    ) -> (QueueStatus, PullSubscription) {
        match self.queues.initialize_subscription(&self.incoming, true).await {
            Ok((QueueStatus::Ready, subscription)) => {
                info!(queue = %self.incoming.name(), "ingestion stream migrated");
                (QueueStatus::Ready, subscription)
            }
            Ok((status, _)) => (status, current),
            Err(e) => {
                warn!(error = %e, "migration step failed, will retry");
                (QueueStatus::SealedForMigration, current)
            }
        }
    }

    async fn handle(&self, message: MqMessage, acks: Acknowledgements) {
        let seq = message.sequence_number;
        let outcome = self.supervisor.process(&acks, self.dispatch(&message)).await;
        let settled = match outcome {
            Ok(forwarded) => {
                debug!(seq, forwarded, "event dispatched");
                acks.ack().await
            }
            Err(DispatchError::InvalidEvent(e)) if message.num_delivered >= MAX_INVALID_DELIVERIES => {
                error!(seq, num_delivered = message.num_delivered, error = %e, "dropping invalid event");
                acks.ack().await
            }
            Err(DispatchError::InvalidEvent(e)) => {
                warn!(seq, num_delivered = message.num_delivered, error = %e, "invalid event");
                acks.nak().await
            }
            Err(e) => {
                error!(seq, error = %e, "event dispatch failed, requesting redelivery");
                acks.nak().await
            }
        };
        if let Err(e) = settled {
            error!(seq, error = %e, "failed to settle inbound event");
        }
    }

    /// Publish `message` to every matching subscription. Returns the number of copies sent.
    pub async fn dispatch(&self, message: &MqMessage) -> DispatchResult<usize> {
        let event = Message::from_slice(&message.data)?;
        let targets = self.routes.load().lookup(&event.realm, &event.topic);
        if targets.is_empty() {
            info!(realm = %event.realm, topic = %event.topic, "no subscriber for event");
            return Ok(0);
        }

        let mut forwarded = 0;
        for name in &targets {
            let queue = QueueSpec::subscription(name);
            match self
                .queues
                .add_raw(&queue, &main_subject(name), message.data.clone())
                .await
            {
                Ok(seq) => {
                    forwarded += 1;
                    info!(subscription = %name, realm = %event.realm, topic = %event.topic, seq, "event forwarded");
                }
                // Deleted after the table was built.
                Err(QueueError::StreamNotFound(_)) => {
                    warn!(subscription = %name, "subscriber queue is gone, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(forwarded)
    }
}

/// Keep `routes` in line with the `subscriptions` bucket.
async fn watch_routes(
    kv: KvAdapter,
    routes: Arc<ArcSwap<RoutingTable>>,
    mut known: BTreeMap<String, Subscription>,
    mut changes: ChangeStream,
    mut shutdown: watch::Receiver<bool>,
) -> DispatchResult<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            change = changes.next() => {
                match change {
                    Some(Ok((key, Some(value)))) => match serde_json::from_slice::<Subscription>(&value) {
                        Ok(subscription) => {
                            known.insert(key, subscription);
                        }
                        Err(e) => {
                            warn!(subscription = %key, error = %e, "unreadable subscription, not routing to it");
                            known.remove(&key);
                        }
                    },
                    Some(Ok((key, None))) => {
                        known.remove(&key);
                    }
                    Some(Err(e)) => {
                        // Missed changes: start over from the store.
                        warn!(error = %e, "subscription watch lagged, reloading");
                        let subscriptions: Vec<Subscription> =
                            kv.all_json(Bucket::Subscriptions).await?;
                        known = subscriptions.into_iter().map(|s| (s.name.clone(), s)).collect();
                    }
                    None => {
                        error!("subscription watch ended");
                        return Err(DispatchError::WatchClosed);
                    }
                }
                routes.store(Arc::new(RoutingTable::from_subscriptions(known.values())));
                info!(subscriptions = known.len(), "routing table rebuilt");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use prov_core::{Body, FillQueueStatus, PublisherName, RealmTopic};
    use prov_queue::{
        Broker, ConsumerConfig, Delivery, MemoryBroker, QueueResult, StoredMessage, StreamConfig,
        StreamInfo,
    };
    use prov_state::{KvBackend, KvEntry, RedbKv, StateResult, WatchStream};
    use serde_json::json;

    /// Memory broker whose publishes to chosen streams fail a set number
    /// of times.
    #[derive(Clone, Default)]
    struct FlakyBroker {
        inner: MemoryBroker,
        failures: Arc<Mutex<HashMap<String, u32>>>,
    }

    impl FlakyBroker {
        fn fail_publish(&self, stream: &str, times: u32) {
            self.failures.lock().unwrap().insert(stream.to_string(), times);
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn stream_info(&self, stream: &str) -> QueueResult<Option<StreamInfo>> {
            self.inner.stream_info(stream).await
        }
        async fn add_stream(&self, config: &StreamConfig) -> QueueResult<()> {
            self.inner.add_stream(config).await
        }
        async fn update_stream(&self, config: &StreamConfig) -> QueueResult<()> {
            self.inner.update_stream(config).await
        }
        async fn delete_stream(&self, stream: &str) -> QueueResult<bool> {
            self.inner.delete_stream(stream).await
        }
        async fn consumer_info(
            &self,
            stream: &str,
            durable: &str,
        ) -> QueueResult<Option<ConsumerConfig>> {
            self.inner.consumer_info(stream, durable).await
        }
        async fn add_consumer(&self, stream: &str, config: &ConsumerConfig) -> QueueResult<()> {
            self.inner.add_consumer(stream, config).await
        }
        async fn delete_consumer(&self, stream: &str, durable: &str) -> QueueResult<bool> {
            self.inner.delete_consumer(stream, durable).await
        }
        async fn publish(&self, stream: &str, subject: &str, payload: Bytes) -> QueueResult<u64> {
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(stream).filter(|left| **left > 0) {
                    *left -= 1;
                    return Err(QueueError::Broker("connection reset".into()));
                }
            }
            self.inner.publish(stream, subject, payload).await
        }
        async fn fetch(
            &self,
            stream: &str,
            durable: &str,
            filter_subject: Option<&str>,
            timeout: Duration,
        ) -> QueueResult<Option<Delivery>> {
            self.inner.fetch(stream, durable, filter_subject, timeout).await
        }
        async fn get_msg(&self, stream: &str, seq: u64) -> QueueResult<Option<StoredMessage>> {
            self.inner.get_msg(stream, seq).await
        }
        async fn delete_msg(&self, stream: &str, seq: u64) -> QueueResult<bool> {
            self.inner.delete_msg(stream, seq).await
        }
        async fn purge(&self, stream: &str, subject: &str) -> QueueResult<u64> {
            self.inner.purge(stream, subject).await
        }
    }

    /// Store whose change feed ends straight away.
    struct EndedWatch(RedbKv);

    #[async_trait]
    impl KvBackend for EndedWatch {
        async fn ensure_bucket(&self, bucket: Bucket) -> StateResult<()> {
            self.0.ensure_bucket(bucket).await
        }
        async fn entry(&self, bucket: Bucket, key: &str) -> StateResult<Option<KvEntry>> {
            self.0.entry(bucket, key).await
        }
        async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> StateResult<u64> {
            self.0.put(bucket, key, value).await
        }
        async fn update(
            &self,
            bucket: Bucket,
            key: &str,
            value: Bytes,
            expected_revision: u64,
        ) -> StateResult<u64> {
            self.0.update(bucket, key, value, expected_revision).await
        }
        async fn delete(&self, bucket: Bucket, key: &str) -> StateResult<()> {
            self.0.delete(bucket, key).await
        }
        async fn delete_with_revision(
            &self,
            bucket: Bucket,
            key: &str,
            expected_revision: u64,
        ) -> StateResult<()> {
            self.0.delete_with_revision(bucket, key, expected_revision).await
        }
        async fn keys(&self, bucket: Bucket) -> StateResult<Vec<String>> {
            self.0.keys(bucket).await
        }
        async fn watch(&self, _bucket: Bucket) -> StateResult<WatchStream> {
            Ok(futures::stream::empty().boxed())
        }
    }

    struct Harness {
        broker: MemoryBroker,
        kv: KvAdapter,
        queues: QueueAdapter,
        dispatcher: Dispatcher,
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let broker = MemoryBroker::new();
        harness_on(config, broker.clone(), Arc::new(broker), KvAdapter::in_memory().unwrap())
    }

    /// `broker` is the inspectable store behind `queue_broker`.
    fn harness_on(
        config: DispatcherConfig,
        broker: MemoryBroker,
        queue_broker: Arc<dyn Broker>,
        kv: KvAdapter,
    ) -> Harness {
        let queues = QueueAdapter::new(queue_broker, 1, Duration::from_secs(30));
        let dispatcher = Dispatcher::new(
            queues.clone(),
            kv.clone(),
            AckWaitSupervisor::default(),
            &config,
        )
        .with_poll_timeout(Duration::from_millis(20));
        Harness {
            broker,
            kv,
            queues,
            dispatcher,
        }
    }

    impl Harness {
        async fn subscribe(&self, name: &str, topic: &str) {
            let subscription = Subscription {
                name: name.into(),
                realms_topics: vec![RealmTopic::new("udm", topic)],
                request_prefill: false,
                prefill_queue_status: FillQueueStatus::Done,
            };
            self.kv
                .put_json(name, &subscription, Bucket::Subscriptions, None)
                .await
                .unwrap();
            let queue = QueueSpec::subscription(name);
            self.queues.ensure_stream(&queue, false).await.unwrap();
            self.queues.ensure_consumer(&queue).await.unwrap();
        }

        async fn publish(&self, payload: &[u8]) {
            self.queues
                .add_raw(&QueueSpec::incoming(false), "incoming", payload.to_vec().into())
                .await
                .unwrap();
        }

        fn start(&self) -> (watch::Sender<bool>, tokio::task::JoinHandle<DispatchResult<()>>) {
            let (tx, rx) = watch::channel(false);
            let dispatcher = self.dispatcher.clone();
            let handle = tokio::spawn(async move { dispatcher.run(rx).await });
            (tx, handle)
        }
    }

    fn event(topic: &str) -> Vec<u8> {
        let new = json!({"dn": "uid=x"}).as_object().cloned().unwrap();
        Message::new(PublisherName::UdmListener, "udm", topic, Body::created(new))
            .to_vec()
            .unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_routes_loaded_at_startup() {
        let h = harness(DispatcherConfig::default());
        h.subscribe("a", "users/.*").await;
        h.subscribe("b", "groups/group").await;
        h.dispatcher.load_routes().await.unwrap();

        let table = h.dispatcher.routing_table();
        let hits: Vec<_> = table.lookup("udm", "users/user").into_iter().collect();
        assert_eq!(hits, ["a"]);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_matches() {
        let h = harness(DispatcherConfig::default());
        h.subscribe("a", "users/.*").await;
        h.subscribe("b", "users/user").await;
        h.subscribe("c", "groups/group").await;
        h.dispatcher.load_routes().await.unwrap();

        let payload = event("users/user");
        let message = MqMessage {
            subject: "incoming".into(),
            data: payload.clone().into(),
            num_delivered: 1,
            sequence_number: 1,
        };
        assert_eq!(h.dispatcher.dispatch(&message).await.unwrap(), 2);
        for name in ["a", "b"] {
            let stored = h.broker.messages(&format!("stream:{name}")).await;
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].subject, format!("{name}.main"));
            assert_eq!(stored[0].payload.as_ref(), payload.as_slice());
        }
        assert!(h.broker.messages("stream:c").await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_envelope() {
        let h = harness(DispatcherConfig::default());
        let message = MqMessage {
            subject: "incoming".into(),
            data: br#"{"realm": "udm"}"#.to_vec().into(),
            num_delivered: 1,
            sequence_number: 1,
        };
        assert!(matches!(
            h.dispatcher.dispatch(&message).await,
            Err(DispatchError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_loop_acks_after_fan_out() {
        let h = harness(DispatcherConfig::default());
        h.subscribe("a", "users/user").await;
        let (stop, handle) = h.start();

        eventually(|| async { h.broker.stream_info("stream:incoming").await.unwrap().is_some() })
            .await;
        h.publish(&event("users/user")).await;
        h.publish(&event("nobody/cares")).await;

        eventually(|| async { h.broker.messages("stream:incoming").await.is_empty() }).await;
        assert_eq!(h.broker.messages("stream:a").await.len(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_event_dropped_after_redeliveries() {
        let h = harness(DispatcherConfig::default());
        let (stop, handle) = h.start();
        eventually(|| async { h.broker.stream_info("stream:incoming").await.unwrap().is_some() })
            .await;
        h.publish(b"not json").await;

        eventually(|| async { h.broker.messages("stream:incoming").await.is_empty() }).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_new_subscription_picked_up_live() {
        let h = harness(DispatcherConfig::default());
        let (stop, handle) = h.start();
        eventually(|| async { h.broker.stream_info("stream:incoming").await.unwrap().is_some() })
            .await;
        assert!(h.dispatcher.routing_table().is_empty());

        h.subscribe("late", "users/user").await;
        eventually(|| async { !h.dispatcher.routing_table().is_empty() }).await;
        h.publish(&event("users/user")).await;
        eventually(|| async { h.broker.messages("stream:late").await.len() == 1 }).await;

        h.kv.delete("late", Bucket::Subscriptions).await.unwrap();
        eventually(|| async { h.dispatcher.routing_table().is_empty() }).await;

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ingestion_migration_drains_then_recreates() {
        // A single dispatcher left an event behind on a work-queue stream.
        let h = harness(DispatcherConfig {
            redundant_replicas: true,
            ..DispatcherConfig::default()
        });
        let old = QueueSpec::incoming(false);
        h.queues.initialize_subscription(&old, false).await.unwrap();
        h.subscribe("a", "users/user").await;
        h.queues
            .add_raw(&old, "incoming", event("users/user").into())
            .await
            .unwrap();

        let (stop, handle) = h.start();
        eventually(|| async {
            h.broker
                .stream_info("stream:incoming")
                .await
                .unwrap()
                .is_some_and(|info| {
                    !info.config.sealed
                        && info.config.retention == prov_queue::RetentionPolicy::Interest
                })
        })
        .await;
        assert_eq!(h.broker.messages("stream:a").await.len(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_fan_out_is_redelivered() {
        let flaky = FlakyBroker::default();
        let h = harness_on(
            DispatcherConfig::default(),
            flaky.inner.clone(),
            Arc::new(flaky.clone()),
            KvAdapter::in_memory().unwrap(),
        );
        h.subscribe("a", "users/user").await;
        h.subscribe("b", "users/user").await;
        flaky.fail_publish("stream:b", 1);
        let (stop, handle) = h.start();
        eventually(|| async { h.broker.stream_info("stream:incoming").await.unwrap().is_some() })
            .await;

        h.publish(&event("users/user")).await;
        eventually(|| async { h.broker.messages("stream:incoming").await.is_empty() }).await;

        // The nak'ed delivery fanned out again; `a` may hold a duplicate.
        assert_eq!(h.broker.messages("stream:b").await.len(), 1);
        assert!((1..=2).contains(&h.broker.messages("stream:a").await.len()));

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_vanished_subscriber_skipped_and_event_acked() {
        let h = harness(DispatcherConfig::default());
        h.subscribe("a", "users/user").await;
        h.subscribe("gone", "users/user").await;
        // Stream removed while the subscription row is still routed.
        h.queues
            .delete_stream(&QueueSpec::subscription("gone"))
            .await
            .unwrap();
        h.dispatcher.load_routes().await.unwrap();

        let message = MqMessage {
            subject: "incoming".into(),
            data: event("users/user").into(),
            num_delivered: 1,
            sequence_number: 1,
        };
        assert_eq!(h.dispatcher.dispatch(&message).await.unwrap(), 1);

        let (stop, handle) = h.start();
        eventually(|| async { h.broker.stream_info("stream:incoming").await.unwrap().is_some() })
            .await;
        h.publish(&event("users/user")).await;
        eventually(|| async { h.broker.messages("stream:incoming").await.is_empty() }).await;
        assert_eq!(h.broker.messages("stream:a").await.len(), 2);
        assert!(h.broker.stream_info("stream:gone").await.unwrap().is_none());

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_routing_watch_end_stops_dispatcher() {
        let broker = MemoryBroker::new();
        let kv = KvAdapter::new(Arc::new(EndedWatch(RedbKv::open_in_memory().unwrap())));
        let h = harness_on(DispatcherConfig::default(), broker.clone(), Arc::new(broker), kv);

        let (_stop, handle) = h.start();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher kept running without routing updates")
            .unwrap();
        assert!(matches!(result, Err(DispatchError::WatchClosed)));
    }
}

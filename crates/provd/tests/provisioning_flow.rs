//! End-to-end provisioning flows.
//!
//! Registry, dispatcher, prefill service and subscriber reads wired
//! together in-process over `MemoryBroker` and the in-memory KV store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prov_core::config::{DispatcherConfig, PrefillConfig};
use prov_core::constants::INCOMING_QUEUE;
use prov_core::{Body, FillQueueStatus, Message, NewSubscription, PublisherName, RealmTopic};
use prov_dispatcher::Dispatcher;
use prov_prefill::{ObjectSource, ObjectType, PrefillService, RetryPolicy, SourceError, SourceResult};
use prov_queue::{AckWaitSupervisor, MemoryBroker, QueueAdapter, QueueSpec};
use prov_registry::{MessageReader, PasswordHasher, RegistryError, SubscriptionRegistry};
use prov_state::KvAdapter;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Directory {
    objects: BTreeMap<&'static str, Vec<&'static str>>,
    down: bool,
}

impl Directory {
    fn up() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert("users/user", vec!["uid=alice", "uid=bob"]);
        objects.insert("groups/group", vec!["cn=staff"]);
        Self {
            objects,
            down: false,
        }
    }

    fn down() -> Self {
        Self {
            down: true,
            ..Self::up()
        }
    }
}

#[async_trait]
impl ObjectSource for Directory {
    async fn list_object_types(&self) -> SourceResult<Vec<ObjectType>> {
        if self.down {
            return Err(SourceError::Http {
                url: "udm://".into(),
                reason: "connection refused".into(),
            });
        }
        Ok(self
            .objects
            .keys()
            .map(|name| ObjectType {
                name: name.to_string(),
                title: String::new(),
                href: String::new(),
            })
            .collect())
    }

    async fn list_object_urls(&self, object_type: &str) -> SourceResult<Vec<String>> {
        Ok(self
            .objects
            .get(object_type)
            .map(|dns| dns.iter().map(|dn| format!("udm://{object_type}/{dn}")).collect())
            .unwrap_or_default())
    }

    async fn get_object(&self, url: &str) -> SourceResult<Map<String, Value>> {
        let dn = url.rsplit('/').next().unwrap_or_default();
        Ok(object(json!({ "dn": dn })))
    }
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

struct Bus {
    broker: MemoryBroker,
    queues: QueueAdapter,
    registry: SubscriptionRegistry,
    reader: MessageReader,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bus {
    fn new() -> Self {
        let broker = MemoryBroker::new();
        let queues = QueueAdapter::new(Arc::new(broker.clone()), 1, Duration::from_secs(30));
        let registry = SubscriptionRegistry::with_hasher(
            KvAdapter::in_memory().unwrap(),
            queues.clone(),
            PasswordHasher::with_params(1024, 1, 1).unwrap(),
        );
        let reader = MessageReader::new(registry.clone());
        let (stop, _) = watch::channel(false);
        Self {
            broker,
            queues,
            registry,
            reader,
            stop,
            tasks: Vec::new(),
        }
    }

    async fn register(&self, name: &str, prefill: bool) {
        self.registry
            .register(NewSubscription {
                name: name.into(),
                realms_topics: vec![RealmTopic::new("udm", "users/.*")],
                request_prefill: prefill,
                password: "secret".into(),
            })
            .await
            .unwrap();
    }

    async fn start_dispatcher(&mut self) -> Dispatcher {
        let dispatcher = Dispatcher::new(
            self.queues.clone(),
            self.registry.kv().clone(),
            AckWaitSupervisor::default(),
            &DispatcherConfig::default(),
        )
        .with_poll_timeout(Duration::from_millis(20));
        let worker = dispatcher.clone();
        let shutdown = self.stop.subscribe();
        self.tasks.push(tokio::spawn(async move {
            worker.run(shutdown).await.unwrap();
        }));
        let incoming = QueueSpec::incoming(false);
        eventually(|| async { self.queues.stream_exists(&incoming).await.unwrap() }).await;
        dispatcher
    }

    fn start_prefill(&mut self, source: Directory, config: PrefillConfig) {
        let service = PrefillService::new(
            self.queues.clone(),
            Arc::new(source),
            Arc::new(self.registry.clone()),
            AckWaitSupervisor::default(),
            &config,
        )
        .with_retry(RetryPolicy::new(Duration::ZERO, Duration::ZERO, 1))
        .with_poll_timeout(Duration::from_millis(20));
        let shutdown = self.stop.subscribe();
        self.tasks.push(tokio::spawn(async move {
            service.run(shutdown).await.unwrap();
        }));
    }

    async fn publish(&self, message: &Message) {
        self.queues
            .add_message(&QueueSpec::incoming(false), INCOMING_QUEUE, message)
            .await
            .unwrap();
    }

    async fn shutdown(self) {
        self.stop.send(true).unwrap();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn user_event(dn: &str) -> Message {
    Message::new(
        PublisherName::UdmListener,
        "udm",
        "users/user",
        Body::created(object(json!({ "dn": dn }))),
    )
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn live_event_reaches_subscriber() {
    let mut bus = Bus::new();
    bus.register("ox", false).await;
    bus.start_dispatcher().await;

    let sent = user_event("uid=carol");
    bus.publish(&sent).await;

    let got = bus
        .reader
        .next_message("ox", Duration::from_secs(3), false)
        .await
        .unwrap()
        .expect("event routed to ox");
    assert_eq!(got.sequence_number, 1);
    assert_eq!(got.num_delivered, 1);
    assert_eq!(got.message, sent);

    bus.reader
        .report_status("ox", got.sequence_number, prov_core::MessageProcessingStatus::Ok)
        .await
        .unwrap();
    assert!(bus
        .reader
        .next_message("ox", Duration::from_millis(50), false)
        .await
        .unwrap()
        .is_none());
    assert!(bus.broker.messages("stream:incoming").await.is_empty());

    bus.shutdown().await;
}

#[tokio::test]
async fn backfill_precedes_live_events() {
    let mut bus = Bus::new();
    bus.register("ox", true).await;
    bus.start_dispatcher().await;
    bus.publish(&user_event("uid=carol")).await;
    bus.start_prefill(Directory::up(), PrefillConfig::default());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let got = bus
            .reader
            .next_message("ox", Duration::from_secs(5), true)
            .await
            .unwrap()
            .expect("message for ox");
        seen.push((got.message.publisher_name, got.message.body.new["dn"].clone()));
    }
    assert_eq!(
        seen,
        [
            (PublisherName::UdmPrefill, json!("uid=alice")),
            (PublisherName::UdmPrefill, json!("uid=bob")),
            (PublisherName::UdmListener, json!("uid=carol")),
        ]
    );
    assert_eq!(
        bus.registry.prefill_status("ox").await.unwrap(),
        FillQueueStatus::Done
    );

    bus.shutdown().await;
}

#[tokio::test]
async fn failed_prefill_is_quarantined() {
    let mut bus = Bus::new();
    bus.register("ox", true).await;
    bus.start_prefill(
        Directory::down(),
        PrefillConfig {
            max_prefill_attempts: 2,
            ..PrefillConfig::default()
        },
    );

    eventually(|| async {
        bus.registry.prefill_status("ox").await.unwrap() == FillQueueStatus::Failed
    })
    .await;
    eventually(|| async { bus.broker.messages("stream:prefill").await.is_empty() }).await;
    assert_eq!(bus.broker.messages("stream:prefill-failures").await.len(), 1);

    // The subscriber never gets past a failed backfill.
    assert!(bus
        .reader
        .next_message("ox", Duration::from_millis(50), false)
        .await
        .unwrap()
        .is_none());

    bus.shutdown().await;
}

#[tokio::test]
async fn deleted_subscription_stops_routing() {
    let mut bus = Bus::new();
    bus.register("ox", false).await;
    bus.register("nb", false).await;
    let dispatcher = bus.start_dispatcher().await;
    eventually(|| async { dispatcher.routing_table().lookup("udm", "users/user").len() == 2 }).await;

    bus.registry.delete("ox").await.unwrap();
    eventually(|| async { dispatcher.routing_table().lookup("udm", "users/user").len() == 1 }).await;
    assert!(!bus.queues.stream_exists(&QueueSpec::subscription("ox")).await.unwrap());

    bus.publish(&user_event("uid=dave")).await;
    eventually(|| async { bus.broker.messages("stream:incoming").await.is_empty() }).await;
    assert_eq!(bus.broker.messages("stream:nb").await.len(), 1);
    assert!(matches!(
        bus.reader.next_message("ox", Duration::ZERO, false).await,
        Err(RegistryError::NotFound(_))
    ));

    bus.shutdown().await;
}

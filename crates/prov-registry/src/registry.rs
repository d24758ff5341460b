//! SubscriptionRegistry — create, inspect and remove subscriptions.
//!
//! A subscription is two rows plus a queue: the password hash in
//! `CREDENTIALS`, the metadata in `SUBSCRIPTIONS`, and the stream/consumer
//! pair named after it. Registration writes the credential first and the
//! metadata second; deletion removes them in the opposite order. Status
//! updates go through the store's revision check so concurrent writers
//! can not overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prov_core::constants::PREFILL_QUEUE;
use prov_core::{
    FillQueueStatus, NewSubscription, PrefillRequest, Subscription, same_realms_topics,
};
use prov_queue::{QueueAdapter, QueueSpec};
use prov_state::{Bucket, KvAdapter};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::password::PasswordHasher;

/// How long a successful login is remembered.
const AUTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// Attempts of a status update racing other writers.
const STATUS_UPDATE_ATTEMPTS: usize = 10;

const PREFILL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of [`SubscriptionRegistry::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(Subscription),
    /// An identical subscription was already registered.
    Existing(Subscription),
}

impl Registration {
    pub fn subscription(&self) -> &Subscription {
        match self {
            Registration::Created(s) | Registration::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Resources a registration made itself and may remove again.
#[derive(Debug, Default)]
struct Created {
    metadata: bool,
    stream: bool,
    consumer: bool,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    kv: KvAdapter,
    queues: QueueAdapter,
    hasher: PasswordHasher,
    auth_cache: Arc<Mutex<HashMap<(String, String), Instant>>>,
}

impl SubscriptionRegistry {
    pub fn new(kv: KvAdapter, queues: QueueAdapter) -> Self {
        Self::with_hasher(kv, queues, PasswordHasher::default())
    }

    pub fn with_hasher(kv: KvAdapter, queues: QueueAdapter, hasher: PasswordHasher) -> Self {
        Self {
            kv,
            queues,
            hasher,
            auth_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn kv(&self) -> &KvAdapter {
        &self.kv
    }

    pub fn queues(&self) -> &QueueAdapter {
        &self.queues
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Register a subscription, or confirm an identical existing one.
    pub async fn register(&self, mut new: NewSubscription) -> RegistryResult<Registration> {
        new.validate()?;
        let name = new.name.clone();

        if let Some(hash) = self.credential(&name).await? {
            return self.compare_existing(&new, &hash).await;
        }

        let hash = self.hash_password(&new.password).await?;
        self.kv
            .put_value(&name, hash, Bucket::Credentials, None)
            .await?;

        let subscription = new.to_subscription();
        let mut created = Created::default();
        if let Err(e) = self.provision(&subscription, &mut created).await {
            error!(subscription = %name, error = %e, ?created, "subscription provisioning failed, rolling back");
            self.rollback(&name, &created).await;
            return Err(RegistryError::Provisioning {
                name,
                reason: e.to_string(),
            });
        }

        info!(
            subscription = %name,
            request_prefill = subscription.request_prefill,
            status = %subscription.prefill_queue_status,
            "subscription registered"
        );
        Ok(Registration::Created(subscription))
    }

    async fn compare_existing(
        &self,
        new: &NewSubscription,
        hash: &str,
    ) -> RegistryResult<Registration> {
        let Some(existing) = self.find(&new.name).await? else {
            // Credential without metadata: another registration is mid-way.
            return Err(RegistryError::Conflict(format!(
                "subscription `{}` is being registered",
                new.name
            )));
        };
        let same = existing.request_prefill == new.request_prefill
            && same_realms_topics(&existing.realms_topics, &new.realms_topics)
            && self.verify_password(&new.password, hash).await?;
        if same {
            debug!(subscription = %new.name, "identical subscription already registered");
            Ok(Registration::Existing(existing))
        } else {
            Err(RegistryError::Conflict(format!(
                "subscription `{}` already exists with different parameters",
                new.name
            )))
        }
    }

    async fn provision(&self, subscription: &Subscription, created: &mut Created) -> RegistryResult<()> {
        let name = &subscription.name;
        self.kv
            .put_json(name, subscription, Bucket::Subscriptions, None)
            .await?;
        created.metadata = true;

        let queue = QueueSpec::subscription(name);
        // A stream or consumer found in place is not ours to roll back.
        let stream_existed = self.queues.stream_exists(&queue).await?;
        self.queues.ensure_stream(&queue, false).await?;
        created.stream = !stream_existed;
        let consumer_existed = self.queues.consumer_exists(&queue).await?;
        self.queues.ensure_consumer(&queue).await?;
        created.consumer = !consumer_existed;

        if subscription.request_prefill {
            let prefill = QueueSpec::prefill();
            self.queues.ensure_stream(&prefill, false).await?;
            let request = PrefillRequest::new(name.clone(), subscription.realms_topics.clone());
            let seq = self
                .queues
                .add_message(&prefill, PREFILL_QUEUE, &request)
                .await?;
            info!(subscription = %name, seq, "prefill requested");
        }
        Ok(())
    }

    /// Best-effort removal of what a failed registration created. Failures
    /// are logged; the caller reports the provisioning error.
    async fn rollback(&self, name: &str, created: &Created) {
        let queue = QueueSpec::subscription(name);
        if created.metadata
            && let Err(e) = self.kv.delete(name, Bucket::Subscriptions).await
        {
            error!(subscription = %name, error = %e, "rollback: metadata delete failed");
        }
        if created.consumer
            && let Err(e) = self.queues.delete_consumer(&queue).await
        {
            error!(subscription = %name, error = %e, "rollback: consumer delete failed");
        }
        if created.stream
            && let Err(e) = self.queues.delete_stream(&queue).await
        {
            error!(subscription = %name, error = %e, "rollback: stream delete failed");
        }
        if let Err(e) = self.kv.delete(name, Bucket::Credentials).await {
            error!(subscription = %name, error = %e, "rollback: credential delete failed");
        }
    }

    /// Remove a subscription with its credential, consumer and stream.
    pub async fn delete(&self, name: &str) -> RegistryResult<()> {
        if self.find(name).await?.is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        self.kv.delete(name, Bucket::Subscriptions).await?;
        self.kv.delete(name, Bucket::Credentials).await?;

        let queue = QueueSpec::subscription(name);
        self.queues.delete_consumer(&queue).await?;
        self.queues.delete_stream(&queue).await?;

        self.auth_cache
            .lock()
            .await
            .retain(|(user, _), _| user != name);
        info!(subscription = %name, "subscription deleted");
        Ok(())
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub async fn find(&self, name: &str) -> RegistryResult<Option<Subscription>> {
        Ok(self.kv.get_json(name, Bucket::Subscriptions).await?)
    }

    pub async fn get(&self, name: &str) -> RegistryResult<Subscription> {
        self.find(name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> RegistryResult<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> =
            self.kv.all_json(Bucket::Subscriptions).await?;
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subscriptions)
    }

    // ── Prefill status ─────────────────────────────────────────────

    pub async fn prefill_status(&self, name: &str) -> RegistryResult<FillQueueStatus> {
        Ok(self.get(name).await?.prefill_queue_status)
    }

    /// Move the prefill status forward with a revision-checked write.
    ///
    /// Setting the current status again is a no-op. Moving backwards, or
    /// out of a terminal state, is a [`RegistryError::Conflict`].
    pub async fn set_prefill_status(
        &self,
        name: &str,
        status: FillQueueStatus,
    ) -> RegistryResult<Subscription> {
        for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
            let Some((mut subscription, revision)) = self
                .kv
                .get_json_with_revision::<Subscription>(name, Bucket::Subscriptions)
                .await?
            else {
                return Err(RegistryError::NotFound(name.to_string()));
            };

            let current = subscription.prefill_queue_status;
            if current == status {
                return Ok(subscription);
            }
            if !current.can_transition_to(status) {
                return Err(RegistryError::Conflict(format!(
                    "prefill status of `{name}` can not move from {current} to {status}"
                )));
            }

            subscription.prefill_queue_status = status;
            match self
                .kv
                .put_json(name, &subscription, Bucket::Subscriptions, Some(revision))
                .await
            {
                Ok(_) => {
                    info!(subscription = %name, from = %current, to = %status, "prefill status updated");
                    return Ok(subscription);
                }
                Err(e) if e.is_conflict() => {
                    debug!(subscription = %name, attempt, "concurrent status update, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RegistryError::Conflict(format!(
            "prefill status of `{name}` kept changing concurrently"
        )))
    }

    /// Wait until the subscription's prefill is done.
    ///
    /// Polls once a second. Returns `false` if `timeout` elapses first.
    pub async fn wait_for_prefill(&self, name: &str, timeout: Duration) -> RegistryResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.prefill_status(name).await? == FillQueueStatus::Done {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(PREFILL_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    // ── Credentials ────────────────────────────────────────────────

    async fn credential(&self, name: &str) -> RegistryResult<Option<String>> {
        let raw = self.kv.get_value(name, Bucket::Credentials).await?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Check a subscriber's basic-auth credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> RegistryResult<()> {
        let key = (username.to_string(), password.to_string());
        {
            let mut cache = self.auth_cache.lock().await;
            match cache.get(&key) {
                Some(expires) if *expires > Instant::now() => return Ok(()),
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let Some(hash) = self.credential(username).await? else {
            warn!(user = %username, "authentication for unknown subscription");
            return Err(RegistryError::Unauthorized(username.to_string()));
        };
        if !self.verify_password(password, &hash).await? {
            warn!(user = %username, "authentication failed");
            return Err(RegistryError::Unauthorized(username.to_string()));
        }

        self.auth_cache
            .lock()
            .await
            .insert(key, Instant::now() + AUTH_CACHE_TTL);
        Ok(())
    }

    async fn hash_password(&self, password: &str) -> RegistryResult<String> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| RegistryError::Hashing(e.to_string()))?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> RegistryResult<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| RegistryError::Hashing(e.to_string()))?
    }
}

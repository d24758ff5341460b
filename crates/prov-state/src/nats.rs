//! NatsKv — key-value backend on NATS JetStream buckets.

use std::collections::HashMap;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{KvBackend, KvEntry, WatchEvent, WatchOp, WatchStream};
use crate::bucket::Bucket;
use crate::error::{StateError, StateResult};

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn watch_op(op: kv::Operation) -> WatchOp {
    match op {
        kv::Operation::Put => WatchOp::Put,
        kv::Operation::Delete => WatchOp::Delete,
        kv::Operation::Purge => WatchOp::Purge,
    }
}

/// The conflict error for a write that expected `expected`.
async fn conflict(store: &kv::Store, bucket: Bucket, key: &str, expected: u64) -> StateError {
    let current = store
        .entry(key)
        .await
        .ok()
        .flatten()
        .filter(|e| e.operation == kv::Operation::Put)
        .map(|e| e.revision);
    StateError::UpdateConflict {
        bucket: bucket.to_string(),
        key: key.to_string(),
        expected,
        current,
    }
}

/// JetStream key-value buckets, opened lazily and cached per bucket.
pub struct NatsKv {
    js: jetstream::Context,
    stores: Mutex<HashMap<Bucket, kv::Store>>,
}

impl NatsKv {
    pub fn new(js: jetstream::Context) -> Self {
        Self {
            js,
            stores: Mutex::new(HashMap::new()),
        }
    }

    async fn store(&self, bucket: Bucket) -> StateResult<kv::Store> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&bucket) {
            return Ok(store.clone());
        }
        let store = match self.js.get_key_value(bucket.as_str()).await {
            Ok(store) => store,
            Err(err) => {
                debug!(%bucket, error = %err, "kv bucket not found, creating it");
                let store = self
                    .js
                    .create_key_value(kv::Config {
                        bucket: bucket.as_str().to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(map_err!(Backend))?;
                info!(%bucket, "kv bucket created");
                store
            }
        };
        stores.insert(bucket, store.clone());
        Ok(store)
    }
}

#[async_trait]
impl KvBackend for NatsKv {
    async fn ensure_bucket(&self, bucket: Bucket) -> StateResult<()> {
        self.store(bucket).await.map(|_| ())
    }

    async fn entry(&self, bucket: Bucket, key: &str) -> StateResult<Option<KvEntry>> {
        let store = self.store(bucket).await?;
        let entry = store.entry(key).await.map_err(map_err!(Backend))?;
        Ok(entry
            .filter(|e| e.operation == kv::Operation::Put)
            .map(|e| KvEntry {
                key: e.key,
                value: e.value,
                revision: e.revision,
            }))
    }

    async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> StateResult<u64> {
        let store = self.store(bucket).await?;
        store.put(key, value).await.map_err(map_err!(Backend))
    }

    async fn update(
        &self,
        bucket: Bucket,
        key: &str,
        value: Bytes,
        expected_revision: u64,
    ) -> StateResult<u64> {
        let store = self.store(bucket).await?;
        match store.update(key, value, expected_revision).await {
            Ok(revision) => Ok(revision),
            Err(err) if err.kind() == kv::UpdateErrorKind::WrongLastRevision => {
                Err(conflict(&store, bucket, key, expected_revision).await)
            }
            Err(err) => Err(StateError::Backend(err.to_string())),
        }
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> StateResult<()> {
        let store = self.store(bucket).await?;
        store.delete(key).await.map_err(map_err!(Backend))
    }

    async fn delete_with_revision(
        &self,
        bucket: Bucket,
        key: &str,
        expected_revision: u64,
    ) -> StateResult<()> {
        let store = self.store(bucket).await?;
        match store.delete_expect_revision(key, Some(expected_revision)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == kv::UpdateErrorKind::WrongLastRevision => {
                Err(conflict(&store, bucket, key, expected_revision).await)
            }
            Err(err) => Err(StateError::Backend(err.to_string())),
        }
    }

    async fn keys(&self, bucket: Bucket) -> StateResult<Vec<String>> {
        let store = self.store(bucket).await?;
        let keys = store.keys().await.map_err(map_err!(Backend))?;
        keys.try_collect().await.map_err(map_err!(Backend))
    }

    async fn watch(&self, bucket: Bucket) -> StateResult<WatchStream> {
        let store = self.store(bucket).await?;
        let watch = store.watch_all().await.map_err(map_err!(Watch))?;
        Ok(watch
            .map(|item| {
                item.map(|e| WatchEvent {
                    key: e.key,
                    op: watch_op(e.operation),
                    value: e.value,
                    revision: e.revision,
                })
                .map_err(|e| StateError::Watch(e.to_string()))
            })
            .boxed())
    }
}

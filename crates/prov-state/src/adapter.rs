//! KvAdapter — JSON and optimistic concurrency over a [`KvBackend`].
//!
//! The adapter creates buckets on first use, treats an empty value as a
//! delete (so "absent" and "empty" never coexist) and exposes the
//! revision-checked update that callers build compare-and-swap loops on.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{KvBackend, WatchOp};
use crate::bucket::Bucket;
use crate::embedded::RedbKv;
use crate::error::{StateError, StateResult};

/// Changes on a bucket: `(key, Some(value))` for writes, `(key, None)` for deletes.
pub type ChangeStream = BoxStream<'static, StateResult<(String, Option<Bytes>)>>;

/// Payloads that count as "no value".
fn is_empty_value(value: &[u8]) -> bool {
    matches!(
        value.trim_ascii(),
        b"" | b"{}" | b"[]" | b"null" | b"\"\""
    )
}

#[derive(Clone)]
pub struct KvAdapter {
    backend: Arc<dyn KvBackend>,
    ready: Arc<Mutex<HashSet<Bucket>>>,
}

impl KvAdapter {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            ready: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Adapter over a fresh in-memory store.
    pub fn in_memory() -> StateResult<Self> {
        Ok(Self::new(Arc::new(RedbKv::open_in_memory()?)))
    }

    /// Create the given buckets up front.
    pub async fn init(&self, buckets: &[Bucket]) -> StateResult<()> {
        for bucket in buckets {
            self.bucket(*bucket).await?;
        }
        Ok(())
    }

    async fn bucket(&self, bucket: Bucket) -> StateResult<()> {
        let mut ready = self.ready.lock().await;
        if !ready.contains(&bucket) {
            self.backend.ensure_bucket(bucket).await?;
            ready.insert(bucket);
            debug!(%bucket, "kv bucket ready");
        }
        Ok(())
    }

    pub async fn get_value(&self, key: &str, bucket: Bucket) -> StateResult<Option<Bytes>> {
        Ok(self
            .get_value_with_revision(key, bucket)
            .await?
            .map(|(value, _)| value))
    }

    pub async fn get_value_with_revision(
        &self,
        key: &str,
        bucket: Bucket,
    ) -> StateResult<Option<(Bytes, u64)>> {
        self.bucket(bucket).await?;
        let entry = self.backend.entry(bucket, key).await?;
        Ok(entry.map(|e| (e.value, e.revision)))
    }

    /// Store `value` under `key`.
    ///
    /// An empty value deletes the key instead. With `revision` set, the
    /// write only happens if the entry is still at that revision and fails
    /// with [`StateError::UpdateConflict`] otherwise. Returns the new
    /// revision, or `None` after a delete.
    pub async fn put_value(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        bucket: Bucket,
        revision: Option<u64>,
    ) -> StateResult<Option<u64>> {
        self.bucket(bucket).await?;
        let value = value.into();
        if is_empty_value(&value) {
            match revision {
                Some(expected) => {
                    self.backend
                        .delete_with_revision(bucket, key, expected)
                        .await?
                }
                None => self.backend.delete(bucket, key).await?,
            }
            return Ok(None);
        }
        let new_revision = match revision {
            Some(expected) => self.backend.update(bucket, key, value, expected).await?,
            None => self.backend.put(bucket, key, value).await?,
        };
        Ok(Some(new_revision))
    }

    pub async fn delete(&self, key: &str, bucket: Bucket) -> StateResult<()> {
        self.bucket(bucket).await?;
        self.backend.delete(bucket, key).await
    }

    pub async fn keys(&self, bucket: Bucket) -> StateResult<Vec<String>> {
        self.bucket(bucket).await?;
        self.backend.keys(bucket).await
    }

    /// Lazy, endless stream of changes committed after the call.
    pub async fn watch(&self, bucket: Bucket) -> StateResult<ChangeStream> {
        self.bucket(bucket).await?;
        let events = self.backend.watch(bucket).await?;
        Ok(events
            .map(|item| {
                item.map(|event| match event.op {
                    WatchOp::Put => (event.key, Some(event.value)),
                    WatchOp::Delete | WatchOp::Purge => (event.key, None),
                })
            })
            .boxed())
    }

    // ── JSON ───────────────────────────────────────────────────────

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        bucket: Bucket,
    ) -> StateResult<Option<T>> {
        Ok(self
            .get_json_with_revision(key, bucket)
            .await?
            .map(|(value, _)| value))
    }

    pub async fn get_json_with_revision<T: DeserializeOwned>(
        &self,
        key: &str,
        bucket: Bucket,
    ) -> StateResult<Option<(T, u64)>> {
        match self.get_value_with_revision(key, bucket).await? {
            Some((raw, revision)) => {
                let value = serde_json::from_slice(&raw)
                    .map_err(|e| StateError::Deserialize(format!("{bucket}/{key}: {e}")))?;
                Ok(Some((value, revision)))
            }
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        bucket: Bucket,
        revision: Option<u64>,
    ) -> StateResult<Option<u64>> {
        let raw = serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.put_value(key, raw, bucket, revision).await
    }

    /// Every value in the bucket. Keys deleted between listing and reading are skipped.
    pub async fn all_json<T: DeserializeOwned>(&self, bucket: Bucket) -> StateResult<Vec<T>> {
        let mut values = Vec::new();
        for key in self.keys(bucket).await? {
            if let Some(value) = self.get_json(&key, bucket).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[tokio::test]
    async fn test_empty_value_deletes_in_every_bucket() {
        let kv = KvAdapter::in_memory().unwrap();
        for bucket in Bucket::ALL {
            kv.put_value("k", "v", bucket, None).await.unwrap();
            for empty in ["", "{}", "[]", "null", " "] {
                kv.put_value("k", "v", bucket, None).await.unwrap();
                assert_eq!(kv.put_value("k", empty, bucket, None).await.unwrap(), None);
                assert!(kv.get_value("k", bucket).await.unwrap().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_revision_mismatch_leaves_value() {
        let kv = KvAdapter::in_memory().unwrap();
        let r1 = kv
            .put_json("s", &Row { n: 1 }, Bucket::Subscriptions, None)
            .await
            .unwrap()
            .unwrap();
        let r2 = kv
            .put_json("s", &Row { n: 2 }, Bucket::Subscriptions, Some(r1))
            .await
            .unwrap()
            .unwrap();
        assert!(r2 > r1);

        let err = kv
            .put_json("s", &Row { n: 3 }, Bucket::Subscriptions, Some(r1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let (row, rev) = kv
            .get_json_with_revision::<Row>("s", Bucket::Subscriptions)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, Row { n: 2 });
        assert_eq!(rev, r2);
    }

    #[tokio::test]
    async fn test_empty_value_with_stale_revision_keeps_row() {
        let kv = KvAdapter::in_memory().unwrap();
        let r1 = kv
            .put_value("s", "one", Bucket::Subscriptions, None)
            .await
            .unwrap()
            .unwrap();
        let r2 = kv
            .put_value("s", "two", Bucket::Subscriptions, Some(r1))
            .await
            .unwrap()
            .unwrap();

        let err = kv
            .put_value("s", "", Bucket::Subscriptions, Some(r1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            kv.get_value_with_revision("s", Bucket::Subscriptions)
                .await
                .unwrap(),
            Some((Bytes::from_static(b"two"), r2))
        );

        assert_eq!(
            kv.put_value("s", "", Bucket::Subscriptions, Some(r2))
                .await
                .unwrap(),
            None
        );
        assert!(kv.get_value("s", Bucket::Subscriptions).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_value_with_revision_on_absent_key_conflicts() {
        let kv = KvAdapter::in_memory().unwrap();
        let err = kv
            .put_value("ghost", "", Bucket::Cache, Some(4))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let kv = KvAdapter::in_memory().unwrap();
        let r1 = kv
            .put_json("s", &Row { n: 0 }, Bucket::Subscriptions, None)
            .await
            .unwrap();
        let a = kv.put_json("s", &Row { n: 1 }, Bucket::Subscriptions, r1);
        let b = kv.put_json("s", &Row { n: 2 }, Bucket::Subscriptions, r1);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_watch_maps_deletes_to_none() {
        let kv = KvAdapter::in_memory().unwrap();
        let mut changes = kv.watch(Bucket::Subscriptions).await.unwrap();
        kv.put_value("a", "1", Bucket::Subscriptions, None).await.unwrap();
        kv.put_value("a", "", Bucket::Subscriptions, None).await.unwrap();

        let (key, value) = changes.next().await.unwrap().unwrap();
        assert_eq!(key, "a");
        assert_eq!(value, Some(Bytes::from_static(b"1")));
        let (_, value) = changes.next().await.unwrap().unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_all_json() {
        let kv = KvAdapter::in_memory().unwrap();
        assert!(kv.all_json::<Row>(Bucket::Cache).await.unwrap().is_empty());
        kv.put_json("a", &Row { n: 1 }, Bucket::Cache, None).await.unwrap();
        kv.put_json("b", &Row { n: 2 }, Bucket::Cache, None).await.unwrap();
        let mut rows = kv.all_json::<Row>(Bucket::Cache).await.unwrap();
        rows.sort_by_key(|r| r.n);
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }
}

//! The key-value collaborator interface.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::bucket::Bucket;
use crate::error::StateResult;

/// A stored value and the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Put,
    Delete,
    Purge,
}

/// A committed change observed on a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub op: WatchOp,
    pub value: Bytes,
    pub revision: u64,
}

/// Endless stream of changes. An `Err` item means events may have been missed.
pub type WatchStream = BoxStream<'static, StateResult<WatchEvent>>;

/// Named buckets of revisioned byte values.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: Bucket) -> StateResult<()>;

    async fn entry(&self, bucket: Bucket, key: &str) -> StateResult<Option<KvEntry>>;

    /// Unconditional write. Returns the new revision.
    async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> StateResult<u64>;

    /// Write only if the entry is still at `expected_revision`.
    ///
    /// Fails with [`StateError::UpdateConflict`](crate::StateError::UpdateConflict)
    /// otherwise, including when the key is absent.
    async fn update(
        &self,
        bucket: Bucket,
        key: &str,
        value: Bytes,
        expected_revision: u64,
    ) -> StateResult<u64>;

    async fn delete(&self, bucket: Bucket, key: &str) -> StateResult<()>;

    /// Delete only if the entry is still at `expected_revision`, with the
    /// same conflict rules as [`KvBackend::update`].
    async fn delete_with_revision(
        &self,
        bucket: Bucket,
        key: &str,
        expected_revision: u64,
    ) -> StateResult<()>;

    async fn keys(&self, bucket: Bucket) -> StateResult<Vec<String>>;

    /// Changes committed after the call.
    async fn watch(&self, bucket: Bucket) -> StateResult<WatchStream>;
}

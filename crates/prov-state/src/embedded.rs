//! RedbKv — embedded key-value backend on redb.
//!
//! Each bucket is a redb table of `&str` keys to `&[u8]` values. A value
//! column holds the 8-byte big-endian revision followed by the payload.
//! Revisions come from a per-bucket counter in a separate table and are
//! bumped in the same transaction as the write. Commits run on the
//! blocking pool; a writer lock spans commit and notification so watchers
//! see events in revision order over a broadcast channel.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::{KvBackend, KvEntry, WatchEvent, WatchOp, WatchStream};
use crate::bucket::Bucket;
use crate::error::{StateError, StateResult};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("kv.SUBSCRIPTIONS");
const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("kv.CREDENTIALS");
const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv.CACHE");

/// Last revision handed out, keyed by bucket name.
const REVISIONS: TableDefinition<&str, u64> = TableDefinition::new("kv.revisions");

const WATCH_CAPACITY: usize = 1024;

fn table(bucket: Bucket) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match bucket {
        Bucket::Subscriptions => SUBSCRIPTIONS,
        Bucket::Credentials => CREDENTIALS,
        Bucket::Cache => CACHE,
    }
}

fn encode(revision: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&revision.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(raw: &[u8]) -> StateResult<(u64, &[u8])> {
    if raw.len() < 8 {
        return Err(StateError::Deserialize(format!(
            "stored value too short ({} bytes)",
            raw.len()
        )));
    }
    let (head, value) = raw.split_at(8);
    let mut revision = [0u8; 8];
    revision.copy_from_slice(head);
    Ok((u64::from_be_bytes(revision), value))
}

enum WriteOp {
    Put(Bytes),
    Delete,
}

/// Thread-safe embedded key-value store.
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<Database>,
    events: broadcast::Sender<(Bucket, WatchEvent)>,
    // Held from transaction start until watchers are notified, so watch
    // events leave in commit order.
    writer: Arc<StdMutex<()>>,
}

impl RedbKv {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        debug!(?path, "kv store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory kv store opened");
        Ok(Self::from_db(db))
    }

    fn from_db(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
            writer: Arc::new(StdMutex::new(())),
        }
    }

    fn read_entry(&self, bucket: Bucket, key: &str) -> StateResult<Option<KvEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(table(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let (revision, value) = decode(guard.value())?;
                Ok(Some(KvEntry {
                    key: key.to_string(),
                    value: Bytes::copy_from_slice(value),
                    revision,
                }))
            }
            None => Ok(None),
        }
    }

    /// Run [`RedbKv::write`] off the async workers; commits block.
    async fn write_blocking(
        &self,
        bucket: Bucket,
        key: &str,
        op: WriteOp,
        expected_revision: Option<u64>,
    ) -> StateResult<Option<u64>> {
        let kv = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || kv.write(bucket, &key, op, expected_revision))
            .await
            .map_err(|e| StateError::Backend(format!("kv writer task failed: {e}")))?
    }

    /// Apply one write in its own transaction and notify watchers.
    /// Returns the new revision, or `None` when a delete found nothing
    /// to remove.
    fn write(
        &self,
        bucket: Bucket,
        key: &str,
        op: WriteOp,
        expected_revision: Option<u64>,
    ) -> StateResult<Option<u64>> {
        let _serialized = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = (|| -> StateResult<Option<u64>> {
            let mut values = txn.open_table(table(bucket)).map_err(map_err!(Table))?;
            let mut revisions = txn.open_table(REVISIONS).map_err(map_err!(Table))?;

            let current = match values.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?.0),
                None => None,
            };
            if let Some(expected) = expected_revision
                && current != Some(expected)
            {
                return Err(StateError::UpdateConflict {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    expected,
                    current,
                });
            }
            if matches!(op, WriteOp::Delete) && current.is_none() {
                return Ok(None);
            }

            let last = revisions
                .get(bucket.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let revision = last + 1;
            revisions
                .insert(bucket.as_str(), revision)
                .map_err(map_err!(Write))?;

            match &op {
                WriteOp::Put(value) => {
                    let raw = encode(revision, value);
                    values
                        .insert(key, raw.as_slice())
                        .map_err(map_err!(Write))?;
                }
                WriteOp::Delete => {
                    values.remove(key).map_err(map_err!(Write))?;
                }
            }
            Ok(Some(revision))
        })();

        let revision = match outcome {
            Ok(revision) => {
                txn.commit().map_err(map_err!(Transaction))?;
                revision
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort kv transaction");
                }
                return Err(e);
            }
        };
        if let Some(revision) = revision {
            let (watch_op, value) = match op {
                WriteOp::Put(value) => (WatchOp::Put, value),
                WriteOp::Delete => (WatchOp::Delete, Bytes::new()),
            };
            self.notify(bucket, key, watch_op, value, revision);
        }
        Ok(revision)
    }

    fn notify(&self, bucket: Bucket, key: &str, op: WatchOp, value: Bytes, revision: u64) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send((
            bucket,
            WatchEvent {
                key: key.to_string(),
                op,
                value,
                revision,
            },
        ));
    }
}

#[async_trait]
impl KvBackend for RedbKv {
    async fn ensure_bucket(&self, bucket: Bucket) -> StateResult<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(table(bucket)).map_err(map_err!(Table))?;
            txn.open_table(REVISIONS).map_err(map_err!(Table))?;
            txn.commit().map_err(map_err!(Transaction))
        })
        .await
        .map_err(|e| StateError::Backend(format!("kv writer task failed: {e}")))?
    }

    async fn entry(&self, bucket: Bucket, key: &str) -> StateResult<Option<KvEntry>> {
        self.read_entry(bucket, key)
    }

    async fn put(&self, bucket: Bucket, key: &str, value: Bytes) -> StateResult<u64> {
        let revision = self
            .write_blocking(bucket, key, WriteOp::Put(value), None)
            .await?
            .ok_or_else(|| StateError::Write(format!("put of {bucket}/{key} produced no revision")))?;
        debug!(%bucket, %key, revision, "kv put");
        Ok(revision)
    }

    async fn update(
        &self,
        bucket: Bucket,
        key: &str,
        value: Bytes,
        expected_revision: u64,
    ) -> StateResult<u64> {
        let revision = self
            .write_blocking(bucket, key, WriteOp::Put(value), Some(expected_revision))
            .await?
            .ok_or_else(|| StateError::Write(format!("update of {bucket}/{key} produced no revision")))?;
        debug!(%bucket, %key, revision, "kv update");
        Ok(revision)
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> StateResult<()> {
        if let Some(revision) = self.write_blocking(bucket, key, WriteOp::Delete, None).await? {
            debug!(%bucket, %key, revision, "kv delete");
        }
        Ok(())
    }

    async fn delete_with_revision(
        &self,
        bucket: Bucket,
        key: &str,
        expected_revision: u64,
    ) -> StateResult<()> {
        if let Some(revision) = self
            .write_blocking(bucket, key, WriteOp::Delete, Some(expected_revision))
            .await?
        {
            debug!(%bucket, %key, revision, "kv delete");
        }
        Ok(())
    }

    async fn keys(&self, bucket: Bucket) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(table(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    async fn watch(&self, bucket: Bucket) -> StateResult<WatchStream> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok((b, event)) if b == bucket => return Some((Ok(event), rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let err = StateError::Watch(format!("watcher lagged by {missed} events"));
                        return Some((Err(err), rx));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

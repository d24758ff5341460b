//! prov-state — revisioned key-value storage for the provisioning bus.
//!
//! # Architecture
//!
//! [`KvBackend`] is the collaborator interface: named buckets of byte
//! values, each entry carrying a per-bucket monotonically increasing
//! revision, plus a watch stream of committed changes. Two backends ship:
//!
//! - [`RedbKv`] — embedded, backed by [redb](https://docs.rs/redb), on disk
//!   or in memory (single node and tests).
//! - [`NatsKv`] — NATS JetStream key-value buckets.
//!
//! [`KvAdapter`] sits on top and gives callers JSON (de)serialization,
//! the empty-value-deletes rule and revision-checked updates.

pub mod adapter;
pub mod backend;
pub mod bucket;
pub mod embedded;
pub mod error;
pub mod nats;

pub use adapter::KvAdapter;
pub use backend::{KvBackend, KvEntry, WatchEvent, WatchOp, WatchStream};
pub use bucket::Bucket;
pub use embedded::RedbKv;
pub use error::{StateError, StateResult};
pub use nats::NatsKv;

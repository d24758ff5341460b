//! Logical namespaces in the key-value store.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    /// Subscription metadata keyed by subscription name.
    Subscriptions,
    /// Password hashes keyed by subscription name.
    Credentials,
    /// Transformer object cache.
    Cache,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Subscriptions, Bucket::Credentials, Bucket::Cache];

    /// Bucket name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Subscriptions => "SUBSCRIPTIONS",
            Bucket::Credentials => "CREDENTIALS",
            Bucket::Cache => "CACHE",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

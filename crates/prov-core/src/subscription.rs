//! Subscriptions and their prefill lifecycle.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// One `(realm, topic)` pair a subscription listens to.
///
/// `topic` is a regex pattern matched in full against producer topics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RealmTopic {
    pub realm: String,
    pub topic: String,
}

impl RealmTopic {
    pub fn new(realm: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for RealmTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.realm, self.topic)
    }
}

/// Compare two realm/topic lists as sets.
pub fn same_realms_topics(a: &[RealmTopic], b: &[RealmTopic]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Compile a topic pattern so that it only matches a whole topic.
pub fn topic_regex(pattern: &str) -> ModelResult<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| ModelError::InvalidTopic {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Progress of a subscription's backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillQueueStatus {
    Pending,
    Running,
    Failed,
    Done,
}

impl FillQueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FillQueueStatus::Done | FillQueueStatus::Failed)
    }

    /// Status moves forward only. Re-asserting the current status is allowed.
    pub fn can_transition_to(self, next: FillQueueStatus) -> bool {
        use FillQueueStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, _) => true,
            (Running, Done | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FillQueueStatus::Pending => "pending",
            FillQueueStatus::Running => "running",
            FillQueueStatus::Failed => "failed",
            FillQueueStatus::Done => "done",
        }
    }
}

impl fmt::Display for FillQueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered subscriber as stored in the `subscriptions` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub realms_topics: Vec<RealmTopic>,
    pub request_prefill: bool,
    pub prefill_queue_status: FillQueueStatus,
}

/// A registration request. The password never leaves the registry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub name: String,
    pub realms_topics: Vec<RealmTopic>,
    pub request_prefill: bool,
    pub password: String,
}

impl fmt::Debug for NewSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSubscription")
            .field("name", &self.name)
            .field("realms_topics", &self.realms_topics)
            .field("request_prefill", &self.request_prefill)
            .finish_non_exhaustive()
    }
}

impl NewSubscription {
    /// Check the request and drop duplicate realm/topic pairs, keeping order.
    pub fn validate(&mut self) -> ModelResult<()> {
        validate_name(&self.name)?;
        if self.password.is_empty() {
            return Err(ModelError::EmptyField("password"));
        }
        if self.realms_topics.is_empty() {
            return Err(ModelError::EmptyField("realms_topics"));
        }
        let mut seen = BTreeSet::new();
        self.realms_topics.retain(|rt| seen.insert(rt.clone()));
        for rt in &self.realms_topics {
            if rt.realm.is_empty() {
                return Err(ModelError::EmptyField("realm"));
            }
            topic_regex(&rt.topic)?;
        }
        Ok(())
    }

    /// The stored record for this request.
    pub fn to_subscription(&self) -> Subscription {
        let prefill_queue_status = if self.request_prefill {
            FillQueueStatus::Pending
        } else {
            FillQueueStatus::Done
        };
        Subscription {
            name: self.name.clone(),
            realms_topics: self.realms_topics.clone(),
            request_prefill: self.request_prefill,
            prefill_queue_status,
        }
    }
}

/// Names double as subject tokens, so they may not contain separators or wildcards.
pub fn validate_name(name: &str) -> ModelResult<()> {
    if name.is_empty() {
        return Err(ModelError::EmptyField("name"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(ModelError::InvalidName(name.to_string()));
    }
    Ok(())
}

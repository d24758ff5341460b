//! Wire envelopes exchanged over the bus.
//!
//! Every payload is JSON. Timestamps are written as RFC 3339 and read
//! leniently: producers that emit naive ISO-8601 strings are taken to be
//! in UTC.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{ModelError, ModelResult};
use crate::subscription::RealmTopic;

/// Known publishers of bus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublisherName {
    #[serde(rename = "udm-listener")]
    UdmListener,
    #[serde(rename = "ldif-producer")]
    LdifProducer,
    #[serde(rename = "udm-pre-fill")]
    UdmPrefill,
    #[serde(rename = "consumer-registration")]
    ConsumerRegistration,
    #[serde(rename = "consumer_client_test")]
    ConsumerClientTest,
}

/// Outcome a subscriber reports for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageProcessingStatus {
    Ok,
    Error,
}

/// Object state before and after a change.
///
/// `null` on the wire is read as an empty object. Extra keys some
/// producers attach (LDAP request metadata) are carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub old: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Body {
    /// Body of a freshly created object.
    pub fn created(new: Map<String, Value>) -> Self {
        Self {
            old: Map::new(),
            new,
            extra: Map::new(),
        }
    }
}

/// A change event routed through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub publisher_name: PublisherName,
    #[serde(with = "timestamp")]
    pub ts: DateTime<Utc>,
    pub realm: String,
    pub topic: String,
    pub body: Body,
}

impl Message {
    pub fn new(
        publisher_name: PublisherName,
        realm: impl Into<String>,
        topic: impl Into<String>,
        body: Body,
    ) -> Self {
        Self {
            publisher_name,
            ts: now(),
            realm: realm.into(),
            topic: topic.into(),
            body,
        }
    }

    /// Decode and validate an event from its wire form.
    pub fn from_slice(payload: &[u8]) -> ModelResult<Self> {
        let message: Message = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.realm.is_empty() {
            return Err(ModelError::EmptyField("realm"));
        }
        if self.topic.is_empty() {
            return Err(ModelError::EmptyField("topic"));
        }
        if self.body.old.is_empty() && self.body.new.is_empty() {
            return Err(ModelError::EmptyBody);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> ModelResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An event as handed to a subscriber, with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningMessage {
    pub sequence_number: u64,
    pub num_delivered: u64,
    #[serde(flatten)]
    pub message: Message,
}

/// Request to backfill a subscription's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillRequest {
    pub publisher_name: PublisherName,
    #[serde(with = "timestamp")]
    pub ts: DateTime<Utc>,
    pub subscription_name: String,
    pub realms_topics: Vec<RealmTopic>,
}

impl PrefillRequest {
    pub fn new(subscription_name: impl Into<String>, realms_topics: Vec<RealmTopic>) -> Self {
        Self {
            publisher_name: PublisherName::ConsumerRegistration,
            ts: now(),
            subscription_name: subscription_name.into(),
            realms_topics,
        }
    }

    pub fn from_slice(payload: &[u8]) -> ModelResult<Self> {
        let request: PrefillRequest = serde_json::from_slice(payload)?;
        if request.subscription_name.is_empty() {
            return Err(ModelError::EmptyField("subscription_name"));
        }
        Ok(request)
    }
}

/// Current time at the precision timestamps are written with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Parse RFC 3339, falling back to a naive ISO-8601 timestamp in UTC.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp `{raw}`: {e}"))
    }
}

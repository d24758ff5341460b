//! Object sources the prefill reads from.

use std::time::Duration;

use async_trait::async_trait;
use prov_core::config::UdmConfig;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response from {url}: {reason}")]
    Format { url: String, reason: String },

    #[error("object source setup failed: {0}")]
    Setup(String),
}

impl SourceError {
    /// Worth another attempt: the request or the server failed, not the content.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Http { .. } | SourceError::Status { .. })
    }
}

/// One object type as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectType {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub href: String,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn list_object_types(&self) -> SourceResult<Vec<ObjectType>>;

    /// URLs of every object of `object_type`.
    async fn list_object_urls(&self, object_type: &str) -> SourceResult<Vec<String>>;

    async fn get_object(&self, url: &str) -> SourceResult<Map<String, Value>>;
}

/// Object listing without properties; one request per object fetches the rest.
const LIST_QUERY: [(&str, &str); 6] = [
    ("scope", "sub"),
    ("hidden", "true"),
    ("properties", "NonExistantDummyProperty"),
    ("page", "1"),
    ("limit", "0"),
    ("dir", "ASC"),
];

/// The UDM REST API.
pub struct UdmRestSource {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl UdmRestSource {
    pub fn new(config: &UdmConfig) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Setup(e.to_string()))?;
        let mut base_url = config.url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> SourceResult<Value> {
        let http = |e: reqwest::Error| SourceError::Http {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.json::<Value>().await.map_err(|e| SourceError::Format {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

fn format_err(url: &str, reason: impl Into<String>) -> SourceError {
    SourceError::Format {
        url: url.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl ObjectSource for UdmRestSource {
    async fn list_object_types(&self) -> SourceResult<Vec<ObjectType>> {
        let url = self.base_url.as_str();
        let mut root = self.get_json(url, &[]).await?;
        let types = root
            .pointer_mut("/_links/udm:object-types")
            .map(Value::take)
            .ok_or_else(|| format_err(url, "no udm:object-types link"))?;
        serde_json::from_value(types).map_err(|e| format_err(url, e.to_string()))
    }

    async fn list_object_urls(&self, object_type: &str) -> SourceResult<Vec<String>> {
        let url = format!("{}{object_type}/", self.base_url);
        let listing = self.get_json(&url, &LIST_QUERY).await?;
        let results = listing
            .get("results")
            .and_then(Value::as_u64)
            .ok_or_else(|| format_err(&url, "missing result count"))?;
        debug!(object_type, results, "objects listed");
        if results == 0 {
            return Ok(Vec::new());
        }
        let objects = listing
            .pointer("/_embedded/udm:object")
            .and_then(Value::as_array)
            .ok_or_else(|| format_err(&url, "missing embedded objects"))?;
        objects
            .iter()
            .map(|object| {
                object
                    .get("uri")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| format_err(&url, "object without uri"))
            })
            .collect()
    }

    async fn get_object(&self, url: &str) -> SourceResult<Map<String, Value>> {
        match self.get_json(url, &[]).await? {
            Value::Object(mut object) => {
                object.remove("_links");
                Ok(object)
            }
            _ => Err(format_err(url, "not a JSON object")),
        }
    }
}

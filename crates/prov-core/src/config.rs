//! provd.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! A handful of connection settings can be overridden from the
//! environment (`PROVD_*`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvConfig {
    pub nats: NatsConfig,
    pub ack: AckConfig,
    pub dispatcher: DispatcherConfig,
    pub prefill: PrefillConfig,
    pub udm: UdmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub server: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub max_reconnect_attempts: usize,
    /// Replica count for streams created by this process.
    pub replicas: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            server: "nats://localhost:4222".to_string(),
            user: None,
            password: None,
            max_reconnect_attempts: 5,
            replicas: 1,
        }
    }
}

/// Ack-wait window negotiated with the broker for long-running handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    pub ack_wait_secs: u64,
    pub ack_threshold_secs: u64,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            ack_wait_secs: 30,
            ack_threshold_secs: 5,
        }
    }
}

impl AckConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn ack_threshold(&self) -> Duration {
        Duration::from_secs(self.ack_threshold_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_timeout_secs: u64,
    /// Several dispatchers read the ingestion queue; use interest retention.
    pub redundant_replicas: bool,
    /// Migrate the ingestion stream when its retention policy changes.
    pub migrate_stream: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 10,
            redundant_replicas: false,
            migrate_stream: true,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefillConfig {
    pub poll_timeout_secs: u64,
    /// `-1` disables the limit.
    pub max_prefill_attempts: i64,
    pub network_retry_starting_interval_secs: f64,
    pub network_retry_max_delay_secs: f64,
    pub network_retry_max_attempts: u32,
}

impl Default for PrefillConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 10,
            max_prefill_attempts: 3,
            network_retry_starting_interval_secs: 1.0,
            network_retry_max_delay_secs: 60.0,
            network_retry_max_attempts: 5,
        }
    }
}

impl PrefillConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Attempt budget, `None` when unlimited.
    pub fn attempt_limit(&self) -> Option<u64> {
        u64::try_from(self.max_prefill_attempts).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdmConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
}

impl Default for UdmConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9979/udm/".to_string(),
            username: String::new(),
            password: String::new(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl ProvConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ProvConfig = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `PROVD_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PROVD_NATS_SERVER") {
            self.nats.server = v;
        }
        if let Some(v) = lookup("PROVD_NATS_USER") {
            self.nats.user = Some(v);
        }
        if let Some(v) = lookup("PROVD_NATS_PASSWORD") {
            self.nats.password = Some(v);
        }
        if let Some(v) = lookup("PROVD_UDM_URL") {
            self.udm.url = v;
        }
        if let Some(v) = lookup("PROVD_UDM_USER") {
            self.udm.username = v;
        }
        if let Some(v) = lookup("PROVD_UDM_PASSWORD") {
            self.udm.password = v;
        }
        match lookup("PROVD_LOG_FORMAT").as_deref() {
            Some("json") => self.logging.format = LogFormat::Json,
            Some("text") => self.logging.format = LogFormat::Text,
            _ => {}
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.ack.ack_threshold_secs >= self.ack.ack_wait_secs {
            anyhow::bail!(
                "ack_threshold_secs ({}) must be smaller than ack_wait_secs ({})",
                self.ack.ack_threshold_secs,
                self.ack.ack_wait_secs
            );
        }
        if self.prefill.max_prefill_attempts < -1 {
            anyhow::bail!("max_prefill_attempts must be -1 or a positive count");
        }
        if self.prefill.network_retry_max_attempts == 0 {
            anyhow::bail!("network_retry_max_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ProvConfig::from_toml("").unwrap();
        assert_eq!(config, ProvConfig::default());
        assert_eq!(config.ack.ack_wait(), Duration::from_secs(30));
        assert_eq!(config.prefill.attempt_limit(), Some(3));
    }

    #[test]
    fn test_parse_sections() {
        let config = ProvConfig::from_toml(
            r#"
[nats]
server = "nats://bus:4222"

[dispatcher]
redundant_replicas = true

[prefill]
max_prefill_attempts = -1
"#,
        )
        .unwrap();
        assert_eq!(config.nats.server, "nats://bus:4222");
        assert!(config.dispatcher.redundant_replicas);
        assert_eq!(config.prefill.attempt_limit(), None);
        assert_eq!(config.ack.ack_threshold_secs, 5);
    }

    #[test]
    fn test_threshold_must_fit_in_window() {
        let err = ProvConfig::from_toml("[ack]\nack_wait_secs = 5\nack_threshold_secs = 5\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROVD_NATS_SERVER", "nats://other:4222"),
            ("PROVD_UDM_USER", "admin"),
            ("PROVD_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        let mut config = ProvConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.nats.server, "nats://other:4222");
        assert_eq!(config.udm.username, "admin");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ProvConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[dispatcher]"));
        assert_eq!(ProvConfig::from_toml(&text).unwrap(), config);
    }
}

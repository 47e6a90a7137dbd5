//! Configuration system for the THP telemetry bridge
//!
//! Configuration is read from a TOML file. Broker credentials never live in the
//! file itself: the file names the environment variables that hold them and they
//! are resolved at runtime, when a connection is actually made.

use crate::supervisor::ConnectionCredentials;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub sink: SinkSection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// MQTT broker URL with protocol and port (`mqtt://` or `mqtts://`)
    pub broker_url: String,
    /// Product key used to build device topics
    pub product_key: String,
    /// Device name used to build device topics
    pub device_name: String,
    /// Client identifier; a unique one is generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on the CONNECT/CONNACK handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// QoS level for publish and subscribe (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

/// Connection supervisor section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorSection {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    /// Topic filter subscribed after every successful handshake
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval(),
            subscribe_topic: default_subscribe_topic(),
        }
    }
}

fn default_health_check_interval() -> u64 {
    1000
}

fn default_subscribe_topic() -> String {
    "#".to_string()
}

/// Bulk publisher section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSection {
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    /// Pause between two published records
    #[serde(default = "default_publish_interval")]
    pub interval_ms: u64,
    /// Target topic; defaults to the device property post topic
    pub topic: Option<String>,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            interval_ms: default_publish_interval(),
            topic: None,
        }
    }
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("THPData/THP_data.csv")
}

fn default_publish_interval() -> u64 {
    1000
}

/// Message sink section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkSection {
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
        }
    }
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("out.csv")
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid topic segment: {0}")]
    InvalidTopicSegment(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TelemetryConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TelemetryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_segment(&self.broker.product_key)?;
        validate_topic_segment(&self.broker.device_name)?;

        if self.broker.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {}",
                self.broker.qos
            )));
        }
        if self.broker.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "handshake_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.supervisor.health_check_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "health_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.supervisor.subscribe_topic.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "subscribe_topic must not be empty".to_string(),
            ));
        }
        if self.publisher.interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "publisher interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Telemetry topic: `/sys/{productKey}/{deviceName}/thing/event/property/post`
    pub fn post_topic(&self) -> String {
        format!(
            "/sys/{}/{}/thing/event/property/post",
            self.broker.product_key, self.broker.device_name
        )
    }

    /// Property set topic: `/sys/{productKey}/{deviceName}/thing/service/property/set`
    pub fn set_topic(&self) -> String {
        format!(
            "/sys/{}/{}/thing/service/property/set",
            self.broker.product_key, self.broker.device_name
        )
    }

    /// Topic the bulk publisher writes to
    pub fn publish_topic(&self) -> String {
        self.publisher
            .topic
            .clone()
            .unwrap_or_else(|| self.post_topic())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.health_check_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publisher.interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.handshake_timeout_secs)
    }

    /// Resolve connection credentials from the configured environment variables.
    ///
    /// A configured but unset username variable is an error; an unset password
    /// variable resolves to an empty secret.
    pub fn credentials(&self) -> Result<ConnectionCredentials, ConfigError> {
        let username = match &self.broker.username_env {
            Some(name) => Self::get_env_var_required(name)?,
            None => String::new(),
        };
        let secret = Self::get_env_var_optional(self.broker.password_env.as_ref())
            .unwrap_or_default();
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("thp-{}", uuid::Uuid::new_v4().simple()));

        Ok(ConnectionCredentials::new(client_id, username, secret))
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}

/// Product keys and device names become single topic levels
fn validate_topic_segment(segment: &str) -> Result<(), ConfigError> {
    if segment.is_empty() || segment.contains(['/', '+', '#']) {
        return Err(ConfigError::InvalidTopicSegment(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[broker]
broker_url = "mqtt://localhost:1883"
product_key = "test_product"
device_name = "THP-DataSystems"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = TelemetryConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.broker.handshake_timeout_secs, 60);
        assert_eq!(config.broker.qos, 1);
        assert_eq!(config.supervisor.health_check_interval_ms, 1000);
        assert_eq!(config.supervisor.subscribe_topic, "#");
        assert_eq!(config.publisher.interval_ms, 1000);
        assert_eq!(config.sink.path, PathBuf::from("out.csv"));
    }

    #[test]
    fn test_topics_built_from_device_identity() {
        let config = TelemetryConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(
            config.post_topic(),
            "/sys/test_product/THP-DataSystems/thing/event/property/post"
        );
        assert_eq!(
            config.set_topic(),
            "/sys/test_product/THP-DataSystems/thing/service/property/set"
        );
        assert_eq!(config.publish_topic(), config.post_topic());
    }

    #[test]
    fn test_publisher_topic_override() {
        let toml = format!("{MINIMAL}\n[publisher]\ntopic = \"custom/topic\"\n");
        let config = TelemetryConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.publish_topic(), "custom/topic");
    }

    #[test]
    fn test_rejects_wildcards_in_device_name() {
        let toml = MINIMAL.replace("THP-DataSystems", "dev/+");
        let result = TelemetryConfig::from_toml_str(&toml);
        assert!(matches!(result, Err(ConfigError::InvalidTopicSegment(_))));
    }

    #[test]
    fn test_rejects_invalid_qos() {
        let toml = format!("{MINIMAL}qos = 3\n");
        let result = TelemetryConfig::from_toml_str(&toml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let toml = format!("{MINIMAL}\n[supervisor]\nhealth_check_interval_ms = 0\n");
        assert!(TelemetryConfig::from_toml_str(&toml).is_err());

        let toml = format!("{MINIMAL}\n[publisher]\ninterval_ms = 0\n");
        assert!(TelemetryConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_credentials_generate_client_id_when_absent() {
        let config = TelemetryConfig::from_toml_str(MINIMAL).unwrap();
        let credentials = config.credentials().unwrap();

        assert!(credentials.client_id().starts_with("thp-"));
        assert_eq!(credentials.username(), "");
    }

    #[test]
    fn test_credentials_missing_username_env() {
        let toml = MINIMAL.replace(
            "device_name = \"THP-DataSystems\"",
            "device_name = \"THP-DataSystems\"\nusername_env = \"THP_TEST_SURELY_UNSET_USERNAME\"",
        );
        let config = TelemetryConfig::from_toml_str(&toml).unwrap();
        assert!(matches!(
            config.credentials(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thp.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = TelemetryConfig::load_from_file(&path).unwrap();
        assert_eq!(config.broker.device_name, "THP-DataSystems");
    }
}

// src/config.rs
//! Sync client configuration, read from YAML with environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::MoistureThresholds;
use crate::error::{Result, SyncError};
use crate::log_debug;

pub const CONFIG_PATH_VAR: &str = "IRRIGATION_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "irrigation.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bound on point-to-point HTTP calls.
    pub http_timeout_ms: u64,
    /// Bound on long-poll style reads (pub/sub status waits).
    pub long_poll_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub history_capacity: usize,
    pub poll_interval_ms: u64,
    /// Publish a `ModePending` event before a mode command goes out.
    pub optimistic_mode_events: bool,
    pub moisture: MoistureThresholds,
    pub mqtt: MqttConfig,
    /// Endpoint to use when nothing has been persisted yet.
    pub endpoint: Option<String>,
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 5_000,
            long_poll_timeout_ms: 30_000,
            retry_delay_ms: 5_000,
            max_reconnect_attempts: 3,
            history_capacity: 10,
            poll_interval_ms: 5_000,
            optimistic_mode_events: false,
            moisture: MoistureThresholds::default(),
            mqtt: MqttConfig::default(),
            endpoint: None,
            database_path: PathBuf::from("./db/irrigation.db"),
            log_dir: None,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub client_id: String,
    pub status_topic: String,
    pub control_topic: String,
    pub mode_topic: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: "irrigation-sync".to_string(),
            status_topic: "smart-irr/status".to_string(),
            control_topic: "smart-irr/control".to_string(),
            mode_topic: "smart-irr/mode/set".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug)]
pub struct ValidationError {
    pub field: String,
    pub error: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.error)
    }
}

impl std::error::Error for ValidationError {}

impl SyncConfig {
    /// Load from the path in `IRRIGATION_CONFIG` (or `irrigation.yaml`), then
    /// apply environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_path(Path::new(&path))?;
        config.apply_env_overrides();
        config.check()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log_debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(format!("Failed to parse YAML: {}", e)))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("IRRIGATION_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(ms) = std::env::var("IRRIGATION_POLL_MS").ok().and_then(|v| v.parse().ok()) {
            self.poll_interval_ms = ms;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false) {
            self.debug = true;
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut reject = |field: &str, error: &str| {
            errors.push(ValidationError {
                field: field.to_string(),
                error: error.to_string(),
            })
        };

        if self.http_timeout_ms == 0 {
            reject("http_timeout_ms", "must be greater than zero");
        }
        if self.long_poll_timeout_ms == 0 {
            reject("long_poll_timeout_ms", "must be greater than zero");
        }
        if self.max_reconnect_attempts == 0 {
            reject("max_reconnect_attempts", "must allow at least one attempt");
        }
        if self.history_capacity == 0 {
            reject("history_capacity", "must hold at least one reading");
        }
        if self.poll_interval_ms == 0 {
            reject("poll_interval_ms", "must be greater than zero");
        }
        if !self.moisture.is_ordered() {
            reject("moisture", "thresholds must satisfy very_dry > dry > moist");
        }
        for (field, topic) in [
            ("mqtt.status_topic", &self.mqtt.status_topic),
            ("mqtt.control_topic", &self.mqtt.control_topic),
            ("mqtt.mode_topic", &self.mqtt.mode_topic),
        ] {
            if topic.is_empty() || topic.contains('#') || topic.contains('+') {
                reject(field, "must be a concrete topic name");
            }
        }
        if self.mqtt.client_id.is_empty() {
            reject("mqtt.client_id", "must not be empty");
        }

        errors
    }

    pub fn check(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        Err(SyncError::Config(joined))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_observed_device_behaviour() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.long_poll_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SyncConfig::from_yaml(
            "retry_delay_ms: 2000\nmoisture:\n  very_dry: 3000\nmqtt:\n  status_topic: garden/status\n",
        )
        .unwrap();
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(config.moisture.very_dry, 3000);
        assert_eq!(config.moisture.dry, 2800);
        assert_eq!(config.mqtt.status_topic, "garden/status");
        assert_eq!(config.mqtt.control_topic, "smart-irr/control");
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = SyncConfig::default();
        config.max_reconnect_attempts = 0;
        config.history_capacity = 0;
        config.mqtt.status_topic = "smart-irr/#".to_string();

        let errors = config.validate();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["max_reconnect_attempts", "history_capacity", "mqtt.status_topic"]);
        assert!(matches!(config.check(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint: 192.168.1.50\npoll_interval_ms: 1500").unwrap();

        let config = SyncConfig::from_path(file.path()).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("192.168.1.50"));
        assert_eq!(config.poll_interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = SyncConfig::from_path(Path::new("./does-not-exist.yaml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}

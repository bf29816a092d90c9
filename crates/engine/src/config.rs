//! Engine configuration loader.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use viewlink_protocol::CommandKind;

/// Environment variable overriding the configured endpoint.
pub const ENDPOINT_ENV: &str = "VIEWLINK_ENDPOINT";

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: String,
    pub connection: ConnectionConfig,
    pub correlation: CorrelationConfig,
    pub dedup: DedupConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            connection: ConnectionConfig::default(),
            correlation: CorrelationConfig::default(),
            dedup: DedupConfig::default(),
            lock: LockConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub keepalive_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            keepalive_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Request/response correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Keep timed-out entries for one more timeout window so late
    /// responses are logged instead of discarded as unknown.
    pub keep_expired: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            sweep_interval_ms: 1_000,
            keep_expired: false,
        }
    }
}

impl CorrelationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Duplicate detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub retention_ms: u64,
    pub similarity_threshold: f64,
    pub focus_distance: f64,
    pub zoom_tolerance: f64,
    pub rotate_tolerance_deg: f64,
    pub max_records: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_ms: 6_000,
            similarity_threshold: 0.8,
            focus_distance: 1.0,
            zoom_tolerance: 0.3,
            rotate_tolerance_deg: 15.0,
            max_records: 64,
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Execution lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_hold_ms: u64,
    pub acquire_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: 10_000,
            acquire_attempts: 3,
            retry_base_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

/// Command queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub replaceable_kinds: Vec<CommandKind>,
    pub inter_command_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            replaceable_kinds: vec![CommandKind::Focus, CommandKind::Reset],
            inter_command_delay_ms: 1_200,
        }
    }
}

impl QueueConfig {
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }
}

impl EngineConfig {
    /// Check value ranges.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.endpoint.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "Config missing required field: endpoint".to_string(),
            ));
        }
        if self.connection.base_delay_ms == 0 {
            return Err(EngineError::ConfigError(
                "connection.base_delay_ms must be positive".to_string(),
            ));
        }
        if self.connection.max_delay_ms < self.connection.base_delay_ms {
            return Err(EngineError::ConfigError(
                "connection.max_delay_ms must be >= connection.base_delay_ms".to_string(),
            ));
        }
        if self.connection.keepalive_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "connection.keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.correlation.timeout_ms == 0 || self.correlation.sweep_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "correlation timeouts must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(EngineError::ConfigError(format!(
                "dedup.similarity_threshold must be within 0..=1, got {}",
                self.dedup.similarity_threshold
            )));
        }
        if self.lock.max_hold_ms == 0 {
            return Err(EngineError::ConfigError(
                "lock.max_hold_ms must be positive".to_string(),
            ));
        }
        if self.lock.acquire_attempts == 0 {
            return Err(EngineError::ConfigError(
                "lock.acquire_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment overrides. Returns whether the endpoint was replaced.
    pub fn apply_env(&mut self) -> bool {
        self.override_endpoint(std::env::var(ENDPOINT_ENV).ok())
    }

    fn override_endpoint(&mut self, endpoint: Option<String>) -> bool {
        match endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => {
                self.endpoint = endpoint.to_string();
                true
            }
            _ => false,
        }
    }
}

/// Parse configuration from YAML text, then apply environment overrides.
///
/// `endpoint` is required unless `VIEWLINK_ENDPOINT` supplies it.
///
/// # Errors
/// Returns error if the text is empty, not valid YAML, or fails validation
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, EngineError> {
    parse_with_endpoint_override(content, std::env::var(ENDPOINT_ENV).ok())
}

fn parse_with_endpoint_override(
    content: &str,
    endpoint_override: Option<String>,
) -> Result<EngineConfig, EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::ConfigError("Config file is empty".to_string()));
    }

    let document: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| EngineError::ConfigError(format!("Invalid YAML: {}", e)))?;
    let has_endpoint = document.get("endpoint").is_some();
    let mut config: EngineConfig = serde_yaml::from_value(document)
        .map_err(|e| EngineError::ConfigError(format!("Invalid YAML: {}", e)))?;

    if !config.override_endpoint(endpoint_override) && !has_endpoint {
        return Err(EngineError::ConfigError(
            "Config missing required field: endpoint".to_string(),
        ));
    }

    config.validate()?;
    Ok(config)
}

/// Load engine configuration from a YAML file.
///
/// # Arguments
/// * `config_path` - Path to the YAML config file
///
/// # Errors
/// Returns error if the file is missing, unreadable, or invalid
pub fn load_engine_config(config_path: &str) -> Result<EngineConfig, EngineError> {
    let config_file = Path::new(config_path);

    if !config_file.exists() {
        return Err(EngineError::ConfigError(format!(
            "Config file not found: {}",
            config_path
        )));
    }

    let content = std::fs::read_to_string(config_file)?;
    parse_engine_config(&content)
}

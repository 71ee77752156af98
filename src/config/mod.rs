/// Configuration management for clusterguard

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::monitor::MonitorSettings;

/// Main clusterguard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Failover and topology configuration
    pub failover: FailoverConfig,
    /// Enhanced failure monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Custom endpoint tracking configuration
    pub custom_endpoint: CustomEndpointConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Host the driver initially connects to
    pub host: String,
    /// Port of every cluster instance
    pub port: u16,
    /// Instance host template, `?` is replaced by the instance id
    pub host_pattern: Option<String>,
    /// Explicit cluster id shared by connections to the same cluster
    pub cluster_id: Option<String>,
    /// Enable failover on connection exceptions
    pub enabled: bool,
    /// Only ever fail over to the writer
    pub strict_writer: bool,
    /// Let reader failover fall back to the writer
    pub allow_writer_fallback: bool,
    /// Topology cache refresh rate in milliseconds
    pub topology_refresh_rate_ms: u64,
    /// Global failover timeout in milliseconds
    pub failover_timeout_ms: u64,
    /// Timeout of a single reader connection attempt in milliseconds
    pub reader_connect_timeout_ms: u64,
    /// Interval between writer reconnection attempts in milliseconds
    pub writer_reconnect_interval_ms: u64,
    /// Interval between topology polls while waiting for a new writer in milliseconds
    pub topology_read_interval_ms: u64,
    /// Connect timeout for regular connections in seconds
    pub connect_timeout_sec: u64,
    /// Collect failover and topology metrics
    pub gather_metrics: bool,
}

/// Enhanced failure monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable background node health monitoring
    pub enabled: bool,
    /// Grace period before failures are counted, in milliseconds
    pub failure_detection_time_ms: u64,
    /// Interval between health checks in milliseconds
    pub failure_detection_interval_ms: u64,
    /// Number of failed intervals before a node is declared dead
    pub failure_detection_count: i32,
    /// Idle time after which an unused monitor stops, in milliseconds
    pub monitor_disposal_time_ms: u64,
    /// Connect/ping timeout of the monitoring connection in milliseconds
    pub failure_detection_timeout_ms: u64,
}

/// Custom endpoint tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEndpointConfig {
    /// Track the membership of custom endpoints
    pub enabled: bool,
    /// Interval between membership polls in milliseconds
    pub refresh_rate_ms: u64,
    /// Lifetime of a cached membership definition in seconds
    pub info_expiration_sec: u64,
    /// Idle time after which a custom endpoint monitor is disposed, in seconds
    pub monitor_expiration_sec: u64,
    /// Time to wait for the first membership definition in milliseconds
    pub wait_for_info_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failover: FailoverConfig::default(),
            monitoring: MonitoringConfig::default(),
            custom_endpoint: CustomEndpointConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            host: "database-1.cluster-xyz.us-east-2.rds.amazonaws.com".to_string(),
            port: 3306,
            host_pattern: None,
            cluster_id: None,
            enabled: true,
            strict_writer: false,
            allow_writer_fallback: true,
            topology_refresh_rate_ms: 30_000,
            failover_timeout_ms: 60_000,
            reader_connect_timeout_ms: 30_000,
            writer_reconnect_interval_ms: 5_000,
            topology_read_interval_ms: 5_000,
            connect_timeout_sec: 30,
            gather_metrics: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_detection_time_ms: 30_000,
            failure_detection_interval_ms: 5_000,
            failure_detection_count: 3,
            monitor_disposal_time_ms: 60_000,
            failure_detection_timeout_ms: 3_000,
        }
    }
}

impl Default for CustomEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_rate_ms: 30_000,
            info_expiration_sec: 300,
            monitor_expiration_sec: 900,
            wait_for_info_timeout_ms: 5_000,
        }
    }
}

impl FailoverConfig {
    pub fn topology_refresh_rate(&self) -> Duration {
        Duration::from_millis(self.topology_refresh_rate_ms)
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }

    pub fn reader_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_connect_timeout_ms)
    }

    pub fn writer_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.writer_reconnect_interval_ms)
    }

    pub fn topology_read_interval(&self) -> Duration {
        Duration::from_millis(self.topology_read_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }
}

impl MonitoringConfig {
    /// Runtime settings handed to `MonitorService::start_monitoring`
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            failure_detection_time: Duration::from_millis(self.failure_detection_time_ms),
            failure_detection_interval: Duration::from_millis(self.failure_detection_interval_ms),
            failure_detection_count: self.failure_detection_count,
            disposal_time: Duration::from_millis(self.monitor_disposal_time_ms),
            failure_detection_timeout: Duration::from_millis(self.failure_detection_timeout_ms),
        }
    }
}

impl CustomEndpointConfig {
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }

    pub fn info_expiration(&self) -> Duration {
        Duration::from_secs(self.info_expiration_sec)
    }

    pub fn monitor_expiration(&self) -> Duration {
        Duration::from_secs(self.monitor_expiration_sec)
    }

    pub fn wait_for_info_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_info_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let failover = &self.failover;
        if failover.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "failover host cannot be empty".to_string(),
            ));
        }

        if failover.port == 0 {
            return Err(ConfigError::ValidationError(
                "failover port must be greater than 0".to_string(),
            ));
        }

        if let Some(pattern) = &failover.host_pattern {
            if pattern.matches('?').count() != 1 {
                return Err(ConfigError::ValidationError(format!(
                    "host_pattern must contain exactly one '?' placeholder: {}",
                    pattern
                )));
            }
        }

        for (name, value) in [
            ("topology_refresh_rate_ms", failover.topology_refresh_rate_ms),
            ("failover_timeout_ms", failover.failover_timeout_ms),
            ("reader_connect_timeout_ms", failover.reader_connect_timeout_ms),
            ("writer_reconnect_interval_ms", failover.writer_reconnect_interval_ms),
            ("topology_read_interval_ms", failover.topology_read_interval_ms),
            ("connect_timeout_sec", failover.connect_timeout_sec),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        // Validate monitoring config
        let monitoring = &self.monitoring;
        if monitoring.failure_detection_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "failure_detection_interval_ms must be greater than 0".to_string(),
            ));
        }

        if monitoring.failure_detection_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "failure_detection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if monitoring.monitor_disposal_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_disposal_time_ms must be greater than 0".to_string(),
            ));
        }

        // Validate custom endpoint config
        if self.custom_endpoint.refresh_rate_ms == 0 {
            return Err(ConfigError::ValidationError(
                "custom endpoint refresh_rate_ms must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "cluster" => Config::default(),
            "custom-domain" => Config {
                failover: FailoverConfig {
                    host: "db.example.com".to_string(),
                    host_pattern: Some("?.cmfagj2fmnyl.us-east-2.rds.amazonaws.com".to_string()),
                    cluster_id: Some("example-cluster".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => return Err(ConfigError::ValidationError(
                "Mode must be 'cluster' or 'custom-domain'".to_string(),
            )),
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

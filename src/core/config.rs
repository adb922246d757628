//! # Configuration Module
//!
//! Configuration for the service cache process.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human-readable durations (`4s`, `500ms`) via `humantime_serde`
//! - Environment variable overrides (`SERVICE_CACHE_*`)
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{ServiceCacheError, ServiceCacheResult};

/// Routing URI that designates the catch-all service unless configured otherwise
pub const DEFAULT_CATCH_ALL_URI: &str = "/*";

/// Default period of the integrity check
pub const DEFAULT_INTEGRITY_CHECK_INTERVAL: Duration = Duration::from_secs(4);

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCacheConfig {
    /// Period of the Reconciler
    #[serde(with = "humantime_serde")]
    pub integrity_check_interval: Duration,

    /// Routing URI that marks a service as the catch-all handler
    pub catch_all_uri: String,

    /// Capacity of the policy event broadcast channel
    pub event_channel_capacity: usize,

    /// Optional YAML file of service records used to seed the in-memory store
    pub seed_file: Option<PathBuf>,

    pub admin: AdminConfig,

    pub logging: LoggingConfig,
}

impl Default for ServiceCacheConfig {
    fn default() -> Self {
        Self {
            integrity_check_interval: DEFAULT_INTEGRITY_CHECK_INTERVAL,
            catch_all_uri: DEFAULT_CATCH_ALL_URI.to_string(),
            event_channel_capacity: 1024,
            seed_file: None,
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Admin facade settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:9180".to_string(),
        }
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl ServiceCacheConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ServiceCacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServiceCacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: ServiceCacheConfig = serde_yaml::from_str(&content)
            .map_err(|e| ServiceCacheError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> ServiceCacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServiceCacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: ServiceCacheConfig = serde_json::from_str(&content)
            .map_err(|e| ServiceCacheError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Variables follow the pattern `SERVICE_CACHE_<FIELD>`, for example
    /// `SERVICE_CACHE_INTEGRITY_CHECK_INTERVAL=10s`.
    pub fn apply_env_overrides(&mut self) -> ServiceCacheResult<()> {
        use std::env;

        if let Ok(interval) = env::var("SERVICE_CACHE_INTEGRITY_CHECK_INTERVAL") {
            self.integrity_check_interval = humantime::parse_duration(&interval).map_err(|e| {
                ServiceCacheError::config(format!("Invalid SERVICE_CACHE_INTEGRITY_CHECK_INTERVAL: {}", e))
            })?;
        }

        if let Ok(uri) = env::var("SERVICE_CACHE_CATCH_ALL_URI") {
            self.catch_all_uri = uri;
        }

        if let Ok(addr) = env::var("SERVICE_CACHE_ADMIN_BIND_ADDRESS") {
            self.admin.bind_address = addr;
        }

        if let Ok(path) = env::var("SERVICE_CACHE_SEED_FILE") {
            self.seed_file = Some(PathBuf::from(path));
        }

        if let Ok(level) = env::var("SERVICE_CACHE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("SERVICE_CACHE_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(ServiceCacheError::config(format!(
                        "Invalid SERVICE_CACHE_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem
    pub fn validate(&self) -> ServiceCacheResult<()> {
        let mut errors = Vec::new();

        if self.integrity_check_interval.is_zero() {
            errors.push("integrity_check_interval must be greater than zero".to_string());
        }

        if self.catch_all_uri.is_empty() {
            errors.push("catch_all_uri cannot be empty".to_string());
        } else if !self.catch_all_uri.starts_with('/') {
            errors.push(format!("catch_all_uri must start with '/': {}", self.catch_all_uri));
        }

        if self.event_channel_capacity == 0 {
            errors.push("event_channel_capacity must be greater than zero".to_string());
        }

        if self.admin.enabled && self.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("Invalid admin bind address: {}", self.admin.bind_address));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceCacheError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    pub fn admin_socket_addr(&self) -> ServiceCacheResult<SocketAddr> {
        self.admin
            .bind_address
            .parse()
            .map_err(|e| ServiceCacheError::config(format!("Invalid admin bind address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_validation() {
        let config = ServiceCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.integrity_check_interval, Duration::from_secs(4));
        assert_eq!(config.catch_all_uri, "/*");
    }

    #[test]
    fn test_config_validation_errors() {
        let config = ServiceCacheConfig {
            integrity_check_interval: Duration::ZERO,
            catch_all_uri: "*".to_string(),
            event_channel_capacity: 0,
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("integrity_check_interval"));
        assert!(err.contains("catch_all_uri must start with '/'"));
        assert!(err.contains("event_channel_capacity"));
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let yaml = r#"
integrity_check_interval: 10s
catch_all_uri: "/fallback/*"
admin:
  bind_address: "0.0.0.0:9999"
logging:
  level: debug
  format: pretty
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ServiceCacheConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.integrity_check_interval, Duration::from_secs(10));
        assert_eq!(config.catch_all_uri, "/fallback/*");
        assert_eq!(config.admin.bind_address, "0.0.0.0:9999");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.event_channel_capacity, 1024);
        assert!(config.seed_file.is_none());
    }

    #[tokio::test]
    async fn test_load_config_from_json_file() {
        let json = r#"{ "integrity_check_interval": "250ms", "admin": { "enabled": false } }"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = ServiceCacheConfig::load_from_json(file.path()).await.unwrap();
        assert_eq!(config.integrity_check_interval, Duration::from_millis(250));
        assert!(!config.admin.enabled);
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_configuration_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"integrity_check_interval: [not a duration").unwrap();

        let err = ServiceCacheConfig::load_from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, ServiceCacheError::Configuration { .. }));
    }
}

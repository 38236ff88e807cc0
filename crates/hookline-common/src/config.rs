//! Configuration for Hookline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::UserId;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Bulk import configuration
    #[serde(default)]
    pub import: ImportConfig,

    /// Tracking artifact configuration
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Scheduled-stop hook configuration
    #[serde(default)]
    pub stop_hook: StopHookConfig,

    /// SMS gateway configuration
    #[serde(default)]
    pub sms: SmsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname, used in generated Message-IDs
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// API keys accepted by the bearer auth layer
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
            keys: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    3333
}

fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024
}

/// A single API key entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Human readable label
    pub name: String,

    /// Hex encoded SHA-256 of the key
    pub key_hash: String,

    /// User the key acts as
    pub user_id: UserId,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between polling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on campaign groups dispatched at once
    #[serde(default = "default_max_concurrent_groups")]
    pub max_concurrent_groups: usize,

    /// Attempts before a backed-off unit is marked as an error
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrent_groups: default_max_concurrent_groups(),
            max_send_attempts: default_max_send_attempts(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_concurrent_groups() -> usize {
    32
}

fn default_max_send_attempts() -> i32 {
    8
}

/// Bulk import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Rows per transactional insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records between cancellation checks
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: u64,

    /// IDs per delete statement during cleanup
    #[serde(default = "default_cleanup_chunk_size")]
    pub cleanup_chunk_size: usize,

    /// Pause after each batch flush, in milliseconds
    #[serde(default = "default_yield_ms")]
    pub yield_ms: u64,

    /// Rows returned in an upload preview
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    /// Directory uploaded CSV files are staged in
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            cancel_check_interval: default_cancel_check_interval(),
            cleanup_chunk_size: default_cleanup_chunk_size(),
            yield_ms: default_yield_ms(),
            preview_rows: default_preview_rows(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_cancel_check_interval() -> u64 {
    10
}

fn default_cleanup_chunk_size() -> usize {
    500
}

fn default_yield_ms() -> u64 {
    10
}

fn default_preview_rows() -> usize {
    50
}

fn default_upload_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Tracking artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// 32-byte AES-256 key for the `rd` redirect token
    #[serde(default = "default_redirect_key")]
    pub redirect_key: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            redirect_key: default_redirect_key(),
        }
    }
}

// Static key shared with the landing side. Overriding it breaks tokens
// already sent out.
fn default_redirect_key() -> String {
    "HooklineRedirectKey0123456789abc".to_string()
}

/// Scheduled-stop hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopHookConfig {
    /// Endpoint notified when a campaign passes its scheduled stop date
    pub url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_stop_hook_timeout")]
    pub timeout_secs: u64,
}

impl Default for StopHookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_stop_hook_timeout(),
        }
    }
}

fn default_stop_hook_timeout() -> u64 {
    30
}

/// SMS gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Twilio REST API base URL
    #[serde(default = "default_twilio_api_base")]
    pub api_base: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_base: default_twilio_api_base(),
        }
    }
}

fn default_twilio_api_base() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `HOOKLINE_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("HOOKLINE_CONFIG") {
            debug!(path = %path, "Loading configuration from HOOKLINE_CONFIG");
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./hookline.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/hookline/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                debug!(path = %path.display(), "Loading configuration");
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    fn validate(&self) -> crate::Result<()> {
        if self.tracking.redirect_key.len() != 32 {
            return Err(crate::Error::Config(format!(
                "tracking.redirect_key must be 32 bytes, got {}",
                self.tracking.redirect_key.len()
            )));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(crate::Error::Config(
                "worker.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.import.batch_size == 0 || self.import.cleanup_chunk_size == 0 {
            return Err(crate::Error::Config(
                "import batch and cleanup sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.poll_interval_secs, 60);
        assert_eq!(worker.max_send_attempts, 8);

        let import = ImportConfig::default();
        assert_eq!(import.batch_size, 1000);
        assert_eq!(import.cancel_check_interval, 10);
        assert_eq!(import.cleanup_chunk_size, 500);
        assert_eq!(TrackingConfig::default().redirect_key.len(), 32);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "phish.example.com"

[database]
backend = "postgres"
url = "postgres://localhost/hookline"

[worker]
poll_interval_secs = 30

[import]
batch_size = 250

[[api.keys]]
name = "ops"
key_hash = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
user_id = "018f3c1e-7d2a-7b44-9a1e-2f6c1d0e9a11"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "phish.example.com");
        assert_eq!(config.database.backend, "postgres");
        assert_eq!(config.worker.poll_interval_secs, 30);
        assert_eq!(config.worker.max_concurrent_groups, 32);
        assert_eq!(config.import.batch_size, 250);
        assert_eq!(config.api.keys.len(), 1);
        assert_eq!(config.api.keys[0].name, "ops");
    }

    #[test]
    fn test_rejects_short_redirect_key() {
        let toml = r#"
[database]
url = "postgres://localhost/hookline"

[tracking]
redirect_key = "too-short"
"#;

        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("redirect_key"));
    }
}

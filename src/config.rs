//! Configuration module for the pollnet server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Size of the fixed header fields that follow the length prefix
/// (operate, seq, options).
const HEADER_FIELDS_SIZE: usize = 6;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "pollnet")]
#[command(author = "pollnet authors")]
#[command(version = "0.1.0")]
#[command(about = "A sharded reactor server for a compact binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Schema to listen on (e.g., tcp://127.0.0.1:8900), may be repeated
    #[arg(short = 'l', long)]
    pub listen: Vec<String>,

    /// Number of sub-reactor shards
    #[arg(short = 's', long)]
    pub shards: Option<usize>,

    /// Maximum number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reactor: ReactorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Schemas to listen on
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Per-connection read timeout in milliseconds (0 = none)
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Per-connection write timeout in milliseconds (0 = none)
    #[serde(default)]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

/// Reactor and sub-reactor configuration
#[derive(Debug, Deserialize)]
pub struct ReactorConfig {
    /// Maximum number of ready tokens reported by one poller wait
    #[serde(default = "default_poller_buffer_size")]
    pub poller_buffer_size: usize,
    /// Number of sub-reactor shards
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Capacity of each shard's ready-token queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poller_buffer_size: default_poller_buffer_size(),
            shard_count: default_shard_count(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of worker threads
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Capacity of the pending task queue
    #[serde(default = "default_worker_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds an idle worker waits for work before exiting
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_capacity: default_worker_queue_capacity(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct CodecConfig {
    /// Maximum size of one framed message in bytes
    #[serde(default = "default_max_read_buffer_size")]
    pub max_read_buffer_size: usize,
    /// Width of the length prefix in bytes
    #[serde(default = "default_length_field_size")]
    pub length_field_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_read_buffer_size: default_max_read_buffer_size(),
            length_field_size: default_length_field_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["tcp://127.0.0.1:8900".to_string()]
}

fn default_poller_buffer_size() -> usize {
    100
}

fn default_shard_count() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_workers() -> usize {
    1000
}

fn default_worker_queue_capacity() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    10 // 10 seconds
}

fn default_max_read_buffer_size() -> usize {
    512
}

fn default_length_field_size() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<String>,
    pub poller_buffer_size: usize,
    pub shard_count: usize,
    pub queue_capacity: usize,
    pub max_workers: usize,
    pub worker_queue_capacity: usize,
    pub worker_idle_timeout: Duration,
    pub max_read_buffer_size: usize,
    pub length_field_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        Self {
            config: None,
            listen: Vec::new(),
            shards: None,
            workers: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the optional TOML file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: if cli.listen.is_empty() {
                toml_config.server.listen
            } else {
                cli.listen
            },
            poller_buffer_size: toml_config.reactor.poller_buffer_size,
            shard_count: cli.shards.unwrap_or(toml_config.reactor.shard_count),
            queue_capacity: toml_config.reactor.queue_capacity,
            max_workers: cli.workers.unwrap_or(toml_config.worker.max_workers),
            worker_queue_capacity: toml_config.worker.queue_capacity,
            worker_idle_timeout: Duration::from_secs(toml_config.worker.idle_timeout),
            max_read_buffer_size: toml_config.codec.max_read_buffer_size,
            length_field_size: toml_config.codec.length_field_size,
            read_timeout: millis(toml_config.server.read_timeout_ms),
            write_timeout: millis(toml_config.server.write_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Size of the packet header implied by the length field width.
    pub fn header_size(&self) -> usize {
        self.length_field_size + HEADER_FIELDS_SIZE
    }

    /// Reject values the reactor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("reactor.poller_buffer_size", self.poller_buffer_size),
            ("reactor.shard_count", self.shard_count),
            ("reactor.queue_capacity", self.queue_capacity),
            ("worker.max_workers", self.max_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if !(1..=8).contains(&self.length_field_size) {
            return Err(ConfigError::Invalid(format!(
                "codec.length_field_size must be within 1..=8, got {}",
                self.length_field_size
            )));
        }

        if self.max_read_buffer_size < self.header_size() {
            return Err(ConfigError::Invalid(format!(
                "codec.max_read_buffer_size {} is smaller than the {} byte header",
                self.max_read_buffer_size,
                self.header_size()
            )));
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, vec!["tcp://127.0.0.1:8900".to_string()]);
        assert_eq!(config.poller_buffer_size, 100);
        assert_eq!(config.shard_count, 32);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_workers, 1000);
        assert_eq!(config.max_read_buffer_size, 512);
        assert_eq!(config.header_size(), 10);
        assert!(config.read_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = ["tcp://0.0.0.0:9000", "ws://0.0.0.0:9001"]
            read_timeout_ms = 1500

            [reactor]
            shard_count = 4
            queue_capacity = 16

            [worker]
            max_workers = 8
            idle_timeout = 2

            [codec]
            max_read_buffer_size = 4096
            length_field_size = 2

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.listen.len(), 2);
        assert_eq!(toml_config.reactor.poller_buffer_size, 100);

        let config = Config::merge(CliArgs::default_args(), toml_config);
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.worker_idle_timeout, Duration::from_secs(2));
        assert_eq!(config.read_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.header_size(), 8);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from([
            "pollnet",
            "--listen",
            "tcp://127.0.0.1:7000",
            "--shards",
            "2",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str("[reactor]\nshard_count = 8\n").unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.listen, vec!["tcp://127.0.0.1:7000".to_string()]);
        assert_eq!(config.shard_count, 2);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.shard_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.length_field_size = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_read_buffer_size = 6;
        assert!(config.validate().is_err());
    }
}

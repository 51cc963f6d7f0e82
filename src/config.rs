//! Configuration for the portcullis binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::{length, line};
use crate::server::{Settings, TlsSettings};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Framing used by the bundled echo service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// `\r\n` terminated lines
    #[default]
    Line,
    /// `<length>\r\n<data>` frames
    Length,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "portcullis")]
#[command(version)]
#[command(about = "A TCP/TLS echo server with worker-pool admission control", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:3498)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads, i.e. concurrent connections (0 = one per CPU)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Accepted connections allowed to wait for a worker
    #[arg(short = 'b', long)]
    pub backlog: Option<usize>,

    /// Serve TLS
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate chain for TLS
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key for TLS
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Framing protocol
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Close connections idle for this long, in milliseconds (0 = never)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Job queue capacity
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            backlog: default_backlog(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub protocol: ProtocolType,
    /// Idle timeout in milliseconds, 0 disables it
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Largest accepted frame in bytes
    pub max_frame: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolType::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame: None,
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

fn default_listen() -> String {
    "127.0.0.1:3498".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_backlog() -> usize {
    100
}

fn default_idle_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub backlog: usize,
    pub tls: Option<TlsSettings>,
    pub protocol: ProtocolType,
    pub idle_timeout: Option<Duration>,
    pub max_frame: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let workers = match cli.workers.unwrap_or(toml_config.server.workers) {
            0 => num_cpus(),
            n => n,
        };

        let tls = if cli.tls || toml_config.tls.enabled {
            let cert = cli
                .cert
                .or(toml_config.tls.cert)
                .ok_or_else(|| ConfigError::Invalid("TLS enabled without a certificate".into()))?;
            let key = cli
                .key
                .or(toml_config.tls.key)
                .ok_or_else(|| ConfigError::Invalid("TLS enabled without a private key".into()))?;
            Some(TlsSettings::new(cert, key))
        } else {
            None
        };

        let protocol = cli.protocol.unwrap_or(toml_config.connection.protocol);
        let max_frame = toml_config.connection.max_frame.unwrap_or(match protocol {
            ProtocolType::Line => line::DEFAULT_MAX_LINE,
            ProtocolType::Length => length::DEFAULT_MAX_FRAME,
        });

        let idle_timeout = match cli
            .idle_timeout_ms
            .unwrap_or(toml_config.connection.idle_timeout_ms)
        {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            tls,
            protocol,
            idle_timeout,
            max_frame,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Server construction parameters.
    pub fn settings(&self) -> Settings {
        Settings {
            listen: self.listen.clone(),
            workers: self.workers,
            backlog: self.backlog,
            tls: self.tls.clone(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:3498");
        assert_eq!(config.server.workers, 5);
        assert_eq!(config.server.backlog, 100);
        assert!(!config.tls.enabled);
        assert_eq!(config.connection.protocol, ProtocolType::Line);
        assert_eq!(config.connection.idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:3498"
            workers = 8
            backlog = 16

            [tls]
            enabled = true
            cert = "server.crt"
            key = "server.key"

            [connection]
            protocol = "length"
            idle_timeout_ms = 0
            max_frame = 1024

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3498");
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.server.backlog, 16);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert, Some(PathBuf::from("server.crt")));
        assert_eq!(config.connection.protocol, ProtocolType::Length);
        assert_eq!(config.connection.max_frame, Some(1024));
        assert_eq!(config.logging.level, "debug");

        let resolved = Config::merge(CliArgs::default(), config).unwrap();
        assert_eq!(resolved.idle_timeout, None);
        assert_eq!(resolved.max_frame, 1024);
        assert_eq!(
            resolved.tls,
            Some(TlsSettings::new("server.crt", "server.key"))
        );
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs {
            listen: Some("127.0.0.1:9000".to_string()),
            workers: Some(3),
            protocol: Some(ProtocolType::Length),
            idle_timeout_ms: Some(500),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.workers, 3);
        assert_eq!(config.backlog, 100);
        assert_eq!(config.protocol, ProtocolType::Length);
        assert_eq!(config.max_frame, length::DEFAULT_MAX_FRAME);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.log_level, "trace");

        let settings = config.settings();
        assert_eq!(settings.workers, 3);
        assert!(settings.tls.is_none());
    }

    #[test]
    fn test_zero_workers_uses_cpus() {
        let cli = CliArgs {
            workers: Some(0),
            ..Default::default()
        };
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_tls_requires_material() {
        let cli = CliArgs {
            tls: true,
            cert: Some(PathBuf::from("server.crt")),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/portcullis.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));
    }
}

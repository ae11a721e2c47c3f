//! Configuration module for tcp-meter.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-meter")]
#[command(author = "tcp-meter authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP throughput measurement server and reconnecting client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Accept connections and log received throughput
    Server {
        /// Log file suffix, giving `<prefix>_<suffix>.log`
        suffix: Option<String>,
    },
    /// Keep a connection to the server and forward stdin to it
    Client,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Log filename prefix
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    /// Directory the sample log is written to
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_prefix: default_log_prefix(),
            log_dir: default_log_dir(),
            workers: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server address to connect to
    #[serde(default = "default_target")]
    pub target: String,
    /// Delay before reconnecting, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            target: default_target(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:10001".to_string()
}

fn default_log_prefix() -> String {
    "TCP_TEST".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_target() -> String {
    "192.168.1.99:10001".to_string()
}

fn default_retry_delay_ms() -> u64 {
    6000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Server settings after merging
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub log_prefix: String,
    pub log_dir: PathBuf,
    /// Operator-supplied log filename suffix
    pub log_suffix: Option<String>,
}

/// Client settings after merging
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: String,
    pub retry_delay: Duration,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        if toml_config.client.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "client.retry_delay_ms must be greater than zero".to_string(),
            ));
        }

        let log_suffix = match &cli.command {
            Command::Server { suffix } => suffix.clone(),
            Command::Client => None,
        };

        Ok(Config {
            server: ServerConfig {
                listen: toml_config.server.listen,
                log_prefix: toml_config.server.log_prefix,
                log_dir: toml_config.server.log_dir,
                log_suffix,
            },
            client: ClientConfig {
                target: toml_config.client.target,
                retry_delay: Duration::from_millis(toml_config.client.retry_delay_ms),
            },
            workers: toml_config.server.workers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: cli.command,
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

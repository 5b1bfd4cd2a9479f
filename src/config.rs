//! Configuration for the demo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{EventLoopConfig, PollMechanism};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "dispatch-loop")]
#[command(version)]
#[command(about = "Single-threaded readiness dispatch server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Protocol to serve
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Readiness primitive driving each event loop
    #[arg(short = 'm', long, value_enum)]
    pub mechanism: Option<PollMechanism>,

    /// Longest single wait of an event loop iteration, in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Stop each event loop after this many iterations
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-connection outgoing buffer limit in bytes
    #[arg(long)]
    pub high_water: Option<usize>,

    /// Maximum connections per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    #[default]
    Ping,
    Echo,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub event_loop: LoopConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub protocol: ProtocolType,
    pub workers: Option<usize>,
    pub high_water: Option<usize>,
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol: ProtocolType::default(),
            workers: None,
            high_water: None,
            max_connections: None,
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct LoopConfig {
    #[serde(default)]
    pub mechanism: PollMechanism,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub max_iterations: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mechanism: PollMechanism::default(),
            timeout_ms: default_timeout_ms(),
            max_iterations: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1:7878".to_string()
}

fn default_timeout_ms() -> u64 {
    crate::runtime::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub protocol: ProtocolType,
    /// Worker threads, 0 meaning one per CPU.
    pub workers: usize,
    pub high_water: Option<usize>,
    pub max_connections: Option<usize>,
    pub event_loop: EventLoopConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 7878).into(),
            protocol: ProtocolType::default(),
            workers: 0,
            high_water: None,
            max_connections: None,
            event_loop: EventLoopConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str))?;

        let timeout_ms = cli.timeout_ms.unwrap_or(toml_config.event_loop.timeout_ms);
        let event_loop = EventLoopConfig {
            mechanism: cli.mechanism.unwrap_or(toml_config.event_loop.mechanism),
            timeout: Duration::from_millis(timeout_ms),
            max_iterations: cli.max_iterations.or(toml_config.event_loop.max_iterations),
        };

        Ok(Config {
            listen,
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            high_water: cli.high_water.or(toml_config.server.high_water),
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            event_loop,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}

//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tcp-echo-server")]
#[command(author = "tcp-echo-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server with bounded concurrent sessions", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (all interfaces)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently active client sessions
    #[arg(short = 'n', long)]
    pub max_clients: Option<usize>,

    /// Receive buffer size per session in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Admission gate implementation
    #[arg(long, value_enum)]
    pub admission: Option<AdmissionMode>,

    /// How to wait for a usable network link before listening
    #[arg(long, value_enum)]
    pub link: Option<LinkMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// How the acceptor decides that a new session may be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Wait on a counting semaphore sized to `max_clients`.
    Semaphore,
    /// Re-check the session counter after a fixed backoff.
    Polling,
}

/// Connectivity provider used during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Probe for a routable local address, retrying until it appears.
    Probe,
    /// Assume the link is already up.
    Static,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port to bind on 0.0.0.0
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Bytes read per receive call
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_admission")]
    pub admission: AdmissionMode,
    /// Re-check interval for the polling admission gate
    #[serde(default = "default_admission_backoff_ms")]
    pub admission_backoff_ms: u64,
    /// Close sessions idle for this long (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            backlog: default_backlog(),
            max_clients: default_max_clients(),
            receive_buffer_size: default_receive_buffer_size(),
            workers: None,
            admission: default_admission(),
            admission_backoff_ms: default_admission_backoff_ms(),
            idle_timeout_secs: 0,
        }
    }
}

/// TCP keepalive parameters applied to every accepted connection
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe
    #[serde(default = "default_keepalive_idle")]
    pub idle_secs: u64,
    /// Interval between probes
    #[serde(default = "default_keepalive_interval")]
    pub interval_secs: u64,
    /// Unanswered probes before the connection is dropped
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_keepalive_idle(),
            interval_secs: default_keepalive_interval(),
            count: default_keepalive_count(),
        }
    }
}

impl KeepaliveConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Network link bring-up configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_link_mode")]
    pub mode: LinkMode,
    /// Remote address used to find a route (nothing is sent to it)
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
    /// Attempts before bring-up is declared failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: default_link_mode(),
            probe_addr: default_probe_addr(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
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

fn default_port() -> u16 {
    3333
}

fn default_backlog() -> u32 {
    3
}

fn default_max_clients() -> usize {
    5
}

fn default_receive_buffer_size() -> usize {
    128
}

fn default_admission() -> AdmissionMode {
    AdmissionMode::Semaphore
}

fn default_admission_backoff_ms() -> u64 {
    1000
}

fn default_keepalive_idle() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_keepalive_count() -> u32 {
    3
}

fn default_link_mode() -> LinkMode {
    LinkMode::Probe
}

fn default_probe_addr() -> String {
    "8.8.8.8:53".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once the server starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backlog: u32,
    pub max_clients: usize,
    pub receive_buffer_size: usize,
    pub workers: Option<usize>,
    pub admission: AdmissionMode,
    pub admission_backoff: Duration,
    pub idle_timeout: Option<Duration>,
    pub keepalive: KeepaliveConfig,
    pub link: LinkConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from file values alone.
    pub fn from_toml(toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            port: server.port,
            backlog: server.backlog,
            max_clients: server.max_clients,
            receive_buffer_size: server.receive_buffer_size,
            workers: server.workers,
            admission: server.admission,
            admission_backoff: Duration::from_millis(server.admission_backoff_ms),
            idle_timeout: match server.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            keepalive: toml_config.keepalive,
            link: toml_config.link,
            log_level: toml_config.logging.level,
        }
    }

    /// Merge CLI args over TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut config = Self::from_toml(toml_config);

        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(max_clients) = cli.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(size) = cli.buffer_size {
            config.receive_buffer_size = size;
        }
        if let Some(backlog) = cli.backlog {
            config.backlog = backlog;
        }
        if cli.workers.is_some() {
            config.workers = cli.workers;
        }
        if let Some(admission) = cli.admission {
            config.admission = admission;
        }
        if let Some(mode) = cli.link {
            config.link.mode = mode;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.max_clients > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_clients must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.receive_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "receive_buffer_size must be at least 1".into(),
            ));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.keepalive.count == 0 {
            return Err(ConfigError::Invalid("keepalive count must be at least 1".into()));
        }
        Ok(())
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

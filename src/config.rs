//! Configuration module for the flipcase echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Concurrency discipline used to drive connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Readiness-driven state machine on a pool of mio worker threads.
    StateMachine,
    /// Reader/writer task pair per connection on the tokio runtime.
    Pipeline,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "flipcase-echo")]
#[command(author = "flipcase-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "An echo server that flips the case of ASCII letters", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// SO_RCVBUF applied to the listening socket, in bytes
    #[arg(long)]
    pub recv_buffer_size: Option<usize>,

    /// Number of worker threads delivering I/O completions
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrently open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Connection handling model
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Per-connection buffer size for the state-machine runtime
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Size of each buffer the pipeline reader allocates
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Capacity of the reader-to-writer channel (0 = unbounded)
    #[arg(long)]
    pub channel_capacity: Option<usize>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            recv_buffer_size: default_recv_buffer_size(),
            workers: default_workers(),
            max_connections: default_max_connections(),
        }
    }
}

/// Connection-handling configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime")]
    pub kind: RuntimeType,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// 0 selects an unbounded channel.
    #[serde(default)]
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: default_runtime(),
            buffer_size: default_buffer_size(),
            read_chunk_size: default_read_chunk_size(),
            channel_capacity: 0,
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

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6070
}

fn default_recv_buffer_size() -> usize {
    1024
}

fn default_workers() -> usize {
    2
}

fn default_max_connections() -> usize {
    10000
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Pipeline
}

fn default_buffer_size() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    80
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listening address as configured, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Resolve to the first socket address the host name maps to.
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {self}"),
                )
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub recv_buffer_size: usize,
    pub workers: usize,
    pub max_connections: usize,
    pub runtime: RuntimeType,
    pub buffer_size: usize,
    pub read_chunk_size: usize,
    pub channel_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            recv_buffer_size: cli
                .recv_buffer_size
                .unwrap_or(toml_config.server.recv_buffer_size),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            runtime: cli.runtime.unwrap_or(toml_config.runtime.kind),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            read_chunk_size: cli
                .read_chunk_size
                .unwrap_or(toml_config.runtime.read_chunk_size),
            channel_capacity: cli
                .channel_capacity
                .unwrap_or(toml_config.runtime.channel_capacity),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("workers", self.workers),
            ("max_connections", self.max_connections),
            ("buffer_size", self.buffer_size),
            ("read_chunk_size", self.read_chunk_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// The address the listening socket binds to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6070);
        assert_eq!(config.recv_buffer_size, 1024);
        assert_eq!(config.workers, 2);
        assert_eq!(config.runtime, RuntimeType::Pipeline);
        assert_eq!(config.read_chunk_size, 80);
        assert_eq!(config.channel_capacity, 0);
        assert_eq!(config.endpoint().to_string(), "localhost:6070");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 7000
            workers = 4

            [runtime]
            kind = "state-machine"
            buffer_size = 4096
            channel_capacity = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.recv_buffer_size, 1024);
        assert_eq!(config.runtime.kind, RuntimeType::StateMachine);
        assert_eq!(config.runtime.buffer_size, 4096);
        assert_eq!(config.runtime.read_chunk_size, 80);
        assert_eq!(config.runtime.channel_capacity, 16);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "flipcase-echo",
            "--port",
            "9000",
            "--runtime",
            "state-machine",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            workers = 3
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.workers, 3);
        assert_eq!(config.runtime, RuntimeType::StateMachine);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cli = CliArgs::parse_from(["flipcase-echo", "--workers", "0"]);
        match Config::from_args(cli) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("workers")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_resolves_loopback() {
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let addr = endpoint.resolve().unwrap();
        assert!(addr.ip().is_loopback());
    }
}

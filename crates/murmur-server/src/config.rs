//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`murmur.toml`, `/etc/murmur/murmur.toml`,
//!   `~/.config/murmur/murmur.toml`)
//! - Environment variables (`MURMUR_HOST`, `MURMUR_PORT`,
//!   `MURMUR_DATABASE_URL`), which win over the file

use anyhow::{Context, Result};
use murmur_core::{BrokerConfig, ChatLimits};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum pooled connections.
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the Server-Sent Events stream.
    #[serde(default = "default_true")]
    pub sse: bool,

    /// Enable the WebSocket stream.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path for the SSE endpoint.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message body length, in characters.
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    /// Default page size for message history.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Default page size for the conversation list.
    #[serde(default = "default_conversation_page_size")]
    pub default_conversation_page_size: u32,

    /// Largest page any listing returns.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Events buffered per stream before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// SSE keep-alive comment and WebSocket ping interval in milliseconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    "sqlite://murmur.db".to_string()
}

fn default_db_connections() -> u32 {
    8
}

fn default_stream_path() -> String {
    "/chat/stream".to_string()
}

fn default_ws_path() -> String {
    "/chat/ws".to_string()
}

fn default_max_body_chars() -> usize {
    murmur_core::MAX_BODY_CHARS
}

fn default_page_size() -> u32 {
    50
}

fn default_conversation_page_size() -> u32 {
    12
}

fn default_max_page_size() -> u32 {
    200
}

fn default_queue_capacity() -> usize {
    murmur_core::broker::DEFAULT_QUEUE_CAPACITY
}

fn default_keepalive_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: DatabaseConfig::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_db_connections(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sse: true,
            websocket: true,
            stream_path: default_stream_path(),
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_chars: default_max_body_chars(),
            default_page_size: default_page_size(),
            default_conversation_page_size: default_conversation_page_size(),
            max_page_size: default_max_page_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// an override has an invalid value.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "murmur.toml",
            "/etc/murmur/murmur.toml",
            "~/.config/murmur/murmur.toml",
        ];

        let mut config = None;
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Some(Self::from_file(expanded.as_ref())?);
                break;
            }
        }

        config
            .unwrap_or_default()
            .with_overrides(|key| std::env::var(key).ok())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `MURMUR_*` overrides looked up through `var`.
    ///
    /// # Errors
    ///
    /// Returns an error if `MURMUR_PORT` isn't a valid port.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = var("MURMUR_HOST") {
            self.host = host;
        }
        if let Some(port) = var("MURMUR_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid MURMUR_PORT: {port}"))?;
        }
        if let Some(url) = var("MURMUR_DATABASE_URL") {
            self.database.url = url;
        }
        Ok(self)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` isn't a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Keep-alive interval for live streams.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.keepalive_interval_ms.max(1))
    }

    /// Limits handed to the chat service.
    #[must_use]
    pub fn chat_limits(&self) -> ChatLimits {
        ChatLimits {
            max_body_chars: self.limits.max_body_chars,
            default_page_size: self.limits.default_page_size,
            default_conversation_page_size: self.limits.default_conversation_page_size,
            max_page_size: self.limits.max_page_size,
        }
    }

    /// Broker settings.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            queue_capacity: self.limits.queue_capacity,
        }
    }
}

//! Configuration module for peerlink
//!
//! Supports JSON configuration files; every field is optional.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default listening port shared by consoles and vehicles
pub const DEFAULT_BIND_PORT: u16 = 7011;

/// Largest single read from a socket (the datagram-sized buffer, about 64KB)
pub const DEFAULT_MAX_READ_SIZE: usize = 65506;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.transport.validate()?;
        Ok(config)
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address to listen on
    pub bind_address: IpAddr,
    /// Listening port, 0 picks an ephemeral port
    pub bind_port: u16,
    /// Socket keep-alive plus zero-length probes on quiet connections
    pub keep_alive: bool,
    /// Bound on establishing an outbound connection
    pub connect_timeout_ms: u64,
    /// Connections without reads for this long are closed
    pub idle_timeout_ms: u64,
    /// Reactor poll timeout, also the idle sweep cadence
    pub poll_timeout_ms: u64,
    /// Quiet period after which a keep-alive probe is written
    pub keep_alive_probe_ms: u64,
    /// Largest single socket read
    pub max_read_size: usize,
    /// Capacity of each of the inbound and outbound queues
    pub queue_capacity: usize,
    /// Bounded wait of the dispatcher and sender on their queues
    pub queue_poll_ms: u64,
    /// Upper bound on concurrently running consumer tasks
    pub max_worker_threads: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            bind_port: DEFAULT_BIND_PORT,
            keep_alive: true,
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 20_000,
            poll_timeout_ms: 100,
            keep_alive_probe_ms: 2_000,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            queue_capacity: 65_536,
            queue_poll_ms: 1_000,
            max_worker_threads: 512,
        }
    }
}

impl TransportConfig {
    pub fn new(bind_port: u16) -> Self {
        Self {
            bind_port,
            ..Default::default()
        }
    }

    /// Loopback-only configuration on an ephemeral port
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            bind_port: 0,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_read_size(mut self, size: usize) -> Self {
        self.max_read_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_queue_poll(mut self, interval: Duration) -> Self {
        self.queue_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn keep_alive_probe(&self) -> Duration {
        Duration::from_millis(self.keep_alive_probe_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    /// Reject settings that would stall or spin the loops
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("connect_timeout_ms", self.connect_timeout_ms as usize),
            ("idle_timeout_ms", self.idle_timeout_ms as usize),
            ("poll_timeout_ms", self.poll_timeout_ms as usize),
            ("keep_alive_probe_ms", self.keep_alive_probe_ms as usize),
            ("max_read_size", self.max_read_size),
            ("queue_capacity", self.queue_capacity),
            ("queue_poll_ms", self.queue_poll_ms as usize),
            ("max_worker_threads", self.max_worker_threads),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.bind_port, DEFAULT_BIND_PORT);
        assert!(config.keep_alive);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_read_size, DEFAULT_MAX_READ_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = Config::from_json(
            r#"{ "log": { "level": "debug" }, "transport": { "bind_port": 6002, "keep_alive": false } }"#,
        )
        .unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.transport.bind_port, 6002);
        assert!(!config.transport.keep_alive);
        assert_eq!(config.transport.idle_timeout_ms, 20_000);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.transport.bind_port, DEFAULT_BIND_PORT);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = Config::from_json(r#"{ "transport": { "poll_timeout_ms": 0 } }"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "transport": {{ "bind_port": 7100 }} }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transport.bind_port, 7100);
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::loopback()
            .with_keep_alive(false)
            .with_connect_timeout(Duration::from_millis(250))
            .with_queue_capacity(16);
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:0");
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.queue_capacity, 16);
    }
}

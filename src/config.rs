//! Event loop configuration.
//!
//! Build it in code with [`EventLoopConfig::builder`], or load it from TOML:
//!
//! ```toml
//! workers = 8
//! read_chunk_size = 8192
//! connect_timeout_ms = 5000
//! idle_timeout_ms = 40000
//!
//! [logging]
//! level = "debug"
//! format = "compact"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::thread_pool::DEFAULT_POOL_CAPACITY;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
/// Bytes read from a socket per data event.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 32;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Configuration for [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventLoopConfig {
    /// Number of worker threads running callbacks
    pub workers: usize,
    /// Maximum number of readiness events handled per poll
    pub events_capacity: usize,
    /// Poll timeout; also the resolution of idle and connect timers
    pub poll_timeout_ms: u64,
    /// Size of one read chunk
    pub read_chunk_size: usize,
    /// Read chunks kept around for reuse
    pub buffer_pool_size: usize,
    /// Default bound on connection establishment for `connect`
    pub connect_timeout_ms: u64,
    /// Idle timeout given to new connections; `None` disables `ping`
    pub idle_timeout_ms: Option<u64>,
    /// Enable TCP_NODELAY on new connections
    pub no_delay: bool,
    /// Maximum number of open connections; `None` for unlimited
    pub max_connections: Option<usize>,
    /// Settings for [`logging::init`](crate::logging::init)
    pub logging: LoggingConfig,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_POOL_CAPACITY),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_ms: None,
            no_delay: true,
            max_connections: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl EventLoopConfig {
    /// Create a new builder for EventLoopConfig
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EventLoopConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Config("events_capacity must be at least 1".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Builder for EventLoopConfig.
///
/// Unset fields keep their defaults from EventLoopConfig::default().
#[derive(Default)]
pub struct EventLoopConfigBuilder {
    config: EventLoopConfig,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.config.buffer_pool_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn build(self) -> EventLoopConfig {
        self.config
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is not set, e.g. "info" or "mill_raw=debug"
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
        }
    }
}

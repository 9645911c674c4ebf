//! Configuration management

use crate::protocol::{DEFAULT_QUEUE_CAPACITY, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::server::ServerOptions;
use crate::transport::TransportConfig;
use crate::tunnel::{Framer, PumpConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Point (client) configuration
    pub point: PointConfig,
    /// Relay tuning shared by both ends
    pub tunnel: TunnelConfig,
    /// Socket settings
    pub transport: TransportConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings the relay cannot work with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let t = &self.tunnel;
        if t.min_frame_size > t.max_frame_size {
            return Err(crate::Error::Config(format!(
                "min_frame_size {} exceeds max_frame_size {}",
                t.min_frame_size, t.max_frame_size
            )));
        }
        if t.max_frame_size > u16::MAX as usize {
            return Err(crate::Error::Config(format!(
                "max_frame_size {} does not fit the 16-bit length field",
                t.max_frame_size
            )));
        }
        if t.queue_capacity == 0 {
            return Err(crate::Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.server.max_clients == 0 {
            return Err(crate::Error::Config("max_clients must be positive".to_string()));
        }
        Ok(())
    }

    /// Accept-loop settings for [`crate::server::Server`]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            framer: self.tunnel.framer(),
            transport: self.transport.clone(),
            max_clients: self.server.max_clients,
            verbose: self.tunnel.verbose,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Linux bridge every tap is enslaved to
    pub bridge: Option<String>,
    /// Maximum concurrent points
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            bridge: None,
            max_clients: 1024,
        }
    }
}

/// Point configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointConfig {
    /// Server address
    pub server: String,
    /// Tap interface name; the kernel picks one when absent
    pub device: Option<String>,
    /// Pause between tunnel rebuilds
    pub reconnect_interval_ms: u64,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            device: None,
            reconnect_interval_ms: 5000,
        }
    }
}

impl PointConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Relay tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub min_frame_size: usize,
    /// Largest frame relayed; also the tap MTU buffer size
    pub max_frame_size: usize,
    /// Frames buffered per direction
    pub queue_capacity: usize,
    /// Pause before a reader retries a recoverable error
    pub retry_interval_ms: u64,
    /// How long stopping waits for a loop before aborting it
    pub drain_timeout_ms: u64,
    /// Log every frame at debug level
    pub verbose: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            min_frame_size: MIN_FRAME_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval_ms: 2000,
            drain_timeout_ms: 2000,
            verbose: false,
        }
    }
}

impl TunnelConfig {
    pub fn framer(&self) -> Framer {
        Framer::new(self.min_frame_size, self.max_frame_size)
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            queue_capacity: self.queue_capacity,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_write_errors: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global `tracing` subscriber. Later calls are no-ops.
    pub fn init(&self) {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let _ = match self.format.as_str() {
            "compact" => builder.compact().try_init(),
            "full" => builder.try_init(),
            _ => builder.pretty().try_init(),
        };
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: ServerConfig {
            bridge: Some("br-tun".to_string()),
            ..ServerConfig::default()
        },
        point: PointConfig {
            device: Some("tap0".to_string()),
            ..PointConfig::default()
        },
        ..Config::default()
    }
}

//! # ethertun
//!
//! Relays raw Ethernet frames between a virtual network interface and a
//! peer across a TCP connection. A server accepts many such peers on one
//! listening socket and gives each one its own tap device.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  read   ┌────────┐  queue  ┌────────┐  write  ┌────────────┐
//! │  device  │ ──────► │ reader │ ══════► │ writer │ ──────► │ connection │
//! │  (tap)   │ ◄────── │ writer │ ◄══════ │ reader │ ◄────── │   (TCP)    │
//! └──────────┘  write  └────────┘  queue  └────────┘  read   └────────────┘
//!                 Pump (device → peer) + Pump (peer → device) = Tunnel
//! ```
//!
//! ## Wire format
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  Magic (0xFFFF) |  Payload Length |
//! +--------+--------+--------+--------+
//! |      Ethernet frame (15..=1514)   |
//! +--------+--------+--------+--------+
//! ```

pub mod config;
pub mod device;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use protocol::{ProtocolError, HEADER_SIZE, MAGIC, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
pub use transport::{Connection, ConnectionError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port the server listens on
pub const DEFAULT_PORT: u16 = 10002;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a reader loop may retry after this error.
    ///
    /// Dial failures, timeouts and a not-yet-established connection are left
    /// to the reconnect policy. Everything else (bad framing, a closed handle,
    /// a broken socket) ends the loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connection(
                ConnectionError::NotConnected
                    | ConnectionError::DialFailed { .. }
                    | ConnectionError::Timeout
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::from(ConnectionError::NotConnected).is_recoverable());
        assert!(Error::from(ConnectionError::Timeout).is_recoverable());
        assert!(!Error::from(ConnectionError::Closed).is_recoverable());
        assert!(!Error::from(ProtocolError::BadMagic([0, 1])).is_recoverable());
        assert!(!Error::Device("gone".to_string()).is_recoverable());
    }
}

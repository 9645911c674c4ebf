//! Transport layer
//!
//! Provides:
//! - TCP dialing with timeouts
//! - [`Connection`], one framed stream to a peer

mod connection;
mod tcp;

pub use connection::{Connection, ConnectionId, ConnectionStats};
pub use tcp::dial;

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Dial {addr} failed: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, never dialed
    Init = 0,
    /// Dial in progress
    Connecting = 1,
    /// Socket established
    Connected = 2,
    /// Terminal; the connection is never reused
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Write timeout in seconds (0 disables)
    pub write_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            write_timeout: 60,
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        assert_eq!(ConnectionState::from(2), ConnectionState::Connected);
        assert_eq!(ConnectionState::from(200), ConnectionState::Closed);
    }
}

//! TCP dialing

use super::{ConnectionError, TransportConfig};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dial `addr`, honoring the configured connect timeout
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream, ConnectionError> {
    let timeout = Duration::from_secs(config.connect_timeout);

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::DialFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|source| ConnectionError::DialFailed {
            addr: addr.to_string(),
            source,
        })?;

    if config.nodelay {
        stream.set_nodelay(true).ok();
    }

    debug!("Dialed {}", addr);
    Ok(stream)
}

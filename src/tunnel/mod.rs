//! Tunnel layer - frame relay between a device and a peer
//!
//! Provides:
//! - Message framing over a byte stream
//! - Bounded frame queues
//! - Pumps (reader loop → queue → writer loop)
//! - Full-duplex tunnels built from two pumps

mod duplex;
mod framer;
mod pump;
mod queue;

pub use duplex::{Tunnel, TunnelStats};
pub use framer::{read_full, write_full, Framer};
pub use pump::{FrameSink, FrameSource, Pump, PumpConfig, PumpStats};
pub use queue::{bounded, FrameRx, FrameTx};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Queue closed")]
    QueueClosed,

    #[error("Tunnel already started")]
    AlreadyStarted,
}

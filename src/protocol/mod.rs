//! Protocol definitions and constants

mod arp;
mod ether;

pub use arp::{ArpPacket, ARP_REPLY, ARP_REQUEST};
pub use ether::{describe_frame, EtherHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_VLAN};

use thiserror::Error;

/// Protocol errors
///
/// Both variants are fatal to the current message: once the header is
/// misread the stream cannot be resynchronized.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Bad magic bytes: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("Bad payload size: {size} not in [{min}, {max}]")]
    BadSize { size: usize, min: usize, max: usize },

    #[error("Truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
}

/// Magic prefix of every message
pub const MAGIC: [u8; 2] = [0xFF, 0xFF];

/// Magic (2B) + payload length (2B)
pub const HEADER_SIZE: usize = 4;

/// Smallest frame accepted on the wire
pub const MIN_FRAME_SIZE: usize = 15;

/// Largest frame accepted on the wire (1500 MTU + 14 byte Ethernet header)
pub const MAX_FRAME_SIZE: usize = 1514;

/// Default capacity of each pump queue, in frames
pub const DEFAULT_QUEUE_CAPACITY: usize = 10240;

//! ARP packet decoding
//!
//! Hardware and protocol addresses are variable length; their sizes come
//! from the `hlen`/`plen` fields and are checked against the buffer before
//! anything is sliced out.

use super::ether::Mac;
use super::ProtocolError;
use std::fmt;
use std::net::Ipv4Addr;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// Fixed part: htype(2) ptype(2) hlen(1) plen(1) oper(2)
const ARP_FIXED_LEN: usize = 8;

/// Decoded ARP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub operation: u16,
    pub sender_hw: Vec<u8>,
    pub sender_proto: Vec<u8>,
    pub target_hw: Vec<u8>,
    pub target_proto: Vec<u8>,
}

impl ArpPacket {
    /// Decode an ARP packet (the bytes following the Ethernet header)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < ARP_FIXED_LEN {
            return Err(ProtocolError::Truncated {
                what: "arp header",
                need: ARP_FIXED_LEN,
                have: buf.len(),
            });
        }

        let hardware_type = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_type = u16::from_be_bytes([buf[2], buf[3]]);
        let hlen = buf[4] as usize;
        let plen = buf[5] as usize;
        let operation = u16::from_be_bytes([buf[6], buf[7]]);

        let need = ARP_FIXED_LEN + 2 * (hlen + plen);
        if buf.len() < need {
            return Err(ProtocolError::Truncated {
                what: "arp addresses",
                need,
                have: buf.len(),
            });
        }

        let mut pos = ARP_FIXED_LEN;
        let mut take = |len: usize| {
            let field = buf[pos..pos + len].to_vec();
            pos += len;
            field
        };

        let sender_hw = take(hlen);
        let sender_proto = take(plen);
        let target_hw = take(hlen);
        let target_proto = take(plen);

        Ok(Self {
            hardware_type,
            protocol_type,
            operation,
            sender_hw,
            sender_proto,
            target_hw,
            target_proto,
        })
    }

    /// Encode the packet; address lengths are taken from the sender fields
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let hlen = self.sender_hw.len();
        let plen = self.sender_proto.len();
        if self.target_hw.len() != hlen || self.target_proto.len() != plen {
            return Err(ProtocolError::Truncated {
                what: "arp target address",
                need: hlen + plen,
                have: self.target_hw.len() + self.target_proto.len(),
            });
        }
        if hlen > u8::MAX as usize || plen > u8::MAX as usize {
            return Err(ProtocolError::BadSize {
                size: hlen.max(plen),
                min: 0,
                max: u8::MAX as usize,
            });
        }

        let mut buf = Vec::with_capacity(ARP_FIXED_LEN + 2 * (hlen + plen));
        buf.extend_from_slice(&self.hardware_type.to_be_bytes());
        buf.extend_from_slice(&self.protocol_type.to_be_bytes());
        buf.push(hlen as u8);
        buf.push(plen as u8);
        buf.extend_from_slice(&self.operation.to_be_bytes());
        buf.extend_from_slice(&self.sender_hw);
        buf.extend_from_slice(&self.sender_proto);
        buf.extend_from_slice(&self.target_hw);
        buf.extend_from_slice(&self.target_proto);
        Ok(buf)
    }

    fn ipv4(addr: &[u8]) -> Option<Ipv4Addr> {
        <[u8; 4]>::try_from(addr).ok().map(Ipv4Addr::from)
    }

    pub fn sender_ipv4(&self) -> Option<Ipv4Addr> {
        Self::ipv4(&self.sender_proto)
    }

    pub fn target_ipv4(&self) -> Option<Ipv4Addr> {
        Self::ipv4(&self.target_proto)
    }
}

impl fmt::Display for ArpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.operation, self.target_ipv4(), self.sender_ipv4()) {
            (ARP_REQUEST, Some(target), Some(sender)) => {
                write!(f, "arp who-has {} tell {}", target, sender)
            }
            (ARP_REPLY, _, Some(sender)) => {
                write!(f, "arp reply {} is-at {}", sender, Mac(&self.sender_hw))
            }
            (op, _, _) => write!(f, "arp op {}", op),
        }
    }
}

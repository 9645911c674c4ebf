//! Ethernet II header decoding
//!
//! ```text
//! +-------------------+-------------------+-----------+
//! |  Destination (6B) |    Source (6B)    | Type (2B) |
//! +-------------------+-------------------+-----------+
//! |   optional 802.1Q: TCI (2B) + inner type (2B)     |
//! +---------------------------------------------------+
//! ```

use super::{ArpPacket, ProtocolError};
use std::fmt;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

const ETHER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;

/// Decoded Ethernet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtherHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    /// Ethertype of the payload (the inner type for tagged frames)
    pub ethertype: u16,
    /// 802.1Q tag control (priority, DEI, VLAN id), if the frame was tagged
    pub tci: Option<u16>,
    /// Header length including any VLAN tag
    pub len: usize,
}

impl EtherHeader {
    /// Decode the header at the start of `frame`
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < ETHER_LEN {
            return Err(ProtocolError::Truncated {
                what: "ethernet header",
                need: ETHER_LEN,
                have: frame.len(),
            });
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        let outer = u16::from_be_bytes([frame[12], frame[13]]);

        if outer != ETHERTYPE_VLAN {
            return Ok(Self {
                dst,
                src,
                ethertype: outer,
                tci: None,
                len: ETHER_LEN,
            });
        }

        if frame.len() < ETHER_LEN + VLAN_TAG_LEN {
            return Err(ProtocolError::Truncated {
                what: "vlan tag",
                need: ETHER_LEN + VLAN_TAG_LEN,
                have: frame.len(),
            });
        }
        let tci = u16::from_be_bytes([frame[14], frame[15]]);
        let inner = u16::from_be_bytes([frame[16], frame[17]]);

        Ok(Self {
            dst,
            src,
            ethertype: inner,
            tci: Some(tci),
            len: ETHER_LEN + VLAN_TAG_LEN,
        })
    }

    /// Encode the header (including the VLAN tag, if any)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len);
        buf.extend_from_slice(&self.dst);
        buf.extend_from_slice(&self.src);
        if let Some(tci) = self.tci {
            buf.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            buf.extend_from_slice(&tci.to_be_bytes());
        }
        buf.extend_from_slice(&self.ethertype.to_be_bytes());
        buf
    }

    /// 12-bit VLAN id of a tagged frame
    pub fn vlan_id(&self) -> Option<u16> {
        self.tci.map(|tci| tci & 0x0FFF)
    }

    /// 802.1p priority code point of a tagged frame
    pub fn priority(&self) -> Option<u8> {
        self.tci.map(|tci| (tci >> 13) as u8)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == [0xFF; 6]
    }

    pub fn is_arp(&self) -> bool {
        self.ethertype == ETHERTYPE_ARP
    }
}

pub(crate) struct Mac<'a>(pub &'a [u8]);

impl fmt::Display for Mac<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One-line summary of a frame for verbose logging
pub fn describe_frame(frame: &[u8]) -> String {
    let eth = match EtherHeader::decode(frame) {
        Ok(eth) => eth,
        Err(_) => return format!("runt frame ({} bytes)", frame.len()),
    };

    let mut out = format!(
        "{} > {} type 0x{:04x}",
        Mac(&eth.src),
        Mac(&eth.dst),
        eth.ethertype
    );
    if let (Some(vlan), Some(pcp)) = (eth.vlan_id(), eth.priority()) {
        out.push_str(&format!(" vlan {}", vlan));
        if pcp != 0 {
            out.push_str(&format!(" pcp {}", pcp));
        }
    }
    if eth.is_arp() {
        match ArpPacket::decode(&frame[eth.len..]) {
            Ok(arp) => out.push_str(&format!(" {}", arp)),
            Err(e) => out.push_str(&format!(" arp ({})", e)),
        }
    }
    out
}

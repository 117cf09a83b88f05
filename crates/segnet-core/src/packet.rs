//! Packet header
//!
//! ```text
//!  0      1      2      3      4      5      6      7
//! ┌──────┬──────┬─────────────┬───────────────────────────┐
//! │ 'V'  │ 'Z'  │ flag (BE)   │ length (BE)               │  payload...
//! └──────┴──────┴─────────────┴───────────────────────────┘
//! ```
//!
//! `flag` is an application-defined message kind; `length` counts payload
//! bytes only.

use crate::constants::{PACKET_HEADER_SIZE, PACKET_MAGIC};
use crate::error::{NetError, NetResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: [u8; 2],
    pub flag: u16,
    pub length: u32,
}

impl PacketHeader {
    pub fn new(flag: u16, length: u32) -> Self {
        Self {
            magic: PACKET_MAGIC,
            flag,
            length,
        }
    }

    /// Wire representation, network byte order.
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        raw[..2].copy_from_slice(&self.magic);
        raw[2..4].copy_from_slice(&self.flag.to_be_bytes());
        raw[4..8].copy_from_slice(&self.length.to_be_bytes());
        raw
    }

    /// Decode without checking the magic.
    pub fn decode(raw: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            magic: [raw[0], raw[1]],
            flag: u16::from_be_bytes([raw[2], raw[3]]),
            length: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    /// Decode and reject anything not starting with 'V','Z'.
    pub fn parse(raw: &[u8; PACKET_HEADER_SIZE]) -> NetResult<Self> {
        let header = Self::decode(raw);
        header.check_magic()?;
        Ok(header)
    }

    #[inline]
    pub fn check_magic(&self) -> NetResult<()> {
        if self.magic == PACKET_MAGIC {
            Ok(())
        } else {
            Err(NetError::BadMagic { found: self.magic })
        }
    }

    /// Header plus payload.
    #[inline]
    pub fn frame_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let raw = PacketHeader::new(0x0102, 0x0A0B0C0D).encode();
        assert_eq!(raw, [b'V', b'Z', 0x01, 0x02, 0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_parse() {
        let raw = [b'V', b'Z', 0, 7, 0, 0, 1, 0];
        let h = PacketHeader::parse(&raw).unwrap();
        assert_eq!(h.flag, 7);
        assert_eq!(h.length, 256);
        assert_eq!(h.frame_len(), 264);
    }

    #[test]
    fn test_bad_magic() {
        let raw = [b'V', b'Y', 0, 0, 0, 0, 0, 0];
        assert_eq!(
            PacketHeader::parse(&raw),
            Err(NetError::BadMagic { found: *b"VY" })
        );
    }
}

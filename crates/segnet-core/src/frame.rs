//! Packet framing and reassembly
//!
//! [`frame_packet`] prepends a header block to a payload buffer.
//! [`FrameAssembler`] turns an arbitrarily fragmented byte stream back into
//! frames. It keeps bytes that do not yet form a complete frame in
//! `pending`; each call to [`FrameAssembler::next_frame`] looks at
//! `pending + incoming` and either emits one frame or parks `incoming`.
//!
//! Header location has three cases:
//!
//! ```text
//!   pending >= 8        pending == 0         0 < pending < 8
//!   [HHHHHHHHpp][ii]    [][HHHHHHHHii]       [HHH][HHHHHii]
//!    ^ header            ^ header             ^ straddles both
//! ```
//!
//! `pending` never holds a whole frame: bytes are parked there only when
//! the frame they start is still incomplete.

use crate::buffer::SegmentedBuffer;
use crate::constants::PACKET_HEADER_SIZE;
use crate::error::{NetError, NetResult};
use crate::packet::PacketHeader;
use crate::pool::BlockPool;

/// One reassembled packet.
#[derive(Debug)]
pub struct Frame {
    pub flag: u16,
    pub payload: SegmentedBuffer,
}

/// Prepend a header for `payload` as a new first block.
///
/// The payload's blocks are moved, not copied.
pub fn frame_packet(
    pool: &BlockPool,
    mut payload: SegmentedBuffer,
    flag: u16,
    max_payload: usize,
) -> NetResult<SegmentedBuffer> {
    let size = payload.len();
    if size > max_payload || size > u32::MAX as usize {
        return Err(NetError::PacketTooLarge {
            size,
            limit: max_payload.min(u32::MAX as usize),
        });
    }
    let mut header = pool.take_block()?;
    header.write_bytes(&PacketHeader::new(flag, size as u32).encode());

    let mut framed = SegmentedBuffer::new(pool);
    framed.append_block(header);
    framed.append_buffer(&mut payload);
    Ok(framed)
}

/// Byte stream to frame reassembly state.
pub struct FrameAssembler {
    pending: SegmentedBuffer,
    max_payload: usize,
}

impl FrameAssembler {
    pub fn new(pool: &BlockPool, max_payload: usize) -> Self {
        Self {
            pending: SegmentedBuffer::new(pool),
            max_payload,
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Pull the next complete frame out of `pending + incoming`.
    ///
    /// Returns `Ok(None)` once `incoming` is exhausted (its bytes parked in
    /// `pending`). Call repeatedly until `None` to drain every frame of one
    /// read. `BadMagic` and `PacketTooLarge` are fatal for the stream.
    pub fn next_frame(&mut self, incoming: &mut SegmentedBuffer) -> NetResult<Option<Frame>> {
        let available = self.pending.len() + incoming.len();
        if available < PACKET_HEADER_SIZE {
            self.pending.append_buffer(incoming);
            return Ok(None);
        }

        let header = PacketHeader::decode(&self.peek_header(incoming));
        header.check_magic()?;
        if header.length as usize > self.max_payload {
            return Err(NetError::PacketTooLarge {
                size: header.length as usize,
                limit: self.max_payload,
            });
        }

        let total = header.frame_len();
        if available < total {
            self.pending.append_buffer(incoming);
            return Ok(None);
        }

        let mut payload = self.pending.take();
        let need = total - payload.len();
        match incoming.split_to(need)? {
            Some(mut tail) => payload.append_buffer(&mut tail),
            None => {
                return Err(NetError::InvalidState("frame shorter than available bytes"))
            }
        }
        payload.skip(PACKET_HEADER_SIZE);

        Ok(Some(Frame {
            flag: header.flag,
            payload,
        }))
    }

    fn peek_header(&self, incoming: &SegmentedBuffer) -> [u8; PACKET_HEADER_SIZE] {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        let have = self.pending.len();
        let copied = if have >= PACKET_HEADER_SIZE {
            self.pending.copy_bytes(0, &mut raw)
        } else if have == 0 {
            incoming.copy_bytes(0, &mut raw)
        } else {
            let (head, tail) = raw.split_at_mut(have);
            self.pending.copy_bytes(0, head) && incoming.copy_bytes(0, tail)
        };
        debug_assert!(copied, "header peek with fewer than 8 bytes available");
        raw
    }
}

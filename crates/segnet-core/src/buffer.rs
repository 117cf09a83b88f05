//! Segmented byte buffer
//!
//! A [`SegmentedBuffer`] is a FIFO byte stream stored as a deque of pooled
//! blocks. Writes fill the last block and then pull fresh blocks from the
//! pool; reads drain from the front, dropping (and so recycling) blocks as
//! they empty. Buffers are joined by moving blocks, never by copying bytes.
//!
//! ```text
//!   front                                        back
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌──────┬──┐
//!   │ 768/768 │─►│ 768/768 │─►│ 300/768 │─►│ 17/768  │   len = 1853
//!   └─────────┘  └─────────┘  └─────────┘  └─────────┘
//!        ▲ read_bytes / skip       append_buffer ▲ (spliced block)
//! ```
//!
//! A buffer built only by `write_bytes` has spare capacity in its last block
//! alone. Spliced buffers can carry partially filled interior blocks; every
//! operation here handles both.

use std::collections::VecDeque;
use std::fmt;

use crate::pool::{BlockHandle, BlockPool};
use crate::error::NetResult;

pub struct SegmentedBuffer {
    pool: BlockPool,
    blocks: VecDeque<BlockHandle>,
    len: usize,
}

impl SegmentedBuffer {
    /// Empty buffer that draws new blocks from `pool`.
    pub fn new(pool: &BlockPool) -> Self {
        Self {
            pool: pool.clone(),
            blocks: VecDeque::new(),
            len: 0,
        }
    }

    /// Buffer holding a copy of `data`.
    pub fn from_bytes(pool: &BlockPool, data: &[u8]) -> NetResult<Self> {
        let mut buf = Self::new(pool);
        buf.write_bytes(data)?;
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Iterate blocks front to back.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockHandle> {
        self.blocks.iter()
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Append a copy of `data`.
    ///
    /// On `PoolExhausted` the bytes placed so far stay in the buffer.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> NetResult<()> {
        if let Some(last) = self.blocks.back_mut() {
            let n = last.write_bytes(data);
            self.len += n;
            data = &data[n..];
        }
        while !data.is_empty() {
            let mut block = self.pool.take_block()?;
            let n = block.write_bytes(data);
            self.len += n;
            data = &data[n..];
            self.blocks.push_back(block);
        }
        Ok(())
    }

    #[inline]
    pub fn write_str(&mut self, s: &str) -> NetResult<()> {
        self.write_bytes(s.as_bytes())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Fill `out` from the front. False (and nothing consumed) if fewer
    /// than `out.len()` bytes are buffered.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        let mut done = 0;
        while done < out.len() {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            let n = front.copy_bytes(0, &mut out[done..]);
            done += n;
            if n == front.len() {
                self.blocks.pop_front();
            } else {
                front.consume(n);
            }
        }
        self.len -= done;
        debug_assert_eq!(done, out.len());
        true
    }

    /// Copy `out.len()` bytes starting `pos` bytes in, without consuming.
    pub fn copy_bytes(&self, pos: usize, out: &mut [u8]) -> bool {
        match pos.checked_add(out.len()) {
            Some(end) if end <= self.len => {}
            _ => return false,
        }
        let mut skip = pos;
        let mut done = 0;
        for block in &self.blocks {
            if done == out.len() {
                break;
            }
            if skip >= block.len() {
                skip -= block.len();
                continue;
            }
            done += block.copy_bytes(skip, &mut out[done..]);
            skip = 0;
        }
        done == out.len()
    }

    /// Discard `n` bytes from the front.
    pub fn skip(&mut self, mut n: usize) -> bool {
        if n > self.len {
            return false;
        }
        self.len -= n;
        while n > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.blocks.pop_front();
            } else {
                front.consume(n);
                n = 0;
            }
        }
        true
    }

    /// Move the first `n` bytes into a new buffer.
    ///
    /// Whole blocks move without copying. A block that straddles the cut
    /// has its head copied into a fresh block; its tail stays here.
    pub fn split_to(&mut self, n: usize) -> NetResult<Option<SegmentedBuffer>> {
        if n > self.len {
            return Ok(None);
        }
        let mut out = SegmentedBuffer::new(&self.pool);
        while out.len < n {
            let need = n - out.len;
            let front_len = match self.blocks.front() {
                Some(front) => front.len(),
                None => break,
            };
            if front_len <= need {
                if let Some(block) = self.pop_front_block() {
                    out.append_block(block);
                }
            } else {
                let head = self.split_front(need)?;
                out.append_block(head);
            }
        }
        Ok(Some(out))
    }

    /// Copy the first `n` bytes of the front block into a fresh block and
    /// consume them here. `n` must be smaller than the front block.
    pub fn split_front(&mut self, n: usize) -> NetResult<BlockHandle> {
        let mut head = self.pool.take_block()?;
        if let Some(front) = self.blocks.front_mut() {
            let n = n.min(front.len());
            head.write_bytes(&front.as_slice()[..n]);
            front.consume(n);
            self.len -= n;
            if front.is_empty() {
                self.blocks.pop_front();
            }
        }
        Ok(head)
    }

    /// Copy-drain `n` bytes into `dest`.
    pub fn read_into(&mut self, dest: &mut SegmentedBuffer, n: usize) -> NetResult<bool> {
        match self.split_to(n)? {
            Some(mut head) => {
                dest.append_buffer(&mut head);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read `n` bytes into a `Vec`.
    pub fn read_vec(&mut self, n: usize) -> Option<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_bytes(&mut out).then_some(out)
    }

    /// Read `n` bytes as UTF-8. Consumes them even if they are not UTF-8.
    pub fn read_string(&mut self, n: usize) -> Option<String> {
        self.read_vec(n).and_then(|v| String::from_utf8(v).ok())
    }

    /// Copy the whole contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in &self.blocks {
            out.extend_from_slice(block.as_slice());
        }
        out
    }

    // ------------------------------------------------------------------
    // Splicing
    // ------------------------------------------------------------------

    /// Move all of `other`'s blocks to the back of `self`; `other` ends empty.
    pub fn append_buffer(&mut self, other: &mut SegmentedBuffer) {
        self.len += other.len;
        other.len = 0;
        self.blocks.append(&mut other.blocks);
    }

    /// Append one block. Empty blocks are dropped.
    pub fn append_block(&mut self, block: BlockHandle) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.blocks.push_back(block);
    }

    /// Insert one block at the front. Empty blocks are dropped.
    pub fn push_front_block(&mut self, block: BlockHandle) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.blocks.push_front(block);
    }

    pub fn pop_front_block(&mut self) -> Option<BlockHandle> {
        let block = self.blocks.pop_front()?;
        self.len -= block.len();
        Some(block)
    }

    /// Take the whole contents, leaving `self` empty.
    pub fn take(&mut self) -> SegmentedBuffer {
        let mut out = SegmentedBuffer::new(&self.pool);
        out.append_buffer(self);
        out
    }

    /// Release every block to the pool.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Set the encode flag on every block. False if the buffer is empty.
    pub fn set_encode(&mut self, encode: bool) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        for block in self.blocks.iter_mut() {
            block.set_encode(encode);
        }
        true
    }
}

// ----------------------------------------------------------------------
// Fixed-width numbers, host byte order
// ----------------------------------------------------------------------

macro_rules! numeric_accessors {
    ($($ty:ty => $write:ident, $read:ident, $copy:ident;)*) => {
        impl SegmentedBuffer {
            $(
                pub fn $write(&mut self, v: $ty) -> NetResult<()> {
                    self.write_bytes(&v.to_ne_bytes())
                }

                pub fn $read(&mut self) -> Option<$ty> {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    self.read_bytes(&mut raw).then(|| <$ty>::from_ne_bytes(raw))
                }

                pub fn $copy(&self, pos: usize) -> Option<$ty> {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    self.copy_bytes(pos, &mut raw).then(|| <$ty>::from_ne_bytes(raw))
                }
            )*
        }
    };
}

numeric_accessors! {
    u8 => write_u8, read_u8, copy_u8;
    u16 => write_u16, read_u16, copy_u16;
    u32 => write_u32, read_u32, copy_u32;
    u64 => write_u64, read_u64, copy_u64;
}

impl fmt::Debug for SegmentedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedBuffer")
            .field("len", &self.len)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

//! Fixed-size block pool
//!
//! Blocks are `BLOCK_SIZE`-byte segments handed out as [`BlockHandle`]s.
//! Dropping a handle resets the block and pushes it on the pool's LIFO free
//! list, so the most recently released (cache-warm) block is reused first.
//!
//! ```text
//!   take_block() ──► free.pop() ──► BlockHandle ──drop──► reset ──► free.push()
//!                       │ empty                                      │ full
//!                       ▼                                            ▼
//!                  Box::new(Block)                               dealloc
//! ```
//!
//! One pool is created by the owner of the runtime and cloned into every
//! component. The free list is behind a mutex because blocks move between
//! threads over their lifetime; everything else is atomic counters.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::constants::{BLOCK_SIZE, DEFAULT_MAX_FREE_BLOCKS};
use crate::env::env_get;
use crate::error::{NetError, NetResult};

/// One fixed-capacity byte segment.
///
/// Bytes live in `data[..len]`. Consumption from the front shifts the
/// remainder down to offset 0.
pub struct Block {
    data: [u8; BLOCK_SIZE],
    len: usize,
    encode: bool,
}

impl Block {
    fn new() -> Self {
        Self {
            data: [0u8; BLOCK_SIZE],
            len: 0,
            encode: false,
        }
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
    pub fn capacity(&self) -> usize {
        BLOCK_SIZE
    }

    #[inline]
    pub fn spare(&self) -> usize {
        BLOCK_SIZE - self.len
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == BLOCK_SIZE
    }

    /// Whether this block's bytes should be transformed before sending.
    #[inline]
    pub fn encode(&self) -> bool {
        self.encode
    }

    #[inline]
    pub fn set_encode(&mut self, encode: bool) {
        self.encode = encode;
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Append as much of `src` as fits. Returns bytes taken.
    pub fn write_bytes(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.spare());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Copy up to `out.len()` bytes starting at `pos` without consuming.
    pub fn copy_bytes(&self, pos: usize, out: &mut [u8]) -> usize {
        if pos >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - pos);
        out[..n].copy_from_slice(&self.data[pos..pos + n]);
        n
    }

    /// Drop `n` bytes from the front and shift the rest to offset 0.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Unused tail, for reading straight from a socket.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` bytes of the spare tail as filled.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.spare(), "commit past block capacity");
        self.len += n.min(self.spare());
    }

    fn reset(&mut self) {
        self.len = 0;
        self.encode = false;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.len)
            .field("encode", &self.encode)
            .finish()
    }
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum blocks alive at once (0 = unlimited)
    pub max_blocks: usize,
    /// Maximum blocks parked on the free list
    pub max_free: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    /// Defaults with environment overrides:
    /// - `SEGNET_POOL_MAX_BLOCKS` - outstanding block limit (0 = unlimited)
    /// - `SEGNET_POOL_MAX_FREE` - free list cap
    pub fn from_env() -> Self {
        Self {
            max_blocks: env_get("SEGNET_POOL_MAX_BLOCKS", 0),
            max_free: env_get("SEGNET_POOL_MAX_FREE", DEFAULT_MAX_FREE_BLOCKS),
        }
    }

    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            max_blocks: 0,
            max_free: DEFAULT_MAX_FREE_BLOCKS,
        }
    }

    pub fn max_blocks(mut self, n: usize) -> Self {
        self.max_blocks = n;
        self
    }

    pub fn max_free(mut self, n: usize) -> Self {
        self.max_free = n;
        self
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<Block>>>,
    max_blocks: usize,
    max_free: usize,
    /// Handles currently alive
    outstanding: AtomicUsize,
    /// Blocks ever allocated from the heap
    created: AtomicUsize,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<Box<Block>>> {
        // A panic while holding the lock cannot leave the Vec inconsistent.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn recycle(&self, mut block: Box<Block>) {
        block.reset();
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "block recycled more times than taken");
        let mut free = self.free_list();
        if free.len() < self.max_free {
            free.push(block);
        }
    }
}

/// Shared, thread-safe block allocator. Cloning shares the same free list.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(config.max_free.min(1024))),
                max_blocks: config.max_blocks,
                max_free: config.max_free,
                outstanding: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a block, reusing the most recently freed one if available.
    ///
    /// Fails with `PoolExhausted` once `max_blocks` handles are alive.
    pub fn take_block(&self) -> NetResult<BlockHandle> {
        let inner = &self.inner;
        let recycled = {
            let mut free = inner.free_list();
            if inner.max_blocks != 0
                && inner.outstanding.load(Ordering::Acquire) >= inner.max_blocks
            {
                return Err(NetError::PoolExhausted);
            }
            inner.outstanding.fetch_add(1, Ordering::AcqRel);
            free.pop()
        };

        let block = match recycled {
            Some(block) => block,
            None => {
                inner.created.fetch_add(1, Ordering::Relaxed);
                Box::new(Block::new())
            }
        };
        debug_assert!(block.is_empty() && !block.encode());

        Ok(BlockHandle {
            block: Some(block),
            pool: Arc::clone(inner),
        })
    }

    /// Handles currently alive
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Blocks parked on the free list
    pub fn free_count(&self) -> usize {
        self.inner.free_list().len()
    }

    /// Blocks ever allocated from the heap
    #[inline]
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// True if both handles share one free list.
    pub fn same_pool(&self, other: &BlockPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(PoolConfig::new())
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("outstanding", &self.outstanding())
            .field("created", &self.created())
            .field("max_blocks", &self.inner.max_blocks)
            .finish()
    }
}

/// Exclusive owner of one pooled block. Returns it to the pool on drop.
pub struct BlockHandle {
    block: Option<Box<Block>>,
    pool: Arc<PoolInner>,
}

impl BlockHandle {
    /// Address of the underlying block, for identity checks in tests.
    pub fn block_addr(&self) -> usize {
        self.block
            .as_deref()
            .map_or(0, |b| b as *const Block as usize)
    }
}

impl Deref for BlockHandle {
    type Target = Block;

    fn deref(&self) -> &Block {
        match self.block.as_deref() {
            Some(block) => block,
            // `block` is only taken in drop.
            None => unreachable!("block handle used after release"),
        }
    }
}

impl DerefMut for BlockHandle {
    fn deref_mut(&mut self) -> &mut Block {
        match self.block.as_deref_mut() {
            Some(block) => block,
            None => unreachable!("block handle used after release"),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.recycle(block);
        }
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

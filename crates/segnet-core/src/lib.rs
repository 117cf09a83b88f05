//! # segnet-core
//!
//! Core types for the segnet networking runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Sockets, the reactor and the async state machines live in `segnet-runtime`.
//!
//! ## Modules
//!
//! - `pool` - Fixed-size block pool with recycle-on-drop handles
//! - `buffer` - Segmented byte buffer built from pooled blocks
//! - `events` - Semantic readiness event bitmask
//! - `packet` - 8-byte packet header codec
//! - `frame` - Frame encoder and reassembly state machine
//! - `error` - Error types
//! - `logging` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod pool;
pub mod buffer;
pub mod events;
pub mod packet;
pub mod frame;
pub mod error;
pub mod logging;
pub mod env;

// Re-exports for convenience
pub use pool::{Block, BlockHandle, BlockPool, PoolConfig};
pub use buffer::SegmentedBuffer;
pub use events::Events;
pub use packet::PacketHeader;
pub use frame::{frame_packet, Frame, FrameAssembler};
pub use error::{NetError, NetResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared by every layer
pub mod constants {
    // Multiples of 3 so full blocks base64-encode without padding.
    cfg_if::cfg_if! {
        if #[cfg(feature = "large-blocks")] {
            /// Capacity of one pooled block
            pub const BLOCK_SIZE: usize = 3072;
        } else {
            /// Capacity of one pooled block
            pub const BLOCK_SIZE: usize = 768;
        }
    }

    /// Size of the packet header on the wire
    pub const PACKET_HEADER_SIZE: usize = 8;

    /// Magic bytes that open every packet
    pub const PACKET_MAGIC: [u8; 2] = *b"VZ";

    /// Largest payload a packet sender will frame by default
    pub const PACKET_BODY_SIZE: usize = 64 * 1024 - PACKET_HEADER_SIZE;

    /// Default cap on blocks kept in the pool free list
    pub const DEFAULT_MAX_FREE_BLOCKS: usize = 4096;
}

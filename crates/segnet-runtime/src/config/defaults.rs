//! Library defaults for [`RuntimeConfig`](super::RuntimeConfig).

/// `listen(2)` backlog for accepting sockets
pub const LISTEN_BACKLOG: i32 = 10;

/// Bytes read per READ event before yielding back to the reactor
pub const READ_LIMIT: usize = 64 * 1024;

/// Largest packet payload accepted or framed
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Disable Nagle on accepted and connected TCP sockets
pub const TCP_NODELAY: bool = true;

/// Base64-encode blocks flagged for encoding
pub const ENCODE_BASE64: bool = false;

/// Set SO_REUSEADDR before binding listeners
pub const REUSE_ADDR: bool = true;

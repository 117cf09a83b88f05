//! Error types for segnet

use core::fmt;

/// Result type for networking operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in pool, socket, reactor and framing operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Socket would block; retry on the next readiness event
    WouldBlock,

    /// Peer performed an orderly shutdown (zero-byte read or CLOSE event)
    PeerClosed,

    /// Operation attempted on a closed socket
    Closed,

    /// Packet header did not start with the 'V','Z' magic
    BadMagic { found: [u8; 2] },

    /// Packet payload exceeds the configured limit
    PacketTooLarge { size: usize, limit: usize },

    /// Readiness syscall failed with a non-interrupt errno
    Reactor(i32),

    /// Block pool reached its configured limit
    PoolExhausted,

    /// Operation not valid in the socket's current state
    InvalidState(&'static str),

    /// Address could not be converted to or from a socket address
    AddrParse,

    /// Descriptor cannot be represented by the active poller
    FdOutOfRange(i32),

    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// OS error with errno
    Os(i32),
}

impl NetError {
    /// True for errors that only defer the operation to a later cycle
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    /// True for errors after which the connection cannot be used
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            NetError::WouldBlock
                | NetError::PoolExhausted
                | NetError::InvalidState(_)
                | NetError::InvalidConfig(_)
        )
    }

    /// OS error code carried by this error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            NetError::Os(e) | NetError::Reactor(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::WouldBlock => write!(f, "operation would block"),
            NetError::PeerClosed => write!(f, "connection closed by peer"),
            NetError::Closed => write!(f, "socket is closed"),
            NetError::BadMagic { found } => write!(
                f,
                "bad packet magic: {:#04x} {:#04x}",
                found[0], found[1]
            ),
            NetError::PacketTooLarge { size, limit } => {
                write!(f, "packet payload {} exceeds limit {}", size, limit)
            }
            NetError::Reactor(e) => write!(f, "reactor wait failed: errno {}", e),
            NetError::PoolExhausted => write!(f, "block pool exhausted"),
            NetError::InvalidState(what) => write!(f, "invalid socket state: {}", what),
            NetError::AddrParse => write!(f, "unsupported socket address"),
            NetError::FdOutOfRange(fd) => write!(f, "descriptor {} out of range for poller", fd),
            NetError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            NetError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => NetError::Os(code),
            None if e.kind() == std::io::ErrorKind::WouldBlock => NetError::WouldBlock,
            None => NetError::InvalidState("io error without errno"),
        }
    }
}

//! Cross-thread reactor wakeup
//!
//! A `Wakeup` owns one descriptor that the reactor polls for readability
//! next to its sockets. Any thread may call `wake()`; the reactor calls
//! `drain()` once it sees the descriptor ready.

use std::os::unix::io::RawFd;

use segnet_core::error::NetResult;

/// Wakes a reactor blocked in its readiness syscall.
///
/// **Contract:**
/// - `wake()` never blocks and never touches reactor state.
/// - Wakes issued before the reactor drains are coalesced into one.
pub trait Wakeup: Send + Sync {
    /// Make `fd()` readable.
    fn wake(&self) -> NetResult<()>;

    /// Consume pending wakes so `fd()` stops polling readable.
    fn drain(&self);

    /// Descriptor the reactor adds to its read set.
    fn fd(&self) -> RawFd;
}

mod pipe;
pub use pipe::PipeWaker;

cfg_if::cfg_if! {
    if #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        not(feature = "force-pipe-waker")
    ))] {
        mod eventfd;
        pub use eventfd::EventFdWaker;
        pub use eventfd::EventFdWaker as PlatformWaker;
    } else {
        pub use pipe::PipeWaker as PlatformWaker;
    }
}

//! Readiness multiplexing backends
//!
//! The reactor hands a poller a flat list of interests every cycle and gets
//! back which entries became readable or writable. One backend is compiled
//! per target:
//!
//! - Linux/Android: `PollPoller` (`poll(2)`, no descriptor ceiling)
//! - other Unix: `SelectPoller` (`select(2)`, descriptors below `FD_SETSIZE`)
//!
//! Both retry `EINTR` with the remaining timeout and report every other
//! failure as `NetError::Reactor`.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use segnet_core::error::NetResult;

/// One descriptor the reactor is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// Readiness for `interests[index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub index: usize,
    pub readable: bool,
    pub writable: bool,
}

/// One readiness syscall wrapped for the reactor.
pub trait Poller {
    /// Block until an interest is ready or `timeout` elapses (`None` waits
    /// forever). `ready` is cleared, then filled with ready entries in
    /// interest order. Returns `ready.len()`.
    fn poll(
        &mut self,
        interests: &[Interest],
        ready: &mut Vec<Ready>,
        timeout: Option<Duration>,
    ) -> NetResult<usize>;

    fn name(&self) -> &'static str;
}

mod select;
pub use select::SelectPoller;

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), not(feature = "force-select")))] {
        mod poll;
        pub use poll::PollPoller;
        pub use poll::PollPoller as PlatformPoller;
    } else if #[cfg(unix)] {
        pub use select::SelectPoller as PlatformPoller;
    } else {
        compile_error!("segnet-runtime supports Unix targets only");
    }
}

/// Time left until `deadline`; `None` stays `None`.
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

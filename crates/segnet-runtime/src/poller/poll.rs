//! `poll(2)` backend.

use std::time::{Duration, Instant};

use segnet_core::error::{NetError, NetResult};

use super::{remaining, Interest, Poller, Ready};
use crate::sys::last_errno;

pub struct PollPoller {
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self { fds: Vec::with_capacity(64) }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

/// Round up so a sub-millisecond timeout does not turn into a busy loop.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Poller for PollPoller {
    fn poll(
        &mut self,
        interests: &[Interest],
        ready: &mut Vec<Ready>,
        timeout: Option<Duration>,
    ) -> NetResult<usize> {
        ready.clear();
        self.fds.clear();
        for interest in interests {
            let mut events = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd { fd: interest.fd, events, revents: 0 });
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let wait = if deadline.is_some() { remaining(deadline) } else { timeout };
            let ms = timeout_ms(wait);
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
            };
            if ret >= 0 {
                break;
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(NetError::Reactor(errno));
            }
        }

        for (index, (pfd, interest)) in self.fds.iter().zip(interests).enumerate() {
            let rev = pfd.revents;
            if rev == 0 {
                continue;
            }
            // Errors and hangups wake whichever side is interested so the
            // owner finds out from recv/send or SO_ERROR.
            let broken = rev & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            let readable = interest.read && (rev & libc::POLLIN != 0 || broken);
            let writable = interest.write && (rev & libc::POLLOUT != 0 || broken);
            if readable || writable {
                ready.push(Ready { index, readable, writable });
            }
        }
        Ok(ready.len())
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(25))), 25);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }
}

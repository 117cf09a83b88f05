//! `select(2)` backend.
//!
//! Descriptors at or above `FD_SETSIZE` cannot be placed in an `fd_set`;
//! they are rejected with `FdOutOfRange` instead of corrupting the stack.

use std::mem;
use std::time::{Duration, Instant};

use segnet_core::error::{NetError, NetResult};

use super::{remaining, Interest, Poller, Ready};
use crate::sys::last_errno;

pub struct SelectPoller {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self {
            read_set: unsafe { mem::zeroed() },
            write_set: unsafe { mem::zeroed() },
        }
    }

    fn fill(&mut self, interests: &[Interest]) -> NetResult<libc::c_int> {
        unsafe {
            libc::FD_ZERO(&mut self.read_set);
            libc::FD_ZERO(&mut self.write_set);
        }
        let mut max_fd = -1;
        for interest in interests {
            let fd = interest.fd;
            if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
                return Err(NetError::FdOutOfRange(fd));
            }
            unsafe {
                if interest.read {
                    libc::FD_SET(fd, &mut self.read_set);
                }
                if interest.write {
                    libc::FD_SET(fd, &mut self.write_set);
                }
            }
            max_fd = max_fd.max(fd);
        }
        Ok(max_fd + 1)
    }
}

impl Default for SelectPoller {
    fn default() -> Self {
        Self::new()
    }
}

fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

impl Poller for SelectPoller {
    fn poll(
        &mut self,
        interests: &[Interest],
        ready: &mut Vec<Ready>,
        timeout: Option<Duration>,
    ) -> NetResult<usize> {
        ready.clear();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            // select() clobbers the sets, so rebuild them on every retry.
            let nfds = self.fill(interests)?;
            let wait = if deadline.is_some() { remaining(deadline) } else { timeout };
            let mut tv = wait.map(to_timeval);
            let tv_ptr = tv
                .as_mut()
                .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);
            let ret = unsafe {
                libc::select(
                    nfds,
                    &mut self.read_set,
                    &mut self.write_set,
                    std::ptr::null_mut(),
                    tv_ptr,
                )
            };
            if ret >= 0 {
                break;
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(NetError::Reactor(errno));
            }
        }

        for (index, interest) in interests.iter().enumerate() {
            let readable = interest.read && unsafe { libc::FD_ISSET(interest.fd, &self.read_set) };
            let writable =
                interest.write && unsafe { libc::FD_ISSET(interest.fd, &self.write_set) };
            if readable || writable {
                ready.push(Ready { index, readable, writable });
            }
        }
        Ok(ready.len())
    }

    fn name(&self) -> &'static str {
        "select"
    }
}

//! `EventFdWaker`: Linux eventfd wakeup.
//!
//! The eventfd counter coalesces any number of `wake()` calls; one 8-byte
//! read resets it.

use std::os::unix::io::RawFd;

use segnet_core::error::{NetError, NetResult};

use super::Wakeup;
use crate::sys::last_errno;

pub struct EventFdWaker {
    fd: RawFd,
}

impl EventFdWaker {
    pub fn new() -> NetResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::Os(last_errno()));
        }
        Ok(Self { fd })
    }
}

impl Wakeup for EventFdWaker {
    fn wake(&self) -> NetResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // Counter saturated: a wake is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(NetError::Os(errno));
        }
        Ok(())
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFdWaker {
    fn drop(&mut self) {
        crate::sys::close_fd(self.fd);
    }
}

//! `PipeWaker`: self-pipe wakeup for Unix targets without eventfd.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use nix::unistd::pipe;
use segnet_core::error::{NetError, NetResult};

use super::Wakeup;
use crate::sys::{last_errno, set_cloexec, set_nonblocking};

pub struct PipeWaker {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl PipeWaker {
    pub fn new() -> NetResult<Self> {
        let (read_end, write_end) = pipe().map_err(|e| NetError::Os(e as i32))?;
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            set_nonblocking(fd)?;
            set_cloexec(fd)?;
        }
        Ok(Self { read_end, write_end })
    }
}

impl Wakeup for PipeWaker {
    fn wake(&self) -> NetResult<()> {
        let byte = 1u8;
        let ret = unsafe {
            libc::write(
                self.write_end.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // Pipe full: the reader has plenty of wakes queued.
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(());
            }
            return Err(NetError::Os(errno));
        }
        Ok(())
    }

    fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_end.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n < scratch.len() as isize {
                break;
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

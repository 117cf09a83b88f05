//! Thin libc helpers shared by sockets, pollers and wakers.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use segnet_core::error::{NetError, NetResult};

/// errno of the last failed libc call on this thread.
#[inline]
pub(crate) fn last_errno() -> i32 {
    Errno::last() as i32
}

/// Errors that only mean "try again on the next readiness event".
#[inline]
pub(crate) fn is_blocking(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
}

/// Map an errno to `WouldBlock` or `Os`.
#[inline]
pub(crate) fn os_error(errno: i32) -> NetError {
    if is_blocking(errno) {
        NetError::WouldBlock
    } else {
        NetError::Os(errno)
    }
}

/// Turn a `-1`-on-failure return into a `NetResult`.
#[inline]
pub(crate) fn cvt(ret: libc::c_int) -> NetResult<libc::c_int> {
    if ret < 0 {
        Err(os_error(last_errno()))
    } else {
        Ok(ret)
    }
}

#[inline]
pub(crate) fn cvt_size(ret: libc::ssize_t) -> NetResult<usize> {
    if ret < 0 {
        Err(os_error(last_errno()))
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> NetResult<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> NetResult<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    if flags & libc::FD_CLOEXEC == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
        /// Suppress SIGPIPE per call.
        pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        /// SIGPIPE is suppressed per socket (SO_NOSIGPIPE) on these targets.
        pub(crate) const SEND_FLAGS: libc::c_int = 0;
    }
}

pub(crate) fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> NetResult<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                return Err(NetError::AddrParse);
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                return Err(NetError::AddrParse);
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => Err(NetError::AddrParse),
    }
}

pub(crate) fn std_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion() {
        for addr in ["127.0.0.1:8080", "[::1]:443", "10.1.2.3:0"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (storage, len) = std_to_sockaddr(&addr);
            assert_eq!(sockaddr_to_std(&storage, len).unwrap(), addr);
        }
    }

    #[test]
    fn test_short_address_rejected() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (storage, _) = std_to_sockaddr(&addr);
        assert_eq!(sockaddr_to_std(&storage, 2), Err(NetError::AddrParse));
    }

    #[test]
    fn test_errno_classes() {
        assert_eq!(os_error(libc::EAGAIN), NetError::WouldBlock);
        assert_eq!(os_error(libc::EINTR), NetError::WouldBlock);
        assert_eq!(os_error(libc::ECONNRESET), NetError::Os(libc::ECONNRESET));
    }
}

//! Non-blocking OS socket
//!
//! `Socket` owns one descriptor and tracks the connection state the reactor
//! needs to turn raw readiness into semantic events (a readable listening
//! socket means ACCEPT, a writable connecting socket means CONNECT).
//!
//! All fields are `Cell`s: a socket is shared (`Rc`) between its async
//! wrapper and its reactor registration on one thread, and `close()` must
//! work through a shared reference. The descriptor is closed exactly once,
//! by `close()` or by drop.

use std::cell::Cell;
use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;

use segnet_core::error::{NetError, NetResult};
use segnet_core::ndebug;

use crate::sys::{
    close_fd, cvt, cvt_size, last_errno, set_cloexec, set_nonblocking, sockaddr_to_std,
    std_to_sockaddr, SEND_FLAGS,
};

/// Connection state as seen by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Connected,
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Options passed straight through to `setsockopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    RecvBuffer,
    SendBuffer,
    NoDelay,
    ReuseAddr,
    KeepAlive,
    Broadcast,
    MulticastTtl,
    MulticastLoop,
}

impl SocketOption {
    fn level_name(self) -> (libc::c_int, libc::c_int) {
        match self {
            SocketOption::RecvBuffer => (libc::SOL_SOCKET, libc::SO_RCVBUF),
            SocketOption::SendBuffer => (libc::SOL_SOCKET, libc::SO_SNDBUF),
            SocketOption::NoDelay => (libc::IPPROTO_TCP, libc::TCP_NODELAY),
            SocketOption::ReuseAddr => (libc::SOL_SOCKET, libc::SO_REUSEADDR),
            SocketOption::KeepAlive => (libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            SocketOption::Broadcast => (libc::SOL_SOCKET, libc::SO_BROADCAST),
            SocketOption::MulticastTtl => (libc::IPPROTO_IP, libc::IP_MULTICAST_TTL),
            SocketOption::MulticastLoop => (libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP),
        }
    }
}

pub struct Socket {
    fd: Cell<RawFd>,
    state: Cell<ConnState>,
    error: Cell<i32>,
    kind: SocketKind,
}

impl Socket {
    /// New non-blocking, close-on-exec socket for `family` (`AF_INET`/`AF_INET6`).
    pub fn create(family: libc::c_int, kind: SocketKind) -> NetResult<Self> {
        let ty = match kind {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        };
        let fd = cvt(unsafe { libc::socket(family, ty, 0) })?;
        // Owns `fd` from here so early returns close it.
        let socket = Self {
            fd: Cell::new(fd),
            state: Cell::new(ConnState::Closed),
            error: Cell::new(0),
            kind,
        };
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_raw_option(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, &1i32.to_ne_bytes())?;
        Ok(socket)
    }

    /// Socket of the right family for `addr`.
    pub fn for_addr(addr: &SocketAddr, kind: SocketKind) -> NetResult<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        Self::create(family, kind)
    }

    /// Take ownership of an existing descriptor and make it non-blocking.
    pub fn from_raw_fd(fd: RawFd, state: ConnState, kind: SocketKind) -> NetResult<Self> {
        let socket = Self {
            fd: Cell::new(fd),
            state: Cell::new(state),
            error: Cell::new(0),
            kind,
        };
        set_nonblocking(fd)?;
        Ok(socket)
    }

    /// Move the descriptor into a new `Socket`, leaving this one closed
    /// without closing the descriptor.
    pub fn detach(&self) -> Option<Socket> {
        let fd = self.fd.replace(-1);
        if fd < 0 {
            return None;
        }
        let state = self.state.replace(ConnState::Closed);
        Some(Socket {
            fd: Cell::new(fd),
            state: Cell::new(state),
            error: Cell::new(self.error.get()),
            kind: self.kind,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    #[inline]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.fd.get() < 0
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.state.get() == ConnState::Listening
    }

    #[inline]
    pub fn is_connecting(&self) -> bool {
        self.state.get() == ConnState::Connecting
    }

    /// Last errno recorded by `take_error` or a failed connect.
    #[inline]
    pub fn last_error(&self) -> i32 {
        self.error.get()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.set(state);
    }

    fn live_fd(&self) -> NetResult<RawFd> {
        let fd = self.fd.get();
        if fd < 0 {
            Err(NetError::Closed)
        } else {
            Ok(fd)
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> NetResult<()> {
        let fd = self.live_fd()?;
        let (storage, len) = std_to_sockaddr(addr);
        cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> NetResult<()> {
        let fd = self.live_fd()?;
        cvt(unsafe { libc::listen(fd, backlog) })?;
        self.state.set(ConnState::Listening);
        Ok(())
    }

    /// Start a non-blocking connect. Returns `Connecting` while the
    /// handshake is in flight, `Connected` if it finished immediately.
    pub fn connect(&self, addr: &SocketAddr) -> NetResult<ConnState> {
        let fd = self.live_fd()?;
        let (storage, len) = std_to_sockaddr(addr);
        let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        let state = if ret == 0 {
            ConnState::Connected
        } else {
            let errno = last_errno();
            if errno != libc::EINPROGRESS && errno != libc::EINTR {
                self.error.set(errno);
                return Err(NetError::Os(errno));
            }
            ConnState::Connecting
        };
        self.state.set(state);
        Ok(state)
    }

    /// Accept one pending connection as a non-blocking `Connected` socket.
    pub fn accept(&self) -> NetResult<(Socket, Option<SocketAddr>)> {
        let fd = self.live_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = cvt(unsafe {
            libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        let socket = Socket::from_raw_fd(client, ConnState::Connected, self.kind)?;
        set_cloexec(client)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_raw_option(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, &1i32.to_ne_bytes())?;
        Ok((socket, sockaddr_to_std(&storage, len).ok()))
    }

    /// `Ok(0)` is an orderly EOF on a stream socket.
    pub fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        let fd = self.live_fd()?;
        cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) })
    }

    pub fn send(&self, buf: &[u8]) -> NetResult<usize> {
        let fd = self.live_fd()?;
        cvt_size(unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
        })
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> NetResult<usize> {
        let fd = self.live_fd()?;
        let (storage, len) = std_to_sockaddr(addr);
        cvt_size(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        let fd = self.live_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = cvt_size(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok((n, sockaddr_to_std(&storage, len)?))
    }

    /// Read and clear `SO_ERROR`. Records a non-zero result in `last_error`.
    pub fn take_error(&self) -> i32 {
        let Ok(fd) = self.live_fd() else {
            return self.error.get();
        };
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        let err = if ret < 0 { last_errno() } else { err };
        if err != 0 {
            self.error.set(err);
        }
        err
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> NetResult<()> {
        let (level, name) = opt.level_name();
        self.set_raw_option(level, name, &value.to_ne_bytes())
    }

    pub fn get_option(&self, opt: SocketOption) -> NetResult<i32> {
        let fd = self.live_fd()?;
        let (level, name) = opt.level_name();
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(fd, level, name, &mut value as *mut _ as *mut libc::c_void, &mut len)
        })?;
        Ok(value)
    }

    /// `setsockopt` with caller-built option bytes.
    pub fn set_raw_option(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: &[u8],
    ) -> NetResult<()> {
        let fd = self.live_fd()?;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// `IP_ADD_MEMBERSHIP` for an IPv4 group on `iface` (UNSPECIFIED = any).
    pub fn join_multicast_v4(&self, group: Ipv4Addr, iface: Ipv4Addr) -> NetResult<()> {
        let mreq = libc::ip_mreq {
            imr_multiaddr: libc::in_addr { s_addr: u32::from(group).to_be() },
            imr_interface: libc::in_addr { s_addr: u32::from(iface).to_be() },
        };
        let raw = unsafe {
            std::slice::from_raw_parts(
                &mreq as *const libc::ip_mreq as *const u8,
                mem::size_of::<libc::ip_mreq>(),
            )
        };
        self.set_raw_option(libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, raw)
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        let fd = self.live_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_to_std(&storage, len)
    }

    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        let fd = self.live_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_to_std(&storage, len)
    }

    /// Close the descriptor. Idempotent.
    pub fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            ndebug!("closing fd {}", fd);
            close_fd(fd);
        }
        self.state.set(ConnState::Closed);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd.get())
            .field("state", &self.state.get())
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_listen_connect_accept() {
        let listener = Socket::for_addr(&loopback(), SocketKind::Stream).unwrap();
        listener.set_option(SocketOption::ReuseAddr, 1).unwrap();
        listener.bind(&loopback()).unwrap();
        listener.listen(10).unwrap();
        assert!(listener.is_listening());
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = Socket::for_addr(&addr, SocketKind::Stream).unwrap();
        let state = client.connect(&addr).unwrap();
        assert!(matches!(state, ConnState::Connecting | ConnState::Connected));

        // Loopback handshakes finish quickly; spin on accept.
        let mut accepted = None;
        for _ in 0..1000 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(NetError::WouldBlock) => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        let (server, peer) = accepted.expect("no connection accepted");
        assert_eq!(server.state(), ConnState::Connected);
        assert_eq!(peer, Some(client.local_addr().unwrap()));
        assert_eq!(client.take_error(), 0);
    }

    #[test]
    fn test_send_recv_would_block_and_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Socket::from_raw_fd(a.into_raw_fd(), ConnState::Connected, SocketKind::Stream)
            .unwrap();
        let b = Socket::from_raw_fd(b.into_raw_fd(), ConnState::Connected, SocketKind::Stream)
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf), Err(NetError::WouldBlock));

        assert_eq!(a.send(b"ping").unwrap(), 4);
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        a.close();
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
        assert_eq!(a.send(b"x"), Err(NetError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let s = Socket::for_addr(&loopback(), SocketKind::Stream).unwrap();
        assert!(!s.is_closed());
        s.close();
        s.close();
        assert!(s.is_closed());
        assert_eq!(s.state(), ConnState::Closed);
        assert_eq!(s.local_addr(), Err(NetError::Closed));
    }

    #[test]
    fn test_detach_moves_descriptor() {
        let s = Socket::for_addr(&loopback(), SocketKind::Stream).unwrap();
        let fd = s.fd();
        let moved = s.detach().unwrap();
        assert_eq!(moved.fd(), fd);
        assert!(s.is_closed());
        assert!(s.detach().is_none());
        // Dropping the husk must not close the moved descriptor.
        drop(s);
        assert!(moved.local_addr().is_ok());
    }

    #[test]
    fn test_options() {
        let s = Socket::for_addr(&loopback(), SocketKind::Stream).unwrap();
        s.set_option(SocketOption::NoDelay, 1).unwrap();
        assert_ne!(s.get_option(SocketOption::NoDelay).unwrap(), 0);
        s.set_option(SocketOption::SendBuffer, 8192).unwrap();
        assert!(s.get_option(SocketOption::SendBuffer).unwrap() >= 4096);
    }

    #[test]
    fn test_datagram_round_trip() {
        let a = Socket::for_addr(&loopback(), SocketKind::Datagram).unwrap();
        let b = Socket::for_addr(&loopback(), SocketKind::Datagram).unwrap();
        a.bind(&loopback()).unwrap();
        b.bind(&loopback()).unwrap();
        let b_addr = b.local_addr().unwrap();

        assert_eq!(a.send_to(b"dgram", &b_addr).unwrap(), 5);
        let mut buf = [0u8; 32];
        let mut got = None;
        for _ in 0..1000 {
            match b.recv_from(&mut buf) {
                Ok(r) => {
                    got = Some(r);
                    break;
                }
                Err(NetError::WouldBlock) => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("recv_from failed: {}", e),
            }
        }
        let (n, from) = got.expect("datagram not delivered");
        assert_eq!(&buf[..n], b"dgram");
        assert_eq!(from, a.local_addr().unwrap());
    }
}

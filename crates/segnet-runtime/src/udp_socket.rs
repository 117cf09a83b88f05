//! Non-blocking datagram socket driven by the reactor.
//!
//! Reads are one-shot like [`AsyncSocket`](crate::AsyncSocket): `async_read`
//! arms READ and the next READ event receives exactly one datagram, handed
//! to `on_read` with its source address. The handler calls `async_read`
//! again for the next one.
//!
//! `send_to` queues whole datagrams. Each queued buffer goes out as one
//! `sendto(2)`; when the OS pushes back, the rest wait for a WRITE event and
//! `on_write_complete` fires once the queue drains.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};

use segnet_core::buffer::SegmentedBuffer;
use segnet_core::error::{NetError, NetResult};
use segnet_core::events::Events;
use segnet_core::pool::BlockPool;
use segnet_core::{ndebug, ninfo, ntrace, nwarn};

use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::reactor::Reactor;
use crate::socket::{Socket, SocketKind, SocketOption};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Callbacks from an [`AsyncUdpSocket`].
pub trait UdpHandler {
    /// One datagram and the address it came from.
    fn on_read(&self, socket: &Rc<AsyncUdpSocket>, data: SegmentedBuffer, from: SocketAddr);

    /// Send queue fully handed to the OS after a blocked `send_to`.
    fn on_write_complete(&self, _socket: &Rc<AsyncUdpSocket>) {}

    /// Fatal error. The socket closes when this returns.
    fn on_error(&self, socket: &Rc<AsyncUdpSocket>, error: NetError);
}

pub struct AsyncUdpSocket {
    reactor: Rc<Reactor>,
    socket: Rc<Socket>,
    dispatcher: Rc<Dispatcher>,
    pool: BlockPool,
    handler: RefCell<Option<Rc<dyn UdpHandler>>>,
    queue: RefCell<VecDeque<(Vec<u8>, SocketAddr)>>,
    scratch: RefCell<Vec<u8>>,
    writable: Cell<bool>,
    closed: Cell<bool>,
    /// Set while datagrams are dropped for lack of pool blocks; warned once.
    starved: Cell<bool>,
    group: Option<Ipv4Addr>,
}

impl AsyncUdpSocket {
    /// Bind a datagram socket to `addr`. Port 0 picks an ephemeral port.
    pub fn bind(
        reactor: &Rc<Reactor>,
        pool: &BlockPool,
        addr: &SocketAddr,
        config: &RuntimeConfig,
        handler: Rc<dyn UdpHandler>,
    ) -> NetResult<Rc<Self>> {
        let socket = Socket::for_addr(addr, SocketKind::Datagram)?;
        if config.reuse_addr {
            socket.set_option(SocketOption::ReuseAddr, 1)?;
        }
        socket.bind(addr)?;
        let udp = Self::wrap(reactor, pool, socket, handler, None);
        ndebug!("udp fd {} bound to {}", udp.socket.fd(), addr);
        Ok(udp)
    }

    /// Bind `0.0.0.0:group.port()` and join `group.ip()` on `iface`.
    ///
    /// `iface` also becomes the outgoing multicast interface unless it is
    /// `UNSPECIFIED`.
    pub fn bind_multicast(
        reactor: &Rc<Reactor>,
        pool: &BlockPool,
        group: &SocketAddrV4,
        iface: Ipv4Addr,
        handler: Rc<dyn UdpHandler>,
    ) -> NetResult<Rc<Self>> {
        if !group.ip().is_multicast() {
            return Err(NetError::InvalidState("not a multicast group"));
        }
        let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
        let socket = Socket::for_addr(&any, SocketKind::Datagram)?;
        socket.set_option(SocketOption::ReuseAddr, 1)?;
        socket.bind(&any)?;
        socket.join_multicast_v4(*group.ip(), iface)?;
        if !iface.is_unspecified() {
            socket.set_raw_option(libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &iface.octets())?;
        }
        let udp = Self::wrap(reactor, pool, socket, handler, Some(*group.ip()));
        ninfo!("udp fd {} joined {} on {}", udp.socket.fd(), group, iface);
        Ok(udp)
    }

    fn wrap(
        reactor: &Rc<Reactor>,
        pool: &BlockPool,
        socket: Socket,
        handler: Rc<dyn UdpHandler>,
        group: Option<Ipv4Addr>,
    ) -> Rc<Self> {
        let socket = Rc::new(socket);
        Rc::new_cyclic(|me: &Weak<AsyncUdpSocket>| {
            let events: Weak<dyn EventHandler> = me.clone();
            Self {
                reactor: Rc::clone(reactor),
                dispatcher: Dispatcher::new(Rc::clone(&socket), events),
                socket,
                pool: pool.clone(),
                handler: RefCell::new(Some(handler)),
                queue: RefCell::new(VecDeque::new()),
                scratch: RefCell::new(vec![0; MAX_DATAGRAM]),
                writable: Cell::new(true),
                closed: Cell::new(false),
                starved: Cell::new(false),
                group,
            }
        })
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Queue `buffer` as one datagram to `addr` and send what the OS takes
    /// now. An error from an immediate send drops that datagram and is
    /// returned here; errors after a blocked send go to `on_error`.
    pub fn send_to(&self, buffer: SegmentedBuffer, addr: &SocketAddr) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        if buffer.len() > MAX_DATAGRAM {
            return Err(NetError::PacketTooLarge {
                size: buffer.len(),
                limit: MAX_DATAGRAM,
            });
        }
        self.queue.borrow_mut().push_back((buffer.to_vec(), *addr));
        if !self.writable.get() {
            return Ok(());
        }
        match self.flush() {
            Ok(()) => Ok(()),
            Err(NetError::WouldBlock) => {
                self.wait_writable();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Copying form of [`send_to`](Self::send_to).
    pub fn send_to_bytes(&self, data: &[u8], addr: &SocketAddr) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        self.send_to(SegmentedBuffer::from_bytes(&self.pool, data)?, addr)
    }

    /// Arm one READ.
    pub fn async_read(&self) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        self.reactor.add(&self.dispatcher, Events::READ);
        Ok(())
    }

    /// Idempotent. Drops queued datagrams and the handler.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        ndebug!("closing udp fd {}", self.socket.fd());
        self.reactor.remove(&self.dispatcher);
        self.socket.close();
        self.writable.set(false);
        self.queue.borrow_mut().clear();
        let handler = self.handler.borrow_mut().take();
        drop(handler);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket.local_addr()
    }

    /// Joined group for sockets made by [`bind_multicast`](Self::bind_multicast).
    pub fn group(&self) -> Option<Ipv4Addr> {
        self.group
    }

    /// Datagrams accepted by `send_to` but not yet sent.
    pub fn pending_datagrams(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> NetResult<()> {
        self.socket.set_option(opt, value)
    }

    pub fn get_option(&self, opt: SocketOption) -> NetResult<i32> {
        self.socket.get_option(opt)
    }

    pub fn set_handler(&self, handler: Rc<dyn UdpHandler>) {
        if !self.closed.get() {
            *self.handler.borrow_mut() = Some(handler);
        }
    }

    pub fn socket(&self) -> &Rc<Socket> {
        &self.socket
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handler(&self) -> Option<Rc<dyn UdpHandler>> {
        self.handler.borrow().clone()
    }

    fn wait_writable(&self) {
        self.writable.set(false);
        self.reactor.add(&self.dispatcher, Events::WRITE);
    }

    /// Send queued datagrams in order. Stops at the first error; a
    /// `WouldBlock` keeps the datagram at the head, any other error drops it.
    fn flush(&self) -> NetResult<()> {
        loop {
            let result = {
                let queue = self.queue.borrow();
                let Some((data, addr)) = queue.front() else {
                    return Ok(());
                };
                self.socket.send_to(data, addr)
            };
            match result {
                Ok(n) => {
                    ntrace!("udp fd {} sent {}", self.socket.fd(), n);
                    self.queue.borrow_mut().pop_front();
                }
                Err(NetError::WouldBlock) => return Err(NetError::WouldBlock),
                Err(e) => {
                    self.queue.borrow_mut().pop_front();
                    return Err(e);
                }
            }
        }
    }

    fn write_ready(self: &Rc<Self>) {
        match self.flush() {
            Ok(()) => {
                self.writable.set(true);
                if let Some(h) = self.handler() {
                    h.on_write_complete(self);
                }
            }
            Err(NetError::WouldBlock) => self.wait_writable(),
            Err(e) => self.fail(e),
        }
    }

    fn read_ready(self: &Rc<Self>) {
        let received = {
            let mut scratch = self.scratch.borrow_mut();
            self.socket
                .recv_from(&mut scratch)
                .and_then(|(n, from)| {
                    SegmentedBuffer::from_bytes(&self.pool, &scratch[..n]).map(|d| (d, from))
                })
        };
        match received {
            Ok((data, from)) => {
                if self.starved.replace(false) {
                    ndebug!("udp fd {} reads resumed", self.socket.fd());
                }
                if let Some(h) = self.handler() {
                    h.on_read(self, data, from);
                }
            }
            Err(NetError::WouldBlock) => self.reactor.add(&self.dispatcher, Events::READ),
            Err(NetError::PoolExhausted) => {
                if !self.starved.replace(true) {
                    nwarn!("udp fd {} dropping datagrams: pool exhausted", self.socket.fd());
                }
                self.reactor.add(&self.dispatcher, Events::READ);
            }
            Err(e) => self.fail(e),
        }
    }

    /// Report `error` once and close.
    fn fail(self: &Rc<Self>, error: NetError) {
        if self.closed.get() {
            return;
        }
        ndebug!("udp fd {} failed: {}", self.socket.fd(), error);
        if let Some(h) = self.handler() {
            h.on_error(self, error);
        }
        self.close();
    }
}

impl EventHandler for AsyncUdpSocket {
    fn on_event(self: Rc<Self>, events: Events, error: i32) {
        if self.closed.get() {
            return;
        }
        if events.contains(Events::CLOSE) {
            let e = if error != 0 {
                NetError::Os(error)
            } else {
                NetError::Closed
            };
            self.fail(e);
            return;
        }
        if events.contains(Events::WRITE) {
            self.write_ready();
            if self.closed.get() {
                return;
            }
        }
        if events.contains(Events::READ) {
            self.read_ready();
        }
    }
}

impl Drop for AsyncUdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AsyncUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncUdpSocket")
            .field("fd", &self.socket.fd())
            .field("closed", &self.closed.get())
            .field("pending", &self.queue.borrow().len())
            .field("group", &self.group)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segnet_core::pool::PoolConfig;
    use std::time::Duration;

    #[derive(Default)]
    struct Inbox {
        datagrams: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
        errors: RefCell<Vec<NetError>>,
        close_on_read: bool,
    }

    impl UdpHandler for Inbox {
        fn on_read(&self, socket: &Rc<AsyncUdpSocket>, data: SegmentedBuffer, from: SocketAddr) {
            self.datagrams.borrow_mut().push((data.to_vec(), from));
            if self.close_on_read {
                socket.close();
            } else {
                socket.async_read().unwrap();
            }
        }

        fn on_error(&self, _socket: &Rc<AsyncUdpSocket>, error: NetError) {
            self.errors.borrow_mut().push(error);
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn bind(reactor: &Rc<Reactor>, pool: &BlockPool, inbox: &Rc<Inbox>) -> Rc<AsyncUdpSocket> {
        let handler: Rc<dyn UdpHandler> = inbox.clone();
        AsyncUdpSocket::bind(reactor, pool, &loopback(), &RuntimeConfig::new(), handler).unwrap()
    }

    #[test]
    fn test_loopback_round_trip_reports_source() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let a_inbox = Rc::new(Inbox::default());
        let b_inbox = Rc::new(Inbox::default());
        let a = bind(&reactor, &pool, &a_inbox);
        let b = bind(&reactor, &pool, &b_inbox);
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        b.async_read().unwrap();
        a.async_read().unwrap();
        // Spans several pool blocks but arrives as one datagram.
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        a.send_to_bytes(&payload, &b_addr).unwrap();
        a.send_to_bytes(b"second", &b_addr).unwrap();

        let inbox = Rc::clone(&b_inbox);
        assert!(reactor
            .run_until(Duration::from_secs(2), || inbox.datagrams.borrow().len() == 2)
            .unwrap());
        {
            let got = b_inbox.datagrams.borrow();
            assert_eq!(got[0].0, payload);
            assert_eq!(got[0].1, a_addr);
            assert_eq!(&got[1].0[..], b"second");
        }

        b.send_to_bytes(b"reply", &a_addr).unwrap();
        let inbox = Rc::clone(&a_inbox);
        assert!(reactor
            .run_until(Duration::from_secs(2), || !inbox.datagrams.borrow().is_empty())
            .unwrap());
        assert_eq!(a_inbox.datagrams.borrow()[0], (b"reply".to_vec(), b_addr));
        assert_eq!(a.pending_datagrams(), 0);
        assert!(b_inbox.errors.borrow().is_empty());
    }

    #[test]
    fn test_close_in_read_handler_stops_delivery() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let inbox = Rc::new(Inbox { close_on_read: true, ..Default::default() });
        let sender = bind(&reactor, &pool, &Rc::new(Inbox::default()));
        let sock = bind(&reactor, &pool, &inbox);
        let to = sock.local_addr().unwrap();

        sock.async_read().unwrap();
        sender.send_to_bytes(b"one", &to).unwrap();
        sender.send_to_bytes(b"two", &to).unwrap();
        let i = Rc::clone(&inbox);
        assert!(reactor
            .run_until(Duration::from_secs(2), || !i.datagrams.borrow().is_empty())
            .unwrap());
        reactor.wait(Some(Duration::from_millis(20))).unwrap();

        assert_eq!(inbox.datagrams.borrow().len(), 1);
        assert!(inbox.errors.borrow().is_empty());
        assert!(sock.is_closed());
        assert!(!reactor.is_registered(&sock.dispatcher));
        assert_eq!(sock.async_read(), Err(NetError::Closed));
        assert_eq!(sock.send_to_bytes(b"x", &to), Err(NetError::Closed));
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let sock = bind(&reactor, &pool, &Rc::new(Inbox::default()));
        let to = loopback();
        let big = vec![0u8; MAX_DATAGRAM + 1];
        assert_eq!(
            sock.send_to_bytes(&big, &to),
            Err(NetError::PacketTooLarge { size: MAX_DATAGRAM + 1, limit: MAX_DATAGRAM })
        );
        assert_eq!(sock.pending_datagrams(), 0);
        assert!(sock.is_open());
    }

    #[test]
    fn test_drop_unregisters() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let sock = bind(&reactor, &pool, &Rc::new(Inbox::default()));
        sock.async_read().unwrap();
        assert_eq!(reactor.len(), 1);
        drop(sock);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_multicast_rejects_unicast_group() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let handler: Rc<dyn UdpHandler> = Rc::new(Inbox::default());
        let group = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let err =
            AsyncUdpSocket::bind_multicast(&reactor, &pool, &group, Ipv4Addr::LOCALHOST, handler)
                .unwrap_err();
        assert_eq!(err, NetError::InvalidState("not a multicast group"));
    }

    #[test]
    fn test_multicast_join() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let handler: Rc<dyn UdpHandler> = Rc::new(Inbox::default());
        let group = SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 1), 0);
        let sock = match AsyncUdpSocket::bind_multicast(
            &reactor,
            &pool,
            &group,
            Ipv4Addr::LOCALHOST,
            handler,
        ) {
            Ok(sock) => sock,
            // Hosts without a multicast-capable loopback.
            Err(NetError::Os(libc::ENODEV)) | Err(NetError::Os(libc::EADDRNOTAVAIL)) => return,
            Err(e) => panic!("bind_multicast: {e}"),
        };
        assert_eq!(sock.group(), Some(*group.ip()));
        assert_ne!(sock.local_addr().unwrap().port(), 0);
        sock.async_read().unwrap();
        assert!(reactor.is_registered(&sock.dispatcher));
    }
}

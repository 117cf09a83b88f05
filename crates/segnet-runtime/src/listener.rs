//! Accepting TCP listener.
//!
//! Each ACCEPT event accepts one connection and re-arms; a busy listener is
//! drained one connection per reactor cycle so accepts interleave fairly
//! with traffic on already-accepted sockets.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use segnet_core::error::{NetError, NetResult};
use segnet_core::events::Events;
use segnet_core::{ndebug, ninfo, nwarn};

use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::reactor::Reactor;
use crate::socket::{Socket, SocketKind, SocketOption};

pub trait AcceptHandler {
    /// A connected, non-blocking socket, or the error `accept` returned.
    /// The listener stays armed after an error.
    fn on_accept(&self, listener: &Rc<AsyncListener>, result: NetResult<Socket>);
}

pub struct AsyncListener {
    reactor: Rc<Reactor>,
    socket: Rc<Socket>,
    dispatcher: Rc<Dispatcher>,
    handler: RefCell<Option<Rc<dyn AcceptHandler>>>,
    nodelay: bool,
    closed: Cell<bool>,
}

impl AsyncListener {
    /// Bind, listen with `config.listen_backlog` and arm ACCEPT.
    pub fn bind(
        reactor: &Rc<Reactor>,
        addr: &SocketAddr,
        config: &RuntimeConfig,
        handler: Rc<dyn AcceptHandler>,
    ) -> NetResult<Rc<Self>> {
        let socket = Socket::for_addr(addr, SocketKind::Stream)?;
        if config.reuse_addr {
            socket.set_option(SocketOption::ReuseAddr, 1)?;
        }
        socket.bind(addr)?;
        socket.listen(config.listen_backlog)?;
        let socket = Rc::new(socket);

        let listener = Rc::new_cyclic(|me: &Weak<AsyncListener>| {
            let events: Weak<dyn EventHandler> = me.clone();
            Self {
                reactor: Rc::clone(reactor),
                dispatcher: Dispatcher::new(Rc::clone(&socket), events),
                socket,
                handler: RefCell::new(Some(handler)),
                nodelay: config.tcp_nodelay,
                closed: Cell::new(false),
            }
        });
        listener.reactor.add(&listener.dispatcher, Events::ACCEPT);
        match listener.local_addr() {
            Ok(local) => ninfo!("listening on {}", local),
            Err(_) => ninfo!("listening on {}", addr),
        }
        Ok(listener)
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.socket.local_addr()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.reactor.remove(&self.dispatcher);
        self.socket.close();
        let handler = self.handler.borrow_mut().take();
        drop(handler);
    }

    fn accept_one(&self) -> Option<NetResult<Socket>> {
        match self.socket.accept() {
            Ok((socket, peer)) => {
                if self.nodelay {
                    if let Err(e) = socket.set_option(SocketOption::NoDelay, 1) {
                        ndebug!("TCP_NODELAY on fd {}: {}", socket.fd(), e);
                    }
                }
                if let Some(peer) = peer {
                    ndebug!("accepted fd {} from {}", socket.fd(), peer);
                }
                Some(Ok(socket))
            }
            Err(NetError::WouldBlock) => None,
            Err(e) => {
                nwarn!("accept failed: {}", e);
                Some(Err(e))
            }
        }
    }
}

impl EventHandler for AsyncListener {
    fn on_event(self: Rc<Self>, events: Events, _error: i32) {
        if self.closed.get() || !events.contains(Events::ACCEPT) {
            return;
        }
        if let Some(result) = self.accept_one() {
            let handler = self.handler.borrow().clone();
            if let Some(h) = handler {
                h.on_accept(&self, result);
            }
        }
        if !self.closed.get() {
            self.reactor.add(&self.dispatcher, Events::ACCEPT);
        }
    }
}

impl Drop for AsyncListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Duration;

    #[derive(Default)]
    struct Accepted {
        sockets: RefCell<Vec<Socket>>,
        errors: Cell<usize>,
        close_after_first: bool,
    }

    impl AcceptHandler for Accepted {
        fn on_accept(&self, listener: &Rc<AsyncListener>, result: NetResult<Socket>) {
            match result {
                Ok(s) => self.sockets.borrow_mut().push(s),
                Err(_) => self.errors.set(self.errors.get() + 1),
            }
            if self.close_after_first {
                listener.close();
            }
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_accepts_each_connection() {
        let reactor = Reactor::new().unwrap();
        let acc = Rc::new(Accepted::default());
        let listener =
            AsyncListener::bind(&reactor, &loopback(), &RuntimeConfig::new(), acc.clone()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();
        let _c3 = TcpStream::connect(addr).unwrap();

        let a = Rc::clone(&acc);
        assert!(reactor
            .run_until(Duration::from_secs(2), || a.sockets.borrow().len() == 3)
            .unwrap());
        for s in acc.sockets.borrow().iter() {
            assert!(!s.is_closed());
            assert_eq!(s.get_option(SocketOption::NoDelay).unwrap(), 1);
        }
        assert_eq!(acc.errors.get(), 0);
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn test_close_in_accept_callback() {
        let reactor = Reactor::new().unwrap();
        let acc = Rc::new(Accepted { close_after_first: true, ..Default::default() });
        let listener =
            AsyncListener::bind(&reactor, &loopback(), &RuntimeConfig::new(), acc.clone()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).unwrap();
        let a = Rc::clone(&acc);
        reactor
            .run_until(Duration::from_secs(2), || !a.sockets.borrow().is_empty())
            .unwrap();

        assert!(listener.is_closed());
        assert!(reactor.is_empty());
        assert!(listener.local_addr().is_err());
    }

    #[test]
    fn test_bind_conflict_fails() {
        let reactor = Reactor::new().unwrap();
        let acc = Rc::new(Accepted::default());
        let config = RuntimeConfig::new().reuse_addr(false);
        let first = AsyncListener::bind(&reactor, &loopback(), &config, acc.clone()).unwrap();
        let taken = first.local_addr().unwrap();
        let second = AsyncListener::bind(&reactor, &taken, &config, acc);
        assert!(matches!(second, Err(NetError::Os(e)) if e == libc::EADDRINUSE));
    }
}

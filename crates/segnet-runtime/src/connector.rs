//! Non-blocking outbound TCP connect.
//!
//! The connector owns the socket only while the handshake is in flight.
//! On success the descriptor is handed to the handler as a plain
//! [`Socket`], ready to wrap in an `AsyncSocket` or `PacketSocket`.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use segnet_core::error::{NetError, NetResult};
use segnet_core::events::Events;
use segnet_core::ndebug;

use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::reactor::Reactor;
use crate::socket::{ConnState, Socket, SocketKind, SocketOption};

pub trait ConnectHandler {
    /// Called exactly once unless the connector is closed first.
    fn on_connect(&self, connector: &Rc<AsyncConnector>, result: NetResult<Socket>);
}

pub struct AsyncConnector {
    reactor: Rc<Reactor>,
    socket: Rc<Socket>,
    dispatcher: Rc<Dispatcher>,
    handler: RefCell<Option<Rc<dyn ConnectHandler>>>,
    addr: SocketAddr,
    nodelay: bool,
    done: Cell<bool>,
}

impl AsyncConnector {
    /// Start connecting to `addr`. Errors the kernel reports synchronously
    /// are returned here; everything later goes to `on_connect`.
    pub fn connect(
        reactor: &Rc<Reactor>,
        addr: &SocketAddr,
        config: &RuntimeConfig,
        handler: Rc<dyn ConnectHandler>,
    ) -> NetResult<Rc<Self>> {
        let socket = Socket::for_addr(addr, SocketKind::Stream)?;
        let state = socket.connect(addr)?;
        let socket = Rc::new(socket);

        let connector = Rc::new_cyclic(|me: &Weak<AsyncConnector>| {
            let events: Weak<dyn EventHandler> = me.clone();
            Self {
                reactor: Rc::clone(reactor),
                dispatcher: Dispatcher::new(Rc::clone(&socket), events),
                socket,
                handler: RefCell::new(Some(handler)),
                addr: *addr,
                nodelay: config.tcp_nodelay,
                done: Cell::new(false),
            }
        });
        // An immediate connect still reports from the reactor thread on the
        // next cycle, as a plain WRITE.
        let interest = if state == ConnState::Connecting {
            Events::CONNECT
        } else {
            Events::WRITE
        };
        connector.reactor.add(&connector.dispatcher, interest);
        ndebug!("connecting fd {} to {}", connector.socket.fd(), addr);
        Ok(connector)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once `on_connect` ran or the attempt was closed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.get()
    }

    /// Abandon the attempt. No callback follows. Idempotent.
    pub fn close(&self) {
        if self.done.replace(true) {
            return;
        }
        self.reactor.remove(&self.dispatcher);
        self.socket.close();
        let handler = self.handler.borrow_mut().take();
        drop(handler);
    }

    fn finish(self: &Rc<Self>, result: NetResult<Socket>) {
        if self.done.replace(true) {
            return;
        }
        self.reactor.remove(&self.dispatcher);
        let handler = self.handler.borrow_mut().take();
        if let Some(h) = handler {
            h.on_connect(self, result);
        }
    }
}

impl EventHandler for AsyncConnector {
    fn on_event(self: Rc<Self>, events: Events, error: i32) {
        if self.done.get() {
            return;
        }
        if events.contains(Events::CLOSE) {
            self.socket.close();
            let e = if error != 0 {
                NetError::Os(error)
            } else {
                NetError::PeerClosed
            };
            ndebug!("connect to {} failed: {}", self.addr, e);
            self.finish(Err(e));
            return;
        }
        if events.intersects(Events::CONNECT | Events::WRITE) {
            self.socket.set_state(ConnState::Connected);
            if self.nodelay {
                if let Err(e) = self.socket.set_option(SocketOption::NoDelay, 1) {
                    ndebug!("TCP_NODELAY on fd {}: {}", self.socket.fd(), e);
                }
            }
            let result = self.socket.detach().ok_or(NetError::Closed);
            self.finish(result);
        }
    }
}

impl Drop for AsyncConnector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    #[derive(Default)]
    struct Outcome {
        result: RefCell<Option<NetResult<Socket>>>,
        calls: Cell<usize>,
    }

    impl ConnectHandler for Outcome {
        fn on_connect(&self, _connector: &Rc<AsyncConnector>, result: NetResult<Socket>) {
            self.calls.set(self.calls.get() + 1);
            *self.result.borrow_mut() = Some(result);
        }
    }

    #[test]
    fn test_connects_and_hands_over_socket() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(Outcome::default());
        let connector =
            AsyncConnector::connect(&reactor, &addr, &RuntimeConfig::new(), out.clone()).unwrap();

        let o = Rc::clone(&out);
        assert!(reactor
            .run_until(Duration::from_secs(2), || o.calls.get() > 0)
            .unwrap());
        assert!(connector.is_done());
        assert!(reactor.is_empty());

        let socket = match out.result.borrow_mut().take() {
            Some(Ok(s)) => s,
            other => panic!("unexpected outcome: {:?}", other.map(|r| r.map(|s| s.fd()))),
        };
        assert_eq!(socket.state(), ConnState::Connected);
        assert_eq!(socket.peer_addr().unwrap(), addr);

        let (mut peer, _) = server.accept().unwrap();
        socket.send(b"hi").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        // Dropping the connector leaves the handed-over socket open.
        drop(connector);
        assert!(!socket.is_closed());
    }

    #[test]
    fn test_refused_reports_error() {
        // Grab a free port, then close it so nothing listens there.
        let addr = {
            let tmp = TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap()
        };
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(Outcome::default());
        match AsyncConnector::connect(&reactor, &addr, &RuntimeConfig::new(), out.clone()) {
            Err(e) => assert_eq!(e, NetError::Os(libc::ECONNREFUSED)),
            Ok(_connector) => {
                let o = Rc::clone(&out);
                assert!(reactor
                    .run_until(Duration::from_secs(2), || o.calls.get() > 0)
                    .unwrap());
                let result = out.result.borrow_mut().take();
                assert!(matches!(result, Some(Err(NetError::Os(libc::ECONNREFUSED)))));
            }
        }
    }

    #[test]
    fn test_close_before_completion_is_silent() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let reactor = Reactor::new().unwrap();
        let out = Rc::new(Outcome::default());
        let connector =
            AsyncConnector::connect(&reactor, &addr, &RuntimeConfig::new(), out.clone()).unwrap();
        connector.close();
        reactor.wait(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(out.calls.get(), 0);
        assert!(reactor.is_empty());
    }
}

//! Length-prefixed packets over an [`AsyncSocket`]
//!
//! Each packet is an 8-byte header (`'V' 'Z'`, flag `u16`, length `u32`,
//! big-endian) followed by `length` payload bytes. Reassembly is done by
//! [`FrameAssembler`]; this module wires it to the socket's read path and
//! owns the policy: framing errors are fatal, and a handler that closes the
//! socket stops delivery of any frames still in the same read.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use segnet_core::buffer::SegmentedBuffer;
use segnet_core::constants::PACKET_BODY_SIZE;
use segnet_core::error::{NetError, NetResult};
use segnet_core::frame::{frame_packet, FrameAssembler};
use segnet_core::pool::BlockPool;
use segnet_core::{ndebug, ntrace};

use crate::async_socket::{AsyncSocket, AsyncSocketHandler};
use crate::reactor::Reactor;
use crate::socket::Socket;

/// Callbacks from a [`PacketSocket`].
pub trait PacketHandler {
    /// One complete packet, header stripped.
    fn on_packet(&self, socket: &Rc<PacketSocket>, payload: SegmentedBuffer, flag: u16);

    fn on_write_complete(&self, _socket: &Rc<PacketSocket>) {}

    /// Fatal error. The socket closes when this returns.
    fn on_error(&self, socket: &Rc<PacketSocket>, error: NetError);
}

pub struct PacketSocket {
    inner: Rc<AsyncSocket>,
    pool: BlockPool,
    assembler: RefCell<FrameAssembler>,
    handler: RefCell<Option<Rc<dyn PacketHandler>>>,
    closed: Cell<bool>,
}

/// Routes stream callbacks back to the packet socket that owns the stream.
struct Bridge(Weak<PacketSocket>);

impl AsyncSocketHandler for Bridge {
    fn on_read(&self, _socket: &Rc<AsyncSocket>, data: SegmentedBuffer) {
        if let Some(packet) = self.0.upgrade() {
            packet.process(data);
        }
    }

    fn on_write_complete(&self, _socket: &Rc<AsyncSocket>) {
        if let Some(packet) = self.0.upgrade() {
            if let Some(h) = packet.handler() {
                h.on_write_complete(&packet);
            }
        }
    }

    fn on_error(&self, _socket: &Rc<AsyncSocket>, error: NetError) {
        if let Some(packet) = self.0.upgrade() {
            packet.fail(error);
        }
    }
}

impl PacketSocket {
    /// Wrap a connected socket and start reading.
    pub fn new(
        reactor: &Rc<Reactor>,
        pool: &BlockPool,
        socket: Socket,
        max_payload: usize,
        handler: Rc<dyn PacketHandler>,
    ) -> NetResult<Rc<Self>> {
        let packet = Rc::new_cyclic(|me: &Weak<PacketSocket>| {
            let bridge: Rc<dyn AsyncSocketHandler> = Rc::new(Bridge(me.clone()));
            Self {
                inner: AsyncSocket::new(reactor, pool, socket, bridge),
                pool: pool.clone(),
                assembler: RefCell::new(FrameAssembler::new(pool, max_payload)),
                handler: RefCell::new(Some(handler)),
                closed: Cell::new(false),
            }
        });
        packet.inner.async_read()?;
        Ok(packet)
    }

    /// Frame `payload` (blocks are moved) and queue it.
    pub fn async_write_packet(&self, payload: SegmentedBuffer, flag: u16) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        let max = self.assembler.borrow().max_payload();
        let framed = frame_packet(&self.pool, payload, flag, max)?;
        self.inner.async_write(framed)
    }

    /// Copying form of [`async_write_packet`](Self::async_write_packet),
    /// limited to [`PACKET_BODY_SIZE`].
    pub fn async_write_packet_bytes(&self, payload: &[u8], flag: u16) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        if payload.len() > PACKET_BODY_SIZE {
            return Err(NetError::PacketTooLarge {
                size: payload.len(),
                limit: PACKET_BODY_SIZE,
            });
        }
        let buffer = SegmentedBuffer::from_bytes(&self.pool, payload)?;
        self.async_write_packet(buffer, flag)
    }

    /// Idempotent and silent: no `on_error`.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.assembler.borrow_mut().reset();
        self.inner.close();
        let handler = self.handler.borrow_mut().take();
        drop(handler);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn max_payload(&self) -> usize {
        self.assembler.borrow().max_payload()
    }

    /// Bytes of an incomplete packet held back.
    pub fn pending_len(&self) -> usize {
        self.assembler.borrow().pending_len()
    }

    /// The underlying stream, for options and encode mode.
    pub fn stream(&self) -> &Rc<AsyncSocket> {
        &self.inner
    }

    pub fn set_handler(&self, handler: Rc<dyn PacketHandler>) {
        if !self.closed.get() {
            *self.handler.borrow_mut() = Some(handler);
        }
    }

    fn handler(&self) -> Option<Rc<dyn PacketHandler>> {
        self.handler.borrow().clone()
    }

    /// True once either this socket or the stream under it is closed.
    /// A stream closed directly by a handler closes the packet socket too,
    /// without `on_error`.
    fn stopped(&self) -> bool {
        if self.closed.get() {
            return true;
        }
        if self.inner.is_closed() {
            self.close();
            return true;
        }
        false
    }

    fn process(self: &Rc<Self>, mut data: SegmentedBuffer) {
        loop {
            if self.stopped() {
                return;
            }
            // Borrow released before the handler runs.
            let next = self.assembler.borrow_mut().next_frame(&mut data);
            match next {
                Ok(Some(frame)) => {
                    ntrace!("packet flag={:#06x} len={}", frame.flag, frame.payload.len());
                    if let Some(h) = self.handler() {
                        h.on_packet(self, frame.payload, frame.flag);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        if self.stopped() {
            return;
        }
        if let Err(e) = self.inner.async_read() {
            self.fail(e);
        }
    }

    fn fail(self: &Rc<Self>, error: NetError) {
        if self.closed.get() {
            return;
        }
        ndebug!("packet socket fd {} failed: {}", self.inner.socket().fd(), error);
        if let Some(h) = self.handler() {
            h.on_error(self, error);
        }
        self.close();
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PacketSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSocket")
            .field("stream", &self.inner)
            .field("pending", &self.pending_len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ConnState, SocketKind};
    use segnet_core::constants::PACKET_HEADER_SIZE;
    use segnet_core::packet::PacketHeader;
    use segnet_core::pool::PoolConfig;
    use std::io::{Read, Write};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        packets: RefCell<Vec<(u16, Vec<u8>)>>,
        errors: RefCell<Vec<NetError>>,
        close_after: Option<usize>,
    }

    impl PacketHandler for Collect {
        fn on_packet(&self, socket: &Rc<PacketSocket>, payload: SegmentedBuffer, flag: u16) {
            self.packets.borrow_mut().push((flag, payload.to_vec()));
            if self.close_after == Some(self.packets.borrow().len()) {
                socket.close();
            }
        }

        fn on_error(&self, _socket: &Rc<PacketSocket>, error: NetError) {
            self.errors.borrow_mut().push(error);
        }
    }

    fn wire(flag: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader::new(flag, payload.len() as u32).encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn setup(
        handler: &Rc<Collect>,
        max_payload: usize,
    ) -> (Rc<Reactor>, BlockPool, Rc<PacketSocket>, UnixStream) {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let (ours, peer) = UnixStream::pair().unwrap();
        let socket =
            Socket::from_raw_fd(ours.into_raw_fd(), ConnState::Connected, SocketKind::Stream)
                .unwrap();
        let h: Rc<dyn PacketHandler> = handler.clone();
        let packet = PacketSocket::new(&reactor, &pool, socket, max_payload, h).unwrap();
        (reactor, pool, packet, peer)
    }

    #[test]
    fn test_two_packets_in_one_read() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, _packet, mut peer) = setup(&c, 1 << 20);

        let mut bytes = wire(1, b"first");
        bytes.extend(wire(2, b"second"));
        peer.write_all(&bytes).unwrap();

        let cc = Rc::clone(&c);
        assert!(reactor
            .run_until(Duration::from_secs(2), || cc.packets.borrow().len() == 2)
            .unwrap());
        assert_eq!(
            *c.packets.borrow(),
            vec![(1, b"first".to_vec()), (2, b"second".to_vec())]
        );
    }

    #[test]
    fn test_byte_at_a_time_across_cycles() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, mut peer) = setup(&c, 1 << 20);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i * 7) as u8).collect();
        let bytes = wire(0xBEEF, &payload);
        for (i, b) in bytes.iter().enumerate().take(PACKET_HEADER_SIZE + 3) {
            peer.write_all(std::slice::from_ref(b)).unwrap();
            reactor.wait(Some(Duration::from_secs(1))).unwrap();
            assert_eq!(packet.pending_len(), i + 1);
        }
        peer.write_all(&bytes[PACKET_HEADER_SIZE + 3..]).unwrap();

        let cc = Rc::clone(&c);
        assert!(reactor
            .run_until(Duration::from_secs(2), || !cc.packets.borrow().is_empty())
            .unwrap());
        assert_eq!(c.packets.borrow()[0], (0xBEEF, payload));
        assert_eq!(packet.pending_len(), 0);
    }

    #[test]
    fn test_bad_magic_closes() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, mut peer) = setup(&c, 1 << 20);

        peer.write_all(b"XY\0\0\0\0\0\x01!").unwrap();
        let cc = Rc::clone(&c);
        assert!(reactor
            .run_until(Duration::from_secs(2), || !cc.errors.borrow().is_empty())
            .unwrap());
        assert_eq!(*c.errors.borrow(), vec![NetError::BadMagic { found: *b"XY" }]);
        assert!(packet.is_closed());
        assert!(packet.stream().is_closed());
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, mut peer) = setup(&c, 16);

        peer.write_all(&PacketHeader::new(0, 17).encode()).unwrap();
        let cc = Rc::clone(&c);
        reactor
            .run_until(Duration::from_secs(2), || !cc.errors.borrow().is_empty())
            .unwrap();
        assert_eq!(
            *c.errors.borrow(),
            vec![NetError::PacketTooLarge { size: 17, limit: 16 }]
        );
        assert!(packet.is_closed());
    }

    #[test]
    fn test_close_in_handler_stops_remaining_frames() {
        let c = Rc::new(Collect { close_after: Some(1), ..Default::default() });
        let (reactor, pool, packet, mut peer) = setup(&c, 1 << 20);

        let mut bytes = wire(1, b"a");
        bytes.extend(wire(2, b"b"));
        bytes.extend(wire(3, b"c"));
        peer.write_all(&bytes).unwrap();

        let cc = Rc::clone(&c);
        reactor
            .run_until(Duration::from_secs(2), || !cc.packets.borrow().is_empty())
            .unwrap();
        reactor.wait(Some(Duration::from_millis(10))).unwrap();

        assert_eq!(c.packets.borrow().len(), 1);
        assert!(c.errors.borrow().is_empty());
        assert!(packet.is_closed());
        assert_eq!(pool.outstanding(), 0);
    }

    struct StreamCloser {
        packets: Cell<usize>,
        errors: RefCell<Vec<NetError>>,
    }

    impl PacketHandler for StreamCloser {
        fn on_packet(&self, socket: &Rc<PacketSocket>, _payload: SegmentedBuffer, _flag: u16) {
            self.packets.set(self.packets.get() + 1);
            socket.stream().close();
        }

        fn on_error(&self, _socket: &Rc<PacketSocket>, error: NetError) {
            self.errors.borrow_mut().push(error);
        }
    }

    #[test]
    fn test_stream_close_in_handler_stops_remaining_frames() {
        let reactor = Reactor::new().unwrap();
        let pool = BlockPool::new(PoolConfig::new());
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let socket =
            Socket::from_raw_fd(ours.into_raw_fd(), ConnState::Connected, SocketKind::Stream)
                .unwrap();
        let closer = Rc::new(StreamCloser {
            packets: Cell::new(0),
            errors: RefCell::new(Vec::new()),
        });
        let handler: Rc<dyn PacketHandler> = closer.clone();
        let packet = PacketSocket::new(&reactor, &pool, socket, 1 << 20, handler).unwrap();

        let mut bytes = wire(1, b"a");
        bytes.extend(wire(2, b"b"));
        bytes.extend(wire(3, b"c"));
        peer.write_all(&bytes).unwrap();

        let c = Rc::clone(&closer);
        reactor
            .run_until(Duration::from_secs(2), || c.packets.get() > 0)
            .unwrap();
        reactor.wait(Some(Duration::from_millis(10))).unwrap();

        assert_eq!(closer.packets.get(), 1);
        assert!(closer.errors.borrow().is_empty());
        assert!(packet.is_closed());
        assert!(reactor.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_write_packet_on_wire() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, mut peer) = setup(&c, 1 << 20);

        packet.async_write_packet_bytes(b"payload", 0x0102).unwrap();
        reactor.wait(Some(Duration::from_millis(50))).unwrap();

        let mut buf = vec![0u8; PACKET_HEADER_SIZE + 7];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[b'V', b'Z', 0x01, 0x02, 0, 0, 0, 7]);
        assert_eq!(&buf[8..], b"payload");
    }

    #[test]
    fn test_write_limits() {
        let c = Rc::new(Collect::default());
        let (_reactor, pool, packet, _peer) = setup(&c, 100);

        let big = vec![0u8; PACKET_BODY_SIZE + 1];
        assert!(matches!(
            packet.async_write_packet_bytes(&big, 0),
            Err(NetError::PacketTooLarge { .. })
        ));
        let over = SegmentedBuffer::from_bytes(&pool, &[0u8; 101]).unwrap();
        assert_eq!(
            packet.async_write_packet(over, 0),
            Err(NetError::PacketTooLarge { size: 101, limit: 100 })
        );

        packet.close();
        assert_eq!(packet.async_write_packet_bytes(b"x", 0), Err(NetError::Closed));
    }

    #[test]
    fn test_peer_close_reported() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, peer) = setup(&c, 1 << 20);
        drop(peer);
        let cc = Rc::clone(&c);
        reactor
            .run_until(Duration::from_secs(2), || !cc.errors.borrow().is_empty())
            .unwrap();
        assert_eq!(*c.errors.borrow(), vec![NetError::PeerClosed]);
        assert!(packet.is_closed());
    }

    #[test]
    fn test_drop_closes_stream() {
        let c = Rc::new(Collect::default());
        let (reactor, _pool, packet, _peer) = setup(&c, 1 << 20);
        assert_eq!(reactor.len(), 1);
        drop(packet);
        assert!(reactor.is_empty());
    }
}

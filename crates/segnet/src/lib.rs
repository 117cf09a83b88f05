//! # segnet - segmented-buffer reactor networking
//!
//! Single-threaded, callback-driven networking for embedded and
//! latency-sensitive services.
//!
//! ## Features
//!
//! - **Pooled buffers**: fixed 768-byte blocks recycled on drop; splicing a
//!   buffer moves blocks instead of copying bytes
//! - **One reactor per thread**: `poll(2)` on Linux, `select(2)` elsewhere
//! - **Backpressure**: write-complete fires only once every queued byte was
//!   handed to the OS
//! - **Packets**: 8-byte `'V' 'Z' flag length` header, reassembled across
//!   arbitrary read boundaries
//!
//! ## Quick Start
//!
//! ```ignore
//! use segnet::prelude::*;
//!
//! struct Echo;
//!
//! impl PacketHandler for Echo {
//!     fn on_packet(&self, s: &Rc<PacketSocket>, payload: SegmentedBuffer, flag: u16) {
//!         let _ = s.async_write_packet(payload, flag);
//!     }
//!     fn on_error(&self, _s: &Rc<PacketSocket>, e: NetError) {
//!         nwarn!("connection dropped: {}", e);
//!     }
//! }
//!
//! let rt = Runtime::from_env()?;
//! // accept, wrap each socket with rt.packet_socket(sock, Rc::new(Echo)), then:
//! rt.run()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Handlers (user code)                    │
//! │       PacketHandler / AsyncSocketHandler / AcceptHandler    │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ on_packet / on_read / on_error
//! ┌─────────────────────────────────────────────────────────────┐
//! │   PacketSocket ──► FrameAssembler        AsyncListener      │
//! │        │                                 AsyncConnector     │
//! │        ▼                                 AsyncUdpSocket     │
//! │   AsyncSocket  ── write queue, staged block, read limit     │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ Events (READ WRITE CONNECT CLOSE ACCEPT)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Reactor                            │
//! │     Dispatcher registry, Poller backend, Wakeup, tasks      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!    ┌─────────────────────────────────────────────────────────┐
//!    │           BlockPool  ──►  SegmentedBuffer               │
//!    │     shared across threads, blocks owned by one buffer   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;

// Re-export core types
pub use segnet_core::{
    constants,
    frame_packet,
    Block,
    BlockHandle,
    BlockPool,
    Events,
    Frame,
    FrameAssembler,
    NetError,
    NetResult,
    PacketHeader,
    PoolConfig,
    SegmentedBuffer,
};

// Re-export logging macros
pub use segnet_core::{nerror, nwarn, ninfo, ndebug, ntrace};
pub use segnet_core::logging::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use segnet_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use segnet_runtime::{
    AcceptHandler,
    AsyncConnector,
    AsyncListener,
    AsyncSocket,
    AsyncSocketHandler,
    AsyncUdpSocket,
    ConfigError,
    ConnState,
    ConnectHandler,
    EncodeMode,
    PacketHandler,
    PacketSocket,
    Reactor,
    ReactorHandle,
    RuntimeConfig,
    Socket,
    SocketKind,
    SocketOption,
    UdpHandler,
};

/// Everything a typical server or client needs.
pub mod prelude {
    pub use std::rc::Rc;

    pub use crate::{
        AcceptHandler, AsyncConnector, AsyncListener, AsyncSocket, AsyncSocketHandler,
        AsyncUdpSocket, BlockPool, ConnectHandler, EncodeMode, Events, NetError, NetResult,
        PacketHandler, PacketSocket, Runtime, RuntimeConfig, SegmentedBuffer, Socket,
        SocketOption, UdpHandler,
    };
    pub use crate::{ndebug, nerror, ninfo, ntrace, nwarn};
}

/// Owner of one reactor and the block pool its sockets share.
///
/// Every socket built through the runtime picks up the read limit, payload
/// limit, encode mode and TCP options from its [`RuntimeConfig`].
pub struct Runtime {
    reactor: Rc<Reactor>,
    pool: BlockPool,
    config: RuntimeConfig,
}

impl Runtime {
    /// Validate `config`, initialize logging, create the pool and reactor.
    pub fn new(config: RuntimeConfig) -> NetResult<Self> {
        config.validate()?;
        init_logging();
        let pool = BlockPool::new(config.pool.clone());
        let reactor = Reactor::new()?;
        Ok(Self { reactor, pool, config })
    }

    /// Runtime with environment-derived configuration.
    pub fn from_env() -> NetResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Thread-safe handle for wakeups, posted tasks and stop.
    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Empty buffer drawing from this runtime's pool.
    pub fn buffer(&self) -> SegmentedBuffer {
        SegmentedBuffer::new(&self.pool)
    }

    /// Wrap a connected socket as a byte stream.
    pub fn async_socket(
        &self,
        socket: Socket,
        handler: Rc<dyn AsyncSocketHandler>,
    ) -> Rc<AsyncSocket> {
        let stream = AsyncSocket::new(&self.reactor, &self.pool, socket, handler);
        stream.set_read_limit(self.config.read_limit);
        stream.set_encode_mode(self.config.encode_mode());
        stream
    }

    /// Wrap a connected socket as a packet stream and start reading.
    pub fn packet_socket(
        &self,
        socket: Socket,
        handler: Rc<dyn PacketHandler>,
    ) -> NetResult<Rc<PacketSocket>> {
        let max_payload = self.config.max_payload;
        let packet = PacketSocket::new(&self.reactor, &self.pool, socket, max_payload, handler)?;
        packet.stream().set_read_limit(self.config.read_limit);
        packet.stream().set_encode_mode(self.config.encode_mode());
        Ok(packet)
    }

    pub fn listen(
        &self,
        addr: &SocketAddr,
        handler: Rc<dyn AcceptHandler>,
    ) -> NetResult<Rc<AsyncListener>> {
        AsyncListener::bind(&self.reactor, addr, &self.config, handler)
    }

    pub fn connect(
        &self,
        addr: &SocketAddr,
        handler: Rc<dyn ConnectHandler>,
    ) -> NetResult<Rc<AsyncConnector>> {
        AsyncConnector::connect(&self.reactor, addr, &self.config, handler)
    }

    /// UDP socket bound to `addr`. Call `async_read` to start receiving.
    pub fn udp_socket(
        &self,
        addr: &SocketAddr,
        handler: Rc<dyn UdpHandler>,
    ) -> NetResult<Rc<AsyncUdpSocket>> {
        AsyncUdpSocket::bind(&self.reactor, &self.pool, addr, &self.config, handler)
    }

    /// UDP socket on `group.port()` that has joined `group` on `iface`.
    pub fn multicast_socket(
        &self,
        group: &SocketAddrV4,
        iface: Ipv4Addr,
        handler: Rc<dyn UdpHandler>,
    ) -> NetResult<Rc<AsyncUdpSocket>> {
        AsyncUdpSocket::bind_multicast(&self.reactor, &self.pool, group, iface, handler)
    }

    /// One reactor cycle.
    pub fn wait(&self, timeout: Option<Duration>) -> NetResult<bool> {
        self.reactor.wait(timeout)
    }

    /// Cycle until `done()` or `timeout`.
    pub fn run_until<F: FnMut() -> bool>(&self, timeout: Duration, done: F) -> NetResult<bool> {
        self.reactor.run_until(timeout, done)
    }

    /// Cycle until [`ReactorHandle::stop`].
    pub fn run(&self) -> NetResult<()> {
        self.reactor.run()
    }
}

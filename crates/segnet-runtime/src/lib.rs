//! # segnet-runtime
//!
//! Unix implementation of the segnet reactor and its socket state machines.
//!
//! This crate provides:
//! - Non-blocking sockets over libc
//! - Readiness backends (`poll(2)`, `select(2)`) and cross-thread wakeup
//! - The single-threaded reactor and its dispatcher registry
//! - `AsyncSocket`, `PacketSocket`, `AsyncListener`, `AsyncConnector` and `AsyncUdpSocket`
//! - Runtime configuration with environment overrides

mod sys;

pub mod config;
pub mod socket;
pub mod poller;
pub mod waker;
pub mod dispatcher;
pub mod reactor;
pub mod async_socket;
pub mod packet_socket;
pub mod listener;
pub mod connector;
pub mod udp_socket;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use socket::{ConnState, Socket, SocketKind, SocketOption};
pub use poller::{PlatformPoller, Poller};
pub use waker::{PlatformWaker, Wakeup};
pub use dispatcher::{Dispatcher, EventHandler};
pub use reactor::{Reactor, ReactorHandle, Task};
pub use async_socket::{AsyncSocket, AsyncSocketHandler, EncodeMode};
pub use packet_socket::{PacketHandler, PacketSocket};
pub use listener::{AcceptHandler, AsyncListener};
pub use connector::{AsyncConnector, ConnectHandler};
pub use udp_socket::{AsyncUdpSocket, UdpHandler};

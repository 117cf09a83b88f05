//! Non-blocking stream socket with a write queue
//!
//! # Write path
//!
//! ```text
//!   async_write(buf) ──splice──► queue [blk][blk][blk]
//!                                   │ pop one block
//!                                   ▼
//!                                staged ──send()──► OS
//!                                   │
//!          full send:  next block   │  partial / EAGAIN: keep the rest,
//!          queue empty: re-arm ◄────┘  arm WRITE, wait
//! ```
//!
//! `on_write_complete` fires only from a WRITE event that found nothing left
//! to send, so it always follows a cycle in which the last byte went to the
//! OS. Callers use it as the backpressure signal.
//!
//! Phases: idle (`writable`, nothing queued), draining (WRITE armed, not
//! `writable`, until the completion event), closed.
//!
//! # Read path
//!
//! Reads are one-shot: `async_read` arms READ, the next READ event pulls
//! blocks until EAGAIN, a short read or the read limit, and hands the lot to
//! `on_read`. The handler calls `async_read` again when it wants more.
//!
//! Every callback receives `&Rc<AsyncSocket>` and the handler is cloned out
//! of its slot first, so a handler may close or drop the socket from inside
//! any callback.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use base64::Engine as _;
use segnet_core::buffer::SegmentedBuffer;
use segnet_core::error::{NetError, NetResult};
use segnet_core::events::Events;
use segnet_core::pool::BlockPool;
use segnet_core::{ndebug, ntrace, nwarn};

use crate::config::defaults;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::reactor::Reactor;
use crate::socket::{Socket, SocketOption};

/// Callbacks from an [`AsyncSocket`].
pub trait AsyncSocketHandler {
    /// Bytes from one READ event. Never empty.
    fn on_read(&self, socket: &Rc<AsyncSocket>, data: SegmentedBuffer);

    /// Write queue fully handed to the OS.
    fn on_write_complete(&self, _socket: &Rc<AsyncSocket>) {}

    /// Fatal error. The socket closes when this returns.
    fn on_error(&self, socket: &Rc<AsyncSocket>, error: NetError);
}

/// Transformation applied to blocks whose encode flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeMode {
    #[default]
    None,
    Base64,
}

pub struct AsyncSocket {
    me: Weak<AsyncSocket>,
    reactor: Rc<Reactor>,
    socket: Rc<Socket>,
    dispatcher: Rc<Dispatcher>,
    pool: BlockPool,
    handler: RefCell<Option<Rc<dyn AsyncSocketHandler>>>,
    queue: RefCell<SegmentedBuffer>,
    /// Wire bytes of the block being sent, and how many already went out.
    staged: RefCell<Vec<u8>>,
    staged_pos: Cell<usize>,
    writable: Cell<bool>,
    closed: Cell<bool>,
    /// Set while reads are deferred by an exhausted pool; warned once.
    starved: Cell<bool>,
    encode: Cell<EncodeMode>,
    read_limit: Cell<usize>,
}

impl AsyncSocket {
    /// Wrap a connected socket. Nothing is armed until the first
    /// `async_read` or a blocked write.
    pub fn new(
        reactor: &Rc<Reactor>,
        pool: &BlockPool,
        socket: Socket,
        handler: Rc<dyn AsyncSocketHandler>,
    ) -> Rc<Self> {
        let socket = Rc::new(socket);
        Rc::new_cyclic(|me: &Weak<AsyncSocket>| {
            let events: Weak<dyn EventHandler> = me.clone();
            Self {
                me: me.clone(),
                reactor: Rc::clone(reactor),
                dispatcher: Dispatcher::new(Rc::clone(&socket), events),
                socket,
                pool: pool.clone(),
                handler: RefCell::new(Some(handler)),
                queue: RefCell::new(SegmentedBuffer::new(pool)),
                staged: RefCell::new(Vec::new()),
                staged_pos: Cell::new(0),
                writable: Cell::new(true),
                closed: Cell::new(false),
                starved: Cell::new(false),
                encode: Cell::new(EncodeMode::None),
                read_limit: Cell::new(defaults::READ_LIMIT),
            }
        })
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Queue `buffer` (its blocks are moved) and send as much as the OS
    /// takes right now.
    pub fn async_write(&self, mut buffer: SegmentedBuffer) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        if buffer.is_empty() {
            return Ok(());
        }
        self.queue.borrow_mut().append_buffer(&mut buffer);
        if self.writable.get() {
            if let Some(this) = self.me.upgrade() {
                this.write_pending(false);
            }
        }
        Ok(())
    }

    /// Copying form of [`async_write`](Self::async_write).
    pub fn async_write_bytes(&self, data: &[u8]) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        self.async_write(SegmentedBuffer::from_bytes(&self.pool, data)?)
    }

    /// Arm one READ.
    pub fn async_read(&self) -> NetResult<()> {
        if self.closed.get() {
            return Err(NetError::Closed);
        }
        self.reactor.add(&self.dispatcher, Events::READ);
        Ok(())
    }

    /// Idempotent. Drops queued bytes and the handler.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        ndebug!("closing fd {}", self.socket.fd());
        self.reactor.remove(&self.dispatcher);
        self.socket.close();
        self.writable.set(false);
        self.queue.borrow_mut().clear();
        self.staged.borrow_mut().clear();
        self.staged_pos.set(0);
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

    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Last OS error seen on the socket, 0 if none.
    pub fn error(&self) -> i32 {
        self.socket.last_error()
    }

    pub fn encode_mode(&self) -> EncodeMode {
        self.encode.get()
    }

    pub fn set_encode_mode(&self, mode: EncodeMode) {
        self.encode.set(mode);
    }

    pub fn set_read_limit(&self, limit: usize) {
        self.read_limit.set(limit.max(1));
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> NetResult<()> {
        self.socket.set_option(opt, value)
    }

    pub fn get_option(&self, opt: SocketOption) -> NetResult<i32> {
        self.socket.get_option(opt)
    }

    /// Bytes accepted by `async_write` but not yet sent. Encoded blocks
    /// count at their encoded size once staged.
    pub fn pending_write_len(&self) -> usize {
        let staged = self.staged.borrow().len() - self.staged_pos.get();
        self.queue.borrow().len() + staged
    }

    pub fn set_handler(&self, handler: Rc<dyn AsyncSocketHandler>) {
        if !self.closed.get() {
            *self.handler.borrow_mut() = Some(handler);
        }
    }

    pub fn socket(&self) -> &Rc<Socket> {
        &self.socket
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handler(&self) -> Option<Rc<dyn AsyncSocketHandler>> {
        self.handler.borrow().clone()
    }

    fn wait_writable(&self) {
        self.writable.set(false);
        self.reactor.add(&self.dispatcher, Events::WRITE);
    }

    /// Make sure `staged` holds unsent bytes. False when nothing is queued.
    fn stage_next(&self) -> bool {
        if self.staged_pos.get() < self.staged.borrow().len() {
            return true;
        }
        let mut staged = self.staged.borrow_mut();
        staged.clear();
        self.staged_pos.set(0);
        loop {
            let Some(block) = self.queue.borrow_mut().pop_front_block() else {
                return false;
            };
            if block.is_empty() {
                continue;
            }
            if block.encode() && self.encode.get() == EncodeMode::Base64 {
                let encoded = base64::engine::general_purpose::STANDARD.encode(block.as_slice());
                staged.extend_from_slice(encoded.as_bytes());
            } else {
                staged.extend_from_slice(block.as_slice());
            }
            return true;
        }
    }

    /// Send queued bytes until the OS pushes back or the queue is empty.
    ///
    /// `from_event` is true when driven by a WRITE event; only then are
    /// errors and write-complete reported.
    fn write_pending(self: &Rc<Self>, from_event: bool) {
        while !self.closed.get() && self.stage_next() {
            let result = {
                let staged = self.staged.borrow();
                self.socket.send(&staged[self.staged_pos.get()..])
            };
            match result {
                Ok(n) => {
                    let pos = self.staged_pos.get() + n;
                    self.staged_pos.set(pos);
                    if pos < self.staged.borrow().len() {
                        ntrace!("fd {} partial send {}", self.socket.fd(), n);
                        self.wait_writable();
                        return;
                    }
                }
                Err(NetError::WouldBlock) => {
                    self.wait_writable();
                    return;
                }
                Err(e) => {
                    if from_event {
                        self.fail(e);
                    } else {
                        // Reported from the next WRITE event.
                        self.wait_writable();
                    }
                    return;
                }
            }
        }
        if self.closed.get() {
            return;
        }
        if from_event {
            self.writable.set(true);
            if let Some(h) = self.handler() {
                h.on_write_complete(self);
            }
        } else {
            self.wait_writable();
        }
    }

    fn read_ready(self: &Rc<Self>) {
        let limit = self.read_limit.get();
        let mut data = SegmentedBuffer::new(&self.pool);
        let mut eof = false;
        let mut error = None;

        while data.len() < limit {
            let mut block = match self.pool.take_block() {
                Ok(block) => block,
                Err(e) => {
                    if data.is_empty() && !self.starved.replace(true) {
                        nwarn!("fd {} read deferred: {}", self.socket.fd(), e);
                    }
                    break;
                }
            };
            if self.starved.replace(false) {
                ndebug!("fd {} read resumed", self.socket.fd());
            }
            let want = block.spare().min(limit - data.len());
            match self.socket.recv(&mut block.spare_mut()[..want]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    block.commit(n);
                    data.append_block(block);
                    if n < want {
                        break;
                    }
                }
                Err(NetError::WouldBlock) => break,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        let got_data = !data.is_empty();
        if got_data {
            if let Some(h) = self.handler() {
                h.on_read(self, data);
            }
        }
        if self.closed.get() {
            return;
        }
        if let Some(e) = error {
            self.fail(e);
        } else if eof {
            self.fail(NetError::PeerClosed);
        } else if !got_data {
            self.reactor.add(&self.dispatcher, Events::READ);
        }
    }

    /// Report `error` once and close.
    fn fail(self: &Rc<Self>, error: NetError) {
        if self.closed.get() {
            return;
        }
        ndebug!("fd {} failed: {}", self.socket.fd(), error);
        if let Some(h) = self.handler() {
            h.on_error(self, error);
        }
        self.close();
    }
}

impl EventHandler for AsyncSocket {
    fn on_event(self: Rc<Self>, events: Events, error: i32) {
        if self.closed.get() {
            return;
        }
        if events.contains(Events::CLOSE) {
            let e = if error != 0 {
                NetError::Os(error)
            } else {
                NetError::PeerClosed
            };
            self.fail(e);
            return;
        }
        if events.contains(Events::WRITE) {
            self.write_pending(true);
            if self.closed.get() {
                return;
            }
        }
        if events.contains(Events::READ) {
            self.read_ready();
        }
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("fd", &self.socket.fd())
            .field("closed", &self.closed.get())
            .field("writable", &self.writable.get())
            .field("encode", &self.encode.get())
            .finish()
    }
}

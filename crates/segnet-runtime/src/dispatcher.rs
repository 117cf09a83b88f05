//! Reactor registration entries
//!
//! A [`Dispatcher`] ties one [`Socket`] to the [`EventHandler`] that wants
//! its events. The reactor keeps `Rc<Dispatcher>`s in its registry; the
//! dispatcher keeps only a `Weak` link to the handler, so dropping the
//! owning async object unregisters it on the next cycle.
//!
//! Interest is one-shot: when a READ/ACCEPT or WRITE/CONNECT interest fires
//! the reactor clears it before calling the handler, and the handler re-arms
//! with [`Reactor::add`](crate::reactor::Reactor::add) if it still cares.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use segnet_core::events::Events;

use crate::socket::Socket;

/// Receiver of semantic readiness events.
///
/// `self` arrives as an owned `Rc`, upgraded from the dispatcher's weak link
/// for exactly the duration of the call, so the handler stays alive even if
/// it drops every other reference to itself.
pub trait EventHandler {
    /// `error` is the socket's `SO_ERROR` when `events` contains CLOSE.
    fn on_event(self: Rc<Self>, events: Events, error: i32);
}

pub struct Dispatcher {
    socket: Rc<Socket>,
    handler: Weak<dyn EventHandler>,
    enabled: Cell<Events>,
    closing: Cell<bool>,
    /// Bumped on every `remove`, so a stale ready snapshot is not delivered
    /// to a dispatcher that was removed and re-added in the same cycle.
    epoch: Cell<u64>,
}

impl Dispatcher {
    pub fn new(socket: Rc<Socket>, handler: Weak<dyn EventHandler>) -> Rc<Self> {
        Rc::new(Self {
            socket,
            handler,
            enabled: Cell::new(Events::NONE),
            closing: Cell::new(false),
            epoch: Cell::new(0),
        })
    }

    #[inline]
    pub fn socket(&self) -> &Rc<Socket> {
        &self.socket
    }

    /// Interest still armed.
    #[inline]
    pub fn enabled(&self) -> Events {
        self.enabled.get()
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    pub(crate) fn handler(&self) -> Option<Rc<dyn EventHandler>> {
        self.handler.upgrade()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub(crate) fn arm(&self, events: Events) {
        self.closing.set(false);
        self.enabled.set(self.enabled.get() | events);
    }

    pub(crate) fn disarm(&self, events: Events) {
        let mut enabled = self.enabled.get();
        enabled.remove(events);
        self.enabled.set(enabled);
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.set(true);
        self.enabled.set(Events::NONE);
        self.epoch.set(self.epoch.get().wrapping_add(1));
    }

    /// Entry can never fire again and may be dropped from the registry.
    pub(crate) fn is_dead(&self) -> bool {
        self.closing.get() || self.socket.is_closed() || self.handler.strong_count() == 0
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("fd", &self.socket.fd())
            .field("enabled", &self.enabled.get())
            .field("closing", &self.closing.get())
            .finish()
    }
}

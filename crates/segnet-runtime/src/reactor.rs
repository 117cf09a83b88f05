//! # Reactor: readiness multiplexer and dispatcher registry
//!
//! One reactor drives every socket of one thread. Each call to
//! [`Reactor::wait`] is one cycle:
//!
//! ```text
//!   purge dead entries
//!        │
//!   build interests ── dispatchers' armed events + wakeup fd
//!        │
//!   poller.poll(timeout)          (the only blocking call)
//!        │
//!   map readiness → Events        listening+readable  → ACCEPT
//!        │                        readable, SO_ERROR  → CLOSE
//!        │                        readable            → READ
//!        │                        connecting+writable → CONNECT / CLOSE
//!        │                        writable            → WRITE
//!   disarm fired interest, erase empty entries
//!        │
//!   dispatch snapshot ── skip entries removed since the snapshot
//!        │
//!   run posted tasks
//! ```
//!
//! The registry is never borrowed while a handler runs, so handlers may add,
//! remove, close or drop anything, including themselves.
//!
//! The reactor is `!Send`. The only thing other threads get is a
//! [`ReactorHandle`] that can wake the reactor, post a task to run on its
//! thread, or ask [`Reactor::run`] to return.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use segnet_core::error::NetResult;
use segnet_core::events::Events;
use segnet_core::{ndebug, nerror, ntrace};

use crate::dispatcher::Dispatcher;
use crate::poller::{Interest, PlatformPoller, Poller, Ready};
use crate::waker::{PlatformWaker, Wakeup};

/// Work posted from another thread; runs on the reactor thread inside `wait`.
pub type Task = Box<dyn FnOnce(&Reactor) + Send>;

struct Remote {
    waker: PlatformWaker,
    tasks: SegQueue<Task>,
    stop: AtomicBool,
}

/// Thread-safe handle to a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    remote: Arc<Remote>,
}

impl ReactorHandle {
    /// Interrupt a blocked `wait`.
    pub fn wakeup(&self) -> NetResult<()> {
        self.remote.waker.wake()
    }

    /// Queue `task` for the reactor thread and wake it.
    pub fn post<F>(&self, task: F) -> NetResult<()>
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        self.remote.tasks.push(Box::new(task));
        self.wakeup()
    }

    /// Make `run` return after the current cycle.
    pub fn stop(&self) -> NetResult<()> {
        self.remote.stop.store(true, Ordering::Release);
        self.wakeup()
    }

    pub fn is_stopping(&self) -> bool {
        self.remote.stop.load(Ordering::Acquire)
    }
}

/// One fired entry, captured before any handler runs.
struct Fired {
    dispatcher: Rc<Dispatcher>,
    events: Events,
    error: i32,
    epoch: u64,
}

pub struct Reactor {
    entries: RefCell<Vec<Rc<Dispatcher>>>,
    poller: RefCell<PlatformPoller>,
    remote: Arc<Remote>,
    interests: RefCell<Vec<Interest>>,
    ready: RefCell<Vec<Ready>>,
    cycles: Cell<u64>,
}

impl Reactor {
    pub fn new() -> NetResult<Rc<Self>> {
        let remote = Arc::new(Remote {
            waker: PlatformWaker::new()?,
            tasks: SegQueue::new(),
            stop: AtomicBool::new(false),
        });
        let poller = PlatformPoller::new();
        ndebug!("reactor created with {} backend", poller.name());
        Ok(Rc::new(Self {
            entries: RefCell::new(Vec::new()),
            poller: RefCell::new(poller),
            remote,
            interests: RefCell::new(Vec::new()),
            ready: RefCell::new(Vec::new()),
            cycles: Cell::new(0),
        }))
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            remote: Arc::clone(&self.remote),
        }
    }

    /// Arm `events` on `dispatcher` and register it if it is not already.
    ///
    /// Re-adding a registered dispatcher only widens its interest.
    pub fn add(&self, dispatcher: &Rc<Dispatcher>, events: Events) {
        if events.is_empty() || dispatcher.socket().is_closed() {
            return;
        }
        dispatcher.arm(events);
        let mut entries = self.entries.borrow_mut();
        if !entries.iter().any(|e| Rc::ptr_eq(e, dispatcher)) {
            entries.push(Rc::clone(dispatcher));
        }
    }

    /// Unregister `dispatcher`. It receives no further events, including
    /// any already captured for the cycle in progress.
    pub fn remove(&self, dispatcher: &Rc<Dispatcher>) {
        dispatcher.mark_closing();
        self.entries
            .borrow_mut()
            .retain(|e| !Rc::ptr_eq(e, dispatcher));
    }

    pub fn is_registered(&self, dispatcher: &Rc<Dispatcher>) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|e| Rc::ptr_eq(e, dispatcher))
    }

    /// Registered dispatchers.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completed `wait` cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    pub fn wakeup(&self) -> NetResult<()> {
        self.remote.waker.wake()
    }

    /// Run one cycle. `None` waits until something happens.
    ///
    /// Returns `Ok(false)` on a timeout with nothing to do. A poller
    /// failure other than `EINTR` is returned as `NetError::Reactor`.
    pub fn wait(&self, timeout: Option<Duration>) -> NetResult<bool> {
        let snapshot: Vec<Rc<Dispatcher>> = {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|e| !e.is_dead());
            entries
                .iter()
                .filter(|e| !e.enabled().is_empty())
                .cloned()
                .collect()
        };

        let (fired, woke) = {
            let mut interests = self.interests.borrow_mut();
            let mut ready = self.ready.borrow_mut();
            interests.clear();
            for d in &snapshot {
                let enabled = d.enabled();
                interests.push(Interest {
                    fd: d.socket().fd(),
                    read: enabled.wants_read(),
                    write: enabled.wants_write(),
                });
            }
            let waker_index = interests.len();
            interests.push(Interest {
                fd: self.remote.waker.fd(),
                read: true,
                write: false,
            });

            if let Err(e) = self.poller.borrow_mut().poll(&interests, &mut ready, timeout) {
                nerror!("poll failed: {}", e);
                return Err(e);
            }

            let mut woke = false;
            let mut fired = Vec::with_capacity(ready.len());
            for r in ready.iter() {
                if r.index == waker_index {
                    self.remote.waker.drain();
                    woke = true;
                    continue;
                }
                let d = &snapshot[r.index];
                let (events, error) = classify(d, r);
                fired.push(Fired {
                    dispatcher: Rc::clone(d),
                    events,
                    error,
                    epoch: d.epoch(),
                });
            }
            (fired, woke)
        };

        // Erase before dispatch: fired entries with nothing left armed leave
        // the registry now, and come back only if their handler re-adds them.
        self.entries
            .borrow_mut()
            .retain(|e| !e.enabled().is_empty());

        for f in &fired {
            let d = &f.dispatcher;
            if d.is_closing() || d.epoch() != f.epoch || d.socket().is_closed() {
                continue;
            }
            let Some(handler) = d.handler() else {
                continue;
            };
            ntrace!("fd {} -> {:?}", d.socket().fd(), f.events);
            handler.on_event(f.events, f.error);
        }

        let mut ran = 0usize;
        while let Some(task) = self.remote.tasks.pop() {
            task(self);
            ran += 1;
        }

        self.cycles.set(self.cycles.get() + 1);
        Ok(!fired.is_empty() || woke || ran > 0)
    }

    /// Cycle until a `ReactorHandle::stop`. Fatal poller errors end the loop.
    pub fn run(&self) -> NetResult<()> {
        while !self.remote.stop.load(Ordering::Acquire) {
            self.wait(None)?;
        }
        self.remote.stop.store(false, Ordering::Release);
        ndebug!("reactor stopped after {} cycles", self.cycles.get());
        Ok(())
    }

    /// Cycle until `done()` is true or `timeout` passes. Returns `done()`.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> NetResult<bool>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.wait(Some(deadline - now))?;
        }
        Ok(true)
    }
}

/// Turn raw readiness into semantic events and disarm what fired.
fn classify(d: &Dispatcher, r: &Ready) -> (Events, i32) {
    let socket = d.socket();
    let mut events = Events::NONE;
    let mut error = 0;

    if r.readable {
        if socket.is_listening() {
            events |= Events::ACCEPT;
        } else {
            let err = socket.take_error();
            if err != 0 {
                error = err;
                events |= Events::CLOSE;
            } else {
                events |= Events::READ;
            }
        }
        d.disarm(Events::READ | Events::ACCEPT);
    }

    if r.writable {
        if socket.is_connecting() {
            let err = if error != 0 { error } else { socket.take_error() };
            if err != 0 {
                error = err;
                events |= Events::CLOSE;
            } else {
                events |= Events::CONNECT;
            }
        } else {
            events |= Events::WRITE;
        }
        d.disarm(Events::WRITE | Events::CONNECT);
    }

    (events, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventHandler;
    use crate::socket::{ConnState, Socket, SocketKind};
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Weak;

    /// Records events; optionally closes or removes itself on the first one.
    struct Recorder {
        reactor: Rc<Reactor>,
        dispatcher: RefCell<Option<Rc<Dispatcher>>>,
        seen: RefCell<Vec<Events>>,
        close_on_event: bool,
    }

    impl EventHandler for Recorder {
        fn on_event(self: Rc<Self>, events: Events, _error: i32) {
            self.seen.borrow_mut().push(events);
            if self.close_on_event {
                if let Some(d) = self.dispatcher.borrow().as_ref() {
                    self.reactor.remove(d);
                    d.socket().close();
                }
            }
        }
    }

    fn recorder(
        reactor: &Rc<Reactor>,
        socket: Socket,
        close_on_event: bool,
    ) -> (Rc<Recorder>, Rc<Dispatcher>) {
        let rec = Rc::new(Recorder {
            reactor: Rc::clone(reactor),
            dispatcher: RefCell::new(None),
            seen: RefCell::new(Vec::new()),
            close_on_event,
        });
        let weak: Weak<dyn EventHandler> = Rc::downgrade(&rec) as Weak<dyn EventHandler>;
        let d = Dispatcher::new(Rc::new(socket), weak);
        *rec.dispatcher.borrow_mut() = Some(Rc::clone(&d));
        (rec, d)
    }

    fn pair() -> (UnixStream, Socket) {
        let (a, b) = UnixStream::pair().unwrap();
        let b = Socket::from_raw_fd(b.into_raw_fd(), ConnState::Connected, SocketKind::Stream)
            .unwrap();
        (a, b)
    }

    #[test]
    fn test_timeout_returns_false() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.wait(Some(Duration::from_millis(5))).unwrap());
    }

    #[test]
    fn test_read_write_accumulate_into_one_callback() {
        let reactor = Reactor::new().unwrap();
        let (mut peer, sock) = pair();
        let (rec, d) = recorder(&reactor, sock, false);

        peer.write_all(b"x").unwrap();
        reactor.add(&d, Events::READ | Events::WRITE);
        reactor.add(&d, Events::READ);
        assert_eq!(reactor.len(), 1);

        assert!(reactor.wait(Some(Duration::from_secs(1))).unwrap());
        assert_eq!(*rec.seen.borrow(), vec![Events::READ | Events::WRITE]);
        // One-shot: nothing armed, entry erased.
        assert!(!reactor.is_registered(&d));
        assert!(!reactor.wait(Some(Duration::from_millis(5))).unwrap());
        assert_eq!(rec.seen.borrow().len(), 1);
    }

    #[test]
    fn test_unfired_interest_stays_armed() {
        let reactor = Reactor::new().unwrap();
        let (mut peer, sock) = pair();
        let (rec, d) = recorder(&reactor, sock, false);

        // Writable now, readable only after the peer writes.
        reactor.add(&d, Events::READ | Events::WRITE);
        reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*rec.seen.borrow(), vec![Events::WRITE]);
        assert_eq!(d.enabled(), Events::READ);
        assert!(reactor.is_registered(&d));

        peer.write_all(b"y").unwrap();
        reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(rec.seen.borrow()[1], Events::READ);
    }

    #[test]
    fn test_remove_during_cycle_skips_pending_entry() {
        let reactor = Reactor::new().unwrap();
        let (_pa, a) = pair();
        let (_pb, b) = pair();
        let (rec_a, da) = recorder(&reactor, a, false);
        let (rec_b, db) = recorder(&reactor, b, false);

        // Registered first, so it fires first and removes the other two.
        struct Remover {
            reactor: Rc<Reactor>,
            victims: Vec<Rc<Dispatcher>>,
            fired: Cell<u32>,
        }
        impl EventHandler for Remover {
            fn on_event(self: Rc<Self>, _events: Events, _error: i32) {
                self.fired.set(self.fired.get() + 1);
                for v in &self.victims {
                    self.reactor.remove(v);
                }
            }
        }
        let remover = Rc::new(Remover {
            reactor: Rc::clone(&reactor),
            victims: vec![Rc::clone(&da), Rc::clone(&db)],
            fired: Cell::new(0),
        });
        let (_pc, c) = pair();
        let dc = Dispatcher::new(Rc::new(c), Rc::downgrade(&remover) as Weak<dyn EventHandler>);

        reactor.add(&dc, Events::WRITE);
        reactor.add(&da, Events::WRITE);
        reactor.add(&db, Events::WRITE);
        reactor.wait(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(remover.fired.get(), 1);
        assert!(rec_a.seen.borrow().is_empty());
        assert!(rec_b.seen.borrow().is_empty());
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_close_in_callback_stops_events() {
        let reactor = Reactor::new().unwrap();
        let (mut peer, sock) = pair();
        let (rec, d) = recorder(&reactor, sock, true);

        peer.write_all(b"z").unwrap();
        reactor.add(&d, Events::READ);
        reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(rec.seen.borrow().len(), 1);

        // Re-arming a closed socket is ignored.
        reactor.add(&d, Events::READ);
        reactor.wait(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(rec.seen.borrow().len(), 1);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_dropped_handler_is_purged() {
        let reactor = Reactor::new().unwrap();
        let (_peer, sock) = pair();
        let (rec, d) = recorder(&reactor, sock, false);
        reactor.add(&d, Events::READ);
        drop(rec);
        reactor.wait(Some(Duration::ZERO)).unwrap();
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_peer_shutdown_maps_to_read() {
        let reactor = Reactor::new().unwrap();
        let (peer, sock) = pair();
        let (rec, d) = recorder(&reactor, sock, false);
        drop(peer);
        reactor.add(&d, Events::READ);
        reactor.wait(Some(Duration::from_secs(1))).unwrap();
        // Orderly shutdown carries no SO_ERROR; recv() reports the EOF.
        assert_eq!(*rec.seen.borrow(), vec![Events::READ]);
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.wakeup().unwrap();
        });
        let start = Instant::now();
        assert!(reactor.wait(Some(Duration::from_secs(5))).unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }

    #[test]
    fn test_posted_tasks_run_on_reactor_thread() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let owner = std::thread::current().id();
        let ran = Rc::new(Cell::new(false));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            handle
                .post(move |r| {
                    tx.send((std::thread::current().id(), r.cycles())).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        let flag = Rc::clone(&ran);
        reactor
            .run_until(Duration::from_secs(1), || {
                if rx.try_recv().map(|(id, _)| id == owner).unwrap_or(false) {
                    flag.set(true);
                }
                flag.get()
            })
            .unwrap();
        assert!(ran.get());
    }

    #[test]
    fn test_run_returns_after_stop() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        handle.post(|r| r.handle().stop().unwrap()).unwrap();
        reactor.run().unwrap();
        assert!(!handle.is_stopping());
    }
}

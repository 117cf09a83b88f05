//! Packet Load Client
//!
//! Connects to a packet-echo server, keeps a window of packets in flight,
//! and checks that every echo comes back in order with the right flag and
//! payload.
//!
//! Usage:
//!     cargo build --release -p packet-client
//!     ./target/release/packet-client [addr] [count] [size] [window]
//!
//! Defaults: addr 127.0.0.1:9900, count 10000, size 512, window 64.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use segnet::prelude::*;

struct Load {
    count: u64,
    size: usize,
    window: u64,
    sent: Cell<u64>,
    received: Cell<u64>,
    mismatches: Cell<u64>,
    failed: RefCell<Option<NetError>>,
    socket: RefCell<Option<Rc<PacketSocket>>>,
}

impl Load {
    fn payload(&self, seq: u64) -> Vec<u8> {
        let mut p = vec![(seq % 251) as u8; self.size.max(8)];
        p[..8].copy_from_slice(&seq.to_be_bytes());
        p
    }

    fn fill_window(&self, socket: &Rc<PacketSocket>) {
        while self.sent.get() < self.count && self.sent.get() - self.received.get() < self.window {
            let seq = self.sent.get();
            if let Err(e) = socket.async_write_packet_bytes(&self.payload(seq), seq as u16) {
                *self.failed.borrow_mut() = Some(e);
                socket.close();
                return;
            }
            self.sent.set(seq + 1);
        }
    }

    fn done(&self) -> bool {
        self.received.get() == self.count || self.failed.borrow().is_some()
    }
}

struct Conn(Rc<Load>);

impl PacketHandler for Conn {
    fn on_packet(&self, socket: &Rc<PacketSocket>, payload: SegmentedBuffer, flag: u16) {
        let load = &self.0;
        let seq = load.received.get();
        if flag != seq as u16 || payload.to_vec() != load.payload(seq) {
            load.mismatches.set(load.mismatches.get() + 1);
        }
        load.received.set(seq + 1);
        load.fill_window(socket);
    }

    fn on_error(&self, _socket: &Rc<PacketSocket>, error: NetError) {
        *self.0.failed.borrow_mut() = Some(error);
    }
}

struct Connect {
    rt: Rc<Runtime>,
    load: Rc<Load>,
}

impl ConnectHandler for Connect {
    fn on_connect(&self, _connector: &Rc<AsyncConnector>, result: NetResult<Socket>) {
        let started = result.and_then(|socket| {
            self.rt.packet_socket(socket, Rc::new(Conn(Rc::clone(&self.load))))
        });
        match started {
            Ok(ps) => {
                self.load.fill_window(&ps);
                *self.load.socket.borrow_mut() = Some(ps);
            }
            Err(e) => *self.load.failed.borrow_mut() = Some(e),
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let addr: SocketAddr = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9900)));
    let count: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let size: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(512);
    let window: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(64).max(1);

    let rt = match Runtime::from_env() {
        Ok(rt) => Rc::new(rt),
        Err(e) => {
            eprintln!("packet-client: {}", e);
            std::process::exit(1);
        }
    };

    let load = Rc::new(Load {
        count,
        size,
        window,
        sent: Cell::new(0),
        received: Cell::new(0),
        mismatches: Cell::new(0),
        failed: RefCell::new(None),
        socket: RefCell::new(None),
    });

    eprintln!(
        "packet-client: {} packets of {} bytes to {} (window {})",
        count,
        size.max(8),
        addr,
        window
    );
    let start = Instant::now();
    let handler = Rc::new(Connect { rt: Rc::clone(&rt), load: Rc::clone(&load) });
    let _connector = match rt.connect(&addr, handler) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("packet-client: connect {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let l = Rc::clone(&load);
    if let Err(e) = rt.run_until(Duration::from_secs(300), || l.done()) {
        eprintln!("packet-client: reactor failed: {}", e);
        std::process::exit(1);
    }
    let secs = start.elapsed().as_secs_f64();
    if let Some(socket) = load.socket.borrow_mut().take() {
        socket.close();
    }

    let received = load.received.get();
    eprintln!(
        "packet-client: {}/{} echoed in {:.2}s ({:.0} pkt/s, {:.1} MiB/s)",
        received,
        count,
        secs,
        received as f64 / secs.max(0.001),
        (received as f64 * size as f64) / secs.max(0.001) / (1024.0 * 1024.0)
    );
    if let Some(e) = load.failed.borrow().as_ref() {
        eprintln!("packet-client: failed: {}", e);
        std::process::exit(1);
    }
    if load.mismatches.get() > 0 {
        eprintln!("packet-client: {} mismatched echoes", load.mismatches.get());
        std::process::exit(1);
    }
}

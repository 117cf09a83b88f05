//! Packet Echo Server
//!
//! Single-threaded TCP server that echoes every packet back with the same
//! flag. Payload blocks are spliced from the read buffer straight into the
//! write queue, never copied.
//!
//! Usage:
//!     cargo build --release -p packet-echo
//!     ./target/release/packet-echo [addr] [max_conns]
//!
//! Defaults: addr 0.0.0.0:9900, max_conns 1024.
//!
//! Test with:
//!     ./target/release/packet-client 127.0.0.1:9900 10000 512
//!
//! Environment: SEGNET_LOG_LEVEL, SEGNET_MAX_PAYLOAD, SEGNET_READ_LIMIT,
//! SEGNET_POOL_MAX_BLOCKS and the other SEGNET_* settings.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use segnet::env_get_bool;
use segnet::prelude::*;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Default)]
struct Stats {
    accepted: Cell<u64>,
    rejected: Cell<u64>,
    closed: Cell<u64>,
    packets: Cell<u64>,
    bytes: Cell<u64>,
}

impl Stats {
    fn print(&self, secs: f64) {
        let packets = self.packets.get();
        eprintln!(
            "packet-echo: {} accepted, {} rejected, {} closed",
            self.accepted.get(),
            self.rejected.get(),
            self.closed.get()
        );
        eprintln!(
            "packet-echo: {} packets, {} payload bytes in {:.1}s ({:.0} pkt/s)",
            packets,
            self.bytes.get(),
            secs,
            packets as f64 / secs.max(0.001)
        );
    }
}

struct Server {
    rt: Rc<Runtime>,
    conns: RefCell<Vec<Rc<PacketSocket>>>,
    max_conns: usize,
    stats: Rc<Stats>,
}

impl Server {
    fn reap(&self) {
        self.conns.borrow_mut().retain(|c| c.is_open());
    }
}

struct Echo {
    stats: Rc<Stats>,
}

impl PacketHandler for Echo {
    fn on_packet(&self, socket: &Rc<PacketSocket>, payload: SegmentedBuffer, flag: u16) {
        self.stats.packets.set(self.stats.packets.get() + 1);
        self.stats.bytes.set(self.stats.bytes.get() + payload.len() as u64);
        if let Err(e) = socket.async_write_packet(payload, flag) {
            nwarn!("echo write failed: {}", e);
            socket.close();
            self.stats.closed.set(self.stats.closed.get() + 1);
        }
    }

    fn on_error(&self, _socket: &Rc<PacketSocket>, error: NetError) {
        if error != NetError::PeerClosed {
            ninfo!("connection error: {}", error);
        }
        self.stats.closed.set(self.stats.closed.get() + 1);
    }
}

impl AcceptHandler for Server {
    fn on_accept(&self, _listener: &Rc<AsyncListener>, result: NetResult<Socket>) {
        let socket = match result {
            Ok(s) => s,
            Err(e) => {
                nwarn!("accept: {}", e);
                return;
            }
        };
        self.reap();
        if self.conns.borrow().len() >= self.max_conns {
            // At capacity; dropping the socket closes it.
            self.stats.rejected.set(self.stats.rejected.get() + 1);
            return;
        }
        let handler = Rc::new(Echo { stats: Rc::clone(&self.stats) });
        match self.rt.packet_socket(socket, handler) {
            Ok(conn) => {
                self.stats.accepted.set(self.stats.accepted.get() + 1);
                self.conns.borrow_mut().push(conn);
            }
            Err(e) => nwarn!("packet socket: {}", e),
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let addr: SocketAddr = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9900)));
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let rt = match Runtime::from_env() {
        Ok(rt) => Rc::new(rt),
        Err(e) => {
            eprintln!("packet-echo: {}", e);
            std::process::exit(1);
        }
    };
    if env_get_bool("SEGNET_PRINT_CONFIG", false) {
        rt.config().print();
    }

    let stats = Rc::new(Stats::default());
    let server = Rc::new(Server {
        rt: Rc::clone(&rt),
        conns: RefCell::new(Vec::new()),
        max_conns,
        stats: Rc::clone(&stats),
    });
    let listener = match rt.listen(&addr, server.clone()) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("packet-echo: cannot listen on {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "packet-echo: listening on {} (max {} connections)",
        listener.local_addr().unwrap_or(addr),
        max_conns
    );

    let start = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        if let Err(e) = rt.wait(Some(Duration::from_millis(250))) {
            eprintln!("packet-echo: reactor failed: {}", e);
            break;
        }
    }

    eprintln!("\npacket-echo: shutting down...");
    listener.close();
    for conn in server.conns.borrow().iter() {
        conn.close();
    }
    stats.print(start.elapsed().as_secs_f64());
    eprintln!("packet-echo: done.");
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

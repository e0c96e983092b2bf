//! sockem End-to-End Smoke Test
//!
//! Drives the full transport against an in-process loopback "stack":
//!   Part A — Primitives: SPSC ring, slab pool carving, tagged descriptors
//!   Part B — Datagram channel: connect, send, echo, truncation
//!   Part C — Stream channel: bulk echo with short writes and partial reads
//!   Part D — Lifecycle: pool exhaustion, drain on close, uninit sockets
//!
//! The stack threads sleep on the server eventfd with poll(2); the client
//! sleeps on the client eventfd. Nothing spins on an empty ring.
//!
//! Run: SOCKEM_LOG=debug ./target/release/sockem-smoke

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing_subscriber::EnvFilter;

use sockem_core::buffer::PacketAllocator;
use sockem_core::constants::MAX_PAYLOAD;
use sockem_core::error::SockError;
use sockem_core::notifier::Notifier;
use sockem_core::{Endpoint, TaggedBuf};

use sockem_module::shared_region::SharedRegion;
use sockem_module::slab_pool::SlabPool;
use sockem_module::spsc_ring::SpscRing;
use sockem_module::{
    ChannelPools, ChannelRef, DatagramChannel, DefaultNotifier, HeapPackets, Reply, Request,
    Socket, SocketKind, StreamChannel, TransportConfig,
};

const PEER: Endpoint = Endpoint::new([198, 51, 100, 7], 9);
const DEADLINE: Duration = Duration::from_secs(10);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Sleep until `fd` is readable or `ms` passes. No fd: short sleep.
fn wait_readable(fd: Option<RawFd>, ms: u16) {
    match fd {
        Some(fd) => {
            // SAFETY: the fd belongs to a notifier that outlives this call.
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            if let Err(e) = poll(&mut fds, PollTimeout::from(ms)) {
                tracing::warn!(error = %e, "poll failed");
            }
        }
        None => thread::sleep(Duration::from_millis(1)),
    }
}

// ── Loopback stacks ──

/// Echo every datagram back to the client, source = original destination.
fn datagram_stack(
    chan: ChannelRef<DatagramChannel<DefaultNotifier>>,
    packets: Arc<HeapPackets>,
    stop: Arc<AtomicBool>,
) -> usize {
    let mut echoed = 0;
    while !stop.load(Ordering::Acquire) {
        wait_readable(chan.server_wake().raw_fd(), 5);
        let _ = chan.server_clear();

        while let Some(h) = chan.reclaim() {
            packets.free(h);
        }
        while let Some(entry) = chan.take() {
            let Some(p) = packets.alloc(entry.total_len()) else {
                tracing::warn!(len = entry.total_len(), "no packet buffer, datagram dropped");
                continue;
            };
            // SAFETY: the client keeps the send buffers until the echo arrives.
            let n = unsafe {
                entry.gather(std::slice::from_raw_parts_mut(p.payload.as_ptr(), p.capacity))
            };
            let delivered = TaggedBuf::new(p.handle, p.payload, n as u16)
                .and_then(|buf| chan.deliver(buf, entry.dest));
            match delivered {
                Ok(()) => echoed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "echo not delivered");
                    packets.free(p.handle);
                }
            }
        }
    }
    while let Some(h) = chan.reclaim() {
        packets.free(h);
    }
    echoed
}

/// Echo the outbound byte stream back as inbound packets.
fn stream_stack(
    chan: ChannelRef<StreamChannel<DefaultNotifier>>,
    packets: Arc<HeapPackets>,
    stop: Arc<AtomicBool>,
) -> usize {
    let mut bytes = 0;
    let mut pending: Option<TaggedBuf> = None;
    while !stop.load(Ordering::Acquire) {
        wait_readable(chan.server_wake().raw_fd(), 5);
        let _ = chan.server_clear();

        loop {
            while let Some(h) = chan.reclaim() {
                packets.free(h);
            }
            let buf = match pending.take() {
                Some(buf) => buf,
                None => {
                    let Some(p) = packets.alloc(packets.buffer_size()) else { break };
                    let cap = p.capacity.min(MAX_PAYLOAD);
                    // SAFETY: freshly allocated payload region of `cap` bytes.
                    let out = unsafe { std::slice::from_raw_parts_mut(p.payload.as_ptr(), cap) };
                    let n = chan.drain_outbound(out);
                    if n == 0 {
                        packets.free(p.handle);
                        break;
                    }
                    match TaggedBuf::new(p.handle, p.payload, n as u16) {
                        Ok(buf) => buf,
                        Err(e) => {
                            tracing::error!(error = %e, "packet address not taggable");
                            packets.free(p.handle);
                            break;
                        }
                    }
                }
            };
            if chan.deliver(buf).is_err() {
                // Inbound ring full: the client's next recv wakes us.
                pending = Some(buf);
                break;
            }
            bytes += buf.len() as usize;
        }
    }
    if let Some(buf) = pending {
        packets.free(buf.handle());
    }
    bytes
}

/// Receive with wakeup waits until data arrives or the deadline passes.
fn recv_blocking(sock: &mut Socket, out: &mut [u8], src: &mut Endpoint) -> Reply {
    let start = Instant::now();
    loop {
        let reply = {
            let mut bufs = [IoSliceMut::new(&mut *out)];
            sock.handle_request(Request::Recv { pid: std::process::id(), iov: &mut bufs, src: Some(&mut *src) })
        };
        match reply {
            Reply::Error(ref e) if e.is_backpressure() && start.elapsed() < DEADLINE => {
                wait_readable(sock.wait_fd(), 5);
                let _ = sock.handle_request(Request::RecvClear);
            }
            other => return other,
        }
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Primitives
// ════════════════════════════════════════════════════════════

fn test_primitives(t: &mut TestRunner) {
    t.section("Part A: Primitives");

    let ring = SpscRing::<u32, 8>::new();
    let filled = (0..8).all(|i| ring.push(i));
    t.check("ring: 8 pushes into capacity 8", filled, "push refused early");
    t.check("ring: push at capacity refused", !ring.push(99), "push succeeded");
    let order: Vec<u32> = std::iter::from_fn(|| ring.pop()).collect();
    t.check("ring: FIFO order", order == (0..8).collect::<Vec<_>>(), &format!("{:?}", order));

    match SharedRegion::anonymous(4096).and_then(|r| SlabPool::new(r, 64)) {
        Ok(mut pool) => {
            let base = pool.base().as_ptr() as usize;
            let offsets: Vec<usize> =
                std::iter::from_fn(|| pool.acquire()).map(|p| p.as_ptr() as usize - base).collect();
            t.check(
                "slab(4096, 64): 63 slots",
                offsets.len() == 63,
                &format!("{} slots", offsets.len()),
            );
            t.check(
                "slab: last slot at offset 3968",
                offsets.last() == Some(&3968),
                &format!("{:?}", offsets.last()),
            );
            let wild = std::ptr::NonNull::new((base + 4096) as *mut u8);
            let refused = wild.map_or(false, |p| pool.release(p).is_err());
            t.check("slab: release past region refused", refused, "accepted");
        }
        Err(e) => t.fail("slab(4096, 64)", &e.to_string()),
    }

    let mut backing = vec![0u8; 64];
    let base = backing.as_mut_ptr();
    let mut round_trips = true;
    for len in [0u16, 1, 1500, 65535] {
        // SAFETY: both pointers are inside `backing`.
        let (h, p) = unsafe {
            (std::ptr::NonNull::new_unchecked(base), std::ptr::NonNull::new_unchecked(base.add(16)))
        };
        round_trips &= TaggedBuf::new(h, p, len).map_or(false, |b| b.unpack() == (h, p, len));
    }
    t.check("tagged: round trip 0/1/1500/65535", round_trips, "mismatch");
}

// ════════════════════════════════════════════════════════════
// Part B: Datagram channel
// ════════════════════════════════════════════════════════════

fn test_datagram(t: &mut TestRunner, pools: &ChannelPools, packets: &Arc<HeapPackets>) {
    t.section("Part B: Datagram channel");

    let mut sock = match Socket::open(SocketKind::Datagram, pools) {
        Ok(s) => { t.pass("open datagram socket"); s }
        Err(e) => { t.fail("open datagram socket", &e.to_string()); return; }
    };
    t.check("client wakeup has an fd", sock.wait_fd().is_some() || cfg!(not(target_os = "linux")), "none");

    let Socket::Datagram(ref d) = sock else { return };
    let server = d.attach();
    let stop = Arc::new(AtomicBool::new(false));
    let stack = {
        let (packets, stop) = (Arc::clone(packets), Arc::clone(&stop));
        thread::spawn(move || datagram_stack(server, packets, stop))
    };

    let pid = std::process::id();
    let reply = sock.handle_request(Request::Send { pid, iov: &[IoSlice::new(b"x")], dest: None });
    t.check(
        "send without destination -> EDESTADDRREQ",
        reply.as_ret() == -i64::from(libc::EDESTADDRREQ),
        &format!("{:?}", reply),
    );

    sock.handle_request(Request::Connect(PEER));
    let mut all_ok = true;
    let mut out = [0u8; 2048];
    for i in 0..200usize {
        let len = 1 + (i * 37) % 1400;
        let msg: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
        let sent = sock.handle_request(Request::Send { pid, iov: &[IoSlice::new(&msg)], dest: None });
        let mut src = Endpoint::UNSPECIFIED;
        let got = recv_blocking(&mut sock, &mut out, &mut src);
        if sent != Reply::Done(len) || got != Reply::Done(len) || out[..len] != msg[..] || src != PEER {
            all_ok = false;
            t.fail("datagram echo x200", &format!("#{}: sent {:?} got {:?}", i, sent, got));
            break;
        }
    }
    if all_ok {
        t.pass("datagram echo x200 (sizes 1..1400)");
    }

    let two = [IoSlice::new(b"scatter "), IoSlice::new(b"gather")];
    sock.handle_request(Request::Send { pid, iov: &two, dest: Some(PEER) });
    let mut small = [0u8; 7];
    let mut src = Endpoint::UNSPECIFIED;
    let got = recv_blocking(&mut sock, &mut small, &mut src);
    t.check(
        "2-vector send, 7-byte recv truncates",
        got == Reply::Done(7) && &small == b"scatter",
        &format!("{:?}", got),
    );

    stop.store(true, Ordering::Release);
    let echoed = stack.join().unwrap_or(0);
    t.check(&format!("stack echoed {} datagrams", echoed), echoed == 201, "count mismatch");
    sock.close();
}

// ════════════════════════════════════════════════════════════
// Part C: Stream channel
// ════════════════════════════════════════════════════════════

fn test_stream(t: &mut TestRunner, pools: &ChannelPools, packets: &Arc<HeapPackets>) {
    t.section("Part C: Stream channel");

    let mut sock = match Socket::open(SocketKind::Stream, pools) {
        Ok(s) => { t.pass("open stream socket"); s }
        Err(e) => { t.fail("open stream socket", &e.to_string()); return; }
    };
    sock.handle_request(Request::Connect(PEER));

    let Socket::Stream(ref s) = sock else { return };
    let server = s.attach();
    let stop = Arc::new(AtomicBool::new(false));
    let stack = {
        let (packets, stop) = (Arc::clone(packets), Arc::clone(&stop));
        thread::spawn(move || stream_stack(server, packets, stop))
    };

    const TOTAL: usize = 1 << 20;
    let source: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let pid = std::process::id();
    let (mut sent, mut received) = (0, 0);
    let (mut short_writes, mut mismatch) = (0, false);
    let mut out = [0u8; 1000];
    let start = Instant::now();

    while received < TOTAL && start.elapsed() < DEADLINE {
        let mut progressed = false;
        if sent < TOTAL {
            let end = (sent + 48 * 1024).min(TOTAL);
            match sock.handle_request(Request::Send { pid, iov: &[IoSlice::new(&source[sent..end])], dest: None }) {
                Reply::Done(n) => {
                    if n < end - sent {
                        short_writes += 1;
                    }
                    sent += n;
                    progressed = true;
                }
                Reply::Error(SockError::WouldBlock) => {}
                other => {
                    t.fail("stream send", &format!("{:?}", other));
                    break;
                }
            }
        }
        let reply = {
            let mut bufs = [IoSliceMut::new(&mut out)];
            sock.handle_request(Request::Recv { pid, iov: &mut bufs, src: None })
        };
        if let Reply::Done(n) = reply {
            mismatch |= out[..n] != source[received..received + n];
            received += n;
            progressed = true;
        }
        if !progressed {
            wait_readable(sock.wait_fd(), 5);
            let _ = sock.handle_request(Request::RecvClear);
        }
    }

    t.check(
        &format!("1 MiB echoed ({} short writes)", short_writes),
        received == TOTAL,
        &format!("received {} of {}", received, TOTAL),
    );
    t.check("byte stream intact", !mismatch, "data mismatch");

    stop.store(true, Ordering::Release);
    let bytes = stack.join().unwrap_or(0);
    t.check("stack delivered every byte", bytes == TOTAL, &format!("{}", bytes));
    sock.close();
}

// ════════════════════════════════════════════════════════════
// Part D: Lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(t: &mut TestRunner, packets: &Arc<HeapPackets>) {
    t.section("Part D: Lifecycle");

    let cfg = TransportConfig::new().dgram_sockets(2).stream_sockets(1);
    let reclaim: Arc<dyn PacketAllocator> = Arc::clone(packets) as Arc<dyn PacketAllocator>;
    let pools: ChannelPools = match ChannelPools::new(&cfg, reclaim) {
        Ok(p) => p,
        Err(e) => { t.fail("small pools", &e.to_string()); return; }
    };

    let a = Socket::open(SocketKind::Datagram, &pools);
    let b = Socket::open(SocketKind::Raw, &pools);
    let c = Socket::open(SocketKind::Datagram, &pools);
    t.check("2 datagram slots: 2 opens succeed", a.is_ok() && b.is_ok(), "open failed");
    let exhausted = matches!(c, Err(SockError::PoolExhausted));
    t.check("3rd open -> PoolExhausted (ENOBUFS)", exhausted, "not exhausted");

    let baseline = packets.in_use();
    if let Ok(Socket::Datagram(ref d)) = a {
        for _ in 0..3 {
            if let Some(p) = packets.alloc(16) {
                let ok = TaggedBuf::new(p.handle, p.payload, 16)
                    .and_then(|buf| d.channel().deliver(buf, PEER))
                    .is_ok();
                if !ok {
                    packets.free(p.handle);
                }
            }
        }
    }
    t.check("3 undelivered buffers parked", packets.in_use() == baseline + 3, "alloc failed");
    drop(a);
    t.check("close drains parked buffers", packets.in_use() == baseline, &format!("{} in use", packets.in_use()));
    t.check("slot returned on close", pools.datagram.available() == 1, "slot leaked");

    let mut dead = Socket::<DefaultNotifier>::Uninit;
    let reply = dead.handle_request(Request::GetFlags);
    t.check("uninit socket -> EBADF", reply.as_ret() == -i64::from(libc::EBADF), &format!("{:?}", reply));
    drop(b);
}

// ════════════════════════════════════════════════════════════

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SOCKEM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== sockem End-to-End Smoke Test ===");

    let cfg = TransportConfig::from_env();
    if let Err(msg) = cfg.validate() {
        println!("\nFATAL: invalid configuration: {}", msg);
        std::process::exit(1);
    }
    println!(
        "    dgram={} stream={} packets={}x{}",
        cfg.dgram_sockets, cfg.stream_sockets, cfg.packets, cfg.packet_size
    );

    let mut t = TestRunner::new();
    let packets = Arc::new(HeapPackets::from_config(&cfg));

    test_primitives(&mut t);

    let reclaim: Arc<dyn PacketAllocator> = Arc::clone(&packets) as Arc<dyn PacketAllocator>;
    let pools: ChannelPools = match ChannelPools::new(&cfg, reclaim) {
        Ok(p) => p,
        Err(e) => {
            println!("\nFATAL: channel pools: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };

    test_datagram(&mut t, &pools, &packets);
    test_stream(&mut t, &pools, &packets);
    test_lifecycle(&mut t, &packets);

    drop(pools);
    t.check("all packet buffers returned", packets.in_use() == 0, &format!("{} in use", packets.in_use()));

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}

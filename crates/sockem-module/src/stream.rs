//! `StreamChannel` — per-socket transport for TCP-style sockets.
//!
//! ```text
//!            client                                server (stack)
//!   send ───► tx   ByteRing<STREAM_BYTES>   ───► drain_outbound
//!   recv ◄─── rx   [TaggedBuf; RING_DEPTH]  ◄─── deliver
//!   recv ───► free [TaggedBuf; RING_DEPTH]  ───► reclaim
//! ```
//!
//! Outbound data is an unframed byte stream: the stack segments it however
//! it likes. Inbound data arrives as packet buffers. A receive may stop in
//! the middle of one, so the client keeps a partial-consumption cursor
//! `(descriptor, bytes consumed)` and only dequeues the next descriptor once
//! the current one is fully read. The cursor is client-private state.
//!
//! Wakeup edges are the same as for the datagram channel: empty → non-empty
//! on the producer side, full → non-full on the consumer side. That covers
//! `free` too, so a receive stalled on a full free ring is woken by the
//! `reclaim` that makes room.

use std::cell::UnsafeCell;
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use sockem_core::constants::{RING_DEPTH, STREAM_BYTES};
use sockem_core::error::{Result, SockError};
use sockem_core::notifier::Notifier;
use sockem_core::{Endpoint, TaggedBuf};

use crate::byte_ring::ByteRing;
use crate::channel_pool::PoolChannel;
use crate::iov;
use crate::spsc_ring::SpscRing;

/// Descriptor currently being read and how far into it.
#[derive(Debug, Clone, Copy, Default)]
struct Partial {
    buf: Option<TaggedBuf>,
    consumed: u16,
}

/// Exclusive hold on the client read side; released on drop.
struct ReadClaim<'a>(&'a AtomicBool);

impl Drop for ReadClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[repr(C)]
pub struct StreamChannel<W: Notifier> {
    tx: ByteRing<STREAM_BYTES>,
    rx: SpscRing<TaggedBuf, RING_DEPTH>,
    free: SpscRing<TaggedBuf, RING_DEPTH>,
    client_wake: W,
    server_wake: W,
    flags: AtomicI32,
    peer: AtomicU64,
    /// Set while a reader holds `partial` and the consumer end of `rx`.
    reading: AtomicBool,
    partial: UnsafeCell<Partial>,
}

// Safety: `partial` is only touched under a `ReadClaim` (or by drain once
// both sides are done); everything else is ring protocol.
unsafe impl<W: Notifier> Sync for StreamChannel<W> {}

impl<W: Notifier> StreamChannel<W> {
    /// Heap-allocate and initialize a channel outside any pool.
    pub fn boxed() -> Result<Box<Self>> {
        let mut slot = Box::new(MaybeUninit::<Self>::zeroed());
        // SAFETY: freshly allocated, aligned, exclusively ours.
        unsafe {
            <Self as PoolChannel>::init_at(slot.as_mut_ptr())?;
            Ok(Box::from_raw(Box::into_raw(slot).cast::<Self>()))
        }
    }

    fn claim_reader(&self) -> Option<ReadClaim<'_>> {
        self.reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ReadClaim(&self.reading))
    }

    fn wake(&self, n: &W, who: &'static str) {
        tracing::trace!(who, "stream wakeup");
        if let Err(e) = n.signal() {
            tracing::warn!(who, error = %e, "stream wakeup failed");
        }
    }

    // ── Client side ──

    /// Append bytes from `iov` to the outbound stream.
    ///
    /// Writes as much as fits; a short count is backpressure. Nothing fits
    /// at all ⇒ `WouldBlock`. `dest` is ignored, as for `sendto` on a
    /// connected stream socket.
    pub fn send(&self, pid: u32, iov: &[IoSlice<'_>], _dest: Option<Endpoint>) -> Result<usize> {
        let mut written = 0;
        let mut crossed_empty = false;
        let mut wanted = 0;
        for slice in iov {
            wanted += slice.len();
            let (n, was_empty) = self.tx.write_tracked(slice);
            written += n;
            crossed_empty |= was_empty;
            if n < slice.len() {
                break;
            }
        }
        if crossed_empty {
            self.wake(&self.server_wake, "server");
        }
        if written == 0 && wanted > 0 {
            return Err(SockError::WouldBlock);
        }
        tracing::trace!(pid, written, "stream send");
        Ok(written)
    }

    /// Read inbound bytes into `bufs`.
    ///
    /// Continues a partially read descriptor first, then dequeues further
    /// descriptors while space remains. Returns bytes read; nothing
    /// available ⇒ `WouldBlock`. `src`, if given, receives the peer.
    ///
    /// One receive runs at a time. A call that overlaps another receive on
    /// the same channel also gets `WouldBlock` and touches nothing.
    pub fn recv(
        &self,
        pid: u32,
        bufs: &mut [IoSliceMut<'_>],
        src: Option<&mut Endpoint>,
    ) -> Result<usize> {
        let want = iov::total_len(bufs);
        if want == 0 {
            return Ok(0);
        }
        let Some(_claim) = self.claim_reader() else {
            tracing::trace!(pid, "stream recv contended");
            return Err(SockError::WouldBlock);
        };
        // SAFETY: the claim makes this the only live reference.
        let partial = unsafe { &mut *self.partial.get() };
        let mut copied = 0;
        let mut wake_server = false;

        while copied < want {
            let buf = match partial.buf {
                Some(buf) => buf,
                None => {
                    // Sole producer on `free`: room now means room later.
                    if self.free.is_full() {
                        wake_server = true;
                        break;
                    }
                    let Some(popped) = self.rx.pop_tracked() else { break };
                    wake_server |= popped.was_full;
                    *partial = Partial { buf: Some(popped.value), consumed: 0 };
                    popped.value
                }
            };

            // SAFETY: the stack keeps the buffer alive until reclaimed.
            let data = unsafe { buf.bytes() };
            let n = iov::scatter(&data[partial.consumed as usize..], bufs, copied);
            copied += n;
            partial.consumed += n as u16;

            if partial.consumed == buf.len() {
                let pushed = self.free.push(buf);
                debug_assert!(pushed, "free ring checked before dequeue");
                *partial = Partial::default();
            }
        }

        if wake_server {
            self.wake(&self.server_wake, "server");
        }
        if copied == 0 {
            return Err(SockError::WouldBlock);
        }
        if let Some(src) = src {
            *src = self.peer();
        }
        tracing::trace!(pid, copied, "stream recv");
        Ok(copied)
    }

    /// Bytes left in the descriptor being read, or `None` while a receive
    /// is in progress.
    pub fn partial_remaining(&self) -> Option<usize> {
        let _claim = self.claim_reader()?;
        // SAFETY: held under the claim.
        let partial = unsafe { &*self.partial.get() };
        Some(partial.buf.map_or(0, |b| (b.len() - partial.consumed) as usize))
    }

    /// Reset the client wakeup; returns the coalesced signal count.
    pub fn recv_clear(&self) -> Result<u64> {
        self.client_wake.clear()
    }

    pub fn flags(&self) -> i32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: i32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub fn peer(&self) -> Endpoint {
        Endpoint::from_bits(self.peer.load(Ordering::Relaxed))
    }

    pub fn connect(&self, peer: Endpoint) {
        self.peer.store(peer.to_bits(), Ordering::Relaxed);
    }

    // ── Server side ──

    /// Pull outbound bytes. Returns bytes copied into `out`.
    pub fn drain_outbound(&self, out: &mut [u8]) -> usize {
        let (n, was_full) = self.tx.read_tracked(out);
        if was_full {
            self.wake(&self.client_wake, "client");
        }
        n
    }

    /// Queue an inbound packet buffer for the client.
    ///
    /// On `WouldBlock` the buffer still belongs to the caller.
    pub fn deliver(&self, buf: TaggedBuf) -> Result<()> {
        let pushed = self.rx.push_tracked(buf).ok_or(SockError::WouldBlock)?;
        if pushed.was_empty {
            self.wake(&self.client_wake, "client");
        }
        Ok(())
    }

    /// Next buffer handle the client has fully read.
    pub fn reclaim(&self) -> Option<NonNull<u8>> {
        let popped = self.free.pop_tracked()?;
        if popped.was_full {
            self.wake(&self.client_wake, "client");
        }
        Some(popped.value.handle())
    }

    /// Reset the server wakeup; returns the coalesced signal count.
    pub fn server_clear(&self) -> Result<u64> {
        self.server_wake.clear()
    }

    pub fn client_wake(&self) -> &W {
        &self.client_wake
    }

    pub fn server_wake(&self) -> &W {
        &self.server_wake
    }

    /// Descriptors queued for the client (not counting the partial one).
    pub fn pending_recv(&self) -> usize {
        self.rx.len()
    }

    /// Outbound bytes waiting for the server.
    pub fn pending_send(&self) -> usize {
        self.tx.len()
    }
}

impl<W: Notifier> PoolChannel for StreamChannel<W> {
    const KIND: &'static str = "stream";

    unsafe fn init_at(slot: *mut Self) -> Result<()> {
        let client_wake = W::create()?;
        let server_wake = W::create()?;
        ByteRing::init_at(ptr::addr_of_mut!((*slot).tx));
        SpscRing::init_at(ptr::addr_of_mut!((*slot).rx));
        SpscRing::init_at(ptr::addr_of_mut!((*slot).free));
        ptr::addr_of_mut!((*slot).client_wake).write(client_wake);
        ptr::addr_of_mut!((*slot).server_wake).write(server_wake);
        ptr::addr_of_mut!((*slot).flags).write(AtomicI32::new(0));
        ptr::addr_of_mut!((*slot).peer).write(AtomicU64::new(0));
        ptr::addr_of_mut!((*slot).reading).write(AtomicBool::new(false));
        ptr::addr_of_mut!((*slot).partial).write(UnsafeCell::new(Partial::default()));
        Ok(())
    }

    fn drain(&self, sink: &mut dyn FnMut(NonNull<u8>)) -> usize {
        let mut n = 0;
        // SAFETY: both sides are done with the channel.
        let partial = unsafe { &mut *self.partial.get() };
        if let Some(buf) = partial.buf.take() {
            sink(buf.handle());
            n += 1;
        }
        while let Some(buf) = self.rx.pop() {
            sink(buf.handle());
            n += 1;
        }
        while let Some(buf) = self.free.pop() {
            sink(buf.handle());
            n += 1;
        }
        self.tx.discard();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting_notifier::CountingNotifier;
    use crate::heap_packets::HeapPackets;
    use sockem_core::buffer::PacketAllocator;

    type Chan = StreamChannel<CountingNotifier>;

    fn packet(pool: &HeapPackets, data: &[u8]) -> TaggedBuf {
        let p = pool.alloc(data.len()).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), p.payload.as_ptr(), data.len());
        }
        TaggedBuf::new(p.handle, p.payload, data.len() as u16).unwrap()
    }

    fn recv_into(chan: &Chan, out: &mut [u8]) -> Result<usize> {
        let mut bufs = [IoSliceMut::new(out)];
        chan.recv(1, &mut bufs, None)
    }

    #[test]
    fn test_partial_read_three_thirds() {
        let pool = HeapPackets::new(4, 2048);
        let chan = Chan::boxed().unwrap();
        let data: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let first = packet(&pool, &data);
        chan.deliver(first).unwrap();
        chan.deliver(packet(&pool, b"next")).unwrap();

        let mut out = [0u8; 500];
        for third in 0..3 {
            assert_eq!(recv_into(&chan, &mut out), Ok(500));
            assert_eq!(&out[..], &data[third * 500..(third + 1) * 500]);
            // The second descriptor stays queued
            assert_eq!(chan.pending_recv(), 1);
        }
        assert_eq!(chan.partial_remaining(), Some(0));
        assert_eq!(chan.reclaim(), Some(first.handle()));

        assert_eq!(recv_into(&chan, &mut out), Ok(4));
        assert_eq!(&out[..4], b"next");
        assert_eq!(chan.pending_recv(), 0);
        assert_eq!(recv_into(&chan, &mut out), Err(SockError::WouldBlock));
    }

    #[test]
    fn test_recv_spans_descriptors() {
        let pool = HeapPackets::new(4, 64);
        let chan = Chan::boxed().unwrap();
        chan.deliver(packet(&pool, b"abc")).unwrap();
        chan.deliver(packet(&pool, b"defgh")).unwrap();

        let mut out = [0u8; 6];
        assert_eq!(recv_into(&chan, &mut out), Ok(6));
        assert_eq!(&out, b"abcdef");
        assert_eq!(chan.partial_remaining(), Some(2));

        let mut src = Endpoint::UNSPECIFIED;
        chan.connect(Endpoint::new([10, 1, 1, 1], 80));
        let mut rest = [0u8; 16];
        let n = {
            let mut bufs = [IoSliceMut::new(&mut rest)];
            chan.recv(1, &mut bufs, Some(&mut src)).unwrap()
        };
        assert_eq!(&rest[..n], b"gh");
        assert_eq!(src, Endpoint::new([10, 1, 1, 1], 80));
    }

    #[test]
    fn test_overlapping_recv_is_refused() {
        let pool = HeapPackets::new(2, 64);
        let chan = Chan::boxed().unwrap();
        chan.deliver(packet(&pool, b"hello")).unwrap();

        let mut out = [0u8; 2];
        {
            let _held = chan.claim_reader().unwrap();
            assert!(chan.claim_reader().is_none());
            assert_eq!(recv_into(&chan, &mut out), Err(SockError::WouldBlock));
            assert_eq!(chan.partial_remaining(), None);
            assert_eq!(chan.pending_recv(), 1);
        }
        assert_eq!(recv_into(&chan, &mut out), Ok(2));
        assert_eq!(chan.partial_remaining(), Some(3));
    }

    #[test]
    fn test_concurrent_readers_split_stream() {
        const PACKETS: usize = 2000;
        let chan: std::sync::Arc<Chan> = Chan::boxed().unwrap().into();
        let pool = std::sync::Arc::new(HeapPackets::new(64, 16));
        let total = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let (chan, total) = (chan.clone(), total.clone());
                std::thread::spawn(move || {
                    let mut out = [0u8; 5];
                    while total.load(Ordering::Relaxed) < PACKETS * 16 {
                        if let Ok(n) = recv_into(&chan, &mut out) {
                            assert!(out[..n].iter().all(|&b| b == 0x5a));
                            total.fetch_add(n, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let mut delivered = 0;
        let mut reclaimed = 0;
        while reclaimed < PACKETS {
            while let Some(h) = chan.reclaim() {
                pool.free(h);
                reclaimed += 1;
            }
            if delivered < PACKETS {
                if let Some(p) = pool.alloc(16) {
                    unsafe { std::ptr::write_bytes(p.payload.as_ptr(), 0x5a, 16) };
                    let buf = TaggedBuf::new(p.handle, p.payload, 16).unwrap();
                    if chan.deliver(buf).is_ok() {
                        delivered += 1;
                    } else {
                        pool.free(p.handle);
                    }
                }
            }
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), PACKETS * 16);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_short_write_is_backpressure() {
        let chan = Chan::boxed().unwrap();
        let chunk = vec![1u8; STREAM_BYTES - 10];
        assert_eq!(chan.send(1, &[IoSlice::new(&chunk)], None), Ok(STREAM_BYTES - 10));
        assert_eq!(chan.server_wake().pending(), 1);

        let more = [2u8; 64];
        assert_eq!(chan.send(1, &[IoSlice::new(&more)], None), Ok(10));
        assert_eq!(chan.send(1, &[IoSlice::new(&more)], None), Err(SockError::WouldBlock));
        assert_eq!(chan.send(1, &[], None), Ok(0));
        assert_eq!(chan.server_wake().pending(), 1);

        let mut out = vec![0u8; 4096];
        assert_eq!(chan.drain_outbound(&mut out), 4096);
        assert_eq!(chan.client_wake().pending(), 1);
        assert_eq!(chan.drain_outbound(&mut out), 4096);
        assert_eq!(chan.client_wake().pending(), 1);
    }

    #[test]
    fn test_send_gathers_vectors_in_order() {
        let chan = Chan::boxed().unwrap();
        let n = chan
            .send(3, &[IoSlice::new(b"GET / "), IoSlice::new(b"HTTP/1.1\r\n")], None)
            .unwrap();
        assert_eq!(n, 16);
        let mut out = [0u8; 32];
        let got = chan.drain_outbound(&mut out);
        assert_eq!(&out[..got], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_deliver_edge_and_full_ring() {
        let pool = HeapPackets::new(RING_DEPTH + 1, 8);
        let chan = Chan::boxed().unwrap();
        for _ in 0..RING_DEPTH {
            chan.deliver(packet(&pool, b"z")).unwrap();
        }
        assert_eq!(chan.client_wake().pending(), 1);
        let spare = packet(&pool, b"z");
        assert_eq!(chan.deliver(spare), Err(SockError::WouldBlock));
        pool.free(spare.handle());

        let mut out = [0u8; 1];
        assert_eq!(recv_into(&chan, &mut out), Ok(1));
        assert_eq!(chan.server_wake().pending(), 1);
    }

    #[test]
    fn test_free_ring_full_stops_dequeue() {
        let pool = HeapPackets::new(RING_DEPTH + 2, 8);
        let chan = Chan::boxed().unwrap();
        let mut out = [0u8; 1];
        for _ in 0..RING_DEPTH {
            chan.deliver(packet(&pool, b"q")).unwrap();
            recv_into(&chan, &mut out).unwrap();
        }
        chan.deliver(packet(&pool, b"r")).unwrap();
        assert_eq!(recv_into(&chan, &mut out), Err(SockError::WouldBlock));
        assert_eq!(chan.pending_recv(), 1);

        let woken = chan.client_wake().pending();
        chan.reclaim().unwrap();
        assert_eq!(chan.client_wake().pending(), woken + 1);
        assert_eq!(recv_into(&chan, &mut out), Ok(1));
        assert_eq!(out[0], b'r');
    }

    #[test]
    fn test_drain_includes_partial() {
        let pool = HeapPackets::new(4, 64);
        let chan = Chan::boxed().unwrap();
        chan.deliver(packet(&pool, b"0123456789")).unwrap();
        chan.deliver(packet(&pool, b"tail")).unwrap();
        let mut out = [0u8; 3];
        recv_into(&chan, &mut out).unwrap();
        chan.send(1, &[IoSlice::new(b"unsent")], None).unwrap();

        assert_eq!(chan.drain(&mut |h| pool.free(h)), 2);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(chan.partial_remaining(), Some(0));
        assert_eq!(chan.pending_send(), 0);
    }

    #[test]
    fn test_cross_thread_echo() {
        const TOTAL: usize = 256 * 1024;
        let chan: std::sync::Arc<Chan> = Chan::boxed().unwrap().into();
        let pool = std::sync::Arc::new(HeapPackets::new(32, 1024));

        let server = {
            let (chan, pool) = (chan.clone(), pool.clone());
            std::thread::spawn(move || {
                let mut echoed = 0;
                let mut scratch = [0u8; 1024];
                while echoed < TOTAL {
                    while let Some(h) = chan.reclaim() {
                        pool.free(h);
                    }
                    let Some(p) = pool.alloc(1024) else { continue };
                    let n = chan.drain_outbound(&mut scratch);
                    if n == 0 {
                        pool.free(p.handle);
                        continue;
                    }
                    unsafe {
                        std::ptr::copy_nonoverlapping(scratch.as_ptr(), p.payload.as_ptr(), n)
                    };
                    let buf = TaggedBuf::new(p.handle, p.payload, n as u16).unwrap();
                    while let Err(SockError::WouldBlock) = chan.deliver(buf) {
                        while let Some(h) = chan.reclaim() {
                            pool.free(h);
                        }
                    }
                    echoed += n;
                }
            })
        };

        let source: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let mut sent = 0;
        let mut received = 0;
        let mut out = [0u8; 700];
        while received < TOTAL {
            if sent < TOTAL {
                let end = (sent + 4000).min(TOTAL);
                if let Ok(n) = chan.send(1, &[IoSlice::new(&source[sent..end])], None) {
                    sent += n;
                }
            }
            if let Ok(n) = recv_into(&chan, &mut out) {
                assert_eq!(&out[..n], &source[received..received + n]);
                received += n;
            }
        }
        server.join().unwrap();
    }

    /// Both sides sleep on real eventfds with no timeout, so a missed edge
    /// hangs the waiter and the test fails on the deadline instead.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    mod blocking {
        use super::*;
        use crate::eventfd_notifier::EventFdNotifier;
        use nix::poll::PollTimeout;
        use std::sync::{mpsc, Arc};
        use std::time::Duration;

        type Chan = StreamChannel<EventFdNotifier>;

        /// Irregular pacing: mostly none, some yields, a few sleeps.
        fn jitter(state: &mut u64) {
            *state ^= *state << 13;
            *state ^= *state >> 7;
            *state ^= *state << 17;
            match *state % 64 {
                0 => std::thread::sleep(Duration::from_micros(200)),
                1..=8 => std::thread::yield_now(),
                _ => {}
            }
        }

        #[test]
        fn test_send_drain_never_misses_wakeup() {
            const WRITES: usize = 4_000;
            let chan: Arc<Chan> = Chan::boxed().unwrap().into();
            let mut rng = 0x9e37_79b9_7f4a_7c15u64;
            let lens: Vec<usize> = (0..WRITES).map(|i| 1 + (i * 7919) % 2000).collect();
            let total: usize = lens.iter().sum();
            let (done_tx, done_rx) = mpsc::channel();

            let server = {
                let chan = chan.clone();
                std::thread::spawn(move || {
                    let mut got = 0usize;
                    let mut scratch = vec![0u8; 3000];
                    while got < total {
                        chan.server_clear().unwrap();
                        loop {
                            let n = chan.drain_outbound(&mut scratch);
                            if n == 0 {
                                break;
                            }
                            for (i, b) in scratch[..n].iter().enumerate() {
                                assert_eq!(*b, ((got + i) % 251) as u8);
                            }
                            got += n;
                        }
                        if got < total {
                            chan.server_wake().wait(PollTimeout::NONE).unwrap();
                        }
                    }
                    done_tx.send(()).unwrap();
                })
            };

            let source: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
            let mut at = 0;
            for len in lens {
                let mut chunk = &source[at..at + len];
                while !chunk.is_empty() {
                    match chan.send(1, &[IoSlice::new(chunk)], None) {
                        Ok(n) => chunk = &chunk[n..],
                        Err(SockError::WouldBlock) => std::thread::yield_now(),
                        Err(e) => panic!("send failed: {}", e),
                    }
                }
                at += len;
                jitter(&mut rng);
            }

            done_rx
                .recv_timeout(Duration::from_secs(60))
                .expect("server stalled waiting for a wakeup");
            server.join().unwrap();
        }

        #[test]
        fn test_deliver_recv_never_misses_wakeup() {
            const PACKETS: u64 = 5_000;
            let chan: Arc<Chan> = Chan::boxed().unwrap().into();
            let pool = Arc::new(HeapPackets::new(2 * RING_DEPTH + 8, 8));
            let (done_tx, done_rx) = mpsc::channel();

            let client = {
                let chan = chan.clone();
                std::thread::spawn(move || {
                    let mut expected = 0u64;
                    let mut out = [0u8; 8];
                    while expected < PACKETS {
                        chan.recv_clear().unwrap();
                        loop {
                            let mut bufs = [IoSliceMut::new(&mut out)];
                            match chan.recv(1, &mut bufs, None) {
                                Ok(8) => {
                                    assert_eq!(u64::from_ne_bytes(out), expected);
                                    expected += 1;
                                }
                                Ok(n) => panic!("short read of {} bytes", n),
                                Err(SockError::WouldBlock) => break,
                                Err(e) => panic!("recv failed: {}", e),
                            }
                        }
                        if expected < PACKETS {
                            chan.client_wake().wait(PollTimeout::NONE).unwrap();
                        }
                    }
                    done_tx.send(()).unwrap();
                })
            };

            let server = {
                let (chan, pool) = (chan.clone(), pool.clone());
                std::thread::spawn(move || {
                    let mut rng = 0x2545_f491_4f6c_dd1du64;
                    let mut sent = 0u64;
                    let mut reclaimed = 0u64;
                    let mut reclaim_all = || {
                        while let Some(h) = chan.reclaim() {
                            pool.free(h);
                            reclaimed += 1;
                        }
                        reclaimed
                    };
                    while sent < PACKETS {
                        // Reclaim lazily so the free ring fills up
                        let Some(p) = pool.alloc(8) else {
                            reclaim_all();
                            std::thread::yield_now();
                            continue;
                        };
                        unsafe { (p.payload.as_ptr() as *mut u64).write_unaligned(sent) };
                        let buf = TaggedBuf::new(p.handle, p.payload, 8).unwrap();
                        if chan.deliver(buf).is_ok() {
                            sent += 1;
                        } else {
                            pool.free(p.handle);
                            reclaim_all();
                            std::thread::yield_now();
                        }
                        jitter(&mut rng);
                    }
                    while reclaim_all() < PACKETS {
                        std::thread::yield_now();
                    }
                })
            };

            done_rx
                .recv_timeout(Duration::from_secs(60))
                .expect("client stalled waiting for a wakeup");
            client.join().unwrap();
            server.join().unwrap();
        }
    }
}

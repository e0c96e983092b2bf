//! `DatagramChannel` — per-socket transport for UDP and raw sockets.
//!
//! ```text
//!            client                               server (stack)
//!   send ───► tx  [SendEntry; RING_DEPTH] ───► take
//!   recv ◄─── rx  [RecvEntry; RING_DEPTH] ◄─── deliver
//!   recv ───► ret [TaggedBuf; RING_DEPTH] ───► reclaim
//!        client_wake ◄── signal          signal ──► server_wake
//! ```
//!
//! Each ring has exactly one producer and one consumer. Wakeups are raised
//! only on ring edges:
//!
//! - `send` signals the server when `tx` goes empty → non-empty.
//! - `recv` signals the server when `rx` goes full → non-full.
//! - `deliver` signals the client when `rx` goes empty → non-empty.
//! - `take` signals the client when `tx` goes full → non-full.
//! - `reclaim` signals the client when `ret` goes full → non-full.
//!
//! A client refused with `ReturnRingFull` signals the server once so it
//! gets to reclaim, and sleeps until that reclaim wakes it.

use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use sockem_core::constants::{MAX_IOV, RING_DEPTH};
use sockem_core::error::{Result, SockError};
use sockem_core::notifier::Notifier;
use sockem_core::{Endpoint, IoVec, RecvEntry, SendEntry, TaggedBuf};

use crate::channel_pool::PoolChannel;
use crate::iov;
use crate::spsc_ring::SpscRing;

/// Outcome of a datagram receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Bytes copied into the caller's buffers.
    pub len: usize,
    /// Sender of the datagram.
    pub src: Endpoint,
    /// Bytes of the datagram that did not fit and were discarded.
    pub remaining: usize,
}

#[repr(C)]
pub struct DatagramChannel<W: Notifier> {
    rx: SpscRing<RecvEntry, RING_DEPTH>,
    tx: SpscRing<SendEntry, RING_DEPTH>,
    ret: SpscRing<TaggedBuf, RING_DEPTH>,
    client_wake: W,
    server_wake: W,
    flags: AtomicI32,
    /// Default destination set by connect (`Endpoint::to_bits`).
    peer: AtomicU64,
}

impl<W: Notifier> DatagramChannel<W> {
    /// Heap-allocate and initialize a channel outside any pool.
    pub fn boxed() -> Result<Box<Self>> {
        let mut slot = Box::new(MaybeUninit::<Self>::zeroed());
        // SAFETY: freshly allocated, aligned, exclusively ours.
        unsafe {
            <Self as PoolChannel>::init_at(slot.as_mut_ptr())?;
            Ok(Box::from_raw(Box::into_raw(slot).cast::<Self>()))
        }
    }

    fn wake(&self, n: &W, who: &'static str) {
        tracing::trace!(who, "datagram wakeup");
        if let Err(e) = n.signal() {
            tracing::warn!(who, error = %e, "datagram wakeup failed");
        }
    }

    // ── Client side ──

    /// Queue one datagram built from `iov`.
    ///
    /// `dest` overrides the connected peer. The bytes are referenced, not
    /// copied: they must stay untouched until the server has taken the
    /// entry. Returns the datagram length.
    pub fn send(&self, pid: u32, iov: &[IoSlice<'_>], dest: Option<Endpoint>) -> Result<usize> {
        let dest = dest.unwrap_or_else(|| self.peer());
        if dest.is_unspecified() {
            return Err(SockError::DestinationRequired);
        }
        if iov.len() > MAX_IOV {
            return Err(SockError::TooManyVectors(iov.len()));
        }
        let mut raw = [IoVec::EMPTY; MAX_IOV];
        for (r, s) in raw.iter_mut().zip(iov) {
            *r = IoVec::from_slice(s);
        }
        let entry = SendEntry::new(pid, dest, &raw[..iov.len()])?;

        let pushed = self.tx.push_tracked(entry).ok_or(SockError::WouldBlock)?;
        if pushed.was_empty {
            self.wake(&self.server_wake, "server");
        }
        Ok(entry.total_len())
    }

    /// Receive one datagram into `bufs`, truncating what does not fit.
    ///
    /// The consumed buffer handle goes onto the return ring. If that ring
    /// is full nothing is consumed and `ReturnRingFull` is returned.
    pub fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<RecvInfo> {
        // Sole producer on `ret`: room now means room after the pop.
        if self.ret.is_full() {
            self.wake(&self.server_wake, "server");
            return Err(SockError::ReturnRingFull);
        }
        let popped = self.rx.pop_tracked().ok_or(SockError::WouldBlock)?;
        if popped.was_full {
            self.wake(&self.server_wake, "server");
        }

        let entry = popped.value;
        // SAFETY: the stack keeps the buffer alive until it reclaims the
        // handle from the return ring.
        let data = unsafe { entry.buf.bytes() };
        let len = iov::scatter(data, bufs, 0);
        let remaining = data.len() - len;
        if remaining > 0 {
            tracing::trace!(len, remaining, "datagram truncated");
        }

        if self.ret.push(entry.buf) {
            Ok(RecvInfo { len, src: entry.src, remaining })
        } else {
            tracing::error!(handle = ?entry.buf.handle(), "return ring overflow");
            Err(SockError::ReturnRingFull)
        }
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

    /// Default destination for sends without one.
    pub fn peer(&self) -> Endpoint {
        Endpoint::from_bits(self.peer.load(Ordering::Relaxed))
    }

    pub fn connect(&self, peer: Endpoint) {
        self.peer.store(peer.to_bits(), Ordering::Relaxed);
    }

    // ── Server side ──

    /// Hand a received datagram to the client.
    ///
    /// On `WouldBlock` the buffer still belongs to the caller.
    pub fn deliver(&self, buf: TaggedBuf, src: Endpoint) -> Result<()> {
        let pushed = self
            .rx
            .push_tracked(RecvEntry { buf, src })
            .ok_or(SockError::WouldBlock)?;
        if pushed.was_empty {
            self.wake(&self.client_wake, "client");
        }
        Ok(())
    }

    /// Next queued send request.
    pub fn take(&self) -> Option<SendEntry> {
        let popped = self.tx.pop_tracked()?;
        if popped.was_full {
            self.wake(&self.client_wake, "client");
        }
        Some(popped.value)
    }

    /// Next buffer handle the client is done with.
    pub fn reclaim(&self) -> Option<NonNull<u8>> {
        let popped = self.ret.pop_tracked()?;
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

    /// Datagrams waiting for the client.
    pub fn pending_recv(&self) -> usize {
        self.rx.len()
    }

    /// Send requests waiting for the server.
    pub fn pending_send(&self) -> usize {
        self.tx.len()
    }
}

impl<W: Notifier> PoolChannel for DatagramChannel<W> {
    const KIND: &'static str = "datagram";

    unsafe fn init_at(slot: *mut Self) -> Result<()> {
        let client_wake = W::create()?;
        let server_wake = W::create()?;
        SpscRing::init_at(ptr::addr_of_mut!((*slot).rx));
        SpscRing::init_at(ptr::addr_of_mut!((*slot).tx));
        SpscRing::init_at(ptr::addr_of_mut!((*slot).ret));
        ptr::addr_of_mut!((*slot).client_wake).write(client_wake);
        ptr::addr_of_mut!((*slot).server_wake).write(server_wake);
        ptr::addr_of_mut!((*slot).flags).write(AtomicI32::new(0));
        ptr::addr_of_mut!((*slot).peer).write(AtomicU64::new(0));
        Ok(())
    }

    fn drain(&self, sink: &mut dyn FnMut(NonNull<u8>)) -> usize {
        let mut n = 0;
        while let Some(entry) = self.rx.pop() {
            sink(entry.buf.handle());
            n += 1;
        }
        while let Some(buf) = self.ret.pop() {
            sink(buf.handle());
            n += 1;
        }
        // Send entries reference client memory only.
        while self.tx.pop().is_some() {}
        n
    }
}

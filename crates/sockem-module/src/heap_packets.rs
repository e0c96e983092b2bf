//! `HeapPackets` — default `PacketAllocator` implementation.
//!
//! Stands in for the network stack's packet pool. One heap block is carved
//! into `count` equal buffers at construction; each buffer starts with
//! `HEADROOM` bytes the stack would use for its own metadata, followed by
//! the payload region. Handle = buffer start, payload = start + headroom,
//! the same split an mbuf has.
//!
//! The free list is a lock-free `ArrayQueue` of buffer indices, so `alloc`
//! and `free` can be called from the client and server threads at once.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use sockem_core::buffer::{PacketAllocator, PacketBuf};

use crate::config::TransportConfig;

/// Bytes reserved in front of every payload.
pub const HEADROOM: usize = 64;

pub struct HeapPackets {
    base: NonNull<u8>,
    /// Bytes from one buffer start to the next.
    stride: usize,
    /// Payload bytes per buffer.
    size: usize,
    count: usize,
    free: ArrayQueue<usize>,
    /// One bit per buffer, set while the buffer is handed out.
    live: Box<[AtomicU64]>,
    in_use: AtomicUsize,
}

// Safety: the block is only reached through handles the free list hands
// out, one owner per buffer.
unsafe impl Send for HeapPackets {}
unsafe impl Sync for HeapPackets {}

impl HeapPackets {
    /// `count` buffers of `size` payload bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        let count = count.max(1);
        let stride = (HEADROOM + size).next_multiple_of(HEADROOM);
        let mut block = vec![0u8; count * stride];
        let base = block.as_mut_ptr();
        std::mem::forget(block); // reclaimed in Drop

        let free = ArrayQueue::new(count);
        for i in 0..count {
            let _ = free.push(i);
        }
        tracing::debug!(count, size, stride, "packet pool ready");

        Self {
            // SAFETY: Vec data pointer of a non-empty allocation.
            base: unsafe { NonNull::new_unchecked(base) },
            stride,
            size,
            count,
            free,
            live: (0..count.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self::new(cfg.packets, cfg.packet_size)
    }

    /// Payload bytes per buffer.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    fn index_of(&self, handle: NonNull<u8>) -> Option<usize> {
        let addr = handle.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        let off = addr.checked_sub(base)?;
        if off % self.stride != 0 || off / self.stride >= self.count {
            return None;
        }
        Some(off / self.stride)
    }
}

impl PacketAllocator for HeapPackets {
    fn alloc(&self, len: usize) -> Option<PacketBuf> {
        if len > self.size {
            return None;
        }
        let idx = self.free.pop()?;
        self.live[idx / 64].fetch_or(1u64 << (idx % 64), Ordering::AcqRel);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        // SAFETY: idx < count, so both offsets stay inside the block.
        unsafe {
            let handle = self.base.as_ptr().add(idx * self.stride);
            Some(PacketBuf {
                handle: NonNull::new_unchecked(handle),
                payload: NonNull::new_unchecked(handle.add(HEADROOM)),
                capacity: self.size,
            })
        }
    }

    fn free(&self, handle: NonNull<u8>) {
        let Some(idx) = self.index_of(handle) else {
            tracing::error!(handle = ?handle, "free of foreign packet handle ignored");
            return;
        };
        let bit = 1u64 << (idx % 64);
        if self.live[idx / 64].fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            tracing::error!(idx, "double free of packet handle ignored");
            return;
        }
        if self.free.push(idx).is_err() {
            tracing::error!(idx, "packet free list overflow");
            return;
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    fn pool_size(&self) -> usize {
        self.count
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl Drop for HeapPackets {
    fn drop(&mut self) {
        let outstanding = self.in_use.load(Ordering::Relaxed);
        if outstanding != 0 {
            tracing::warn!(outstanding, "packet pool dropped with buffers in use");
        }
        let len = self.count * self.stride;
        // SAFETY: rebuilds the Vec forgotten in `new`.
        unsafe {
            drop(Vec::from_raw_parts(self.base.as_ptr(), len, len));
        }
    }
}

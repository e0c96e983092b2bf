//! `ByteRing` — SPSC ring of raw bytes.
//!
//! The outbound half of a stream channel. Same index protocol as
//! [`SpscRing`](crate::spsc_ring::SpscRing), but the unit is a byte and
//! writes/reads move as many bytes as fit instead of failing outright.
//! No framing: the consumer sees one continuous byte run.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::spsc_ring::CacheAligned;

#[repr(C)]
pub struct ByteRing<const N: usize> {
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    buf: UnsafeCell<[u8; N]>,
}

// Safety: byte ranges are handed across by the head/tail protocol, exactly
// as for SpscRing slots.
unsafe impl<const N: usize> Send for ByteRing<N> {}
unsafe impl<const N: usize> Sync for ByteRing<N> {}

impl<const N: usize> ByteRing<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "byte ring size must be a power of 2");
        N - 1
    };

    pub fn new() -> Self {
        Self {
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
            buf: UnsafeCell::new([0; N]),
        }
    }

    /// Initialize in place; the data area is left as-is.
    ///
    /// # Safety
    /// `this` must be valid for writes and suitably aligned.
    pub unsafe fn init_at(this: *mut Self) {
        let _ = Self::MASK;
        ptr::addr_of_mut!((*this).head).write(CacheAligned(AtomicUsize::new(0)));
        ptr::addr_of_mut!((*this).tail).write(CacheAligned(AtomicUsize::new(0)));
    }

    #[inline(always)]
    fn data(&self) -> *mut u8 {
        self.buf.get() as *mut u8
    }

    // ── Producer ──

    /// Copy as much of `src` as fits. Returns bytes written (0 if full).
    pub fn write(&self, src: &[u8]) -> usize {
        self.write_tracked(src).0
    }

    /// Like `write`, also reporting whether the ring was empty before.
    pub fn write_tracked(&self, src: &[u8]) -> (usize, bool) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let free = N - tail.wrapping_sub(head);
        let n = free.min(src.len());
        if n == 0 {
            return (0, false);
        }

        let idx = tail & Self::MASK;
        let first = n.min(N - idx);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(idx), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), n - first);
        }
        self.tail.store(tail.wrapping_add(n), Ordering::Release);

        fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Relaxed);
        (n, head == tail)
    }

    // ── Consumer ──

    /// Copy up to `dst.len()` bytes out. Returns bytes read (0 if empty).
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.read_tracked(dst).0
    }

    /// Like `read`, also reporting whether the ring was full before.
    pub fn read_tracked(&self, dst: &mut [u8]) -> (usize, bool) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let avail = tail.wrapping_sub(head);
        let n = avail.min(dst.len());
        if n == 0 {
            return (0, false);
        }

        let idx = head & Self::MASK;
        let first = n.min(N - idx);
        unsafe {
            ptr::copy_nonoverlapping(self.data().add(idx), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(first), n - first);
        }
        self.head.store(head.wrapping_add(n), Ordering::Release);

        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Relaxed);
        (n, tail.wrapping_sub(head) == N)
    }

    /// Drop everything currently buffered. Consumer side only.
    pub fn discard(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
        tail.wrapping_sub(head)
    }

    // ── Observers ──

    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the producer can write right now.
    #[inline]
    pub fn free(&self) -> usize {
        N - self.len()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

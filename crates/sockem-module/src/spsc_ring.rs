//! `SpscRing` — bounded single-producer / single-consumer ring.
//!
//! The foundation of every channel queue. Lives inside channel memory, so
//! it holds no pointers: two cache-line-padded indices plus an inline slot
//! array.
//!
//! # Roles
//!
//! - **Producer:** sole writer of `tail`. Writes the slot, then publishes
//!   `tail` with Release.
//! - **Consumer:** sole writer of `head`. Loads `tail` with Acquire before
//!   reading the slot, then publishes `head` with Release.
//!
//! Two producers (or two consumers) on one ring is undefined.
//!
//! # Indices
//!
//! head and tail are monotonically increasing `usize`. Actual index = val & mask.
//! Ring is empty when head == tail.
//! Ring is full when (tail - head) == N.
//!
//! # Wakeup edges
//!
//! `push_tracked` / `pop_tracked` additionally report whether the operation
//! crossed the empty→non-empty (push) or full→non-full (pop) edge. The edge
//! is computed from the peer index loaded *after* publishing, behind a
//! SeqCst fence, so a peer that drains concurrently either sees our slot or
//! is reported to us as needing a wakeup.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Cache-line-aligned wrapper keeping producer and consumer indices apart.
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Outcome of a successful `push_tracked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Pushed {
    /// The ring held only this value right after the push.
    pub was_empty: bool,
}

/// Outcome of a successful `pop_tracked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Popped<T> {
    pub value: T,
    /// The ring was full right before the pop.
    pub was_full: bool,
}

#[repr(C)]
pub struct SpscRing<T: Copy, const N: usize> {
    /// Consumer position.
    head: CacheAligned<AtomicUsize>,
    /// Producer position.
    tail: CacheAligned<AtomicUsize>,
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

// Safety: slots are handed across by the head/tail protocol; each slot is
// written only by the producer while outside [head, tail) and read only by
// the consumer while inside it.
unsafe impl<T: Copy + Send, const N: usize> Send for SpscRing<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T: Copy, const N: usize> SpscRing<T, N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ring capacity must be a power of 2");
        N - 1
    };

    pub fn new() -> Self {
        Self {
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
        }
    }

    /// Initialize a ring in place (shared memory, pool slot).
    ///
    /// Only the indices are written; slots stay uninitialized until pushed.
    ///
    /// # Safety
    /// `this` must be valid for writes and suitably aligned.
    pub unsafe fn init_at(this: *mut Self) {
        let _ = Self::MASK;
        ptr::addr_of_mut!((*this).head).write(CacheAligned(AtomicUsize::new(0)));
        ptr::addr_of_mut!((*this).tail).write(CacheAligned(AtomicUsize::new(0)));
    }

    // ── Producer methods ──

    /// Push a value. Returns false iff the ring is full.
    #[inline]
    pub fn push(&self, value: T) -> bool {
        self.publish(value).is_some()
    }

    /// Push a value and report whether the ring was empty.
    ///
    /// `None` if the ring is full.
    #[inline]
    pub fn push_tracked(&self, value: T) -> Option<Pushed> {
        let tail = self.publish(value)?;
        fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Relaxed);
        Some(Pushed { was_empty: head == tail })
    }

    /// Write the slot and advance tail. Returns the pre-push tail.
    #[inline]
    fn publish(&self, value: T) -> Option<usize> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            return None;
        }
        let idx = tail & Self::MASK;
        unsafe {
            (*self.slots[idx].get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(tail)
    }

    // ── Consumer methods ──

    /// Pop the oldest value. `None` iff the ring is empty.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.consume().map(|(value, _)| value)
    }

    /// Pop a value and report whether the ring was full before.
    #[inline]
    pub fn pop_tracked(&self) -> Option<Popped<T>> {
        let (value, head) = self.consume()?;
        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Relaxed);
        Some(Popped {
            value,
            was_full: tail.wrapping_sub(head) == N,
        })
    }

    /// Read the head slot and advance head. Returns the pre-pop head.
    #[inline]
    fn consume(&self) -> Option<(T, usize)> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head & Self::MASK;
        let value = unsafe { (*self.slots[idx].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some((value, head))
    }

    // ── Observers (either side; exact only for the calling role) ──

    /// Number of values currently in the ring.
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

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy, const N: usize> Default for SpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

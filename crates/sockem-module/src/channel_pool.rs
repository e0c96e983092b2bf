//! `ChannelPool` — typed channel allocation on top of `SlabPool`.
//!
//! One pool per channel kind per process, shared by every socket of that
//! kind. The slab itself is not thread safe, so it sits behind a mutex;
//! the lock is only taken on socket open and close, never on the data path.
//!
//! A channel is handed out as a [`PooledChannel`], the socket's owning
//! guard. The stack side of the channel attaches through
//! [`PooledChannel::attach`]. The slot goes back to the pool when the last
//! of these is dropped, and before that every buffer handle still parked in
//! the channel is drained back to the packet allocator.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sockem_core::buffer::PacketAllocator;
use sockem_core::error::{Result, SockError};

use crate::shared_region::Offset;
use crate::slab_pool::SlabPool;

/// A channel type that can live in a pool slot.
pub trait PoolChannel: Send + Sync + Sized {
    /// Short name for logs.
    const KIND: &'static str;

    /// Construct a channel in place.
    ///
    /// # Safety
    /// `slot` must be valid for writes of `Self`, suitably aligned and not
    /// aliased. On error nothing needing drop has been written.
    unsafe fn init_at(slot: *mut Self) -> Result<()>;

    /// Hand every buffer handle still referenced by the channel to `sink`
    /// and return how many there were. Only called once both sides are done.
    fn drain(&self, sink: &mut dyn FnMut(NonNull<u8>)) -> usize;
}

pub struct ChannelPool<C: PoolChannel> {
    slab: Mutex<SlabPool>,
    /// Where drained buffer handles go.
    reclaim: Arc<dyn PacketAllocator>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: PoolChannel> ChannelPool<C> {
    /// A pool of exactly `slots` channels.
    pub fn new(slots: usize, reclaim: Arc<dyn PacketAllocator>) -> Result<Arc<Self>> {
        let slab = SlabPool::with_slots(slots, size_of::<C>())?;
        tracing::debug!(
            kind = C::KIND,
            slots = slab.capacity(),
            slot_size = slab.slot_size(),
            "channel pool created"
        );
        Ok(Arc::new(Self {
            slab: Mutex::new(slab),
            reclaim,
            _marker: PhantomData,
        }))
    }

    fn slab(&self) -> MutexGuard<'_, SlabPool> {
        self.slab.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a fresh channel. Never blocks on exhaustion.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledChannel<C>> {
        let slot = self.slab().acquire().ok_or_else(|| {
            tracing::debug!(kind = C::KIND, "channel pool exhausted");
            SockError::PoolExhausted
        })?;

        let chan = slot.cast::<C>();
        // SAFETY: a slot is at least size_of::<C>() bytes, sits a multiple of
        // its power-of-two size past a page-aligned base, and is ours until
        // released.
        if let Err(e) = unsafe { C::init_at(chan.as_ptr()) } {
            tracing::debug!(kind = C::KIND, error = %e, "channel init failed");
            if let Err(re) = self.slab().release(slot) {
                tracing::error!(kind = C::KIND, error = %re, "channel slot release failed");
                debug_assert!(false, "channel slot release failed: {}", re);
            }
            return Err(e);
        }
        tracing::debug!(kind = C::KIND, chan = ?chan, "channel acquired");

        Ok(PooledChannel {
            lease: Arc::new(Lease { pool: Arc::clone(self), chan }),
        })
    }

    /// Resolve an offset received from the other side of the region.
    ///
    /// `None` unless `off` names the start of a slot. Whether that slot is
    /// currently live is up to the caller.
    pub fn channel_at(&self, off: Offset) -> Option<NonNull<C>> {
        let slab = self.slab();
        if off.0 % slab.slot_size() != 0 || off.0 / slab.slot_size() >= slab.capacity() {
            return None;
        }
        // SAFETY: in range of the carved slots.
        Some(unsafe { NonNull::new_unchecked(slab.base().as_ptr().add(off.0)) }.cast())
    }

    pub fn capacity(&self) -> usize {
        self.slab().capacity()
    }

    pub fn available(&self) -> usize {
        self.slab().available()
    }

    pub fn in_use(&self) -> usize {
        self.slab().in_use()
    }
}

/// One live channel: releases its slot when the last reference goes.
struct Lease<C: PoolChannel> {
    pool: Arc<ChannelPool<C>>,
    chan: NonNull<C>,
}

// Safety: the slot is exclusively leased; C itself is Send + Sync.
unsafe impl<C: PoolChannel> Send for Lease<C> {}
unsafe impl<C: PoolChannel> Sync for Lease<C> {}

impl<C: PoolChannel> Drop for Lease<C> {
    fn drop(&mut self) {
        // SAFETY: the lease holds the only references to an initialized slot.
        let chan = unsafe { self.chan.as_ref() };
        let reclaim = &self.pool.reclaim;
        let drained = chan.drain(&mut |h| reclaim.free(h));
        if drained > 0 {
            tracing::warn!(kind = C::KIND, drained, "buffers drained at channel close");
        }

        unsafe { ptr::drop_in_place(self.chan.as_ptr()) };

        if let Err(e) = self.pool.slab().release(self.chan.cast()) {
            tracing::error!(kind = C::KIND, error = %e, "channel slot release failed");
            debug_assert!(false, "channel slot release failed: {}", e);
        } else {
            tracing::debug!(kind = C::KIND, chan = ?self.chan, "channel released");
        }
    }
}

/// The socket's owning handle on a pooled channel.
pub struct PooledChannel<C: PoolChannel> {
    lease: Arc<Lease<C>>,
}

impl<C: PoolChannel> PooledChannel<C> {
    /// A handle for the stack side of the channel.
    pub fn attach(&self) -> ChannelRef<C> {
        ChannelRef { lease: Arc::clone(&self.lease) }
    }

    /// Position of the channel inside the pool region.
    pub fn offset(&self) -> Offset {
        let base = self.lease.pool.slab().base().as_ptr() as usize;
        Offset(self.lease.chan.as_ptr() as usize - base)
    }
}

impl<C: PoolChannel> Deref for PooledChannel<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // SAFETY: initialized in acquire, alive while the lease is.
        unsafe { self.lease.chan.as_ref() }
    }
}

/// A stack-side reference to a pooled channel.
pub struct ChannelRef<C: PoolChannel> {
    lease: Arc<Lease<C>>,
}

impl<C: PoolChannel> Clone for ChannelRef<C> {
    fn clone(&self) -> Self {
        Self { lease: Arc::clone(&self.lease) }
    }
}

impl<C: PoolChannel> Deref for ChannelRef<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // SAFETY: as for PooledChannel.
        unsafe { self.lease.chan.as_ref() }
    }
}

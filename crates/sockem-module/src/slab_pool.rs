//! `SlabPool` — fixed-size-block allocator over a contiguous region.
//!
//! Hands out channel instances by address. The region is carved once at
//! construction into power-of-two slots and every slot is threaded onto an
//! intrusive free list written directly into the unused slot memory.
//!
//! ```text
//! base                                               base + region_size
//! |slot 0|slot 1|slot 2| ... |slot k-1|  tail < slot_size, never carved |
//!    │      ▲
//!    └next──┘   (free list lives inside free slots)
//! ```
//!
//! Carving stops at the first offset where `offset + slot_size` is not
//! strictly below `region_size`, so the final `<= slot_size` bytes are
//! always wasted. A 4096-byte region with 64-byte slots yields 63 slots.
//!
//! Reuse is LIFO: the most recently released slot is acquired next.
//!
//! # Thread safety
//!
//! None. Callers serialize access (see `ChannelPool`, which wraps this in a
//! mutex) or keep one pool per ownership domain.

use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use sockem_core::error::{Result, SockError};

use crate::shared_region::SharedRegion;

/// Free-list link stored in the first word of every free slot.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

pub struct SlabPool {
    base: NonNull<u8>,
    region_size: usize,
    slot_size: usize,
    /// Head of the intrusive free list (null when exhausted).
    free: *mut FreeNode,
    /// Slots carved at construction.
    capacity: usize,
    /// Slots currently on the free list.
    available: usize,
    /// One bit per carved slot, set while the slot is handed out.
    live: Vec<u64>,
    /// Backing mapping when the pool owns it.
    _region: Option<SharedRegion>,
}

// Safety: the pool exclusively manages its free list; the caller provides
// mutual exclusion (&mut self on every mutating method).
unsafe impl Send for SlabPool {}

impl SlabPool {
    /// Slot size used for items of `item_size` bytes.
    pub fn slot_size_for(item_size: usize) -> usize {
        item_size.max(size_of::<FreeNode>()).next_power_of_two()
    }

    /// Build a pool over caller-provided memory.
    ///
    /// # Safety
    /// `base..base+region_size` must be valid for reads and writes, aligned
    /// for a pointer, and unused by anything else for the pool's lifetime.
    pub unsafe fn from_raw_parts(
        base: NonNull<u8>,
        region_size: usize,
        item_size: usize,
    ) -> Result<Self> {
        let slot_size = Self::slot_size_for(item_size);
        if region_size < slot_size {
            return Err(SockError::RegionTooSmall {
                region: region_size,
                slot: slot_size,
            });
        }
        debug_assert_eq!(base.as_ptr() as usize % align_of::<FreeNode>(), 0);

        let mut capacity = 0;
        while (capacity + 1) * slot_size < region_size {
            capacity += 1;
        }

        // Thread back to front so the lowest slot is handed out first.
        let mut free: *mut FreeNode = ptr::null_mut();
        for i in (0..capacity).rev() {
            let node = base.as_ptr().add(i * slot_size) as *mut FreeNode;
            node.write(FreeNode { next: free });
            free = node;
        }

        tracing::debug!(region_size, slot_size, capacity, "slab pool carved");

        Ok(Self {
            base,
            region_size,
            slot_size,
            free,
            capacity,
            available: capacity,
            live: vec![0; capacity.div_ceil(64)],
            _region: None,
        })
    }

    /// Build a pool that owns `region`.
    pub fn new(region: SharedRegion, item_size: usize) -> Result<Self> {
        // SAFETY: the mapping is page aligned, exclusively ours, and moves
        // into the pool so it outlives every slot.
        let mut pool = unsafe { Self::from_raw_parts(region.base(), region.len(), item_size)? };
        pool._region = Some(region);
        Ok(pool)
    }

    /// Map a fresh region sized for exactly `slots` items.
    pub fn with_slots(slots: usize, item_size: usize) -> Result<Self> {
        let slot_size = Self::slot_size_for(item_size);
        let region = SharedRegion::anonymous((slots + 1) * slot_size)?;
        Self::new(region, item_size)
    }

    /// Take a slot. `None` when exhausted. O(1).
    pub fn acquire(&mut self) -> Option<NonNull<u8>> {
        let node = NonNull::new(self.free)?;
        // SAFETY: every node on the list was written by us into a slot
        // that is still free.
        self.free = unsafe { (*node.as_ptr()).next };
        self.available -= 1;
        let idx = self.index_of(node.as_ptr() as usize);
        self.live[idx / 64] |= 1u64 << (idx % 64);
        Some(node.cast())
    }

    /// Give a slot back.
    ///
    /// An address that is not the start of a carved slot, or a slot that is
    /// not currently handed out (double free), is a caller bug. It is logged
    /// at error level and refused so the free list is never corrupted.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        if !self.is_slot_start(addr) || !self.is_live(addr) {
            tracing::error!(
                addr = format_args!("{:#x}", addr),
                base = ?self.base,
                region_size = self.region_size,
                available = self.available,
                "invalid slab release"
            );
            return Err(SockError::InvalidRelease { addr });
        }

        let node = ptr.as_ptr() as *mut FreeNode;
        // SAFETY: addr is the start of a carved slot inside our region.
        unsafe { node.write(FreeNode { next: self.free }) };
        self.free = node;
        self.available += 1;
        let idx = self.index_of(addr);
        self.live[idx / 64] &= !(1u64 << (idx % 64));
        Ok(())
    }

    /// Slot index of a carved slot start.
    fn index_of(&self, addr: usize) -> usize {
        (addr - self.base.as_ptr() as usize) / self.slot_size
    }

    fn is_live(&self, addr: usize) -> bool {
        let idx = self.index_of(addr);
        self.live[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    fn is_slot_start(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        if addr < base {
            return false;
        }
        let off = addr - base;
        off % self.slot_size == 0 && off / self.slot_size < self.capacity
    }

    /// Whether `ptr` lies anywhere in the managed region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.region_size
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity - self.available
    }
}

//! Packet buffer abstraction.
//!
//! The network stack owns all packet memory. The transport only carries
//! references to it (tagged descriptors) and hands consumed handles back.
//! This trait is the narrow interface to the stack's allocator:
//! "give me a buffer handle and payload region" and "take this handle back".
//!
//! # Implementors
//!
//! - `HeapPackets` (default): fixed set of heap buffers, lock-free free list.
//!   Stands in for the stack allocator in tests and the smoke binary.
//!
//! - A DPDK mbuf pool adapter would implement this in the stack process;
//!   handle = mbuf pointer, payload = mbuf data pointer.

use std::ptr::NonNull;

/// A freshly allocated packet buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuf {
    /// Opaque handle the allocator needs to free the buffer.
    pub handle: NonNull<u8>,
    /// Start of the writable payload region.
    pub payload: NonNull<u8>,
    /// Bytes available at `payload`.
    pub capacity: usize,
}

// Safety: a packet buffer is just pointers + metadata; ownership is
// tracked by whoever holds the handle.
unsafe impl Send for PacketBuf {}
unsafe impl Sync for PacketBuf {}

/// The stack-side packet allocator.
///
/// **Contract:**
/// - `alloc()` never blocks; `None` means the pool is exhausted.
/// - `free()` takes a handle previously returned by `alloc()` on this
///   allocator. Each handle is freed exactly once.
pub trait PacketAllocator: Send + Sync {
    /// Allocate a buffer with at least `len` payload bytes.
    fn alloc(&self, len: usize) -> Option<PacketBuf>;

    /// Return a buffer to the allocator.
    fn free(&self, handle: NonNull<u8>);

    /// Total number of buffers managed.
    fn pool_size(&self) -> usize;

    /// Number of buffers currently handed out.
    fn in_use(&self) -> usize;
}

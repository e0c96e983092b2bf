//! # sockem-core — Trait definitions for the socket-emulation transport
//!
//! This crate defines the types that cross the channel boundary between a
//! client process issuing socket calls and the server process hosting the
//! user-space network stack, plus the trait seams for the two external
//! collaborators the transport talks to:
//!
//! - `Notifier`: the OS wakeup object (eventfd on Linux).
//! - `PacketAllocator`: the stack's packet buffer allocator.
//!
//! Every implementation lives in `sockem-module`. Nothing here touches
//! shared memory or the OS beyond errno constants.
//!
//! ## Modules
//!
//! - `entry` - Ring entry types (`IoVec`, `Endpoint`, `SendEntry`, `RecvEntry`)
//! - `tagged` - Two-word buffer descriptor with the length in spare address bits
//! - `notifier` - Cross-process wakeup abstraction
//! - `buffer` - Packet buffer allocator abstraction
//! - `error` - Error type with POSIX codes
//! - `env` - Environment variable utilities

pub mod entry;
pub mod tagged;
pub mod notifier;
pub mod buffer;
pub mod error;
pub mod env;

pub use entry::{Endpoint, IoVec, RecvEntry, SendEntry};
pub use tagged::TaggedBuf;
pub use error::{Result, SockError};
pub use notifier::Notifier;
pub use buffer::{PacketAllocator, PacketBuf};

/// Compile-time layout constants shared by client and server.
///
/// Both sides of a channel must be built with the same values; a mismatch
/// is a configuration error and is not detected at runtime.
pub mod constants {
    /// Slots per SPSC ring in every channel (power of 2).
    pub const RING_DEPTH: usize = 256;

    /// Bytes in the outbound byte ring of a stream channel (power of 2).
    pub const STREAM_BYTES: usize = 64 * 1024;

    /// Maximum I/O vectors carried by one datagram send entry.
    pub const MAX_IOV: usize = 4;

    /// Largest payload a tagged descriptor can describe.
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    /// Bit position where the length tag starts in a descriptor word.
    /// Addresses above 56 bits are rejected when packing.
    pub const TAG_SHIFT: u32 = 56;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;

    const _: () = assert!(RING_DEPTH.is_power_of_two());
    const _: () = assert!(STREAM_BYTES.is_power_of_two());
}

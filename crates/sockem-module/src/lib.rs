//! # sockem-module — Default implementations
//!
//! Everything that touches shared memory lives here: the ring primitives,
//! the slab pool and its arena, the two channel types, and the socket
//! dispatch shim on top of them.
//!
//! ## Default stack
//!
//! | Seam             | Default Impl      | Alternative                  |
//! |------------------|-------------------|------------------------------|
//! | Notifier         | EventFdNotifier   | CountingNotifier (non-Linux) |
//! | PacketAllocator  | HeapPackets       | stack mbuf pool adapter      |
//! | Channel arena    | SharedRegion      | caller memory                |
//!
//! ## Layering
//!
//! ```text
//! Socket ─► PooledChannel<C> ─► ChannelPool<C> ─► SlabPool ─► SharedRegion
//!              │
//!              ├─ DatagramChannel: SpscRing × 3
//!              └─ StreamChannel:   ByteRing + SpscRing × 2
//! ```

pub mod spsc_ring;
pub mod byte_ring;
pub mod shared_region;
pub mod slab_pool;
pub mod counting_notifier;
pub mod heap_packets;
pub mod iov;
pub mod datagram;
pub mod stream;
pub mod channel_pool;
pub mod socket;
pub mod config;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod eventfd_notifier;

        /// Notifier used when none is named.
        pub type DefaultNotifier = eventfd_notifier::EventFdNotifier;
    } else {
        /// Notifier used when none is named.
        pub type DefaultNotifier = counting_notifier::CountingNotifier;
    }
}

pub use channel_pool::{ChannelPool, ChannelRef, PoolChannel, PooledChannel};
pub use config::TransportConfig;
pub use datagram::{DatagramChannel, RecvInfo};
pub use heap_packets::HeapPackets;
pub use socket::{ChannelPools, Reply, Request, Socket, SocketKind};
pub use stream::StreamChannel;

//! Cross-process wakeup abstraction.
//!
//! Each channel carries two notifiers: one the server waits on, one the
//! client waits on. Ring operations never block; a side that finds nothing
//! to do waits on its notifier outside the transport.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (Linux default): an eventfd counter.
//!   The raw fd can be handed to epoll/poll for readiness multiplexing.
//!
//! - `CountingNotifier`: an in-memory atomic counter. No fd, no syscalls.
//!   Used on hosts without eventfd and in tests that count wakeups.

use std::os::fd::RawFd;

use crate::error::Result;

/// A counting, edge-resettable wakeup object.
///
/// **Contract:**
/// - `signal()` must NEVER block. Signals raised before the waiter
///   clears are coalesced into the counter.
/// - `clear()` resets the counter to zero and returns the prior count.
///   A zero return means nothing was pending.
/// - Waiters must `clear()` and then re-check their ring before sleeping,
///   otherwise a signal raised between the check and the sleep is lost.
pub trait Notifier: Send + Sync {
    /// Create a fresh notifier with a zero counter.
    fn create() -> Result<Self>
    where
        Self: Sized;

    /// Increment the counter, waking any waiter.
    fn signal(&self) -> Result<()>;

    /// Reset the counter and return its previous value.
    fn clear(&self) -> Result<u64>;

    /// Descriptor usable with poll/epoll, if the implementation has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

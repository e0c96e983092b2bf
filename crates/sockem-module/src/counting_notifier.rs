//! `CountingNotifier` — in-memory `Notifier`.
//!
//! A bare atomic counter. No fd, so nothing can sleep on it; waiters spin
//! or poll `pending()`. Default on hosts without eventfd, and what the
//! channel tests use to count exactly how many wakeups were raised.

use std::sync::atomic::{AtomicU64, Ordering};

use sockem_core::error::Result;
use sockem_core::notifier::Notifier;

#[derive(Debug, Default)]
pub struct CountingNotifier {
    count: AtomicU64,
}

impl CountingNotifier {
    pub const fn new() -> Self {
        Self { count: AtomicU64::new(0) }
    }

    /// Signals raised since the last `clear()`, without resetting.
    #[inline]
    pub fn pending(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Notifier for CountingNotifier {
    fn create() -> Result<Self> {
        Ok(Self::new())
    }

    #[inline]
    fn signal(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn clear(&self) -> Result<u64> {
        Ok(self.count.swap(0, Ordering::AcqRel))
    }
}

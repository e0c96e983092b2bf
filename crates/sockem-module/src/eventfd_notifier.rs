//! `EventFdNotifier` — default `Notifier` implementation on Linux.
//!
//! One eventfd per wakeup direction. Coalescing: multiple `signal()` calls
//! before the waiter clears collapse into one readable event (eventfd
//! counter semantics), and `clear()` reports how many were folded together.
//!
//! The fd is inherited across `fork()`, so a channel placed in a shared
//! region before forking is signalable from both processes.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use sockem_core::error::{Result, SockError};
use sockem_core::notifier::Notifier;

pub struct EventFdNotifier {
    fd: EventFd,
}

impl EventFdNotifier {
    /// The underlying eventfd descriptor (for poll/epoll registration).
    pub fn fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Block until a signal is pending or `timeout` passes. Does not clear.
    ///
    /// Returns whether the notifier is readable. An interrupted wait counts
    /// as not readable.
    pub fn wait(&self, timeout: PollTimeout) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(SockError::Os(e as i32)),
        }
    }
}

impl Notifier for EventFdNotifier {
    fn create() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| SockError::Os(e as i32))?;
        tracing::trace!(fd = fd.as_fd().as_raw_fd(), "eventfd notifier created");
        Ok(Self { fd })
    }

    fn signal(&self) -> Result<()> {
        match self.fd.write(1) {
            Ok(_) => Ok(()),
            // Counter would overflow: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(SockError::Os(e as i32)),
        }
    }

    fn clear(&self) -> Result<u64> {
        match self.fd.read() {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(SockError::Os(e as i32)),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd())
    }
}

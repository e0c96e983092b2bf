//! sockem error types.
//!
//! Every variant carries a POSIX errno so a dispatch reply can hand the
//! failure back to the client as a plain negative return value.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockError {
    /// Ring full or nothing to read. Retry after the next wakeup.
    WouldBlock,
    /// Channel pool has no free slot.
    PoolExhausted,
    /// Return ring is full; the consumed buffer could not be handed back.
    ReturnRingFull,
    /// Pool release of an address outside the carved range (fatal).
    InvalidRelease { addr: usize },
    /// Pool region cannot hold a single slot.
    RegionTooSmall { region: usize, slot: usize },
    /// Address uses bits reserved for the descriptor length tag.
    TaggedAddress { addr: usize },
    /// Datagram larger than a descriptor can carry.
    MessageTooLong(usize),
    /// More I/O vectors than a send entry holds.
    TooManyVectors(usize),
    /// Datagram send without destination on an unconnected socket.
    DestinationRequired,
    /// Request on a socket with no protocol attached.
    NotInitialized,
    /// Request not meaningful for this socket kind.
    Unsupported,
    /// OS error with errno.
    Os(i32),
}

impl SockError {
    /// POSIX error code for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::WouldBlock => libc::EAGAIN,
            Self::PoolExhausted | Self::ReturnRingFull => libc::ENOBUFS,
            Self::InvalidRelease { .. } => libc::EFAULT,
            Self::RegionTooSmall { .. } | Self::TaggedAddress { .. } => libc::EINVAL,
            Self::MessageTooLong(_) => libc::EMSGSIZE,
            Self::TooManyVectors(_) => libc::EINVAL,
            Self::DestinationRequired => libc::EDESTADDRREQ,
            Self::NotInitialized => libc::EBADF,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Os(e) => *e,
        }
    }

    /// Backpressure: not a failure, the caller's event loop retries.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::PoolExhausted | Self::ReturnRingFull)
    }

    /// Caller bug (wild pointer, double free). Must never be ignored.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidRelease { .. })
    }
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "operation would block"),
            Self::PoolExhausted => write!(f, "channel pool exhausted"),
            Self::ReturnRingFull => write!(f, "buffer return ring full"),
            Self::InvalidRelease { addr } => {
                write!(f, "release of {:#x} outside pool region", addr)
            }
            Self::RegionTooSmall { region, slot } => {
                write!(f, "region of {} bytes smaller than slot of {} bytes", region, slot)
            }
            Self::TaggedAddress { addr } => {
                write!(f, "address {:#x} overlaps descriptor tag bits", addr)
            }
            Self::MessageTooLong(n) => write!(f, "message of {} bytes too long", n),
            Self::TooManyVectors(n) => write!(f, "{} I/O vectors exceed entry capacity", n),
            Self::DestinationRequired => write!(f, "destination address required"),
            Self::NotInitialized => write!(f, "socket not initialized"),
            Self::Unsupported => write!(f, "operation not supported by socket kind"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for SockError {}

pub type Result<T> = std::result::Result<T, SockError>;

//! Ring entry types.
//!
//! These are the plain values stored in channel ring slots. They hold no
//! pointers into the ring itself, are `Copy`, and have a `repr(C)` layout
//! so a client and server built from the same source agree on them.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::constants::{MAX_IOV, MAX_PAYLOAD};
use crate::error::{Result, SockError};
use crate::tagged::TaggedBuf;

/// One raw I/O vector: an address and a length.
///
/// Building an `IoVec` is safe; reading through one is not, because the
/// consumer runs on the far side of the channel and cannot know whether the
/// producer still holds the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IoVec {
    pub base: usize,
    pub len: usize,
}

impl IoVec {
    pub const EMPTY: Self = Self { base: 0, len: 0 };

    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            base: buf.as_ptr() as usize,
            len: buf.len(),
        }
    }

    /// View the referenced bytes.
    ///
    /// # Safety
    /// The memory at `base..base+len` must be mapped in this address space
    /// and left untouched by the producer until the caller is done with the
    /// returned slice.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.base as *const u8, self.len)
    }
}

/// IPv4 endpoint in a fixed layout (`SocketAddrV4` has no stable repr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Endpoint {
    pub addr: [u8; 4],
    pub port: u16,
}

impl Endpoint {
    pub const UNSPECIFIED: Self = Self { addr: [0; 4], port: 0 };

    pub const fn new(addr: [u8; 4], port: u16) -> Self {
        Self { addr, port }
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// Pack into one word so a channel can keep its peer in an atomic.
    /// `UNSPECIFIED` packs to 0.
    #[inline]
    pub fn to_bits(self) -> u64 {
        (u64::from(u32::from_be_bytes(self.addr)) << 16) | u64::from(self.port)
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            addr: ((bits >> 16) as u32).to_be_bytes(),
            port: bits as u16,
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(sa: SocketAddrV4) -> Self {
        Self {
            addr: sa.ip().octets(),
            port: sa.port(),
        }
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(ep: Endpoint) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(ep.addr), ep.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddrV4::from(*self))
    }
}

/// A datagram send request: client → stack.
///
/// Carries the caller's I/O vectors by address. The stack gathers them
/// into a packet buffer when it drains the send ring.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SendEntry {
    /// Destination of the datagram.
    pub dest: Endpoint,
    /// Caller process id, for attribution only.
    pub pid: u32,
    /// Number of valid entries in `iov`.
    pub count: u32,
    pub iov: [IoVec; MAX_IOV],
}

impl SendEntry {
    /// Build an entry from up to `MAX_IOV` vectors.
    ///
    /// Fails if there are too many vectors or the total length does not
    /// fit in a single descriptor.
    pub fn new(pid: u32, dest: Endpoint, iov: &[IoVec]) -> Result<Self> {
        if iov.len() > MAX_IOV {
            return Err(SockError::TooManyVectors(iov.len()));
        }
        let total: usize = iov.iter().map(|v| v.len).sum();
        if total > MAX_PAYLOAD {
            return Err(SockError::MessageTooLong(total));
        }
        let mut entry = Self {
            dest,
            pid,
            count: iov.len() as u32,
            iov: [IoVec::EMPTY; MAX_IOV],
        };
        entry.iov[..iov.len()].copy_from_slice(iov);
        Ok(entry)
    }

    #[inline]
    pub fn iov(&self) -> &[IoVec] {
        &self.iov[..self.count as usize]
    }

    pub fn total_len(&self) -> usize {
        self.iov().iter().map(|v| v.len).sum()
    }

    /// Copy the referenced bytes into `out`; returns bytes copied.
    ///
    /// # Safety
    /// Same contract as [`IoVec::as_slice`] for every vector in the entry.
    pub unsafe fn gather(&self, out: &mut [u8]) -> usize {
        let mut off = 0;
        for v in self.iov() {
            let src = v.as_slice();
            let n = src.len().min(out.len() - off);
            out[off..off + n].copy_from_slice(&src[..n]);
            off += n;
            if off == out.len() {
                break;
            }
        }
        off
    }
}

/// A received datagram: stack → client.
///
/// `buf.len()` is the datagram byte count.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RecvEntry {
    pub buf: TaggedBuf,
    pub src: Endpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_conversion() {
        let sa = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 9000);
        let ep = Endpoint::from(sa);
        assert_eq!(ep.addr, [10, 0, 0, 7]);
        assert_eq!(SocketAddrV4::from(ep), sa);
        assert_eq!(ep.to_string(), "10.0.0.7:9000");
        assert!(Endpoint::default().is_unspecified());
    }

    #[test]
    fn test_endpoint_bits() {
        assert_eq!(Endpoint::UNSPECIFIED.to_bits(), 0);
        let ep = Endpoint::new([192, 168, 1, 254], 65535);
        assert_eq!(Endpoint::from_bits(ep.to_bits()), ep);
    }

    #[test]
    fn test_send_entry_gather() {
        let a = b"hello ";
        let b = b"world";
        let entry = SendEntry::new(
            42,
            Endpoint::new([127, 0, 0, 1], 53),
            &[IoVec::from_slice(a), IoVec::from_slice(b)],
        )
        .unwrap();
        assert_eq!(entry.iov().len(), 2);
        assert_eq!(entry.total_len(), 11);

        let mut out = [0u8; 32];
        let n = unsafe { entry.gather(&mut out) };
        assert_eq!(&out[..n], b"hello world");

        // Short destination truncates
        let mut small = [0u8; 4];
        assert_eq!(unsafe { entry.gather(&mut small) }, 4);
        assert_eq!(&small, b"hell");
    }

    #[test]
    fn test_send_entry_limits() {
        let byte = [0u8; 1];
        let many = [IoVec::from_slice(&byte); MAX_IOV + 1];
        assert_eq!(
            SendEntry::new(1, Endpoint::UNSPECIFIED, &many).unwrap_err(),
            SockError::TooManyVectors(MAX_IOV + 1)
        );

        let huge = IoVec { base: 0x1000, len: MAX_PAYLOAD + 1 };
        assert_eq!(
            SendEntry::new(1, Endpoint::UNSPECIFIED, &[huge]).unwrap_err(),
            SockError::MessageTooLong(MAX_PAYLOAD + 1)
        );
    }
}

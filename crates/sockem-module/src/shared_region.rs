//! `SharedRegion` — anonymous shared mapping used as a channel arena.
//!
//! `MAP_SHARED | MAP_ANONYMOUS`, so the region survives `fork()` at the same
//! address in both processes. Channel pools carve their slots out of it.
//!
//! Addresses handed across a process boundary should travel as an
//! [`Offset`] and be turned back into a pointer with [`SharedRegion::at`],
//! which revalidates the range before anything is dereferenced.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use sockem_core::error::{Result, SockError};

/// Byte offset from the start of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Offset(pub usize);

pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region is plain memory; synchronization of its contents is
// the job of whatever lives inside it (rings use atomics).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` zeroed bytes, page aligned.
    pub fn anonymous(len: usize) -> Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(SockError::Os(libc::EINVAL))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| SockError::Os(e as i32))?;
        tracing::debug!(len, base = ?ptr, "mapped shared region");
        Ok(Self {
            base: ptr.cast(),
            len,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Offset of `ptr` inside the region, if it is inside.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<Offset> {
        if !self.contains(ptr.as_ptr()) {
            return None;
        }
        Some(Offset(ptr.as_ptr() as usize - self.base.as_ptr() as usize))
    }

    /// Pointer for `off`, or `None` if it falls outside the region.
    pub fn at(&self, off: Offset) -> Option<NonNull<u8>> {
        if off.0 >= self.len {
            return None;
        }
        // SAFETY: off < len, so the result stays inside the mapping.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(off.0)) })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            tracing::warn!(errno = e as i32, "munmap of shared region failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_offsets() {
        let region = SharedRegion::anonymous(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.base().as_ptr() as usize % 4096, 0);

        let p = region.at(Offset(100)).unwrap();
        assert_eq!(region.offset_of(p), Some(Offset(100)));
        assert!(region.at(Offset(8192)).is_none());

        let outside = NonNull::new((region.base().as_ptr() as usize + 8192) as *mut u8).unwrap();
        assert!(region.offset_of(outside).is_none());
    }

    #[test]
    fn test_zeroed_and_writable() {
        let region = SharedRegion::anonymous(4096).unwrap();
        unsafe {
            let p = region.base().as_ptr();
            assert_eq!(*p.add(4095), 0);
            *p.add(10) = 0xab;
            assert_eq!(*p.add(10), 0xab);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(SharedRegion::anonymous(0).err(), Some(SockError::Os(libc::EINVAL)));
    }
}

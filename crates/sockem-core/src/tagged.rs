//! Tagged buffer descriptor.
//!
//! A packet buffer reference is logically `(handle, payload, len: u16)`.
//! Physically it is two pointer-sized words: user-space addresses on the
//! supported hosts never use the top byte, so each word carries one byte of
//! the length in bits 56..64.
//!
//! ```text
//! word 0:  [ len >> 8  | handle address (56 bits)  ]
//! word 1:  [ len & 0xff| payload address (56 bits) ]
//! ```
//!
//! The descriptor owns nothing. It is a view over memory that belongs to
//! whoever allocated the packet buffer (the network stack).

use std::fmt;
use std::ptr::NonNull;

use crate::constants::TAG_SHIFT;
use crate::error::{Result, SockError};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("tagged buffer descriptors require 64-bit pointers");

/// Bits of a word that hold the address.
pub const ADDR_MASK: usize = (1usize << TAG_SHIFT) - 1;

const TAG_MASK: usize = !ADDR_MASK;

// The tag must hold exactly one byte of the length.
const _: () = assert!(usize::BITS - TAG_SHIFT == 8);

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TaggedBuf {
    handle: usize,
    payload: usize,
}

impl TaggedBuf {
    /// Pack a handle, payload pointer and length.
    ///
    /// Rejects addresses with any tag bit set instead of silently
    /// truncating them.
    pub fn new(handle: NonNull<u8>, payload: NonNull<u8>, len: u16) -> Result<Self> {
        let h = handle.as_ptr() as usize;
        let p = payload.as_ptr() as usize;
        for addr in [h, p] {
            if addr & TAG_MASK != 0 {
                return Err(SockError::TaggedAddress { addr });
            }
        }
        let mut buf = Self { handle: h, payload: p };
        buf.set_len(len);
        Ok(buf)
    }

    #[inline]
    pub fn handle(&self) -> NonNull<u8> {
        // SAFETY: the address bits were non-null when packed and only the
        // tag bits are ever rewritten.
        unsafe { NonNull::new_unchecked((self.handle & ADDR_MASK) as *mut u8) }
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: as for `handle`.
        unsafe { NonNull::new_unchecked((self.payload & ADDR_MASK) as *mut u8) }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        let hi = (self.handle >> TAG_SHIFT) as u16;
        let lo = (self.payload >> TAG_SHIFT) as u16;
        (hi << 8) | lo
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the length in place. Address bits are not touched.
    #[inline]
    pub fn set_len(&mut self, len: u16) {
        self.handle = (self.handle & ADDR_MASK) | (((len >> 8) as usize) << TAG_SHIFT);
        self.payload = (self.payload & ADDR_MASK) | (((len & 0xff) as usize) << TAG_SHIFT);
    }

    #[inline]
    pub fn unpack(&self) -> (NonNull<u8>, NonNull<u8>, u16) {
        (self.handle(), self.payload(), self.len())
    }

    /// The payload bytes.
    ///
    /// # Safety
    /// The packet buffer must still be allocated and mapped in this address
    /// space, and nobody may write to it while the slice is alive.
    #[inline]
    pub unsafe fn bytes<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.payload().as_ptr(), self.len() as usize)
    }
}

impl fmt::Debug for TaggedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedBuf")
            .field("handle", &self.handle())
            .field("payload", &self.payload())
            .field("len", &self.len())
            .finish()
    }
}

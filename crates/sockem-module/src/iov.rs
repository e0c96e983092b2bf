//! Scatter/gather helpers over caller I/O vectors.

use std::io::IoSliceMut;

/// Total bytes addressable through `bufs`.
#[inline]
pub fn total_len(bufs: &[IoSliceMut<'_>]) -> usize {
    bufs.iter().map(|b| b.len()).sum()
}

/// Copy `src` into `bufs`, starting `skip` bytes into the vector chain.
/// Returns bytes copied (limited by whichever side runs out first).
pub fn scatter(src: &[u8], bufs: &mut [IoSliceMut<'_>], mut skip: usize) -> usize {
    let mut copied = 0;
    for buf in bufs.iter_mut() {
        if copied == src.len() {
            break;
        }
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        let room = &mut buf[skip..];
        skip = 0;
        let n = room.len().min(src.len() - copied);
        room[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    copied
}

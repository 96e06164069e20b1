//! Helper functions for bitmap arithmetic and segment naming

use crate::constants::{BITMAP_SIZE, SHM_NAME_MAX};
use crate::errors::{Error, Result};

/// Number of bitmap words needed to hold `num_locks` slots (rounded up).
#[inline]
pub const fn bitmaps_for(num_locks: u32) -> u32 {
    num_locks.div_ceil(BITMAP_SIZE)
}

/// The usable lock count after rounding `requested` up to whole bitmaps.
#[inline]
pub const fn rounded_locks(requested: u32) -> u32 {
    bitmaps_for(requested) * BITMAP_SIZE
}

/// Split an absolute slot index into (bitmap word, bit within word).
#[inline]
pub const fn slot_position(index: u32) -> (usize, usize) {
    ((index / BITMAP_SIZE) as usize, (index % BITMAP_SIZE) as usize)
}

#[inline]
pub const fn slot_index(word: usize, bit: usize) -> u32 {
    word as u32 * BITMAP_SIZE + bit as u32
}

/// First clear bit in `word`, lowest first.
#[inline]
pub fn first_clear_bit(word: u32) -> Option<usize> {
    if word == u32::MAX {
        None
    } else {
        Some((!word).trailing_zeros() as usize)
    }
}

#[inline]
pub fn free_bits(word: u32) -> u32 {
    (!word).count_ones()
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Canonicalise a shared memory name: exactly one leading `/`, no other
/// slashes, and short enough for `shm_open`.
pub fn normalize_shm_name(path: &str) -> Result<String> {
    let bare = path.strip_prefix('/').unwrap_or(path);
    if bare.is_empty() || bare.contains('/') || bare.contains('\0') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let name = format!("/{bare}");
    if name.len() >= SHM_NAME_MAX {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(name)
}

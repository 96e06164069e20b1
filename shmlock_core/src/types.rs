//! Shared-memory layout of a lock segment

use crate::constants::BITMAP_SIZE;
use crate::helpers::align_up;
use crate::platform::unix::RobustMutex;
use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU32;

/// Segment header. Everything after it is `num_bitmaps` lock groups.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: u64,               // identifies a valid lock segment
    pub num_locks: u32,           // num_bitmaps * BITMAP_SIZE
    pub num_bitmaps: u32,         // number of lock groups that follow
    pub segment_lock: RobustMutex, // guards every bitmap, not the slot mutexes
}

/// One bitmap word and the mutexes whose allocation it tracks.
#[repr(C)]
pub struct LockGroup {
    /// Bit set = slot allocated. Only read or written under `segment_lock`;
    /// atomic so concurrent mappings never observe a torn word.
    pub bitmap: AtomicU32,
    pub locks: [RobustMutex; BITMAP_SIZE as usize],
}

/// Offset of the first lock group from the start of the segment.
#[inline]
pub const fn groups_offset() -> usize {
    align_up(size_of::<SegmentHeader>(), align_of::<LockGroup>())
}

/// Total segment size for the given number of bitmaps.
#[inline]
pub const fn segment_size(num_bitmaps: u32) -> usize {
    groups_offset() + num_bitmaps as usize * size_of::<LockGroup>()
}

const _: () = assert!(groups_offset() % align_of::<LockGroup>() == 0);
const _: () = assert!(size_of::<LockGroup>() % align_of::<LockGroup>() == 0);

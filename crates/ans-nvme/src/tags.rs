//! Command tag space.
//!
//! ANS2 indexes both the submission ring and the tracking table by tag, and the NVMMU treats tags
//! as unique across queues. The admin queue therefore owns the low tags and the I/O queue starts
//! above them.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring depth and tracking-table size supported by the controller.
pub const MAX_QUEUE_DEPTH: u16 = 64;
pub const ADMIN_QUEUE_DEPTH: u16 = 32;
/// Admin tag reserved for the long-lived asynchronous event request.
pub const AEN_TAG: u16 = ADMIN_QUEUE_DEPTH - 1;

/// Lock-free allocator over a contiguous tag range (at most 64 tags wide).
#[derive(Debug)]
pub struct TagAllocator {
    range: Range<u16>,
    /// Bit `n` set means `range.start + n` is free.
    free: AtomicU64,
}

impl TagAllocator {
    pub fn new(range: Range<u16>) -> Self {
        let width = range.len() as u32;
        assert!(width <= 64 && range.end <= MAX_QUEUE_DEPTH, "tag range {range:?} too wide");
        let free = if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Self {
            range,
            free: AtomicU64::new(free),
        }
    }

    /// Admin request tags: everything below the async event tag.
    pub fn admin() -> Self {
        Self::new(0..AEN_TAG)
    }

    /// I/O request tags for a ring of `depth` entries. One slot stays unused so a full ring is
    /// distinguishable from an empty one.
    pub fn io(depth: u16) -> Self {
        Self::new(ADMIN_QUEUE_DEPTH..depth - 1)
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.range.contains(&tag)
    }

    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.load(Ordering::Acquire).count_ones() as usize
    }

    /// Returns the lowest free tag.
    pub fn alloc(&self) -> Option<u16> {
        let mut cur = self.free.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return None;
            }
            let n = cur.trailing_zeros();
            match self.free.compare_exchange_weak(
                cur,
                cur & !(1u64 << n),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.range.start + n as u16),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns `tag` to the pool. Returns `false` if it was not allocated.
    pub fn free(&self, tag: u16) -> bool {
        debug_assert!(self.contains(tag), "tag {tag} outside {:?}", self.range);
        let bit = 1u64 << (tag - self.range.start);
        self.free.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }
}

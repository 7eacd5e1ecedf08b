//! Shard slot selection
//!
//! Writers pick a bucket from a slot number. By default each thread gets a
//! stable slot the first time it asks for one (a global counter, cached in a
//! thread-local), so writes from one thread always land in the same bucket.
//! Callers that multiplex many tasks over few threads can pass an explicit
//! [`ShardSlot`] instead.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Explicit shard selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSlot(usize);

impl ShardSlot {
    /// Slot from any stable per-task number
    pub const fn new(slot: usize) -> Self {
        Self(slot)
    }

    /// Slot of the calling thread
    pub fn current() -> Self {
        Self(current_slot())
    }

    /// Bucket index for a collection with `bucket_count` buckets
    #[inline]
    pub fn bucket(self, bucket_count: usize) -> usize {
        debug_assert!(bucket_count > 0);
        self.0 % bucket_count
    }
}

/// Stable slot number of the calling thread
pub fn current_slot() -> usize {
    THREAD_SLOT.with(|cell| match cell.get() {
        Some(slot) => slot,
        None => {
            let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(slot));
            slot
        }
    })
}

//! Tombstone growable array
//!
//! An append-mostly bag of integer ids, used as the set of row ids that
//! share one indexed value.
//!
//! # Design
//!
//! - Slots are `AtomicU64`; `EMPTY_SLOT` marks a free or removed slot
//! - `add` claims the slot at the tail cursor with a CAS against
//!   `EMPTY_SLOT`; on contention it backs off and retries on a fresh cursor
//! - `remove` is a linear scan that CASes the first matching slot back to
//!   `EMPTY_SLOT` (a tombstone). Nothing is compacted, so removal is O(n)
//!   and the structure is meant for small bags
//! - Growth: while the array is a single block below `COPY_GROWTH_LIMIT`
//!   slots, live values are copied (tombstones dropped) into one block of
//!   twice the size. Past the limit a new `LINKED_BLOCK_CAPACITY` block is
//!   linked instead of copying
//!
//! # Thread Safety
//!
//! Adds, removes and lookups share the block directory's read lock and
//! only touch atomics. The directory's write lock is taken only to grow.
//! `add` never parks on the directory lock: it tries the lock and backs off
//! (spin, then yield) while another writer is growing.
//! Iterators work on a snapshot of the block directory and load each slot
//! atomically, so they yield either a value or nothing, never a partial
//! value or the sentinel.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use objtrack_core::{Error, Result, RowId};

use crate::backoff::Backoff;

/// Sentinel for an unused slot; cannot be stored
pub const EMPTY_SLOT: u64 = RowId::SENTINEL;

/// Largest single block that growth still copies into
pub const COPY_GROWTH_LIMIT: usize = 1024;

/// Capacity of blocks linked once the copy limit is reached
pub const LINKED_BLOCK_CAPACITY: usize = 256;

const MIN_CAPACITY: usize = 4;

struct Block {
    slots: Box<[AtomicU64]>,
    /// Next unclaimed slot. May lag one slot behind a successful claim.
    cursor: AtomicUsize,
}

impl Block {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(EMPTY_SLOT)).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.cursor.load(Ordering::Acquire) >= self.capacity()
    }

    /// Slots worth scanning: everything claimed plus the one in flight
    #[inline]
    fn scan_end(&self) -> usize {
        (self.cursor.load(Ordering::Acquire) + 1).min(self.capacity())
    }
}

/// Lock-free-append bag of integer ids with tombstone removal
pub struct TombstoneGrowableArray {
    blocks: RwLock<Vec<Arc<Block>>>,
    count: AtomicUsize,
}

impl TombstoneGrowableArray {
    /// Empty array with the minimum capacity
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Empty array with room for `capacity` ids before growing
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            blocks: RwLock::new(vec![Arc::new(Block::with_capacity(capacity))]),
            count: AtomicUsize::new(0),
        }
    }

    /// Number of live ids
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// True when no live ids remain
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slots across all blocks, including tombstones
    pub fn capacity(&self) -> usize {
        self.blocks.read().iter().map(|b| b.capacity()).sum()
    }

    /// Number of linked blocks
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Append `value`
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `value` is the sentinel
    /// - `CorruptState` if the block directory has no tail
    pub fn add(&self, value: u64) -> Result<()> {
        if value == EMPTY_SLOT {
            return Err(Error::invalid_argument(
                "the empty-slot sentinel cannot be stored",
            ));
        }

        let mut backoff = Backoff::new();
        loop {
            let needs_growth = {
                let Some(blocks) = self.blocks.try_read() else {
                    backoff.snooze();
                    continue;
                };
                let tail = blocks
                    .last()
                    .ok_or_else(|| Error::corrupt("growable array has no tail block"))?;
                let pos = tail.cursor.load(Ordering::Acquire);
                if pos >= tail.capacity() {
                    true
                } else {
                    let claimed = tail.slots[pos]
                        .compare_exchange(EMPTY_SLOT, value, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    // Winner or loser, move the cursor past the occupied slot.
                    let _ = tail.cursor.compare_exchange(
                        pos,
                        pos + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if claimed {
                        self.count.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                    false
                }
            };

            if !needs_growth || !self.try_grow()? {
                backoff.snooze();
            }
        }
    }

    /// Grow the tail; `false` if the directory was busy and nothing changed
    fn try_grow(&self) -> Result<bool> {
        let Some(mut blocks) = self.blocks.try_write() else {
            return Ok(false);
        };
        let tail = blocks
            .last()
            .ok_or_else(|| Error::corrupt("growable array has no tail block"))?;
        if !tail.is_full() {
            // Another writer grew it first.
            return Ok(true);
        }

        if blocks.len() == 1 && tail.capacity() < COPY_GROWTH_LIMIT {
            let live: Vec<u64> = tail
                .slots
                .iter()
                .map(|s| s.load(Ordering::Acquire))
                .filter(|&v| v != EMPTY_SLOT)
                .collect();
            let new_capacity = (tail.capacity() * 2).min(COPY_GROWTH_LIMIT);
            let block = Block::with_capacity(new_capacity.max(live.len() + 1));
            for (slot, value) in block.slots.iter().zip(&live) {
                slot.store(*value, Ordering::Release);
            }
            block.cursor.store(live.len(), Ordering::Release);
            *blocks = vec![Arc::new(block)];
        } else {
            blocks.push(Arc::new(Block::with_capacity(LINKED_BLOCK_CAPACITY)));
        }
        Ok(true)
    }

    /// Tombstone the first slot holding `value`
    ///
    /// Returns `true` if a slot was cleared.
    pub fn remove(&self, value: u64) -> bool {
        if value == EMPTY_SLOT {
            return false;
        }
        let blocks = self.blocks.read();
        for block in blocks.iter() {
            for slot in &block.slots[..block.scan_end()] {
                if slot.load(Ordering::Acquire) == value
                    && slot
                        .compare_exchange(value, EMPTY_SLOT, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return true;
                }
            }
        }
        false
    }

    /// True if some slot holds `value`
    pub fn contains(&self, value: u64) -> bool {
        if value == EMPTY_SLOT {
            return false;
        }
        let blocks = self.blocks.read();
        blocks.iter().any(|block| {
            block.slots[..block.scan_end()]
                .iter()
                .any(|slot| slot.load(Ordering::Acquire) == value)
        })
    }

    /// First live id in slot order
    pub fn first(&self) -> Option<u64> {
        self.iter().next()
    }

    /// Iterate live ids over a snapshot of the current blocks
    pub fn iter(&self) -> Iter {
        Iter {
            blocks: self.blocks.read().clone(),
            block: 0,
            slot: 0,
        }
    }

    /// Collect live ids
    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }
}

impl Default for TombstoneGrowableArray {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TombstoneGrowableArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a TombstoneGrowableArray {
    type Item = u64;
    type IntoIter = Iter;

    fn into_iter(self) -> Iter {
        self.iter()
    }
}

/// Iterator over live ids
///
/// Holds its own references to the blocks it walks; growth that happens
/// meanwhile is not observed.
pub struct Iter {
    blocks: Vec<Arc<Block>>,
    block: usize,
    slot: usize,
}

impl Iterator for Iter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while let Some(block) = self.blocks.get(self.block) {
            while self.slot < block.capacity() {
                let value = block.slots[self.slot].load(Ordering::Acquire);
                self.slot += 1;
                if value != EMPTY_SLOT {
                    return Some(value);
                }
            }
            self.block += 1;
            self.slot = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    // ========================================
    // Basic operations
    // ========================================

    #[test]
    fn test_add_and_iterate_in_order() {
        let arr = TombstoneGrowableArray::new();
        for i in 0..10 {
            arr.add(i).unwrap();
        }
        assert_eq!(arr.len(), 10);
        assert_eq!(arr.to_vec(), (0..10).collect::<Vec<_>>());
        assert_eq!(arr.first(), Some(0));
    }

    #[test]
    fn test_sentinel_is_rejected() {
        let arr = TombstoneGrowableArray::new();
        let err = arr.add(EMPTY_SLOT).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(arr.is_empty());
        assert!(!arr.remove(EMPTY_SLOT));
        assert!(!arr.contains(EMPTY_SLOT));
    }

    #[test]
    fn test_remove_tombstones_first_match_only() {
        let arr = TombstoneGrowableArray::new();
        arr.add(7).unwrap();
        arr.add(8).unwrap();
        arr.add(7).unwrap();

        assert!(arr.remove(7));
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.to_vec(), vec![8, 7]);
        assert!(arr.contains(7));

        assert!(arr.remove(7));
        assert!(!arr.remove(7));
        assert!(!arr.contains(7));
        assert_eq!(arr.to_vec(), vec![8]);
    }

    #[test]
    fn test_remove_missing_returns_false() {
        let arr = TombstoneGrowableArray::new();
        arr.add(1).unwrap();
        assert!(!arr.remove(2));
        assert_eq!(arr.len(), 1);
    }

    // ========================================
    // Growth policy
    // ========================================

    #[test]
    fn test_small_growth_copies_and_drops_tombstones() {
        let arr = TombstoneGrowableArray::with_capacity(4);
        for i in 0..4 {
            arr.add(i).unwrap();
        }
        arr.remove(1);
        arr.remove(2);
        // Tail is full; this add triggers a compacting copy.
        arr.add(100).unwrap();

        assert_eq!(arr.block_count(), 1);
        assert_eq!(arr.capacity(), 8);
        assert_eq!(arr.to_vec(), vec![0, 3, 100]);
    }

    #[test]
    fn test_large_growth_links_blocks() {
        let arr = TombstoneGrowableArray::with_capacity(COPY_GROWTH_LIMIT);
        for i in 0..(COPY_GROWTH_LIMIT as u64 + 1) {
            arr.add(i).unwrap();
        }
        assert_eq!(arr.block_count(), 2);
        assert_eq!(arr.capacity(), COPY_GROWTH_LIMIT + LINKED_BLOCK_CAPACITY);
        assert_eq!(arr.len(), COPY_GROWTH_LIMIT + 1);
        assert!(arr.contains(COPY_GROWTH_LIMIT as u64));
    }

    #[test]
    fn test_growth_preserves_values() {
        let arr = TombstoneGrowableArray::new();
        for i in 0..5_000u64 {
            arr.add(i).unwrap();
        }
        assert_eq!(arr.len(), 5_000);
        let seen: HashSet<u64> = arr.iter().collect();
        assert_eq!(seen.len(), 5_000);
    }

    // ========================================
    // Concurrency
    // ========================================

    #[test]
    fn test_concurrent_adds_lose_nothing() {
        let arr = Arc::new(TombstoneGrowableArray::new());
        let threads = 8u64;
        let per_thread = 1_000u64;
        let barrier = Arc::new(Barrier::new(threads as usize));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let arr = Arc::clone(&arr);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        arr.add(t * per_thread + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(arr.len(), (threads * per_thread) as usize);
        let seen: HashSet<u64> = arr.iter().collect();
        assert_eq!(seen.len(), (threads * per_thread) as usize);
    }

    #[test]
    fn test_add_backs_off_while_directory_is_held() {
        let arr = Arc::new(TombstoneGrowableArray::with_capacity(4));
        for v in 0..4 {
            arr.add(v).unwrap();
        }

        let held = arr.blocks.write();
        assert!(!arr.try_grow().unwrap());

        let adder = {
            let arr = Arc::clone(&arr);
            thread::spawn(move || arr.add(99))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!adder.is_finished());
        assert_eq!(held.len(), 1);

        drop(held);
        adder.join().unwrap().unwrap();
        assert!(arr.contains(99));
        assert_eq!(arr.len(), 5);
        assert!(arr.capacity() > 4);
    }

    #[test]
    fn test_iteration_during_concurrent_remove_never_leaks_sentinel() {
        let arr = Arc::new(TombstoneGrowableArray::new());
        for i in 0..2_000u64 {
            arr.add(i).unwrap();
        }

        let remover = {
            let arr = Arc::clone(&arr);
            thread::spawn(move || {
                for i in (0..2_000u64).step_by(2) {
                    assert!(arr.remove(i));
                }
            })
        };

        for _ in 0..20 {
            for value in arr.iter() {
                assert_ne!(value, EMPTY_SLOT);
                assert!(value < 2_000);
            }
        }
        remover.join().unwrap();

        assert_eq!(arr.len(), 1_000);
        assert!(arr.iter().all(|v| v % 2 == 1));
    }

    proptest::proptest! {
        #[test]
        fn prop_matches_multiset_model(ops in proptest::collection::vec((proptest::bool::ANY, 0u64..16), 0..200)) {
            let arr = TombstoneGrowableArray::new();
            let mut model: Vec<u64> = Vec::new();
            for (is_add, v) in ops {
                if is_add {
                    arr.add(v).unwrap();
                    model.push(v);
                } else {
                    let removed = arr.remove(v);
                    let pos = model.iter().position(|&m| m == v);
                    proptest::prop_assert_eq!(removed, pos.is_some());
                    if let Some(p) = pos {
                        model.remove(p);
                    }
                }
            }
            let mut got = arr.to_vec();
            got.sort_unstable();
            model.sort_unstable();
            proptest::prop_assert_eq!(arr.len(), model.len());
            proptest::prop_assert_eq!(got, model);
        }
    }
}

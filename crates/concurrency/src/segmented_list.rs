//! Segmented append list
//!
//! An ordered, partitioned sequence of `Arc<T>` with the same per-thread
//! bucket layout as [`ThreadPartitionedMap`](crate::ThreadPartitionedMap).
//! Each bucket is a chain of fixed-size blocks; appends go to the tail block
//! of the writer's bucket. Logical order is bucket order, then block order,
//! then slot order, skipping removed slots.
//!
//! # Design
//!
//! - Slots are `ArcSwapOption<T>`, so `remove` and `replace` are a CAS of
//!   the slot from the located item to `None` (or to the replacement)
//! - Items are matched by reference (`Arc::ptr_eq`), never by value
//! - A full tail block grows the way the tombstone array does: a lone block
//!   below `COPY_GROWTH_LIMIT` is copied (dropping removed slots) into one
//!   twice the size, otherwise a new `LINKED_BLOCK_CAPACITY` block is linked
//! - Observers get `CollectionChange` and `property_changed("Count")` /
//!   `property_changed("Item[]")` after each mutation is applied and its
//!   bucket lock released, so an observer may read the list back
//!
//! # Locking
//!
//! Appends and growth take the bucket's write lock, removals and
//! replacements its read lock, so growth can never move a slot out from
//! under a CAS. All waits are bounded by the configured lock timeout.

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use objtrack_core::{CollectionChange, CollectionObserver, CollectionOptions, Error, Result};

use crate::growable::{COPY_GROWTH_LIMIT, LINKED_BLOCK_CAPACITY};
use crate::lock::{read_for, write_for};
use crate::shard::ShardSlot;

const MIN_BLOCK_CAPACITY: usize = 4;

/// Handle returned by [`SegmentedAppendList::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Block<T> {
    slots: Box<[ArcSwapOption<T>]>,
    /// Slots written so far; only advanced under the bucket write lock
    used: AtomicUsize,
}

impl<T> Block<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            used: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn written(&self) -> &[ArcSwapOption<T>] {
        &self.slots[..self.used.load(Ordering::Acquire)]
    }
}

struct ListBucket<T> {
    blocks: RwLock<Vec<Arc<Block<T>>>>,
    len: AtomicUsize,
}

impl<T> ListBucket<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            blocks: RwLock::new(vec![Arc::new(Block::with_capacity(
                capacity.max(MIN_BLOCK_CAPACITY),
            ))]),
            len: AtomicUsize::new(0),
        }
    }
}

enum SlotOutcome {
    Done(usize),
    NotFound,
    Raced,
}

/// Partitioned, block-linked list of shared items
///
/// # Example
///
/// ```
/// use objtrack_concurrency::SegmentedAppendList;
/// use std::sync::Arc;
///
/// let list = SegmentedAppendList::new(2);
/// let a = Arc::new("a");
/// list.add(Arc::clone(&a)).unwrap();
/// assert!(list.contains(&a).unwrap());
/// assert!(list.remove(&a).unwrap());
/// assert!(list.is_empty());
/// ```
pub struct SegmentedAppendList<T> {
    buckets: Box<[ArcSwapOption<ListBucket<T>>]>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn CollectionObserver<T>>)>>,
    next_observer: AtomicU64,
    initial_capacity: usize,
    lock_timeout: Duration,
}

impl<T: Send + Sync + 'static> SegmentedAppendList<T> {
    /// List with `bucket_count` buckets and default options otherwise
    pub fn new(bucket_count: usize) -> Self {
        Self::with_options(&CollectionOptions::with_buckets(bucket_count.max(1)))
    }

    /// List built from collection options
    pub fn with_options(options: &CollectionOptions) -> Self {
        Self {
            buckets: (0..options.bucket_count.max(1))
                .map(|_| ArcSwapOption::empty())
                .collect(),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            initial_capacity: options.initial_capacity,
            lock_timeout: options.lock_timeout(),
        }
    }

    /// Number of live items
    pub fn len(&self) -> usize {
        self.populated().map(|b| b.len.load(Ordering::Acquire)).sum()
    }

    /// True when no live items remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn populated(&self) -> impl Iterator<Item = Arc<ListBucket<T>>> + '_ {
        self.buckets.iter().filter_map(|s| s.load_full())
    }

    fn get_or_create(&self, index: usize) -> Arc<ListBucket<T>> {
        let slot = &self.buckets[index];
        if let Some(existing) = slot.load_full() {
            return existing;
        }
        let fresh = Arc::new(ListBucket::with_capacity(self.initial_capacity));
        let none: Option<Arc<ListBucket<T>>> = None;
        let prev = slot.compare_and_swap(&none, Some(Arc::clone(&fresh)));
        match &*prev {
            None => fresh,
            Some(winner) => Arc::clone(winner),
        }
    }

    /// Live items in buckets before `index`
    fn items_before_bucket(&self, index: usize) -> usize {
        self.buckets[..index]
            .iter()
            .filter_map(|s| s.load_full())
            .map(|b| b.len.load(Ordering::Acquire))
            .sum()
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn CollectionObserver<T>>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Unregister an observer; returns `false` if it was not registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    fn notify(&self, change: CollectionChange<T>) {
        let observers: Vec<Arc<dyn CollectionObserver<T>>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        if observers.is_empty() {
            return;
        }
        let count_changed = !matches!(change, CollectionChange::Replace { .. });
        for observer in &observers {
            observer.collection_changed(&change);
            if count_changed {
                observer.property_changed("Count");
            }
            observer.property_changed("Item[]");
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Append to the calling thread's bucket; returns the logical position
    pub fn add(&self, item: Arc<T>) -> Result<usize> {
        self.add_on(ShardSlot::current(), item)
    }

    /// Append to the bucket chosen by `slot`
    pub fn add_on(&self, slot: ShardSlot, item: Arc<T>) -> Result<usize> {
        let index = slot.bucket(self.buckets.len());
        let bucket = self.get_or_create(index);
        let mut blocks = write_for(&bucket.blocks, self.lock_timeout, "list bucket")?;

        let tail_full = match blocks.last() {
            Some(tail) => tail.used.load(Ordering::Acquire) >= tail.capacity(),
            None => return Err(Error::corrupt("list bucket has no tail block")),
        };
        if tail_full {
            Self::grow(&mut blocks);
        }
        let tail = blocks
            .last()
            .ok_or_else(|| Error::corrupt("list bucket has no tail block"))?;
        let at = tail.used.load(Ordering::Acquire);
        tail.slots[at].store(Some(Arc::clone(&item)));
        tail.used.store(at + 1, Ordering::Release);
        let in_bucket = bucket.len.fetch_add(1, Ordering::AcqRel);
        drop(blocks);

        let position = self.items_before_bucket(index) + in_bucket;
        trace!(bucket = index, position, "list append");
        self.notify(CollectionChange::Add { item, position });
        Ok(position)
    }

    fn grow(blocks: &mut Vec<Arc<Block<T>>>) {
        let single_small = blocks.len() == 1
            && blocks
                .first()
                .map(|b| b.capacity() < COPY_GROWTH_LIMIT)
                .unwrap_or(false);
        if single_small {
            let old = &blocks[0];
            let live: Vec<Arc<T>> = old.written().iter().filter_map(|s| s.load_full()).collect();
            let capacity = (old.capacity() * 2)
                .min(COPY_GROWTH_LIMIT)
                .max(live.len() + 1);
            let block = Block::with_capacity(capacity);
            for (slot, item) in block.slots.iter().zip(&live) {
                slot.store(Some(Arc::clone(item)));
            }
            block.used.store(live.len(), Ordering::Release);
            debug!(capacity, live = live.len(), "list block copied");
            *blocks = vec![Arc::new(block)];
        } else {
            blocks.push(Arc::new(Block::with_capacity(LINKED_BLOCK_CAPACITY)));
            debug!(blocks = blocks.len(), "list block linked");
        }
    }

    /// Locate `target` by reference and CAS its slot to `replacement`
    fn swap_slot(&self, target: &Arc<T>, replacement: Option<Arc<T>>) -> Result<SlotOutcome> {
        let mut position = 0;
        for (index, slot) in self.buckets.iter().enumerate() {
            let Some(bucket) = slot.load_full() else {
                continue;
            };
            let blocks = read_for(&bucket.blocks, self.lock_timeout, "list bucket")?;
            for block in blocks.iter() {
                for cell in block.written() {
                    let current = cell.load_full();
                    let Some(current) = current else {
                        continue;
                    };
                    if !Arc::ptr_eq(&current, target) {
                        position += 1;
                        continue;
                    }
                    let expected = Some(current);
                    let removing = replacement.is_none();
                    let prev = cell.compare_and_swap(&expected, replacement);
                    let won = matches!(&*prev, Some(p) if Arc::ptr_eq(p, target));
                    if !won {
                        return Ok(SlotOutcome::Raced);
                    }
                    if removing {
                        bucket.len.fetch_sub(1, Ordering::AcqRel);
                    }
                    trace!(bucket = index, position, removing, "list slot swapped");
                    return Ok(SlotOutcome::Done(position));
                }
            }
        }
        Ok(SlotOutcome::NotFound)
    }

    /// Remove `item` (by reference)
    ///
    /// Returns `false` if the item is not in the list.
    ///
    /// # Errors
    ///
    /// `CorruptState` if the slot changes underneath the CAS twice in a row.
    pub fn remove(&self, item: &Arc<T>) -> Result<bool> {
        for _ in 0..2 {
            match self.swap_slot(item, None)? {
                SlotOutcome::Done(position) => {
                    self.notify(CollectionChange::Remove {
                        item: Arc::clone(item),
                        position,
                    });
                    return Ok(true);
                }
                SlotOutcome::NotFound => return Ok(false),
                SlotOutcome::Raced => continue,
            }
        }
        Err(Error::corrupt("list slot changed twice during removal"))
    }

    /// Replace `old` with `new` in place
    ///
    /// Returns `false` if `old` is not in the list.
    pub fn replace(&self, old: &Arc<T>, new: Arc<T>) -> Result<bool> {
        for _ in 0..2 {
            match self.swap_slot(old, Some(Arc::clone(&new)))? {
                SlotOutcome::Done(position) => {
                    self.notify(CollectionChange::Replace {
                        old: Arc::clone(old),
                        new,
                        position,
                    });
                    return Ok(true);
                }
                SlotOutcome::NotFound => return Ok(false),
                SlotOutcome::Raced => continue,
            }
        }
        Err(Error::corrupt("list slot changed twice during replace"))
    }

    /// Remove everything
    pub fn clear(&self) -> Result<()> {
        let buckets: Vec<Arc<ListBucket<T>>> = self.populated().collect();
        let mut guards = Vec::with_capacity(buckets.len());
        for bucket in &buckets {
            guards.push(write_for(&bucket.blocks, self.lock_timeout, "list bucket")?);
        }
        for (bucket, guard) in buckets.iter().zip(guards.iter_mut()) {
            **guard = vec![Arc::new(Block::with_capacity(
                self.initial_capacity.max(MIN_BLOCK_CAPACITY),
            ))];
            bucket.len.store(0, Ordering::Release);
        }
        drop(guards);
        debug!(buckets = buckets.len(), "list cleared");
        self.notify(CollectionChange::Reset);
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// True if `item` (by reference) is in the list
    pub fn contains(&self, item: &Arc<T>) -> Result<bool> {
        for bucket in self.populated() {
            let blocks = read_for(&bucket.blocks, self.lock_timeout, "list bucket")?;
            let found = blocks.iter().any(|block| {
                block
                    .written()
                    .iter()
                    .any(|cell| matches!(&*cell.load(), Some(cur) if Arc::ptr_eq(cur, item)))
            });
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Live items in logical order
    pub fn snapshot(&self) -> Result<Vec<Arc<T>>> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.populated() {
            let blocks = read_for(&bucket.blocks, self.lock_timeout, "list bucket")?;
            for block in blocks.iter() {
                out.extend(block.written().iter().filter_map(|cell| cell.load_full()));
            }
        }
        Ok(out)
    }

    /// Iterate a snapshot of the live items
    pub fn iter(&self) -> Result<std::vec::IntoIter<Arc<T>>> {
        Ok(self.snapshot()?.into_iter())
    }

    /// Item at logical `position`
    pub fn get(&self, position: usize) -> Result<Option<Arc<T>>> {
        Ok(self.iter()?.nth(position))
    }
}

impl<T: Send + Sync + 'static> Default for SegmentedAppendList<T> {
    fn default() -> Self {
        Self::with_options(&CollectionOptions::default())
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for SegmentedAppendList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedAppendList")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objtrack_core::ChangeKind;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(ChangeKind, Option<usize>)>>,
        properties: Mutex<Vec<String>>,
    }

    impl CollectionObserver<String> for Recorder {
        fn collection_changed(&self, change: &CollectionChange<String>) {
            self.changes.lock().push((change.kind(), change.position()));
        }

        fn property_changed(&self, property: &str) {
            self.properties.lock().push(property.to_string());
        }
    }

    fn item(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    // ========================================
    // Basic operations
    // ========================================

    #[test]
    fn test_add_iterate_in_bucket_order() {
        let list = SegmentedAppendList::new(2);
        let a = item("a");
        let b = item("b");
        let c = item("c");
        assert_eq!(list.add_on(ShardSlot::new(1), Arc::clone(&a)).unwrap(), 0);
        assert_eq!(list.add_on(ShardSlot::new(0), Arc::clone(&b)).unwrap(), 0);
        list.add_on(ShardSlot::new(1), Arc::clone(&c)).unwrap();

        let names: Vec<String> = list.iter().unwrap().map(|s| (*s).clone()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(list.len(), 3);
        assert!(Arc::ptr_eq(&list.get(1).unwrap().unwrap(), &a));
    }

    #[test]
    fn test_remove_is_by_reference() {
        let list = SegmentedAppendList::new(1);
        let a = item("same");
        let twin = item("same");
        list.add(Arc::clone(&a)).unwrap();

        assert!(!list.contains(&twin).unwrap());
        assert!(!list.remove(&twin).unwrap());
        assert!(list.remove(&a).unwrap());
        assert!(!list.remove(&a).unwrap());
        assert!(list.is_empty());
    }

    #[test]
    fn test_replace_keeps_position() {
        let list = SegmentedAppendList::new(1);
        let a = item("a");
        let b = item("b");
        let z = item("z");
        list.add(Arc::clone(&a)).unwrap();
        list.add(Arc::clone(&b)).unwrap();

        assert!(list.replace(&a, Arc::clone(&z)).unwrap());
        let names: Vec<String> = list.iter().unwrap().map(|s| (*s).clone()).collect();
        assert_eq!(names, vec!["z", "b"]);
        assert!(!list.contains(&a).unwrap());
        assert!(!list.replace(&a, item("q")).unwrap());
    }

    #[test]
    fn test_growth_copies_then_links() {
        let list = SegmentedAppendList::new(1);
        let items: Vec<Arc<String>> = (0..COPY_GROWTH_LIMIT + 10)
            .map(|i| item(&i.to_string()))
            .collect();
        for (i, it) in items.iter().enumerate() {
            list.add(Arc::clone(it)).unwrap();
            if i == 2 {
                // A removed slot is dropped by the next copy.
                list.remove(&items[1]).unwrap();
            }
        }
        assert_eq!(list.len(), items.len() - 1);
        let snapshot = list.snapshot().unwrap();
        assert_eq!(*snapshot[0], "0");
        assert_eq!(*snapshot[1], "2");
        assert_eq!(**snapshot.last().unwrap(), (COPY_GROWTH_LIMIT + 9).to_string());
    }

    #[test]
    fn test_clear() {
        let list = SegmentedAppendList::new(3);
        for i in 0..20 {
            list.add_on(ShardSlot::new(i), item("x")).unwrap();
        }
        list.clear().unwrap();
        assert!(list.is_empty());
        assert!(list.snapshot().unwrap().is_empty());
        list.add(item("y")).unwrap();
        assert_eq!(list.len(), 1);
    }

    // ========================================
    // Notifications
    // ========================================

    #[test]
    fn test_observer_receives_changes() {
        let list = SegmentedAppendList::new(1);
        let recorder = Arc::new(Recorder::default());
        let id = list.subscribe(recorder.clone());

        let a = item("a");
        let b = item("b");
        list.add(Arc::clone(&a)).unwrap();
        list.add(Arc::clone(&b)).unwrap();
        list.replace(&b, item("c")).unwrap();
        list.remove(&a).unwrap();
        list.clear().unwrap();

        let changes = recorder.changes.lock().clone();
        assert_eq!(
            changes,
            vec![
                (ChangeKind::Add, Some(0)),
                (ChangeKind::Add, Some(1)),
                (ChangeKind::Replace, Some(1)),
                (ChangeKind::Remove, Some(0)),
                (ChangeKind::Reset, None),
            ]
        );
        let props = recorder.properties.lock().clone();
        assert_eq!(props.iter().filter(|p| *p == "Count").count(), 4);
        assert_eq!(props.iter().filter(|p| *p == "Item[]").count(), 5);

        assert!(list.unsubscribe(id));
        assert!(!list.unsubscribe(id));
        list.add(item("d")).unwrap();
        assert_eq!(recorder.changes.lock().len(), 5);
    }

    /// Re-reads the list whenever its items change
    struct Reader {
        list: std::sync::Weak<SegmentedAppendList<String>>,
        seen: Mutex<Vec<usize>>,
    }

    impl CollectionObserver<String> for Reader {
        fn collection_changed(&self, _change: &CollectionChange<String>) {}

        fn property_changed(&self, property: &str) {
            if property != "Item[]" {
                return;
            }
            if let Some(list) = self.list.upgrade() {
                let items = list.snapshot().unwrap();
                assert_eq!(items.len(), list.len());
                self.seen.lock().push(items.len());
            }
        }
    }

    #[test]
    fn test_observer_can_read_list_during_notification() {
        let list = Arc::new(SegmentedAppendList::with_options(&CollectionOptions {
            bucket_count: 2,
            lock_timeout_ms: 200,
            ..CollectionOptions::default()
        }));
        let reader = Arc::new(Reader {
            list: Arc::downgrade(&list),
            seen: Mutex::new(Vec::new()),
        });
        list.subscribe(reader.clone());

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                let a = item("a");
                list.add(Arc::clone(&a)).unwrap();
                list.add_on(ShardSlot::new(1), item("b")).unwrap();
                list.replace(&a, item("c")).unwrap();
                list.clear().unwrap();
                tx.send(()).unwrap();
            })
        };

        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("list mutation blocked on its own observer");
        worker.join().unwrap();
        assert_eq!(*reader.seen.lock(), vec![1, 2, 2, 0]);
    }

    // ========================================
    // Concurrency
    // ========================================

    #[test]
    fn test_concurrent_add_and_remove() {
        let list = Arc::new(SegmentedAppendList::new(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    let mine: Vec<Arc<String>> =
                        (0..300).map(|i| item(&format!("{}-{}", t, i))).collect();
                    for it in &mine {
                        list.add(Arc::clone(it)).unwrap();
                    }
                    for it in mine.iter().step_by(3) {
                        assert!(list.remove(it).unwrap());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.len(), 4 * 200);
        assert_eq!(list.snapshot().unwrap().len(), 4 * 200);
    }
}

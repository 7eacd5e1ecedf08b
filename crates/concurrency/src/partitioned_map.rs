//! Thread-partitioned concurrent map
//!
//! A key → value map split into N independent buckets. Each writer works on
//! the bucket selected by its [`ShardSlot`] (by default the calling thread's
//! slot), so writers on different threads rarely share a lock. Readers scan
//! every bucket.
//!
//! # Design
//!
//! - Buckets live in a `BucketArray` published through `ArcSwap`; each slot
//!   is an `ArcSwapOption` filled lazily, exactly once, by CAS
//! - A key lives in at most one bucket. First inserts of the same key from
//!   different slots are serialised by a claim set (`DashSet`) that is
//!   separate from the bucket locks; `add_with_factory` uses the same
//!   claims so its factory runs at most once per key
//! - `compact` locks every bucket, merges them into a single populated
//!   bucket, and CASes the new array in. Old buckets are marked retired so
//!   writers that were waiting on them retry against the new array
//!
//! # Reads
//!
//! - Default ("assume safe") reads take each bucket's read lock untimed and
//!   only for the duration of one lookup; a scan may observe a write that is
//!   mid-flight across buckets but never a torn entry
//! - With dirty reads disallowed, each bucket is read under a timed read lock
//!   held for that bucket's whole scan
//!
//! No operation gives a cross-bucket atomic snapshot.

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashSet;
use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use objtrack_core::{CollectionOptions, Error, Result};

use crate::backoff::Backoff;
use crate::lock::{read_for, write_for};
use crate::shard::ShardSlot;

/// Bound for keys stored in a [`ThreadPartitionedMap`]
pub trait MapKey: Eq + Hash + Clone + Send + Sync + 'static {}
impl<T: Eq + Hash + Clone + Send + Sync + 'static> MapKey for T {}

/// Bound for values stored in a [`ThreadPartitionedMap`]
pub trait MapValue: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> MapValue for T {}

/// One shard
struct Bucket<K, V> {
    data: RwLock<FxHashMap<K, V>>,
    len: AtomicUsize,
    /// Set once this bucket has been replaced by compaction or clear
    retired: AtomicBool,
}

impl<K: MapKey, V: MapValue> Bucket<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self::from_map(FxHashMap::with_capacity_and_hasher(
            capacity,
            Default::default(),
        ))
    }

    fn from_map(map: FxHashMap<K, V>) -> Self {
        Self {
            len: AtomicUsize::new(map.len()),
            data: RwLock::new(map),
            retired: AtomicBool::new(false),
        }
    }

    #[inline]
    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

struct BucketArray<K, V> {
    slots: Box<[ArcSwapOption<Bucket<K, V>>]>,
}

impl<K: MapKey, V: MapValue> BucketArray<K, V> {
    fn empty(bucket_count: usize) -> Self {
        Self {
            slots: (0..bucket_count).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    /// All entries in slot 0, other slots left to lazy creation
    fn consolidated(bucket_count: usize, map: FxHashMap<K, V>) -> Self {
        let array = Self::empty(bucket_count);
        array.slots[0].store(Some(Arc::new(Bucket::from_map(map))));
        array
    }

    #[inline]
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, index: usize) -> Option<Arc<Bucket<K, V>>> {
        self.slots[index].load_full()
    }

    /// Existing bucket at `index`, or a new one installed by CAS
    fn get_or_create(&self, index: usize, capacity: usize) -> Arc<Bucket<K, V>> {
        let slot = &self.slots[index];
        if let Some(existing) = slot.load_full() {
            return existing;
        }
        let fresh = Arc::new(Bucket::with_capacity(capacity));
        let none: Option<Arc<Bucket<K, V>>> = None;
        let prev = slot.compare_and_swap(&none, Some(Arc::clone(&fresh)));
        match &*prev {
            None => {
                debug!(bucket = index, "created bucket");
                fresh
            }
            Some(winner) => Arc::clone(winner),
        }
    }

    fn populated(&self) -> impl Iterator<Item = Arc<Bucket<K, V>>> + '_ {
        self.slots.iter().filter_map(|s| s.load_full())
    }
}

/// Removes a key from the claim set on drop
struct Claim<'a, K: MapKey> {
    set: &'a DashSet<K>,
    key: K,
}

impl<K: MapKey> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Concurrent map partitioned into per-thread buckets
///
/// # Example
///
/// ```
/// use objtrack_concurrency::ThreadPartitionedMap;
///
/// let map = ThreadPartitionedMap::new(4);
/// map.upsert("a", 1).unwrap();
/// assert_eq!(map.try_get(&"a").unwrap(), Some(1));
/// assert_eq!(map.count(), 1);
/// ```
pub struct ThreadPartitionedMap<K, V> {
    buckets: ArcSwap<BucketArray<K, V>>,
    claims: DashSet<K>,
    bucket_count: usize,
    initial_capacity: usize,
    lock_timeout: Duration,
    disallow_dirty_reads: AtomicBool,
}

impl<K: MapKey, V: MapValue> ThreadPartitionedMap<K, V> {
    /// Map with `bucket_count` buckets and default options otherwise
    ///
    /// A zero bucket count is raised to one.
    pub fn new(bucket_count: usize) -> Self {
        Self::with_options(&CollectionOptions::with_buckets(bucket_count.max(1)))
    }

    /// Map built from collection options
    pub fn with_options(options: &CollectionOptions) -> Self {
        let bucket_count = options.bucket_count.max(1);
        Self {
            buckets: ArcSwap::from_pointee(BucketArray::empty(bucket_count)),
            claims: DashSet::new(),
            bucket_count,
            initial_capacity: options.initial_capacity,
            lock_timeout: options.lock_timeout(),
            disallow_dirty_reads: AtomicBool::new(options.disallow_dirty_reads),
        }
    }

    /// Configured number of buckets
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Buckets that currently exist
    pub fn populated_buckets(&self) -> usize {
        self.buckets.load().populated().count()
    }

    /// Lock timeout applied to writes and safe reads
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Whether reads must take timed bucket locks
    pub fn disallows_dirty_reads(&self) -> bool {
        self.disallow_dirty_reads.load(Ordering::Acquire)
    }

    /// Switch between dirty and locked reads
    pub fn set_disallow_dirty_reads(&self, disallow: bool) {
        self.disallow_dirty_reads.store(disallow, Ordering::Release);
    }

    /// Total entries: sum of per-bucket counts
    pub fn count(&self) -> usize {
        self.buckets
            .load()
            .populated()
            .map(|b| b.len.load(Ordering::Acquire))
            .sum()
    }

    /// Alias for [`count`](Self::count)
    pub fn len(&self) -> usize {
        self.count()
    }

    /// True when no entries exist
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn claim(&self, key: &K) -> Claim<'_, K> {
        let mut backoff = Backoff::new();
        while !self.claims.insert(key.clone()) {
            backoff.snooze();
        }
        Claim {
            set: &self.claims,
            key: key.clone(),
        }
    }

    /// Bucket currently holding `key`, if any
    fn locate(&self, array: &BucketArray<K, V>, key: &K) -> Option<Arc<Bucket<K, V>>> {
        array.populated().find(|b| b.data.read().contains_key(key))
    }

    /// Insert or replace; caller holds the key's claim
    fn put_claimed(&self, slot: ShardSlot, key: K, value: V, replace: bool) -> Result<Option<V>> {
        let mut backoff = Backoff::new();
        loop {
            let array = self.buckets.load_full();
            if let Some(bucket) = self.locate(&array, &key) {
                let mut data = write_for(&bucket.data, self.lock_timeout, "bucket")?;
                if bucket.is_retired() {
                    drop(data);
                    backoff.snooze();
                    continue;
                }
                if let Some(existing) = data.get_mut(&key) {
                    if replace {
                        return Ok(Some(std::mem::replace(existing, value)));
                    }
                    return Ok(Some(existing.clone()));
                }
                // Removed between locate and lock.
                continue;
            }

            let index = slot.bucket(array.len());
            let bucket = array.get_or_create(index, self.initial_capacity);
            let mut data = write_for(&bucket.data, self.lock_timeout, "bucket")?;
            if bucket.is_retired() {
                drop(data);
                backoff.snooze();
                continue;
            }
            data.insert(key, value);
            bucket.len.fetch_add(1, Ordering::AcqRel);
            return Ok(None);
        }
    }

    /// Insert or replace from the calling thread's bucket
    ///
    /// An existing key is updated in whichever bucket holds it. Returns the
    /// previous value.
    pub fn upsert(&self, key: K, value: V) -> Result<Option<V>> {
        self.upsert_on(ShardSlot::current(), key, value)
    }

    /// Insert or replace, choosing the bucket from `slot`
    pub fn upsert_on(&self, slot: ShardSlot, key: K, value: V) -> Result<Option<V>> {
        let _claim = self.claim(&key);
        self.put_claimed(slot, key, value, true)
    }

    /// Insert only if absent
    ///
    /// Returns `true` if the entry was inserted, `false` if the key already
    /// existed (the existing value is kept).
    pub fn add(&self, key: K, value: V) -> Result<bool> {
        self.add_on(ShardSlot::current(), key, value)
    }

    /// Insert only if absent, choosing the bucket from `slot`
    pub fn add_on(&self, slot: ShardSlot, key: K, value: V) -> Result<bool> {
        let _claim = self.claim(&key);
        Ok(self.put_claimed(slot, key, value, false)?.is_none())
    }

    /// Value for `key`, building it with `factory` if absent
    ///
    /// Concurrent callers racing on the same key run the factory at most
    /// once: losers wait on the key's claim until the winner has published
    /// and then read the published value.
    pub fn add_with_factory<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        self.add_with_factory_on(ShardSlot::current(), key, factory)
    }

    /// [`add_with_factory`](Self::add_with_factory) with an explicit slot
    pub fn add_with_factory_on<F>(&self, slot: ShardSlot, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(value) = self.try_get(&key)? {
            return Ok(value);
        }
        let _claim = self.claim(&key);
        if let Some(value) = self.try_get(&key)? {
            return Ok(value);
        }
        let value = factory(&key);
        self.put_claimed(slot, key, value.clone(), false)?;
        Ok(value)
    }

    /// Remove `key`, returning its value
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let mut backoff = Backoff::new();
        loop {
            let array = self.buckets.load_full();
            let Some(bucket) = self.locate(&array, key) else {
                return Ok(None);
            };
            let mut data = write_for(&bucket.data, self.lock_timeout, "bucket")?;
            if bucket.is_retired() {
                drop(data);
                backoff.snooze();
                continue;
            }
            return Ok(data.remove(key).map(|value| {
                bucket.len.fetch_sub(1, Ordering::AcqRel);
                value
            }));
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn find_in<R>(&self, key: &K, f: impl Fn(&V) -> R) -> Result<Option<R>> {
        let locked = self.disallows_dirty_reads();
        let array = self.buckets.load_full();
        for bucket in array.populated() {
            let found = if locked {
                read_for(&bucket.data, self.lock_timeout, "bucket")?
                    .get(key)
                    .map(&f)
            } else {
                bucket.data.read().get(key).map(&f)
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Value for `key`, scanning buckets in order
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        self.find_in(key, V::clone)
    }

    /// Value for `key`; a miss is an error
    ///
    /// # Errors
    ///
    /// `MissingKey` if the key is absent.
    pub fn get(&self, key: &K) -> Result<V>
    where
        K: fmt::Debug,
    {
        self.try_get(key)?
            .ok_or_else(|| Error::MissingKey(format!("{:?}", key)))
    }

    /// True if `key` is present
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.find_in(key, |_| ())?.is_some())
    }

    fn collect_with(&self, locked: bool) -> Result<Vec<(K, V)>> {
        let array = self.buckets.load_full();
        let mut out = Vec::with_capacity(self.count());
        for bucket in array.populated() {
            if locked {
                let data = read_for(&bucket.data, self.lock_timeout, "bucket")?;
                out.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            } else {
                let data = bucket.data.read();
                out.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(out)
    }

    /// Copy of all entries, honouring the dirty-read setting
    pub fn enumerate(&self) -> Result<Vec<(K, V)>> {
        self.collect_with(self.disallows_dirty_reads())
    }

    /// Copy of all entries with every bucket read under a timed lock
    pub fn safe_enumerate(&self) -> Result<Vec<(K, V)>> {
        self.collect_with(true)
    }

    /// All keys
    pub fn keys(&self) -> Result<Vec<K>> {
        Ok(self.enumerate()?.into_iter().map(|(k, _)| k).collect())
    }

    /// All values
    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.enumerate()?.into_iter().map(|(_, v)| v).collect())
    }

    // ========================================================================
    // Whole-collection operations
    // ========================================================================

    /// Lock every bucket of the current array, build a replacement from
    /// their contents and CAS it in. Retries if another swap wins.
    fn swap_buckets<F>(&self, op: &'static str, mut build: F) -> Result<()>
    where
        F: FnMut(&[RwLockWriteGuard<'_, FxHashMap<K, V>>]) -> BucketArray<K, V>,
    {
        let mut backoff = Backoff::new();
        loop {
            let current = self.buckets.load_full();
            let buckets: Vec<Arc<Bucket<K, V>>> = (0..current.len())
                .map(|i| current.get_or_create(i, 0))
                .collect();
            let mut guards = Vec::with_capacity(buckets.len());
            for bucket in &buckets {
                guards.push(write_for(&bucket.data, self.lock_timeout, "bucket")?);
            }
            if buckets.iter().any(|b| b.is_retired()) {
                drop(guards);
                backoff.snooze();
                continue;
            }

            let next = Arc::new(build(&guards));
            let prev = self.buckets.compare_and_swap(&current, next);
            if Arc::ptr_eq(&prev, &current) {
                for bucket in &buckets {
                    bucket.retired.store(true, Ordering::Release);
                }
                debug!(op, buckets = buckets.len(), "swapped bucket array");
                return Ok(());
            }
            drop(guards);
            debug!(op, "bucket array swap lost a race, retrying");
            backoff.snooze();
        }
    }

    /// Merge all buckets into one
    ///
    /// Blocks every writer for the duration. The visible key/value set is
    /// unchanged; later writes recreate per-thread buckets lazily.
    pub fn compact(&self) -> Result<()> {
        let bucket_count = self.bucket_count;
        self.swap_buckets("compact", |guards| {
            let total: usize = guards.iter().map(|g| g.len()).sum();
            let mut merged = FxHashMap::with_capacity_and_hasher(total, Default::default());
            for guard in guards {
                for (k, v) in guard.iter() {
                    merged.insert(k.clone(), v.clone());
                }
            }
            BucketArray::consolidated(bucket_count, merged)
        })
    }

    /// Drop every entry
    pub fn clear(&self) -> Result<()> {
        let bucket_count = self.bucket_count;
        self.swap_buckets("clear", |_| BucketArray::empty(bucket_count))
    }
}

impl<K: MapKey, V: MapValue> Default for ThreadPartitionedMap<K, V> {
    fn default() -> Self {
        Self::with_options(&CollectionOptions::default())
    }
}

impl<K: MapKey, V: MapValue> fmt::Debug for ThreadPartitionedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPartitionedMap")
            .field("bucket_count", &self.bucket_count)
            .field("populated", &self.populated_buckets())
            .field("count", &self.count())
            .finish()
    }
}

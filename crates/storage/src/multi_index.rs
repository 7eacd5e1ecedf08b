//! Multi-index store
//!
//! `MultiIndexStore<T>` holds shared items under a row id and keeps one
//! [`PropertyIndex`] per configured property.
//!
//! # Layout
//!
//! - `rows`: RowId → `Arc<T>` (`ThreadPartitionedMap`)
//! - `identities`: item address → RowId, so one item is stored at most once
//! - `indexes`: property name → value → bag of row ids
//!
//! # Locking
//!
//! One reader/writer lock (`structure`) guards the primary maps and all
//! bags as a unit. `add`, `remove`, index moves and configuration changes
//! take it exclusively within the configured timeout. Lookups take it
//! shared only when dirty reads are disallowed; otherwise they rely on the
//! per-bucket locking underneath.
//!
//! # Failed adds
//!
//! An add that fails part-way removes every bag entry it made, then the
//! primary entries, and returns the original error. Callers never observe a
//! partially indexed item.

use parking_lot::{RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use objtrack_concurrency::lock::{read_for, write_for};
use objtrack_concurrency::ThreadPartitionedMap;
use objtrack_core::{
    CollectionOptions, Error, IndexConfig, Indexable, Result, RowId, StoreConfig, Value,
};

use crate::index::{BagInsert, PropertyIndex};

/// How an item ended up in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored under a fresh row and indexed everywhere
    Inserted(RowId),
    /// The same item was already stored under this row
    AlreadyPresent(RowId),
    /// Stored under `row`, but the unique index on `property` kept `existing`
    SharedUnique {
        /// Row of the new item
        row: RowId,
        /// Row that already owned the unique value
        existing: RowId,
        /// Unique property that collided
        property: String,
    },
}

impl AddOutcome {
    /// Row of the added (or already present) item
    pub fn row(&self) -> RowId {
        match self {
            AddOutcome::Inserted(row) | AddOutcome::AlreadyPresent(row) => *row,
            AddOutcome::SharedUnique { row, .. } => *row,
        }
    }

    /// True when a new row was created
    pub fn is_new(&self) -> bool {
        !matches!(self, AddOutcome::AlreadyPresent(_))
    }
}

/// Bag entries made so far by one add, for unwinding
type Applied = SmallVec<[(Arc<PropertyIndex>, Value); 4]>;

/// Identity of a shared item: the address of its allocation
fn identity_of<T: ?Sized>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item).cast::<()>() as usize
}

/// Concurrent collection of shared items with secondary property indexes
pub struct MultiIndexStore<T: Indexable + ?Sized + 'static> {
    rows: ThreadPartitionedMap<RowId, Arc<T>>,
    identities: ThreadPartitionedMap<usize, RowId>,
    indexes: RwLock<Vec<Arc<PropertyIndex>>>,
    structure: RwLock<()>,
    next_row: AtomicU64,
    options: CollectionOptions,
    assume_safe: bool,
}

impl<T: Indexable + ?Sized + 'static> MultiIndexStore<T> {
    /// Build a store from validated configuration
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let options = config.collection;
        let indexes = config
            .indexes
            .iter()
            .map(|index| Arc::new(PropertyIndex::new(index, &options)))
            .collect();
        debug!(
            indexes = config.indexes.len(),
            buckets = options.bucket_count,
            "created multi-index store"
        );
        Ok(Self {
            rows: ThreadPartitionedMap::with_options(&options),
            identities: ThreadPartitionedMap::with_options(&options),
            indexes: RwLock::new(indexes),
            structure: RwLock::new(()),
            next_row: AtomicU64::new(0),
            assume_safe: config.assume_safe,
            options,
        })
    }

    /// Store with default options and the given indexes
    pub fn with_indexes(indexes: impl IntoIterator<Item = IndexConfig>) -> Result<Self> {
        let config = indexes
            .into_iter()
            .fold(StoreConfig::default(), StoreConfig::with_index);
        Self::new(config)
    }

    fn timeout(&self) -> Duration {
        self.options.lock_timeout()
    }

    /// Shared structural lock, taken only when dirty reads are disallowed
    fn read_guard(&self) -> Result<Option<RwLockReadGuard<'_, ()>>> {
        if self.rows.disallows_dirty_reads() {
            read_for(&self.structure, self.timeout(), "store").map(Some)
        } else {
            Ok(None)
        }
    }

    /// Look up an index by name
    ///
    /// Unknown names are an error unless the store assumes safe callers, in
    /// which case they read as "no index".
    fn index(&self, name: &str) -> Result<Option<Arc<PropertyIndex>>> {
        let found = self
            .indexes
            .read()
            .iter()
            .find(|index| index.name() == name)
            .cloned();
        match found {
            Some(index) => Ok(Some(index)),
            None if self.assume_safe => Ok(None),
            None => Err(Error::UnknownIndex(name.to_string())),
        }
    }

    /// Look up an index by name, always rejecting unknown names
    fn configured_index(&self, name: &str) -> Result<Arc<PropertyIndex>> {
        self.indexes
            .read()
            .iter()
            .find(|index| index.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))
    }

    fn index_snapshot(&self) -> Vec<Arc<PropertyIndex>> {
        self.indexes.read().clone()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Store `item` and index it under every configured property
    ///
    /// An item already in the store is reported as `AlreadyPresent`. When a
    /// unique index already holds the item's value, `check_exists` decides
    /// the outcome: `true` keeps the existing row in that bag and reports
    /// `SharedUnique`, `false` fails with `ConstraintViolation` and leaves
    /// the store untouched.
    pub fn add(&self, item: Arc<T>, check_exists: bool) -> Result<AddOutcome> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let identity = identity_of(&item);
        if let Some(row) = self.identities.try_get(&identity)? {
            return Ok(AddOutcome::AlreadyPresent(row));
        }

        let row = RowId::new(self.next_row.fetch_add(1, Ordering::Relaxed));
        let mut applied = Applied::new();
        let mut shared = None;

        let result = self.insert_locked(
            &item,
            identity,
            row,
            check_exists,
            &mut applied,
            &mut shared,
        );
        if let Err(e) = result {
            warn!(%row, error = %e, undo = applied.len(), "add failed, rolling back");
            self.unwind(&applied, identity, row);
            return Err(e);
        }

        trace!(%row, "added item");
        Ok(match shared {
            Some((existing, property)) => AddOutcome::SharedUnique {
                row,
                existing,
                property,
            },
            None => AddOutcome::Inserted(row),
        })
    }

    fn insert_locked(
        &self,
        item: &Arc<T>,
        identity: usize,
        row: RowId,
        check_exists: bool,
        applied: &mut Applied,
        shared: &mut Option<(RowId, String)>,
    ) -> Result<()> {
        if !self.rows.add(row, Arc::clone(item))? {
            return Err(Error::corrupt(format!("row {} allocated twice", row)));
        }
        if !self.identities.add(identity, row)? {
            return Err(Error::corrupt(format!("identity of row {} already mapped", row)));
        }

        for index in self.index_snapshot() {
            let Some(value) = index.key_for(&**item) else {
                continue;
            };
            match index.insert(&value, row, check_exists)? {
                BagInsert::Added => applied.push((index, value)),
                BagInsert::Shared { existing } => {
                    shared.get_or_insert_with(|| (existing, index.name().to_string()));
                }
            }
        }
        Ok(())
    }

    /// Undo a partial add: bag entries newest first, then the primary maps
    fn unwind(&self, applied: &Applied, identity: usize, row: RowId) {
        for (index, value) in applied.iter().rev() {
            if let Err(e) = index.remove(value, row) {
                warn!(property = index.name(), %row, error = %e, "failed to unwind index entry");
            }
        }
        if let Err(e) = self.identities.remove(&identity) {
            warn!(%row, error = %e, "failed to unwind identity entry");
        }
        if let Err(e) = self.rows.remove(&row) {
            warn!(%row, error = %e, "failed to unwind row entry");
        }
    }

    /// `add(item, true)`: never fails on a unique collision
    pub fn add_safe(&self, item: Arc<T>) -> Result<AddOutcome> {
        self.add(item, true)
    }

    /// Remove `item` and all of its index entries
    pub fn remove(&self, item: &Arc<T>) -> Result<bool> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let Some(row) = self.identities.try_get(&identity_of(item))? else {
            return Ok(false);
        };
        self.remove_row_locked(row)
    }

    /// Remove the item stored under `row`
    pub fn remove_row(&self, row: RowId) -> Result<bool> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        self.remove_row_locked(row)
    }

    fn remove_row_locked(&self, row: RowId) -> Result<bool> {
        let Some(item) = self.rows.try_get(&row)? else {
            return Ok(false);
        };
        for index in self.index_snapshot() {
            let removed = match index.key_for(&*item) {
                Some(value) => index.remove(&value, row)?,
                None => false,
            };
            if !removed {
                index.remove_anywhere(row)?;
            }
        }
        self.identities.remove(&identity_of(&item))?;
        self.rows.remove(&row)?;
        trace!(%row, "removed item");
        Ok(true)
    }

    /// Move every row filed under `old` in index `name` to `new`
    ///
    /// Used after an external change to an indexed property. Bags are merged
    /// when `new` is already present; a unique index refuses the merge.
    pub fn update_field_index(&self, name: &str, old: &Value, new: &Value) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let Some(index) = self.index(name)? else {
            return Ok(());
        };
        let (Some(old), Some(new)) = (
            index.normalize(Some(old.clone())),
            index.normalize(Some(new.clone())),
        ) else {
            return Ok(());
        };
        index.move_bag(&old, &new)
    }

    /// Move one item from the `old` bag to the `new` bag of index `name`
    ///
    /// Either side may be `None` (missing value). On a unique collision the
    /// item stays where it was.
    pub fn reindex_item(
        &self,
        item: &Arc<T>,
        name: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let Some(index) = self.index(name)? else {
            return Ok(());
        };
        let Some(row) = self.identities.try_get(&identity_of(item))? else {
            return Err(Error::invalid_argument("item is not in the store"));
        };

        let old = index.normalize(old);
        let new = index.normalize(new);
        if old == new {
            return Ok(());
        }

        if let Some(new) = &new {
            if index.is_unique() {
                if let Some(bag) = index.bag(new)? {
                    if bag.iter().any(|id| id != row.as_u64()) {
                        return Err(Error::constraint(name, new));
                    }
                }
            }
        }

        if let Some(old) = &old {
            if !index.remove(old, row)? {
                index.remove_anywhere(row)?;
            }
        }
        if let Some(new) = &new {
            index.insert(new, row, false)?;
        }
        trace!(%row, property = name, "reindexed item");
        Ok(())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Add an index at runtime, filling it from the stored items
    ///
    /// Nothing is installed if the backfill violates a unique definition.
    pub fn add_index(&self, config: IndexConfig) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        if self.indexes.read().iter().any(|i| i.name() == config.name) {
            return Err(Error::Config(format!(
                "index '{}' is already configured",
                config.name
            )));
        }

        let index = Arc::new(PropertyIndex::new(&config, &self.options));
        let mut rows = self.rows.safe_enumerate()?;
        rows.sort_unstable_by_key(|(row, _)| *row);
        for (row, item) in &rows {
            if let Some(value) = index.key_for(&**item) {
                index.insert(&value, *row, false)?;
            }
        }
        index.set_disallow_dirty_reads(self.rows.disallows_dirty_reads());

        debug!(property = %config.name, rows = rows.len(), "backfilled index");
        self.indexes.write().push(index);
        Ok(())
    }

    /// Make index `name` unique, after checking the stored data allows it
    pub fn add_unique_constraint(&self, name: &str) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let index = self.configured_index(name)?;
        index.validate_unique()?;
        index.set_unique();
        debug!(property = name, "unique constraint added");
        Ok(())
    }

    /// Stop tracking null values in index `name`
    pub fn add_never_track_null(&self, name: &str) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let index = self.configured_index(name)?;
        index.set_never_track_null()?;
        debug!(property = name, "null values no longer indexed");
        Ok(())
    }

    /// Switch every underlying map between dirty and locked reads
    pub fn set_disallow_dirty_reads(&self, disallow: bool) {
        self.rows.set_disallow_dirty_reads(disallow);
        self.identities.set_disallow_dirty_reads(disallow);
        for index in self.indexes.read().iter() {
            index.set_disallow_dirty_reads(disallow);
        }
    }

    /// Names of all configured indexes, in definition order
    pub fn index_names(&self) -> Vec<String> {
        self.indexes
            .read()
            .iter()
            .map(|index| index.name().to_string())
            .collect()
    }

    /// Whether an index named `name` exists
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.read().iter().any(|index| index.name() == name)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Row of `item`, if stored
    pub fn find(&self, item: &Arc<T>) -> Result<Option<RowId>> {
        let _guard = self.read_guard()?;
        self.identities.try_get(&identity_of(item))
    }

    /// Whether `item` is stored
    pub fn contains(&self, item: &Arc<T>) -> Result<bool> {
        Ok(self.find(item)?.is_some())
    }

    /// Item stored under `row`
    pub fn get(&self, row: RowId) -> Result<Option<Arc<T>>> {
        let _guard = self.read_guard()?;
        self.rows.try_get(&row)
    }

    /// First live item whose `name` property equals `value`
    pub fn get_first_by_property(&self, name: &str, value: &Value) -> Result<Option<Arc<T>>> {
        let Some(index) = self.index(name)? else {
            return Ok(None);
        };
        let mut dead = Vec::new();
        let found = {
            let _guard = self.read_guard()?;
            let mut found = None;
            if let Some(bag) = index.bag(value)? {
                for id in bag.iter() {
                    let row = RowId::new(id);
                    match self.rows.try_get(&row)? {
                        Some(item) if item.is_alive() => {
                            found = Some(item);
                            break;
                        }
                        Some(_) => dead.push(row),
                        None => {}
                    }
                }
            }
            found
        };
        self.evict_opportunistically(dead);
        Ok(found)
    }

    /// Every live item whose `name` property equals `value`, in row order
    pub fn get_all_by_property(&self, name: &str, value: &Value) -> Result<Vec<Arc<T>>> {
        let Some(index) = self.index(name)? else {
            return Ok(Vec::new());
        };
        let mut dead = Vec::new();
        let items = {
            let _guard = self.read_guard()?;
            let mut rows: Vec<u64> = index.bag(value)?.map(|b| b.to_vec()).unwrap_or_default();
            rows.sort_unstable();
            let mut items = Vec::with_capacity(rows.len());
            for id in rows {
                let row = RowId::new(id);
                match self.rows.try_get(&row)? {
                    Some(item) if item.is_alive() => items.push(item),
                    Some(_) => dead.push(row),
                    None => {}
                }
            }
            items
        };
        self.evict_opportunistically(dead);
        Ok(items)
    }

    /// Number of rows filed under `value` in index `name`
    pub fn bag_len(&self, name: &str, value: &Value) -> Result<usize> {
        match self.index(name)? {
            Some(index) => index.bag_len(value),
            None => Ok(0),
        }
    }

    /// Number of distinct values with a bag in index `name`
    ///
    /// Bags are dropped as they empty, so this equals the number of values
    /// some stored row currently holds.
    pub fn distinct_values(&self, name: &str) -> Result<usize> {
        Ok(self.index(name)?.map_or(0, |index| index.distinct_values()))
    }

    /// Number of stored rows, live or not
    pub fn count(&self) -> usize {
        self.rows.count()
    }

    /// Alias for [`count`](Self::count)
    pub fn len(&self) -> usize {
        self.count()
    }

    /// Whether the store holds no rows
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    fn collect_live(&self, entries: Vec<(RowId, Arc<T>)>) -> Vec<(RowId, Arc<T>)> {
        let mut dead = Vec::new();
        let mut live: Vec<(RowId, Arc<T>)> = entries
            .into_iter()
            .filter(|(row, item)| {
                let alive = item.is_alive();
                if !alive {
                    dead.push(*row);
                }
                alive
            })
            .collect();
        live.sort_unstable_by_key(|(row, _)| *row);
        self.evict_opportunistically(dead);
        live
    }

    /// Live items in row order, without the structural lock
    pub fn enumerate(&self) -> Result<Vec<Arc<T>>> {
        let entries = self.rows.enumerate()?;
        Ok(self
            .collect_live(entries)
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    /// Live items in row order, read under the structural lock
    pub fn safe_enumerate(&self) -> Result<Vec<Arc<T>>> {
        let entries = {
            let _guard = read_for(&self.structure, self.timeout(), "store")?;
            self.rows.safe_enumerate()?
        };
        Ok(self
            .collect_live(entries)
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    /// Live (row, item) pairs in row order, read under the structural lock
    pub fn safe_entries(&self) -> Result<Vec<(RowId, Arc<T>)>> {
        let entries = {
            let _guard = read_for(&self.structure, self.timeout(), "store")?;
            self.rows.safe_enumerate()?
        };
        Ok(self.collect_live(entries))
    }

    /// Live items matching `predicate`, in row order
    pub fn enumerate_where<F>(&self, mut predicate: F) -> Result<Vec<Arc<T>>>
    where
        F: FnMut(&T) -> bool,
    {
        Ok(self
            .safe_enumerate()?
            .into_iter()
            .filter(|item| predicate(&**item))
            .collect())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove dead rows if the structural lock is free right now
    fn evict_opportunistically(&self, dead: Vec<RowId>) {
        if dead.is_empty() {
            return;
        }
        let Some(_guard) = self.structure.try_write() else {
            return;
        };
        for row in dead {
            if let Err(e) = self.remove_row_locked(row) {
                warn!(%row, error = %e, "failed to evict dead row");
            }
        }
    }

    /// Remove every row whose item is no longer alive
    pub fn evict_dead(&self) -> Result<usize> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        let mut evicted = 0;
        for (row, item) in self.rows.safe_enumerate()? {
            if !item.is_alive() && self.remove_row_locked(row)? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "evicted dead rows");
        }
        Ok(evicted)
    }

    /// Drop every row and bag; indexes stay configured
    pub fn clear(&self) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        self.rows.clear()?;
        self.identities.clear()?;
        for index in self.index_snapshot() {
            index.clear()?;
        }
        debug!("store cleared");
        Ok(())
    }

    /// Consolidate every underlying map into a single bucket
    pub fn compact(&self) -> Result<()> {
        let _guard = write_for(&self.structure, self.timeout(), "store")?;
        self.rows.compact()?;
        self.identities.compact()?;
        for index in self.index_snapshot() {
            index.compact()?;
        }
        Ok(())
    }
}

impl<T: Indexable + ?Sized + 'static> fmt::Debug for MultiIndexStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiIndexStore")
            .field("rows", &self.count())
            .field("indexes", &self.index_names())
            .field("assume_safe", &self.assume_safe)
            .finish()
    }
}

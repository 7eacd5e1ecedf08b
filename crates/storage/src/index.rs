//! Secondary property indexes
//!
//! A [`PropertyIndex`] maps each distinct value of one property to a bag of
//! row ids holding that value:
//! - Bags are `TombstoneGrowableArray`s kept in a `ThreadPartitionedMap`
//! - A unique index admits at most one id per bag
//! - A never-track-null index skips items whose value is null or missing
//! - A bag that becomes empty is removed from the map
//!
//! Mutations here are not atomic across bags on their own. The owning
//! [`MultiIndexStore`](crate::MultiIndexStore) serialises them under its
//! structural lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use objtrack_concurrency::{ThreadPartitionedMap, TombstoneGrowableArray};
use objtrack_core::{CollectionOptions, Error, IndexConfig, Indexable, Result, RowId, Value};

/// Starting capacity of a freshly created bag
const BAG_CAPACITY: usize = 4;

/// Result of placing a row into a bag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagInsert {
    /// The row id was appended
    Added,
    /// A unique bag already held `existing`; the row was not appended
    Shared {
        /// Row already owning the value
        existing: RowId,
    },
}

/// Index of one property: value → bag of row ids
pub struct PropertyIndex {
    name: String,
    unique: AtomicBool,
    never_track_null: AtomicBool,
    bags: ThreadPartitionedMap<Value, Arc<TombstoneGrowableArray>>,
}

impl PropertyIndex {
    /// Build an empty index from its definition
    pub fn new(config: &IndexConfig, options: &CollectionOptions) -> Self {
        Self {
            name: config.name.clone(),
            unique: AtomicBool::new(config.unique),
            never_track_null: AtomicBool::new(config.never_track_null),
            bags: ThreadPartitionedMap::with_options(options),
        }
    }

    /// Indexed property name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether at most one row may hold each value
    pub fn is_unique(&self) -> bool {
        self.unique.load(Ordering::Acquire)
    }

    /// Whether null values are left out of the index
    pub fn never_tracks_null(&self) -> bool {
        self.never_track_null.load(Ordering::Acquire)
    }

    pub(crate) fn set_unique(&self) {
        self.unique.store(true, Ordering::Release);
    }

    /// Stop tracking nulls and drop the null bag
    pub(crate) fn set_never_track_null(&self) -> Result<()> {
        self.never_track_null.store(true, Ordering::Release);
        self.bags.remove(&Value::Null)?;
        Ok(())
    }

    pub(crate) fn set_disallow_dirty_reads(&self, disallow: bool) {
        self.bags.set_disallow_dirty_reads(disallow);
    }

    /// Key under which a property value is indexed, `None` if it is skipped
    pub fn normalize(&self, value: Option<Value>) -> Option<Value> {
        match value {
            Some(v) if !v.is_null() => Some(v),
            _ if self.never_tracks_null() => None,
            _ => Some(Value::Null),
        }
    }

    /// Key for `item`'s current value of this property
    pub fn key_for<T: Indexable + ?Sized>(&self, item: &T) -> Option<Value> {
        self.normalize(item.get_value(&self.name, false))
    }

    /// Bag for `value`, if any row holds it
    pub fn bag(&self, value: &Value) -> Result<Option<Arc<TombstoneGrowableArray>>> {
        self.bags.try_get(value)
    }

    /// Number of rows holding `value`
    pub fn bag_len(&self, value: &Value) -> Result<usize> {
        Ok(self.bag(value)?.map_or(0, |bag| bag.len()))
    }

    /// Number of distinct values currently indexed
    pub fn distinct_values(&self) -> usize {
        self.bags.count()
    }

    /// Every (value, bag) pair
    pub fn bags(&self) -> Result<Vec<(Value, Arc<TombstoneGrowableArray>)>> {
        self.bags.safe_enumerate()
    }

    /// Place `row` in the bag for `value`
    ///
    /// On a unique index whose bag is already occupied, either report the
    /// occupant (`share_existing`) or fail with `ConstraintViolation`.
    pub fn insert(&self, value: &Value, row: RowId, share_existing: bool) -> Result<BagInsert> {
        let bag = self.bags.add_with_factory(value.clone(), |_| {
            Arc::new(TombstoneGrowableArray::with_capacity(BAG_CAPACITY))
        })?;

        if self.is_unique() {
            if let Some(existing) = bag.first() {
                if existing != row.as_u64() {
                    if share_existing {
                        return Ok(BagInsert::Shared {
                            existing: RowId::new(existing),
                        });
                    }
                    return Err(Error::constraint(self.name.as_str(), value));
                }
                return Ok(BagInsert::Added);
            }
        }

        bag.add(row.as_u64())?;
        Ok(BagInsert::Added)
    }

    /// Take `row` out of the bag for `value`, dropping the bag if it empties
    pub fn remove(&self, value: &Value, row: RowId) -> Result<bool> {
        let Some(bag) = self.bags.try_get(value)? else {
            return Ok(false);
        };
        let removed = bag.remove(row.as_u64());
        if bag.is_empty() {
            self.bags.remove(value)?;
        }
        Ok(removed)
    }

    /// Take `row` out of whichever bag holds it
    ///
    /// Used when the row's current value no longer matches the bag it was
    /// filed under.
    pub fn remove_anywhere(&self, row: RowId) -> Result<bool> {
        for (value, bag) in self.bags.safe_enumerate()? {
            if bag.remove(row.as_u64()) {
                if bag.is_empty() {
                    self.bags.remove(&value)?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move every row filed under `old` to `new`
    ///
    /// Merges into an existing destination bag. A unique index refuses to
    /// merge two occupied bags.
    pub fn move_bag(&self, old: &Value, new: &Value) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let Some(source) = self.bags.try_get(old)? else {
            return Ok(());
        };

        match self.bags.try_get(new)? {
            Some(dest) => {
                if self.is_unique() && !dest.is_empty() && !source.is_empty() {
                    return Err(Error::constraint(self.name.as_str(), new));
                }
                for id in source.iter() {
                    dest.add(id)?;
                }
            }
            None => {
                self.bags.upsert(new.clone(), Arc::clone(&source))?;
            }
        }
        self.bags.remove(old)?;
        Ok(())
    }

    /// Check that no bag holds more than one row
    pub fn validate_unique(&self) -> Result<()> {
        for (value, bag) in self.bags.safe_enumerate()? {
            if bag.len() > 1 {
                return Err(Error::constraint(self.name.as_str(), &value));
            }
        }
        Ok(())
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.bags.clear()
    }

    pub(crate) fn compact(&self) -> Result<()> {
        self.bags.compact()
    }
}

impl fmt::Debug for PropertyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyIndex")
            .field("name", &self.name)
            .field("unique", &self.is_unique())
            .field("never_track_null", &self.never_tracks_null())
            .field("values", &self.distinct_values())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(config: IndexConfig) -> PropertyIndex {
        PropertyIndex::new(&config, &CollectionOptions::with_buckets(2))
    }

    #[test]
    fn test_insert_and_remove_drops_empty_bag() {
        let idx = index(IndexConfig::new("Name"));
        let v = Value::from("a");
        assert_eq!(idx.insert(&v, RowId::new(1), false).unwrap(), BagInsert::Added);
        assert_eq!(idx.insert(&v, RowId::new(2), false).unwrap(), BagInsert::Added);
        assert_eq!(idx.bag_len(&v).unwrap(), 2);

        assert!(idx.remove(&v, RowId::new(1)).unwrap());
        assert!(idx.bag(&v).unwrap().is_some());
        assert!(idx.remove(&v, RowId::new(2)).unwrap());
        assert!(idx.bag(&v).unwrap().is_none());
        assert_eq!(idx.distinct_values(), 0);
    }

    #[test]
    fn test_unique_insert_conflict() {
        let idx = index(IndexConfig::new("SSN").unique());
        let v = Value::from("123");
        idx.insert(&v, RowId::new(1), false).unwrap();

        let err = idx.insert(&v, RowId::new(2), false).unwrap_err();
        assert!(err.is_constraint());

        let shared = idx.insert(&v, RowId::new(2), true).unwrap();
        assert_eq!(
            shared,
            BagInsert::Shared {
                existing: RowId::new(1)
            }
        );
        assert_eq!(idx.bag_len(&v).unwrap(), 1);
    }

    #[test]
    fn test_normalize_null_handling() {
        let tracking = index(IndexConfig::new("P"));
        assert_eq!(tracking.normalize(None), Some(Value::Null));
        assert_eq!(tracking.normalize(Some(Value::Null)), Some(Value::Null));

        let skipping = index(IndexConfig::new("P").never_track_null());
        assert_eq!(skipping.normalize(None), None);
        assert_eq!(skipping.normalize(Some(Value::Int(3))), Some(Value::Int(3)));
    }

    #[test]
    fn test_set_never_track_null_drops_null_bag() {
        let idx = index(IndexConfig::new("P"));
        idx.insert(&Value::Null, RowId::new(1), false).unwrap();
        idx.set_never_track_null().unwrap();
        assert!(idx.bag(&Value::Null).unwrap().is_none());
        assert!(idx.never_tracks_null());
    }

    #[test]
    fn test_move_bag_merges() {
        let idx = index(IndexConfig::new("City"));
        let a = Value::from("A");
        let b = Value::from("B");
        idx.insert(&a, RowId::new(1), false).unwrap();
        idx.insert(&a, RowId::new(2), false).unwrap();
        idx.insert(&b, RowId::new(3), false).unwrap();

        idx.move_bag(&a, &b).unwrap();
        assert!(idx.bag(&a).unwrap().is_none());
        let mut rows = idx.bag(&b).unwrap().unwrap().to_vec();
        rows.sort_unstable();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[test]
    fn test_move_bag_unique_refuses_merge() {
        let idx = index(IndexConfig::new("SSN").unique());
        let a = Value::from("1");
        let b = Value::from("2");
        idx.insert(&a, RowId::new(1), false).unwrap();
        idx.insert(&b, RowId::new(2), false).unwrap();

        assert!(idx.move_bag(&a, &b).unwrap_err().is_constraint());
        assert_eq!(idx.bag_len(&a).unwrap(), 1);
        assert_eq!(idx.bag_len(&b).unwrap(), 1);
    }

    #[test]
    fn test_move_bag_to_fresh_value() {
        let idx = index(IndexConfig::new("SSN").unique());
        let a = Value::from("1");
        let b = Value::from("2");
        idx.insert(&a, RowId::new(7), false).unwrap();
        idx.move_bag(&a, &b).unwrap();
        assert_eq!(idx.bag(&b).unwrap().unwrap().first(), Some(7));
    }

    #[test]
    fn test_remove_anywhere() {
        let idx = index(IndexConfig::new("P"));
        idx.insert(&Value::Int(1), RowId::new(5), false).unwrap();
        assert!(idx.remove_anywhere(RowId::new(5)).unwrap());
        assert!(!idx.remove_anywhere(RowId::new(5)).unwrap());
        assert_eq!(idx.distinct_values(), 0);
    }

    #[test]
    fn test_validate_unique() {
        let idx = index(IndexConfig::new("P"));
        idx.insert(&Value::Int(1), RowId::new(1), false).unwrap();
        assert!(idx.validate_unique().is_ok());
        idx.insert(&Value::Int(1), RowId::new(2), false).unwrap();
        assert!(idx.validate_unique().unwrap_err().is_constraint());
    }
}

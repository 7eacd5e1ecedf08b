//! Object tracker
//!
//! An [`ObjectTracker`] is one unit-of-work scope. It owns a
//! `MultiIndexStore<TrackedObject>` indexed by instance address, wrapper
//! address, and any configured domain properties, and it drives every
//! lifecycle change of the records it holds.
//!
//! # Entry points
//!
//! - `include` / `include_wrapped`: existing objects, start `Unchanged`;
//!   including a deleted object again resets it to `Unchanged`
//! - `create`: new objects, start `Added`; a unique-key collision is an error
//! - `materialize`: objects loaded by a query; a unique-key collision
//!   collapses the new record into the one already tracked
//!
//! # Cascades
//!
//! `delete` and `unlink` ask the [`RelationshipProvider`] for children and
//! re-enter the same store for each of them. A visited set stops cycles.

use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use objtrack_core::{Error, IndexConfig, Indexable, Result, ScopeId, StoreConfig, Value};
use objtrack_storage::{AddOutcome, MultiIndexStore};

use crate::entity::{address_of, address_value, Entity, PropertyAccessor};
use crate::relationships::{DeletePolicy, NoRelationships, RelationshipProvider};
use crate::state::EntityState;
use crate::tracked::{TrackedObject, INSTANCE_PROPERTY, WRAPPER_PROPERTY};

/// How an object enters the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Include,
    Create,
    Materialize,
    /// Reached through a relationship; never resets a deleted record
    Attach,
}

/// Pending changes in save order
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Rows whose foreign keys were nulled ahead of dependent deletes
    pub modified_priority: Vec<Arc<TrackedObject>>,
    /// New rows
    pub added: Vec<Arc<TrackedObject>>,
    /// Changed rows
    pub modified: Vec<Arc<TrackedObject>>,
    /// Rows to delete
    pub deleted: Vec<Arc<TrackedObject>>,
}

impl ChangeSet {
    fn push(&mut self, record: Arc<TrackedObject>) {
        match record.state() {
            EntityState::ModifiedPriority => self.modified_priority.push(record),
            EntityState::Added => self.added.push(record),
            EntityState::Modified => self.modified.push(record),
            EntityState::Deleted => self.deleted.push(record),
            EntityState::Unchanged | EntityState::Unlinked => {}
        }
    }

    /// Every pending record: priority, added, modified, then deleted
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrackedObject>> {
        self.modified_priority
            .iter()
            .chain(&self.added)
            .chain(&self.modified)
            .chain(&self.deleted)
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.modified_priority.len() + self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Put the identity indexes in front of the configured ones
fn with_identity_indexes(mut config: StoreConfig) -> StoreConfig {
    for name in [WRAPPER_PROPERTY, INSTANCE_PROPERTY] {
        if !config.indexes.iter().any(|index| index.name == name) {
            config
                .indexes
                .insert(0, IndexConfig::new(name).unique().never_track_null());
        }
    }
    config
}

/// One unit-of-work scope of tracked objects
pub struct ObjectTracker {
    scope: ScopeId,
    store: MultiIndexStore<TrackedObject>,
    relationships: Arc<dyn RelationshipProvider>,
    accessor: Option<Arc<dyn PropertyAccessor>>,
    disposed: AtomicBool,
}

impl ObjectTracker {
    /// Open a scope with the given store layout and relationship source
    pub fn new(config: StoreConfig, relationships: Arc<dyn RelationshipProvider>) -> Result<Self> {
        let store = MultiIndexStore::new(with_identity_indexes(config))?;
        let scope = ScopeId::new();
        info!(scope = %scope, indexes = ?store.index_names(), "tracking scope created");
        Ok(Self {
            scope,
            store,
            relationships,
            accessor: None,
            disposed: AtomicBool::new(false),
        })
    }

    /// Scope with default options, no domain indexes and no relationships
    pub fn with_defaults() -> Result<Self> {
        Self::new(StoreConfig::default(), Arc::new(NoRelationships))
    }

    /// Route property access of new records through `accessor`
    pub fn with_accessor(mut self, accessor: Arc<dyn PropertyAccessor>) -> Self {
        self.accessor = Some(accessor);
        self
    }

    /// Identifier of this scope
    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    /// Underlying store
    pub fn store(&self) -> &MultiIndexStore<TrackedObject> {
        &self.store
    }

    /// Whether `dispose` has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::invalid_argument(format!(
                "tracking scope {} is disposed",
                self.scope
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Entering the scope
    // ========================================================================

    /// Track an existing object as `Unchanged`
    pub fn include(&self, instance: Arc<dyn Entity>) -> Result<Arc<TrackedObject>> {
        self.track(instance, None, EntityState::Unchanged, Entry::Include)
    }

    /// Track an existing object seen through `wrapper`
    pub fn include_wrapped(
        &self,
        instance: Arc<dyn Entity>,
        wrapper: Arc<dyn Entity>,
    ) -> Result<Arc<TrackedObject>> {
        self.track(instance, Some(wrapper), EntityState::Unchanged, Entry::Include)
    }

    /// Track a newly constructed object as `Added`
    pub fn create(&self, instance: Arc<dyn Entity>) -> Result<Arc<TrackedObject>> {
        self.track(instance, None, EntityState::Added, Entry::Create)
    }

    /// Track an object produced by a query
    ///
    /// When a unique domain key is already held by a live record, that
    /// record is returned and the new one is unlinked.
    pub fn materialize(&self, instance: Arc<dyn Entity>) -> Result<Arc<TrackedObject>> {
        self.track(instance, None, EntityState::Unchanged, Entry::Materialize)
    }

    fn track(
        &self,
        instance: Arc<dyn Entity>,
        wrapper: Option<Arc<dyn Entity>>,
        state: EntityState,
        entry: Entry,
    ) -> Result<Arc<TrackedObject>> {
        self.ensure_open()?;
        if let Some(existing) = self.find_existing(&*instance, wrapper.as_deref())? {
            return self.reuse(existing, entry);
        }

        // A dead record may still hold our address; evict it and retry once.
        for _ in 0..2 {
            let mut record = TrackedObject::new(&instance, wrapper.as_ref(), state);
            if let Some(accessor) = &self.accessor {
                record = record.with_accessor(Arc::clone(accessor));
            }
            let record = Arc::new(record);

            match self.store.add(Arc::clone(&record), true)? {
                AddOutcome::Inserted(row) | AddOutcome::AlreadyPresent(row) => {
                    trace!(scope = %self.scope, %row, entity = record.base_name(), %state, "tracking");
                    return Ok(record);
                }
                AddOutcome::SharedUnique {
                    row,
                    existing,
                    property,
                } => {
                    let survivor = self.store.get(existing)?.filter(|s| s.is_alive());
                    let Some(survivor) = survivor else {
                        self.discard(&record)?;
                        self.store.remove_row(existing)?;
                        continue;
                    };

                    if property == INSTANCE_PROPERTY || property == WRAPPER_PROPERTY {
                        // lost a race to track the same object
                        self.discard(&record)?;
                        return self.reuse(survivor, entry);
                    }
                    match entry {
                        Entry::Materialize => {
                            self.discard(&record)?;
                            debug!(
                                scope = %self.scope,
                                property = %property,
                                survivor = survivor.base_name(),
                                "collapsed duplicate"
                            );
                            return Ok(survivor);
                        }
                        Entry::Create => {
                            let value = record.get_value(&property, false).unwrap_or(Value::Null);
                            self.discard(&record)?;
                            return Err(Error::constraint(property, value));
                        }
                        Entry::Include | Entry::Attach => {
                            trace!(scope = %self.scope, %row, property = %property, "tracking with shared unique key");
                            return Ok(record);
                        }
                    }
                }
            }
        }
        Err(Error::corrupt(format!(
            "could not track {} after evicting a stale record",
            instance.type_name()
        )))
    }

    fn reuse(&self, existing: Arc<TrackedObject>, entry: Entry) -> Result<Arc<TrackedObject>> {
        if matches!(entry, Entry::Include | Entry::Create) {
            existing.update_state(|s| Ok(s.reset()))?;
        }
        Ok(existing)
    }

    /// Remove a record from the store and mark it unlinked
    fn discard(&self, record: &Arc<TrackedObject>) -> Result<()> {
        self.store.remove(record)?;
        record.transition(EntityState::Unlinked)?;
        record.clear_originals();
        Ok(())
    }

    fn find_existing(
        &self,
        instance: &dyn Entity,
        wrapper: Option<&dyn Entity>,
    ) -> Result<Option<Arc<TrackedObject>>> {
        if let Some(wrapper) = wrapper {
            if let Some(found) = self.lookup(wrapper)? {
                return Ok(Some(found));
            }
        }
        self.lookup(instance)
    }

    fn lookup(&self, entity: &dyn Entity) -> Result<Option<Arc<TrackedObject>>> {
        let key = address_value(address_of(entity));
        if let Some(found) = self.store.get_first_by_property(WRAPPER_PROPERTY, &key)? {
            return Ok(Some(found));
        }
        self.store.get_first_by_property(INSTANCE_PROPERTY, &key)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Record tracking `entity` as instance or wrapper
    pub fn get(&self, entity: &dyn Entity) -> Result<Option<Arc<TrackedObject>>> {
        self.ensure_open()?;
        self.lookup(entity)
    }

    fn require(&self, entity: &dyn Entity) -> Result<Arc<TrackedObject>> {
        self.get(entity)?.ok_or_else(|| {
            Error::invalid_argument(format!("{} is not tracked in this scope", entity.type_name()))
        })
    }

    /// First record whose indexed domain property `name` equals `value`
    pub fn find_by(&self, name: &str, value: &Value) -> Result<Option<Arc<TrackedObject>>> {
        self.ensure_open()?;
        self.store.get_first_by_property(name, value)
    }

    /// Lifecycle state of `entity`, `None` if untracked
    pub fn state_of(&self, entity: &dyn Entity) -> Result<Option<EntityState>> {
        Ok(self.get(entity)?.map(|record| record.state()))
    }

    /// Every live record
    pub fn tracked(&self) -> Result<Vec<Arc<TrackedObject>>> {
        self.ensure_open()?;
        self.store.safe_enumerate()
    }

    /// Number of records in the store
    pub fn tracked_count(&self) -> usize {
        self.store.count()
    }

    // ========================================================================
    // State changes
    // ========================================================================

    /// Move `entity` to `state`, returning the previous state
    ///
    /// `Unlinked` evicts the record.
    pub fn set_state(&self, entity: &dyn Entity, state: EntityState) -> Result<EntityState> {
        let record = self.require(entity)?;
        if state == EntityState::Unlinked {
            let previous = record.state();
            self.discard(&record)?;
            return Ok(previous);
        }
        record.transition(state)
    }

    /// Report that `name` on `entity` changed from `old` to `new`
    ///
    /// Records the original value, moves the record's index entry when
    /// `name` is indexed, and marks the record modified.
    pub fn property_changed(
        &self,
        entity: &dyn Entity,
        name: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        let record = self.require(entity)?;
        record.state().after_property_change()?;
        self.apply_change(&record, name, old, new)?;
        record.update_state(EntityState::after_property_change)?;
        Ok(())
    }

    /// Set `name` on `entity` and report the change
    pub fn set_property(&self, entity: &dyn Entity, name: &str, value: Value) -> Result<()> {
        let record = self.require(entity)?;
        record.state().after_property_change()?;
        self.assign(&record, name, value)?;
        record.update_state(EntityState::after_property_change)?;
        Ok(())
    }

    /// Write a property and keep indexes and originals in step, state untouched
    fn assign(&self, record: &Arc<TrackedObject>, name: &str, value: Value) -> Result<()> {
        let old = record.set_property(name, value.clone())?;
        if let Err(e) = self.apply_change(record, name, old.clone(), Some(value)) {
            record.set_property(name, old.unwrap_or(Value::Null))?;
            return Err(e);
        }
        Ok(())
    }

    fn apply_change(
        &self,
        record: &Arc<TrackedObject>,
        name: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.store.has_index(name) {
            self.store.reindex_item(record, name, old.clone(), new)?;
        }
        record.record_original(name, old);
        Ok(())
    }

    // ========================================================================
    // Cascades
    // ========================================================================

    /// Mark `entity` deleted, handling its children per `policy`
    pub fn delete(&self, entity: &dyn Entity, policy: DeletePolicy) -> Result<()> {
        let record = self.require(entity)?;
        let mut visited = FxHashSet::default();
        self.delete_record(&record, policy, &mut visited)
    }

    fn delete_record(
        &self,
        record: &Arc<TrackedObject>,
        policy: DeletePolicy,
        visited: &mut FxHashSet<usize>,
    ) -> Result<()> {
        if !visited.insert(record.instance_address()) || record.state() == EntityState::Deleted {
            return Ok(());
        }
        let Some(entity) = record.instance() else {
            return Ok(());
        };
        let children = self.relationships.children_of(&*entity);

        match policy {
            DeletePolicy::Fail => {
                let mut blocking = 0;
                for link in &children {
                    let deleted = self
                        .lookup(&*link.child)?
                        .is_some_and(|child| child.state() == EntityState::Deleted);
                    if !deleted {
                        blocking += 1;
                    }
                }
                if blocking > 0 {
                    return Err(Error::DeleteRestricted {
                        entity: record.base_name().to_string(),
                        children: blocking,
                    });
                }
            }
            DeletePolicy::Cascade => {
                for link in children {
                    let child = self.track(link.child, None, EntityState::Unchanged, Entry::Attach)?;
                    self.delete_record(&child, DeletePolicy::Cascade, visited)?;
                }
            }
            DeletePolicy::SetNull => {
                for link in children {
                    let child = self.track(link.child, None, EntityState::Unchanged, Entry::Attach)?;
                    if matches!(child.state(), EntityState::Deleted | EntityState::Unlinked) {
                        continue;
                    }
                    for key in &link.foreign_keys {
                        self.assign(&child, key, Value::Null)?;
                    }
                    child.update_state(|s| Ok(s.after_detach()))?;
                }
            }
        }

        record.transition(EntityState::Deleted)?;
        debug!(scope = %self.scope, entity = record.base_name(), ?policy, "marked deleted");
        Ok(())
    }

    /// Evict `entity`, and its tracked children when `cascade` is set
    ///
    /// Returns how many records were evicted.
    pub fn unlink(&self, entity: &dyn Entity, cascade: bool) -> Result<usize> {
        let record = self.require(entity)?;
        let mut visited = FxHashSet::default();
        self.unlink_record(&record, cascade, &mut visited)
    }

    fn unlink_record(
        &self,
        record: &Arc<TrackedObject>,
        cascade: bool,
        visited: &mut FxHashSet<usize>,
    ) -> Result<usize> {
        if !visited.insert(record.instance_address()) {
            return Ok(0);
        }
        let mut evicted = 0;
        if cascade {
            if let Some(entity) = record.instance() {
                for link in self.relationships.children_of(&*entity) {
                    if let Some(child) = self.lookup(&*link.child)? {
                        evicted += self.unlink_record(&child, true, visited)?;
                    }
                }
            }
        }
        self.discard(record)?;
        trace!(scope = %self.scope, entity = record.base_name(), "unlinked");
        Ok(evicted + 1)
    }

    /// Fold the record of `duplicate` into the record of `survivor`
    ///
    /// The duplicate is unlinked; the survivor is returned.
    pub fn collapse_duplicate(
        &self,
        duplicate: &dyn Entity,
        survivor: &dyn Entity,
    ) -> Result<Arc<TrackedObject>> {
        let kept = self.require(survivor)?;
        let dropped = self.require(duplicate)?;
        if !Arc::ptr_eq(&kept, &dropped) {
            self.discard(&dropped)?;
            debug!(
                scope = %self.scope,
                duplicate = dropped.base_name(),
                survivor = kept.base_name(),
                "collapsed duplicate"
            );
        }
        Ok(kept)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Pending records accepted by `filter`, in save order
    pub fn pending_changes<F>(&self, filter: F) -> Result<ChangeSet>
    where
        F: Fn(&TrackedObject) -> bool,
    {
        self.ensure_open()?;
        let mut changes = ChangeSet::default();
        for record in self.store.safe_enumerate()? {
            if record.state().is_pending() && filter(&*record) {
                changes.push(record);
            }
        }
        Ok(changes)
    }

    /// Every pending record, in save order
    pub fn all_pending_changes(&self) -> Result<ChangeSet> {
        self.pending_changes(|_| true)
    }

    /// Mark a saved change set as persisted
    ///
    /// Saved rows return to `Unchanged` and forget their original values;
    /// deleted rows are evicted.
    pub fn accept_changes(&self, changes: &ChangeSet) -> Result<()> {
        self.ensure_open()?;
        for record in changes
            .modified_priority
            .iter()
            .chain(&changes.added)
            .chain(&changes.modified)
        {
            record.update_state(|s| match s {
                EntityState::Added | EntityState::Modified | EntityState::ModifiedPriority => {
                    s.transition(EntityState::Unchanged)
                }
                other => Ok(other),
            })?;
            record.clear_originals();
        }
        for record in &changes.deleted {
            if record.state() == EntityState::Deleted {
                self.discard(record)?;
            }
        }
        debug!(scope = %self.scope, saved = changes.len(), "changes accepted");
        Ok(())
    }

    /// Evict every record whose object no longer exists
    pub fn evict_dead(&self) -> Result<usize> {
        self.store.evict_dead()
    }

    /// Close the scope: every record is unlinked and the store emptied
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let records = self.store.safe_enumerate()?;
        for record in &records {
            record.transition(EntityState::Unlinked)?;
        }
        self.store.clear()?;
        info!(scope = %self.scope, unlinked = records.len(), "tracking scope disposed");
        Ok(())
    }
}

impl fmt::Debug for ObjectTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTracker")
            .field("scope", &self.scope)
            .field("tracked", &self.tracked_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

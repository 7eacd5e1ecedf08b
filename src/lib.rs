//! objtrack - concurrent in-process object tracking
//!
//! objtrack holds the live domain objects of a unit of work, indexes them by
//! property, and records each object's lifecycle state so a later save pass
//! knows what to persist.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use objtrack::{DeletePolicy, Entity, EntityState, ObjectTracker, Result, Value};
//!
//! struct Note(Mutex<String>);
//!
//! impl Entity for Note {
//!     fn type_name(&self) -> &str { "Note" }
//!     fn get_property(&self, name: &str) -> Option<Value> {
//!         (name == "Text").then(|| Value::from(self.0.lock().as_str()))
//!     }
//!     fn set_property(&self, _name: &str, value: Value) -> Result<()> {
//!         *self.0.lock() = value.as_str().unwrap_or_default().to_string();
//!         Ok(())
//!     }
//! }
//!
//! let tracker = ObjectTracker::with_defaults()?;
//! let note = Arc::new(Note(Mutex::new("draft".into())));
//! tracker.include(note.clone())?;
//!
//! tracker.set_property(&*note, "Text", Value::from("final"))?;
//! assert_eq!(tracker.state_of(&*note)?, Some(EntityState::Modified));
//!
//! tracker.delete(&*note, DeletePolicy::Fail)?;
//! let changes = tracker.all_pending_changes()?;
//! assert_eq!(changes.deleted.len(), 1);
//! # Ok::<(), objtrack::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `objtrack-core`: values, errors, configuration, shared traits
//! - `objtrack-concurrency`: thread-partitioned map, append list, growable id array
//! - `objtrack-storage`: multi-index store with unique and null-skipping indexes
//! - `objtrack-engine`: tracked objects, lifecycle state machine, cascades

pub use objtrack_concurrency::{
    current_slot, ObserverId, SegmentedAppendList, ShardSlot, ThreadPartitionedMap,
    TombstoneGrowableArray,
};
pub use objtrack_core::{
    ChangeKind, CollectionChange, CollectionObserver, CollectionOptions, Error, ErrorKind,
    IndexConfig, Indexable, Result, RowId, ScopeId, StoreConfig, Value,
};
pub use objtrack_engine::{
    ChangeSet, ChildLink, DeletePolicy, Entity, EntityState, NoRelationships, ObjectTracker,
    PropertyAccessor, RelationshipProvider, TrackedObject,
};
pub use objtrack_storage::{AddOutcome, MultiIndexStore};

//! Collection change notifications
//!
//! Structural mutations of observable collections are broadcast as a
//! [`CollectionChange`] (kind, affected item(s), position). Observers are
//! invoked after the mutation has been applied.

use std::sync::Arc;

/// Kind of structural mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Item appended
    Add,
    /// Item removed
    Remove,
    /// Item replaced in place
    Replace,
    /// Collection cleared or rebuilt
    Reset,
}

/// One structural mutation
#[derive(Debug)]
pub enum CollectionChange<T> {
    /// `item` was added at logical `position`
    Add {
        /// New item
        item: Arc<T>,
        /// Logical position of the new item
        position: usize,
    },
    /// `item` was removed from logical `position`
    Remove {
        /// Removed item
        item: Arc<T>,
        /// Logical position it occupied
        position: usize,
    },
    /// `old` was replaced by `new` at logical `position`
    Replace {
        /// Previous item
        old: Arc<T>,
        /// Replacement
        new: Arc<T>,
        /// Logical position
        position: usize,
    },
    /// Everything changed
    Reset,
}

impl<T> CollectionChange<T> {
    /// The kind of this change
    pub fn kind(&self) -> ChangeKind {
        match self {
            CollectionChange::Add { .. } => ChangeKind::Add,
            CollectionChange::Remove { .. } => ChangeKind::Remove,
            CollectionChange::Replace { .. } => ChangeKind::Replace,
            CollectionChange::Reset => ChangeKind::Reset,
        }
    }

    /// Logical position, if the change has one
    pub fn position(&self) -> Option<usize> {
        match self {
            CollectionChange::Add { position, .. }
            | CollectionChange::Remove { position, .. }
            | CollectionChange::Replace { position, .. } => Some(*position),
            CollectionChange::Reset => None,
        }
    }
}

/// Receives collection notifications
///
/// Callbacks run on the mutating thread while the mutation is still held,
/// so they must not call back into the collection that raised them.
pub trait CollectionObserver<T>: Send + Sync {
    /// A structural change happened
    fn collection_changed(&self, change: &CollectionChange<T>);

    /// A derived property (`"Count"`, `"Item[]"`) changed
    fn property_changed(&self, _property: &str) {}
}

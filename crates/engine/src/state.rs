//! Entity lifecycle states
//!
//! Allowed edges:
//! - `Unchanged → Modified | ModifiedPriority | Deleted`
//! - `Added → Modified | Deleted`
//! - `Modified → ModifiedPriority | Deleted`
//! - `ModifiedPriority → Deleted`
//! - save completion: `Added | Modified | ModifiedPriority → Unchanged`
//! - any state `→ Unlinked` (terminal)
//!
//! `Deleted` is left only by unlinking or by an explicit re-include, which
//! the tracker performs with [`EntityState::reset`].

use std::fmt;

use objtrack_core::{Error, Result};

/// Lifecycle state of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityState {
    /// Loaded and not changed since
    Unchanged,
    /// Newly constructed, not yet persisted
    Added,
    /// Changed since it was loaded
    Modified,
    /// Changed, and must be persisted before ordinary modified rows
    ModifiedPriority,
    /// Marked for deletion
    Deleted,
    /// Evicted from the store; never saved
    Unlinked,
}

impl EntityState {
    /// Every state, in declaration order
    pub const ALL: [EntityState; 6] = [
        EntityState::Unchanged,
        EntityState::Added,
        EntityState::Modified,
        EntityState::ModifiedPriority,
        EntityState::Deleted,
        EntityState::Unlinked,
    ];

    /// Whether `self → to` is an allowed edge
    ///
    /// Self-transitions are allowed and change nothing.
    pub fn can_transition_to(self, to: EntityState) -> bool {
        use EntityState::*;
        if self == to || to == Unlinked {
            return true;
        }
        matches!(
            (self, to),
            (Unchanged, Modified | ModifiedPriority | Deleted)
                | (Added, Modified | Deleted | Unchanged)
                | (Modified, ModifiedPriority | Deleted | Unchanged)
                | (ModifiedPriority, Deleted | Unchanged)
        )
    }

    /// Validate `self → to` and return the new state
    pub fn transition(self, to: EntityState) -> Result<EntityState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// State after a tracked property changes
    pub fn after_property_change(self) -> Result<EntityState> {
        match self {
            EntityState::Unchanged | EntityState::Added => self.transition(EntityState::Modified),
            EntityState::Modified | EntityState::ModifiedPriority => Ok(self),
            EntityState::Deleted | EntityState::Unlinked => self.transition(EntityState::Modified),
        }
    }

    /// State after a foreign key is nulled by a cascading set-null
    ///
    /// Rows that were never persisted keep their state.
    pub fn after_detach(self) -> EntityState {
        match self {
            EntityState::Unchanged | EntityState::Modified => EntityState::ModifiedPriority,
            other => other,
        }
    }

    /// State of an object that is included again after being deleted
    pub fn reset(self) -> EntityState {
        match self {
            EntityState::Deleted => EntityState::Unchanged,
            other => other,
        }
    }

    /// Whether the object must be written by the next save
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added
                | EntityState::Modified
                | EntityState::ModifiedPriority
                | EntityState::Deleted
        )
    }

    /// Position in the save order, `None` for states that are not saved
    pub fn save_rank(self) -> Option<u8> {
        match self {
            EntityState::ModifiedPriority => Some(0),
            EntityState::Added => Some(1),
            EntityState::Modified => Some(2),
            EntityState::Deleted => Some(3),
            EntityState::Unchanged | EntityState::Unlinked => None,
        }
    }

    /// Name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::ModifiedPriority => "ModifiedPriority",
            EntityState::Deleted => "Deleted",
            EntityState::Unlinked => "Unlinked",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Relationship collaborator
//!
//! The tracker knows nothing about keys or foreign keys on its own. Cascading
//! delete and unlink ask a [`RelationshipProvider`] for the children of an
//! entity and act on what it returns.

use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;

/// What happens to children when their parent is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Delete every reachable child as well
    Cascade,
    /// Null the children's foreign keys and save them first
    SetNull,
    /// Refuse while any child is not deleted
    #[default]
    Fail,
}

/// One child of a parent entity
#[derive(Clone)]
pub struct ChildLink {
    /// The child entity
    pub child: Arc<dyn Entity>,
    /// Child properties referencing the parent
    pub foreign_keys: Vec<String>,
}

impl ChildLink {
    /// Link to `child` through `foreign_keys`
    pub fn new<I, S>(child: Arc<dyn Entity>, foreign_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            child,
            foreign_keys: foreign_keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Debug for ChildLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildLink")
            .field("child", &self.child.type_name())
            .field("foreign_keys", &self.foreign_keys)
            .finish()
    }
}

/// Source of parent → child relationships
pub trait RelationshipProvider: Send + Sync {
    /// Children currently referencing `parent`
    fn children_of(&self, parent: &dyn Entity) -> Vec<ChildLink>;
}

/// Provider for object graphs without relationships
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRelationships;

impl RelationshipProvider for NoRelationships {
    fn children_of(&self, _parent: &dyn Entity) -> Vec<ChildLink> {
        Vec::new()
    }
}

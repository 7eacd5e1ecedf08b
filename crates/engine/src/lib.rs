//! Tracking engine for objtrack
//!
//! This crate tracks domain objects through a unit of work:
//! - Entity: the contract domain types implement
//! - TrackedObject: weak-referencing record with lifecycle state and services
//! - EntityState: the lifecycle state machine
//! - ObjectTracker: one scope; include/create/materialize, cascades, change sets
//!
//! Relationships between entities come from an external
//! [`RelationshipProvider`]; the engine never infers them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod relationships;
pub mod state;
pub mod tracked;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use entity::{Entity, PropertyAccessor};
pub use relationships::{ChildLink, DeletePolicy, NoRelationships, RelationshipProvider};
pub use state::EntityState;
pub use tracked::{TrackedObject, INSTANCE_PROPERTY, WRAPPER_PROPERTY};
pub use tracker::{ChangeSet, ObjectTracker};

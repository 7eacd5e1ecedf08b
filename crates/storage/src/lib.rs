//! Storage layer for objtrack
//!
//! This crate implements the indexed store tracked items live in:
//! - MultiIndexStore: RowId → item map plus identity map and property indexes
//! - PropertyIndex: value → bag of row ids for one property
//!
//! # Consistency
//!
//! The primary maps and every bag are mutated together under the store's
//! structural lock. A failed add is unwound before its error is returned.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod multi_index;

pub use index::{BagInsert, PropertyIndex};
pub use multi_index::{AddOutcome, MultiIndexStore};

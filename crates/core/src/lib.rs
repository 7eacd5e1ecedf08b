//! Core types and traits for objtrack
//!
//! This crate defines the foundational types used throughout the system:
//! - Error: Error type hierarchy with the argument/constraint/timeout/corrupt-state taxonomy
//! - Value: Hashable property value used as an index key
//! - Indexable: The contract every stored item implements
//! - CollectionChange / CollectionObserver: Structural change notifications
//! - StoreConfig: Bucket layout, lock timeout and index definitions
//! - ScopeId / RowId: Identifiers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod notify;
pub mod traits;
pub mod types;
pub mod value;

pub use config::{CollectionOptions, IndexConfig, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use notify::{ChangeKind, CollectionChange, CollectionObserver};
pub use traits::Indexable;
pub use types::{RowId, ScopeId};
pub use value::Value;

//! Concurrency layer for objtrack
//!
//! This crate implements the thread-partitioned collections the tracking
//! store is built from:
//! - TombstoneGrowableArray: CAS-append bag of integer ids with tombstone removal
//! - ThreadPartitionedMap: Key → value map split into lazily created per-thread buckets
//! - SegmentedAppendList: Ordered, block-linked list of shared items with change notifications
//!
//! Supporting pieces:
//! - ShardSlot: Explicit or per-thread bucket selection
//! - Backoff: Spin-then-yield wait used by every CAS retry loop
//! - Timed lock helpers that surface `Error::LockTimeout`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod growable;
pub mod lock;
pub mod partitioned_map;
pub mod segmented_list;
pub mod shard;

pub use backoff::Backoff;
pub use growable::{TombstoneGrowableArray, EMPTY_SLOT};
pub use partitioned_map::{MapKey, MapValue, ThreadPartitionedMap};
pub use segmented_list::{ObserverId, SegmentedAppendList};
pub use shard::{current_slot, ShardSlot};

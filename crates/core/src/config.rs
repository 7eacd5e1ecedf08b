//! Store configuration
//!
//! Consumed once at construction time. Can be built in code or loaded from
//! TOML:
//!
//! ```toml
//! assume_safe = false
//!
//! [collection]
//! bucket_count = 8
//! initial_capacity = 16
//! lock_timeout_ms = 5000
//! disallow_dirty_reads = false
//!
//! [[indexes]]
//! name = "SSN"
//! unique = true
//! never_track_null = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Lock timeout used in release builds (ms)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Lock timeout used when debug assertions are on (ms)
pub const DEBUG_LOCK_TIMEOUT_MS: u64 = 60_000;

fn default_bucket_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_initial_capacity() -> usize {
    16
}

fn default_lock_timeout_ms() -> u64 {
    if cfg!(debug_assertions) {
        DEBUG_LOCK_TIMEOUT_MS
    } else {
        DEFAULT_LOCK_TIMEOUT_MS
    }
}

/// Settings shared by the partitioned collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Number of buckets (shards)
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    /// Capacity hint for each bucket
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    /// Lock acquisition timeout in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Force bucket reader locks during reads and scans
    #[serde(default)]
    pub disallow_dirty_reads: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
            initial_capacity: default_initial_capacity(),
            lock_timeout_ms: default_lock_timeout_ms(),
            disallow_dirty_reads: false,
        }
    }
}

impl CollectionOptions {
    /// Options with an explicit bucket count and defaults otherwise
    pub fn with_buckets(bucket_count: usize) -> Self {
        Self {
            bucket_count,
            ..Self::default()
        }
    }

    /// Lock timeout as a `Duration`
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket_count must be at least 1".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// One indexed property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Property name passed to `Indexable::get_value`
    pub name: String,
    /// At most one live row per value
    #[serde(default)]
    pub unique: bool,
    /// Rows without a value are left out of the index
    #[serde(default)]
    pub never_track_null: bool,
}

impl IndexConfig {
    /// Plain non-unique index
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique: false,
            never_track_null: false,
        }
    }

    /// Mark as unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Skip null values
    pub fn never_track_null(mut self) -> Self {
        self.never_track_null = true;
        self
    }
}

/// Configuration for a multi-index store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket layout and locking
    #[serde(default)]
    pub collection: CollectionOptions,
    /// Skip index-name validation on lookups
    #[serde(default)]
    pub assume_safe: bool,
    /// Indexed properties
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}

impl StoreConfig {
    /// Add an index definition
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.indexes.push(index);
        self
    }

    /// Replace the collection options
    pub fn with_collection(mut self, collection: CollectionOptions) -> Self {
        self.collection = collection;
        self
    }

    /// Parse from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: StoreConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        self.collection.validate()?;
        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                return Err(Error::Config("index name must not be empty".into()));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(Error::Config(format!(
                    "index '{}' is defined more than once",
                    index.name
                )));
            }
        }
        Ok(())
    }
}

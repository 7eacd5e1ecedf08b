//! Error types for objtrack
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every variant maps onto one [`ErrorKind`], so callers can branch on the
//! category (argument, constraint, timeout, corrupt state) without matching
//! individual variants.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for objtrack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error category
///
/// - `Argument`: caller supplied invalid input; never retried
/// - `Constraint`: a unique index rejected a duplicate value
/// - `Timeout`: a lock was not acquired within the configured window
/// - `CorruptState`: an internal invariant was violated (framework bug)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or missing input
    Argument,
    /// Uniqueness violation
    Constraint,
    /// Lock acquisition timed out
    Timeout,
    /// Invariant violation inside the store
    CorruptState,
}

/// Error types for objtrack
#[derive(Debug, Error)]
pub enum Error {
    /// Null/missing/invalid input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Duplicate value for a uniquely indexed property
    #[error("Unique constraint violated on '{property}' for value {value}")]
    ConstraintViolation {
        /// Indexed property name
        property: String,
        /// Rendered offending value
        value: String,
    },

    /// Lock not acquired within the configured timeout
    #[error("Timed out after {timeout:?} waiting for {resource} lock")]
    LockTimeout {
        /// Which lock was contended
        resource: &'static str,
        /// Configured timeout
        timeout: Duration,
    },

    /// Internal invariant violation
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// Direct lookup on a key that is not present
    #[error("Key not found: {0}")]
    MissingKey(String),

    /// Operation referenced an index that was never configured
    #[error("Index '{0}' is not configured")]
    UnknownIndex(String),

    /// Lifecycle transition outside the allowed edges
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Delete refused because live children still reference the entity
    #[error("Cannot delete {entity}: {children} dependent object(s) still exist")]
    DeleteRestricted {
        /// Display name of the parent entity
        entity: String,
        /// Number of blocking children
        children: usize,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build an `InvalidArgument` error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build a `CorruptState` error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptState(msg.into())
    }

    /// Build a `LockTimeout` error
    pub fn lock_timeout(resource: &'static str, timeout: Duration) -> Self {
        Error::LockTimeout { resource, timeout }
    }

    /// Build a `ConstraintViolation` error
    pub fn constraint(property: impl Into<String>, value: impl std::fmt::Display) -> Self {
        Error::ConstraintViolation {
            property: property.into(),
            value: value.to_string(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidTransition { .. }
            | Error::DeleteRestricted { .. }
            | Error::Config(_) => ErrorKind::Argument,
            Error::ConstraintViolation { .. } => ErrorKind::Constraint,
            Error::LockTimeout { .. } => ErrorKind::Timeout,
            Error::CorruptState(_) | Error::MissingKey(_) | Error::UnknownIndex(_) => {
                ErrorKind::CorruptState
            }
        }
    }

    /// True for unique-constraint violations
    pub fn is_constraint(&self) -> bool {
        self.kind() == ErrorKind::Constraint
    }

    /// True for lock timeouts
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

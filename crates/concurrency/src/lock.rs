//! Timed lock acquisition
//!
//! All blocking lock waits go through these helpers so a wait either
//! succeeds or surfaces `Error::LockTimeout`.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use objtrack_core::{Error, Result};

/// Shared lock within `timeout`
pub fn read_for<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    resource: &'static str,
) -> Result<RwLockReadGuard<'a, T>> {
    lock.try_read_for(timeout).ok_or_else(|| {
        tracing::warn!(resource, ?timeout, "read lock timed out");
        Error::lock_timeout(resource, timeout)
    })
}

/// Exclusive lock within `timeout`
pub fn write_for<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    resource: &'static str,
) -> Result<RwLockWriteGuard<'a, T>> {
    lock.try_write_for(timeout).ok_or_else(|| {
        tracing::warn!(resource, ?timeout, "write lock timed out");
        Error::lock_timeout(resource, timeout)
    })
}

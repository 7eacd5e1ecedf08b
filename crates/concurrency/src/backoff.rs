//! Spin/yield backoff for CAS retry loops
//!
//! Never blocks in the OS sense: the first few rounds spin with
//! `spin_loop`, later rounds yield the thread.

use std::hint;
use std::thread;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential spin, then yield
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
    attempts: u64,
}

impl Backoff {
    /// Fresh backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait a little before the next attempt
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
        self.attempts += 1;
    }

    /// Number of `snooze` calls so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// True once spinning has given way to yielding
    pub fn is_yielding(&self) -> bool {
        self.step > SPIN_LIMIT
    }
}

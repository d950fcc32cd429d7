//! Tunables of the reflection manager.
//!
//! The manager re-reads these at the start of every wakeup, so an
//! embedding can adjust them at runtime through the shared handle.

use std::sync::Arc;

use parking_lot::RwLock;

/// Reflection manager tunables.
#[derive(Debug, Clone)]
pub struct ReflectionOptions {
    /// Minimum age, in seconds, before a deprecated materialization or a
    /// deleted goal is physically removed.
    pub deletion_grace_seconds: u64,
    /// Cap on materialization deletions per wakeup.
    pub deletion_num_entries: usize,
    /// Minimum refresh interval, in seconds, for reflections with no
    /// known upstream dependencies.
    pub no_dependency_refresh_period_seconds: u64,
    /// Consecutive failures before a reflection is marked failed.
    pub max_refresh_attempts: u32,
}

impl Default for ReflectionOptions {
    fn default() -> Self {
        Self {
            deletion_grace_seconds: 4 * 60 * 60,
            deletion_num_entries: 100,
            no_dependency_refresh_period_seconds: 30 * 60,
            max_refresh_attempts: 3,
        }
    }
}

impl ReflectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deletion_grace_seconds(mut self, seconds: u64) -> Self {
        self.deletion_grace_seconds = seconds;
        self
    }

    pub fn with_deletion_num_entries(mut self, entries: usize) -> Self {
        self.deletion_num_entries = entries;
        self
    }

    pub fn with_no_dependency_refresh_period_seconds(mut self, seconds: u64) -> Self {
        self.no_dependency_refresh_period_seconds = seconds;
        self
    }

    pub fn with_max_refresh_attempts(mut self, attempts: u32) -> Self {
        self.max_refresh_attempts = attempts;
        self
    }

    pub fn deletion_grace_ms(&self) -> i64 {
        self.deletion_grace_seconds as i64 * 1000
    }

    pub fn no_dependency_refresh_period_ms(&self) -> i64 {
        self.no_dependency_refresh_period_seconds as i64 * 1000
    }

    /// Wrap into the shared handle the manager reads each wakeup.
    pub fn into_shared(self) -> SharedOptions {
        Arc::new(RwLock::new(self))
    }
}

/// Shared, hot-swappable options handle.
pub type SharedOptions = Arc<RwLock<ReflectionOptions>>;

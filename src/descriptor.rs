//! Materialization descriptor cache hook.
//!
//! Query planning keeps descriptors of servable materializations in a
//! cache outside this crate. The manager talks to it at exactly two
//! points: a descriptor is published when a metadata load completes, and
//! invalidated when its materialization is deprecated.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{EmberError, Result};
use crate::types::{Materialization, MaterializationId};

/// Descriptor cache contract consumed by the manager.
pub trait DescriptorCache: Send + Sync {
    /// Drop the descriptor of a materialization that is no longer
    /// servable.
    fn invalidate(&self, id: &MaterializationId);

    /// Publish or refresh the descriptor of a materialization whose
    /// metadata load completed.
    fn update(&self, materialization: &Materialization) -> Result<()>;
}

/// In-memory descriptor cache that records what was published and
/// invalidated, suitable for embedding and tests.
pub struct MemoryDescriptorCache {
    cached: RwLock<HashSet<String>>,
    invalidations: RwLock<Vec<MaterializationId>>,
    fail_updates: AtomicBool,
}

impl Default for MemoryDescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDescriptorCache {
    pub fn new() -> Self {
        Self {
            cached: RwLock::new(HashSet::new()),
            invalidations: RwLock::new(Vec::new()),
            fail_updates: AtomicBool::new(false),
        }
    }

    /// Whether a descriptor is currently cached.
    pub fn contains(&self, id: &MaterializationId) -> bool {
        self.cached.read().contains(id.as_str())
    }

    /// Every invalidation observed, in order.
    pub fn invalidations(&self) -> Vec<MaterializationId> {
        self.invalidations.read().clone()
    }

    /// Make subsequent `update` calls fail, to exercise the caller's
    /// failure handling.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

impl DescriptorCache for MemoryDescriptorCache {
    fn invalidate(&self, id: &MaterializationId) {
        debug!("invalidating materialization descriptor {}", id);
        self.cached.write().remove(id.as_str());
        self.invalidations.write().push(id.clone());
    }

    fn update(&self, materialization: &Materialization) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(EmberError::internal(format!(
                "descriptor update rejected for materialization {}",
                materialization.id
            )));
        }
        self.cached
            .write()
            .insert(materialization.id.as_str().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReflectionId;

    #[test]
    fn test_update_then_invalidate() {
        let cache = MemoryDescriptorCache::new();
        let materialization = Materialization::new(ReflectionId::new("r-1"), 1);

        cache.update(&materialization).unwrap();
        assert!(cache.contains(&materialization.id));

        cache.invalidate(&materialization.id);
        assert!(!cache.contains(&materialization.id));
        assert_eq!(cache.invalidations(), vec![materialization.id]);
    }

    #[test]
    fn test_failing_updates() {
        let cache = MemoryDescriptorCache::new();
        let materialization = Materialization::new(ReflectionId::new("r-1"), 1);

        cache.set_fail_updates(true);
        assert!(cache.update(&materialization).is_err());
        assert!(!cache.contains(&materialization.id));
    }
}

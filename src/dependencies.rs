//! Dependency graph over reflections and the datasets they are built
//! from.
//!
//! The graph is kept out-of-band, keyed by reflection id; entries stay
//! flat records. Edges point upstream: a node lists what its reflection
//! depends on, either physical datasets or other reflections whose
//! materialized data feeds it. The graph answers two scheduling
//! questions: *is this reflection due for a refresh* and *should it ever
//! give up retrying*.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::store::EntryStore;
use crate::types::{now_millis, DependencyEntry, ReflectionId};

/// In-memory dependency graph.
pub struct DependencyManager {
    entries: Arc<EntryStore>,
    graph: RwLock<HashMap<ReflectionId, Vec<DependencyEntry>>>,
}

impl DependencyManager {
    pub fn new(entries: Arc<EntryStore>) -> Self {
        Self {
            entries,
            graph: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the dependencies learned for a reflection.
    pub fn update_dependencies(&self, id: &ReflectionId, dependencies: Vec<DependencyEntry>) {
        debug!(
            "updating dependencies of reflection {} ({} edges)",
            id,
            dependencies.len()
        );
        self.graph.write().insert(id.clone(), dependencies);
    }

    /// Whether any dependency was ever learned for this reflection.
    pub fn reflection_has_known_dependencies(&self, id: &ReflectionId) -> bool {
        self.graph
            .read()
            .get(id)
            .map(|deps| !deps.is_empty())
            .unwrap_or(false)
    }

    /// Whether the reflection is due for a refresh.
    ///
    /// The baseline is the entry's last submitted refresh. A reflection
    /// with no known dependencies falls back to `floor_period_ms`; with
    /// dataset dependencies it is due once the smallest dataset refresh
    /// period has elapsed; with reflection dependencies it is due as soon
    /// as any upstream reflection refreshed successfully after the
    /// baseline.
    pub fn should_refresh(&self, id: &ReflectionId, floor_period_ms: i64) -> bool {
        let entry = match self.entries.get(id) {
            Some(entry) => entry,
            None => return false,
        };
        let baseline = entry.last_submitted_refresh;
        let now = now_millis();

        let graph = self.graph.read();
        let dependencies = match graph.get(id) {
            Some(dependencies) if !dependencies.is_empty() => dependencies,
            _ => return now - baseline >= floor_period_ms,
        };

        let mut min_dataset_period: Option<i64> = None;
        for dependency in dependencies {
            match dependency {
                DependencyEntry::Dataset(dataset) => {
                    min_dataset_period = Some(match min_dataset_period {
                        Some(period) => period.min(dataset.refresh_period_ms),
                        None => dataset.refresh_period_ms,
                    });
                }
                DependencyEntry::Reflection(upstream) => {
                    if let Some(upstream_entry) = self.entries.get(&upstream.reflection_id) {
                        if upstream_entry.last_successful_refresh > baseline {
                            return true;
                        }
                    }
                }
            }
        }

        match min_dataset_period {
            Some(period) => now >= baseline + period,
            None => false,
        }
    }

    /// Whether some upstream path mandates infinite retry. Walks
    /// reflection edges transitively and returns true as soon as a
    /// dataset dependency is flagged.
    pub fn dont_give_up(&self, id: &ReflectionId) -> bool {
        let graph = self.graph.read();
        let mut visited: HashSet<&ReflectionId> = HashSet::new();
        let mut pending: Vec<&ReflectionId> = vec![id];

        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(dependencies) = graph.get(current) else {
                continue;
            };
            for dependency in dependencies {
                match dependency {
                    DependencyEntry::Dataset(dataset) if dataset.infinite_retry => return true,
                    DependencyEntry::Dataset(_) => {}
                    DependencyEntry::Reflection(upstream) => {
                        pending.push(&upstream.reflection_id);
                    }
                }
            }
        }
        false
    }

    /// Remove a reflection from the graph. Edges pointing at it are
    /// dropped from every remaining node, so dependents recompute their
    /// schedule without it.
    pub fn delete(&self, id: &ReflectionId) {
        let mut graph = self.graph.write();
        graph.remove(id);
        for dependencies in graph.values_mut() {
            dependencies.retain(|dependency| match dependency {
                DependencyEntry::Reflection(upstream) => &upstream.reflection_id != id,
                DependencyEntry::Dataset(_) => true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DatasetDependency, DatasetId, GoalType, ReflectionDependency, ReflectionEntry,
        ReflectionGoal,
    };

    fn dataset_dep(id: &str, period_ms: i64, infinite_retry: bool) -> DependencyEntry {
        DependencyEntry::Dataset(DatasetDependency {
            dataset_id: DatasetId::new(id),
            path: vec!["source".to_string(), id.to_string()],
            refresh_period_ms: period_ms,
            infinite_retry,
        })
    }

    fn reflection_dep(id: &ReflectionId) -> DependencyEntry {
        DependencyEntry::Reflection(ReflectionDependency {
            reflection_id: id.clone(),
        })
    }

    fn saved_entry(entries: &EntryStore) -> ReflectionEntry {
        let goal = ReflectionGoal::new(DatasetId::new("ds"), "r", GoalType::Raw);
        let mut entry = ReflectionEntry::new(&goal, "v1");
        entries.save(&mut entry).unwrap();
        entry
    }

    #[test]
    fn test_no_known_dependencies_uses_floor_period() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries.clone());
        let mut entry = saved_entry(&entries);

        // never refreshed: due immediately even with a large floor
        assert!(manager.should_refresh(&entry.id, 3_600_000));

        entry.last_submitted_refresh = now_millis();
        entries.save(&mut entry).unwrap();
        assert!(!manager.should_refresh(&entry.id, 3_600_000));
        assert!(manager.should_refresh(&entry.id, 0));
    }

    #[test]
    fn test_unknown_reflection_is_never_due() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries);
        assert!(!manager.should_refresh(&ReflectionId::new("ghost"), 0));
    }

    #[test]
    fn test_dataset_dependency_period() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries.clone());
        let mut entry = saved_entry(&entries);
        entry.last_submitted_refresh = now_millis();
        entries.save(&mut entry).unwrap();

        manager.update_dependencies(&entry.id, vec![dataset_dep("ds-a", 3_600_000, false)]);
        assert!(!manager.should_refresh(&entry.id, 0));

        // the smallest period across dataset edges wins
        manager.update_dependencies(
            &entry.id,
            vec![
                dataset_dep("ds-a", 3_600_000, false),
                dataset_dep("ds-b", 0, false),
            ],
        );
        assert!(manager.should_refresh(&entry.id, 0));
    }

    #[test]
    fn test_upstream_reflection_triggers_refresh() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries.clone());

        let mut upstream = saved_entry(&entries);
        let mut downstream = saved_entry(&entries);
        downstream.last_submitted_refresh = now_millis();
        entries.save(&mut downstream).unwrap();

        manager.update_dependencies(&downstream.id, vec![reflection_dep(&upstream.id)]);
        assert!(!manager.should_refresh(&downstream.id, 0));

        upstream.last_successful_refresh = now_millis() + 1;
        entries.save(&mut upstream).unwrap();
        assert!(manager.should_refresh(&downstream.id, 0));
    }

    #[test]
    fn test_dont_give_up_is_transitive() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries);
        let leaf = ReflectionId::new("leaf");
        let mid = ReflectionId::new("mid");
        let top = ReflectionId::new("top");

        manager.update_dependencies(&top, vec![reflection_dep(&mid)]);
        manager.update_dependencies(&mid, vec![reflection_dep(&leaf)]);
        manager.update_dependencies(&leaf, vec![dataset_dep("ds", 1000, false)]);
        assert!(!manager.dont_give_up(&top));

        manager.update_dependencies(&leaf, vec![dataset_dep("ds", 1000, true)]);
        assert!(manager.dont_give_up(&top));
    }

    #[test]
    fn test_dont_give_up_survives_cycles() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries);
        let a = ReflectionId::new("a");
        let b = ReflectionId::new("b");

        manager.update_dependencies(&a, vec![reflection_dep(&b)]);
        manager.update_dependencies(&b, vec![reflection_dep(&a)]);
        assert!(!manager.dont_give_up(&a));
    }

    #[test]
    fn test_delete_cascades_to_dependents() {
        let entries = Arc::new(EntryStore::new());
        let manager = DependencyManager::new(entries.clone());

        let upstream = saved_entry(&entries);
        let mut downstream = saved_entry(&entries);
        downstream.last_submitted_refresh = now_millis();
        entries.save(&mut downstream).unwrap();

        manager.update_dependencies(&downstream.id, vec![reflection_dep(&upstream.id)]);
        assert!(manager.reflection_has_known_dependencies(&downstream.id));

        manager.delete(&upstream.id);
        // the edge is gone, so the dependent no longer has known
        // dependencies and falls back to the floor period
        assert!(!manager.reflection_has_known_dependencies(&downstream.id));
        assert!(!manager.should_refresh(&downstream.id, 3_600_000));
        assert!(manager.should_refresh(&downstream.id, 0));
    }
}

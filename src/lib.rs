//! Ember - Reflection Lifecycle Manager for Embedded Warehouse Accelerators
//!
//! Ember keeps materialized accelerations (*reflections*) of warehouse
//! datasets alive: users declare what they want pre-computed, and a
//! periodic reconciliation loop compares that intent with the observed
//! build state, launches refresh jobs, digests their out-of-band
//! outcomes, ages out stale data and propagates deletions.
//!
//! # Features
//!
//! - **Declarative goals**: users describe the acceleration; the manager
//!   owns the lifecycle
//! - **Serial reconciliation**: one driver thread, one `run()` at a time,
//!   no callback-threaded state mutation
//! - **Out-of-band jobs**: builds run in an external job service; their
//!   terminal states only wake the loop
//! - **Failure containment**: a fault in one reflection never starves the
//!   others, and repeated failures quiesce into a terminal state
//! - **Dependency-aware scheduling**: a graph over reflections and
//!   datasets decides refresh timing and cascading recomputation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ember::descriptor::MemoryDescriptorCache;
//! use ember::jobs::MemoryJobsService;
//! use ember::namespace::{DatasetConfig, MemoryNamespace};
//! use ember::types::{DatasetId, GoalType};
//! use ember::{AcceleratorConfig, AcceleratorService, Result};
//!
//! fn main() -> Result<()> {
//!     let jobs = Arc::new(MemoryJobsService::new());
//!     let namespace = Arc::new(MemoryNamespace::new());
//!     namespace.put_dataset(DatasetConfig::new(
//!         DatasetId::new("orders-uuid"),
//!         vec!["source".into(), "orders".into()],
//!         "v1",
//!     ));
//!
//!     let mut service = AcceleratorService::new(
//!         AcceleratorConfig::default(),
//!         jobs,
//!         namespace,
//!         Arc::new(MemoryDescriptorCache::new()),
//!     );
//!
//!     service.create_goal(DatasetId::new("orders-uuid"), "orders_by_day", GoalType::Aggregation)?;
//!     service.start();
//!     Ok(())
//! }
//! ```

pub mod dependencies;
pub mod descriptor;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod manager;
pub mod namespace;
pub mod options;
pub mod store;
pub mod types;
pub mod wakeup;

// Re-export commonly used types
pub use error::{EmberError, Result};
pub use manager::ReflectionManager;
pub use options::ReflectionOptions;
pub use types::{
    GoalState, GoalType, Materialization, MaterializationState, ReflectionEntry, ReflectionGoal,
    ReflectionId, ReflectionState,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dependencies::DependencyManager;
use crate::descriptor::DescriptorCache;
use crate::jobs::JobsService;
use crate::manager::ReflectionsToUpdate;
use crate::namespace::NamespaceService;
use crate::options::SharedOptions;
use crate::store::{
    EntryStore, ExternalReflectionStore, GoalStore, MaterializationStore, ReflectionStores,
};
use crate::types::{DatasetId, ExternalReflection};
use crate::wakeup::{WakeUpCallback, WakeupScheduler};

/// Configuration of the accelerator service.
#[derive(Debug, Clone)]
pub struct AcceleratorConfig {
    /// Period of the manager's own tick; external events wake it earlier.
    pub refresh_period: Duration,
    /// Initial manager tunables; adjustable at runtime through
    /// [`AcceleratorService::options`].
    pub options: ReflectionOptions,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(60),
            options: ReflectionOptions::default(),
        }
    }
}

impl AcceleratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn with_options(mut self, options: ReflectionOptions) -> Self {
        self.options = options;
        self
    }
}

/// User-facing surface around the reflection manager.
///
/// Owns the stores and the manager; goal mutations bump the goal version,
/// wake the reconciliation loop and are picked up on its next pass. The
/// manager runs either on the scheduler thread (between [`start`] and
/// [`stop`]) or synchronously through [`run_once`].
///
/// [`start`]: AcceleratorService::start
/// [`stop`]: AcceleratorService::stop
/// [`run_once`]: AcceleratorService::run_once
pub struct AcceleratorService {
    config: AcceleratorConfig,
    stores: ReflectionStores,
    dependencies: Arc<DependencyManager>,
    options: SharedOptions,
    reflections_to_update: ReflectionsToUpdate,
    wake_up: WakeUpCallback,
    manager: Option<ReflectionManager>,
    scheduler: Option<WakeupScheduler>,
}

impl AcceleratorService {
    pub fn new(
        config: AcceleratorConfig,
        jobs: Arc<dyn JobsService>,
        namespace: Arc<dyn NamespaceService>,
        descriptor_cache: Arc<dyn DescriptorCache>,
    ) -> Self {
        let stores = ReflectionStores::new();
        let dependencies = Arc::new(DependencyManager::new(stores.entries.clone()));
        let options = config.options.clone().into_shared();
        let reflections_to_update: ReflectionsToUpdate = Arc::new(Mutex::new(HashSet::new()));
        let wake_up = WakeUpCallback::new();

        let manager = ReflectionManager::new(
            stores.clone(),
            dependencies.clone(),
            jobs,
            namespace,
            descriptor_cache,
            options.clone(),
            reflections_to_update.clone(),
            wake_up.clone(),
        );

        Self {
            config,
            stores,
            dependencies,
            options,
            reflections_to_update,
            wake_up,
            manager: Some(manager),
            scheduler: None,
        }
    }

    /// Start reconciling on the scheduler thread. A no-op when already
    /// running.
    pub fn start(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.scheduler = Some(WakeupScheduler::start(
                manager,
                &self.wake_up,
                self.config.refresh_period,
            ));
        }
    }

    /// Stop the scheduler thread. In-flight jobs keep running and are
    /// reconciled after the next start. A no-op when not running.
    pub fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            self.manager = Some(scheduler.stop());
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Run one reconciliation synchronously. Fails while the scheduler
    /// thread owns the manager.
    pub fn run_once(&mut self) -> Result<()> {
        match self.manager.as_mut() {
            Some(manager) => {
                manager.run();
                Ok(())
            }
            None => Err(EmberError::invalid_state(
                "the reflection manager is running on the scheduler thread",
            )),
        }
    }

    /// Declare a new reflection goal.
    pub fn create_goal(
        &self,
        dataset_id: DatasetId,
        name: impl Into<String>,
        goal_type: GoalType,
    ) -> Result<ReflectionGoal> {
        let mut goal = ReflectionGoal::new(dataset_id, name, goal_type);
        self.stores.goals.save(&mut goal)?;
        self.wake_up.wakeup("goal created");
        Ok(goal)
    }

    /// Save an edited goal. Bumps the version, so the manager rebuilds the
    /// reflection against the new descriptor.
    pub fn update_goal(&self, goal: &mut ReflectionGoal) -> Result<()> {
        self.stores.goals.save(goal)?;
        self.wake_up.wakeup("goal updated");
        Ok(())
    }

    /// Disable a goal. Its entry and materializations are torn down on
    /// the next wakeup.
    pub fn disable_goal(&self, id: &ReflectionId) -> Result<()> {
        self.set_goal_state(id, GoalState::Disabled, "goal disabled")
    }

    /// Delete a goal. The record itself is retained for the deletion
    /// grace period, then purged by the manager.
    pub fn delete_goal(&self, id: &ReflectionId) -> Result<()> {
        self.set_goal_state(id, GoalState::Deleted, "goal deleted")
    }

    fn set_goal_state(&self, id: &ReflectionId, state: GoalState, reason: &str) -> Result<()> {
        let mut goal = self
            .stores
            .goals
            .get(id)
            .ok_or_else(|| EmberError::store(format!("reflection goal {} not found", id)))?;
        goal.state = state;
        self.stores.goals.save(&mut goal)?;
        self.wake_up.wakeup(reason);
        Ok(())
    }

    /// Register an externally managed reflection. The manager only
    /// observes it for dataset deletion.
    pub fn register_external_reflection(
        &self,
        name: impl Into<String>,
        query_dataset_id: DatasetId,
        target_dataset_id: DatasetId,
    ) -> Result<ExternalReflection> {
        let mut external = ExternalReflection::new(name, query_dataset_id, target_dataset_id);
        self.stores.external_reflections.save(&mut external)?;
        Ok(external)
    }

    pub fn drop_external_reflection(&self, id: &ReflectionId) {
        self.stores.external_reflections.delete(id);
    }

    /// Ask the manager to rebuild a reflection on its next wakeup, used
    /// when its materialized plan can no longer be expanded.
    pub fn request_update(&self, id: &ReflectionId) {
        self.reflections_to_update.lock().insert(id.clone());
        self.wake_up.wakeup("forced update");
    }

    pub fn goals(&self) -> Arc<GoalStore> {
        self.stores.goals.clone()
    }

    pub fn entries(&self) -> Arc<EntryStore> {
        self.stores.entries.clone()
    }

    pub fn materializations(&self) -> Arc<MaterializationStore> {
        self.stores.materializations.clone()
    }

    pub fn external_reflections(&self) -> Arc<ExternalReflectionStore> {
        self.stores.external_reflections.clone()
    }

    pub fn dependency_manager(&self) -> Arc<DependencyManager> {
        self.dependencies.clone()
    }

    /// Live tunables; changes apply from the next wakeup.
    pub fn options(&self) -> SharedOptions {
        self.options.clone()
    }

    /// Handle external event sources can use to wake the manager.
    pub fn wake_up_callback(&self) -> WakeUpCallback {
        self.wake_up.clone()
    }
}

impl Drop for AcceleratorService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MemoryDescriptorCache;
    use crate::jobs::MemoryJobsService;
    use crate::namespace::{DatasetConfig, MemoryNamespace};

    fn service() -> (AcceleratorService, Arc<MemoryJobsService>, Arc<MemoryNamespace>) {
        let jobs = Arc::new(MemoryJobsService::new());
        let namespace = Arc::new(MemoryNamespace::new());
        let service = AcceleratorService::new(
            AcceleratorConfig::default().with_refresh_period(Duration::from_millis(20)),
            jobs.clone(),
            namespace.clone(),
            Arc::new(MemoryDescriptorCache::new()),
        );
        (service, jobs, namespace)
    }

    #[test]
    fn test_create_goal_and_reconcile() {
        let (mut service, jobs, namespace) = service();
        namespace.put_dataset(DatasetConfig::new(
            DatasetId::new("ds-1"),
            vec!["source".into(), "orders".into()],
            "v1",
        ));

        let goal = service
            .create_goal(DatasetId::new("ds-1"), "orders_by_day", GoalType::Aggregation)
            .unwrap();
        assert_eq!(goal.version, 1);

        service.run_once().unwrap();
        let entry = service.entries().get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Refreshing);
        assert_eq!(jobs.job_count(), 1);
    }

    #[test]
    fn test_run_once_is_rejected_while_started() {
        let (mut service, _jobs, _namespace) = service();
        service.start();
        assert!(service.is_running());
        assert!(service.run_once().is_err());

        service.stop();
        assert!(!service.is_running());
        service.run_once().unwrap();
    }

    #[test]
    fn test_scheduler_reconciles_on_wakeup() {
        let (mut service, jobs, namespace) = service();
        namespace.put_dataset(DatasetConfig::new(
            DatasetId::new("ds-1"),
            vec!["source".into(), "orders".into()],
            "v1",
        ));
        service.start();

        let goal = service
            .create_goal(DatasetId::new("ds-1"), "orders_raw", GoalType::Raw)
            .unwrap();

        // the goal edit woke the scheduler; give the driver thread a
        // moment
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(entry) = service.entries().get(&goal.id) {
                if entry.state == ReflectionState::Refreshing {
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "entry never reached Refreshing"
            );
            std::thread::sleep(Duration::from_millis(5));
        }

        service.stop();
        assert_eq!(jobs.job_count(), 1);
    }

    #[test]
    fn test_missing_goal_edits_are_rejected() {
        let (service, _jobs, _namespace) = service();
        assert!(service.disable_goal(&ReflectionId::new("ghost")).is_err());
        assert!(service.delete_goal(&ReflectionId::new("ghost")).is_err());
    }
}

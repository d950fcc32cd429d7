//! The reflection reconciliation loop.
//!
//! [`ReflectionManager::run`] executes a fixed sequence of passes over the
//! stores on every wakeup:
//!
//! 1. forced updates requested by external callers
//! 2. dataset-deletion sweep over goals and external reflections
//! 3. reconciliation of goals created or modified since the last wakeup
//! 4. the per-entry state machine (submit refreshes, poll jobs, tear
//!    down)
//! 5. garbage collection of dead materializations past the grace period
//! 6. expiry sweep moving stale materializations to Deprecated
//! 7. garbage collection of deleted goals past the grace period
//!
//! Long-running work is delegated to the job service and polled on later
//! wakeups; the manager never blocks on a job. Every per-item body is
//! guarded so a fault in one reflection cannot starve its siblings, and
//! no error propagates past `run()`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::dependencies::DependencyManager;
use crate::descriptor::DescriptorCache;
use crate::error::{EmberError, Result};
use crate::handlers::{RefreshDoneHandler, RefreshStartHandler};
use crate::jobs::{
    drop_table_query, load_materialization_query, materialization_path, noop_job_listener, Job,
    JobRequest, JobState, JobsService, MaterializationSummary, QueryType, SqlQuery,
    SYSTEM_USERNAME,
};
use crate::namespace::NamespaceService;
use crate::options::SharedOptions;
use crate::store::ReflectionStores;
use crate::types::{
    now_millis, DatasetId, GoalState, Materialization, MaterializationFailure,
    MaterializationState, ReflectionEntry, ReflectionGoal, ReflectionId, ReflectionState,
};
use crate::wakeup::{wake_on_job_done, WakeUpCallback, WarningTimer};

/// Goals are scanned from slightly before the previous wakeup: store
/// writes become visible a moment after their commit timestamp, and
/// without the overlap those writes would be skipped forever.
const WAKEUP_OVERLAP_MS: i64 = 10;

/// A wakeup taking longer than this gets logged.
const WAKEUP_WARNING_THRESHOLD: Duration = Duration::from_secs(5);

/// Set of reflections external callers want reconciled on the next
/// wakeup, typically because their materialized plan could no longer be
/// expanded.
pub type ReflectionsToUpdate = Arc<Mutex<HashSet<ReflectionId>>>;

/// The reconciliation engine. Owned by a single driver; `run()` is never
/// invoked concurrently.
pub struct ReflectionManager {
    stores: ReflectionStores,
    dependencies: Arc<DependencyManager>,
    jobs: Arc<dyn JobsService>,
    namespace: Arc<dyn NamespaceService>,
    descriptor_cache: Arc<dyn DescriptorCache>,
    options: SharedOptions,
    reflections_to_update: ReflectionsToUpdate,
    wake_up: WakeUpCallback,
    last_wakeup_time: i64,
}

impl ReflectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: ReflectionStores,
        dependencies: Arc<DependencyManager>,
        jobs: Arc<dyn JobsService>,
        namespace: Arc<dyn NamespaceService>,
        descriptor_cache: Arc<dyn DescriptorCache>,
        options: SharedOptions,
        reflections_to_update: ReflectionsToUpdate,
        wake_up: WakeUpCallback,
    ) -> Self {
        Self {
            stores,
            dependencies,
            jobs,
            namespace,
            descriptor_cache,
            options,
            reflections_to_update,
            wake_up,
            last_wakeup_time: 0,
        }
    }

    /// One reconciliation wakeup.
    pub fn run(&mut self) {
        let _timer = WarningTimer::new("reflection manager wakeup", WAKEUP_WARNING_THRESHOLD);
        trace!("running the reflection manager");

        let previous_wakeup = self.last_wakeup_time - WAKEUP_OVERLAP_MS;
        // Advanced before doing any work: a pass failing midway must not
        // make every later wakeup re-scan the full modification history.
        // This relies on per-item fault containment below.
        self.last_wakeup_time = now_millis();

        let options = self.options.read().clone();
        let deletion_threshold = now_millis() - options.deletion_grace_ms();

        self.handle_reflections_to_update();
        self.handle_deleted_datasets();
        self.handle_goals(previous_wakeup);
        self.handle_entries(options.no_dependency_refresh_period_ms());
        self.delete_deprecated_materializations(deletion_threshold, options.deletion_num_entries);
        self.deprecate_expired_materializations();
        self.delete_deprecated_goals(deletion_threshold);
    }

    /// Pass 1: reflections flagged by external callers get their in-flight
    /// refresh cancelled and go back through Update.
    fn handle_reflections_to_update(&self) {
        loop {
            let id = {
                let mut pending = self.reflections_to_update.lock();
                match pending.iter().next().cloned() {
                    Some(id) => {
                        // removed before handling so one bad entry cannot
                        // stall the queue
                        pending.remove(&id);
                        id
                    }
                    None => break,
                }
            };
            if let Err(e) = self.force_update(&id) {
                error!("couldn't force an update of reflection {}: {}", id, e);
            }
        }
    }

    fn force_update(&self, id: &ReflectionId) -> Result<()> {
        let Some(mut entry) = self.stores.entries.get(id) else {
            return Ok(());
        };
        self.cancel_refresh_job_if_any(&mut entry)?;
        entry.state = ReflectionState::Update;
        self.stores.entries.save(&mut entry)
    }

    /// Pass 2: sweep for datasets deleted under a goal or an external
    /// reflection.
    fn handle_deleted_datasets(&self) {
        for goal in self.stores.goals.get_all_not_deleted() {
            if let Err(e) = self.handle_dataset_deletion(&goal.dataset_id, &goal.id) {
                error!("couldn't check the dataset of reflection {}: {}", goal.id, e);
            }
        }
        for external in self.stores.external_reflections.get_all() {
            if let Err(e) = self.handle_dataset_deletion(&external.query_dataset_id, &external.id) {
                error!(
                    "couldn't check the dataset of external reflection {}: {}",
                    external.id, e
                );
            }
        }
    }

    fn handle_dataset_deletion(&self, dataset_id: &DatasetId, id: &ReflectionId) -> Result<()> {
        if self.namespace.find_dataset_by_uuid(dataset_id).is_some() {
            return Ok(());
        }
        debug!("dataset deleted under reflection {}", id);

        if let Some(mut goal) = self.stores.goals.get(id) {
            goal.state = GoalState::Deleted;
            return match self.stores.goals.save(&mut goal) {
                Ok(()) => Ok(()),
                Err(e) if e.is_concurrent_modification() => {
                    // someone is editing the goal; it gets marked next
                    // wakeup
                    debug!(
                        "concurrent modification while marking reflection goal {} as deleted",
                        id
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }

        if self.stores.external_reflections.get(id).is_some() {
            self.stores.external_reflections.delete(id);
            return Ok(());
        }

        Err(EmberError::invalid_state(format!(
            "no reflection record found for an observed reflection id {}",
            id
        )))
    }

    /// Pass 3: reconcile goals created or modified since the previous
    /// wakeup.
    fn handle_goals(&self, since: i64) {
        for goal in self.stores.goals.get_modified_or_created_since(since) {
            if let Err(e) = self.handle_goal(&goal) {
                error!("couldn't handle reflection goal {}: {}", goal.id, e);
            }
        }
    }

    fn handle_goal(&self, goal: &ReflectionGoal) -> Result<()> {
        match self.stores.entries.get(&goal.id) {
            None => {
                // no entry: the goal was just created, or created disabled
                // and never materialized
                if goal.state == GoalState::Enabled {
                    let mut entry = self.create_entry(goal)?;
                    self.stores.entries.save(&mut entry)?;
                }
                Ok(())
            }
            Some(mut entry) if entry.goal_version != goal.version => {
                debug!(
                    "reflection goal {} updated, entry {:?} -> goal {:?}",
                    goal.id, entry.state, goal.state
                );
                self.cancel_refresh_job_if_any(&mut entry)?;
                entry.state = if goal.state == GoalState::Enabled {
                    ReflectionState::Update
                } else {
                    ReflectionState::Deprecate
                };
                entry.name = goal.name.clone();
                entry.goal_version = goal.version;
                self.stores.entries.save(&mut entry)
            }
            Some(_) => Ok(()),
        }
    }

    fn create_entry(&self, goal: &ReflectionGoal) -> Result<ReflectionEntry> {
        debug!("creating a new entry for reflection goal {}", goal.id);
        let dataset = self
            .namespace
            .find_dataset_by_uuid(&goal.dataset_id)
            .ok_or_else(|| {
                EmberError::namespace(format!(
                    "dataset {} not found for reflection goal {}",
                    goal.dataset_id, goal.id
                ))
            })?;
        Ok(ReflectionEntry::new(goal, dataset.version))
    }

    /// Pass 4: drive the per-entry state machine.
    fn handle_entries(&self, no_dependency_refresh_period_ms: i64) {
        for mut entry in self.stores.entries.find() {
            if let Err(e) = self.handle_entry(&mut entry, no_dependency_refresh_period_ms) {
                error!("couldn't handle reflection entry {}: {}", entry.id, e);
                let state = entry.state;
                if let Err(e) = self.report_failure(&mut entry, state) {
                    debug!("couldn't report the failure of reflection {}: {}", entry.id, e);
                }
            }
        }
    }

    fn handle_entry(
        &self,
        entry: &mut ReflectionEntry,
        no_dependency_refresh_period_ms: i64,
    ) -> Result<()> {
        match entry.state {
            // only a new goal version revives a failed reflection
            ReflectionState::Failed => Ok(()),
            ReflectionState::Refreshing | ReflectionState::MetadataRefresh => {
                self.handle_refreshing_entry(entry)
            }
            ReflectionState::Update => {
                self.deprecate_materializations_of(entry)?;
                self.start_refresh(entry)
            }
            // an Active reflection waits until it is due, then takes
            // exactly the Refresh path below
            ReflectionState::Active
                if !self
                    .dependencies
                    .should_refresh(&entry.id, no_dependency_refresh_period_ms) =>
            {
                Ok(())
            }
            ReflectionState::Active | ReflectionState::Refresh => {
                info!("reflection {} is due for refresh", entry.id);
                self.start_refresh(entry)
            }
            ReflectionState::Deprecate => {
                self.deprecate_materializations_of(entry)?;
                self.delete_reflection(entry);
                Ok(())
            }
        }
    }

    /// Poll the in-flight job of a Refreshing or MetadataRefresh entry.
    fn handle_refreshing_entry(&self, entry: &mut ReflectionEntry) -> Result<()> {
        let mut materialization =
            self.stores
                .materializations
                .get_last(&entry.id)
                .ok_or_else(|| {
                    EmberError::invalid_state(format!(
                        "reflection entry {} is refreshing but has no materialization",
                        entry.id
                    ))
                })?;
        let job_id = entry.refresh_job_id.clone().ok_or_else(|| {
            EmberError::invalid_state(format!(
                "reflection entry {} is refreshing but has no refresh job id",
                entry.id
            ))
        })?;

        let job = match self.jobs.get_job(&job_id) {
            Ok(job) => job,
            Err(e) if e.is_job_not_found() => {
                // a refreshing entry means a job was submitted and should
                // be retrievable; treat the lost job as a failed refresh
                // so the entry doesn't spin here forever
                materialization.state = MaterializationState::Failed;
                materialization.failure = Some(MaterializationFailure::new(format!(
                    "Couldn't retrieve refresh job {}",
                    job_id
                )));
                self.stores.materializations.save(&mut materialization)?;
                return self.report_failure(entry, ReflectionState::Active);
            }
            Err(e) => return Err(e),
        };

        match job.state {
            JobState::Completed => {
                debug!(
                    "refresh job {} for materialization {} completed successfully",
                    job.id, materialization.id
                );
                self.handle_successful_refresh_job(entry, &mut materialization, &job)
            }
            JobState::Canceled => {
                debug!(
                    "refresh job {} for materialization {} was cancelled",
                    job.id, materialization.id
                );
                self.update_dependencies_if_possible(entry, &job);
                materialization.state = MaterializationState::Canceled;
                self.stores.materializations.save(&mut materialization)?;
                entry.state = ReflectionState::Active;
                self.stores.entries.save(entry)
            }
            JobState::Failed => {
                debug!(
                    "refresh job {} for materialization {} failed",
                    job.id, materialization.id
                );
                self.update_dependencies_if_possible(entry, &job);
                let message = job.failure_info.clone().unwrap_or_else(|| {
                    "Materialization job failed without reporting an error message".to_string()
                });
                materialization.state = MaterializationState::Failed;
                materialization.failure = Some(MaterializationFailure::new(message));
                self.stores.materializations.save(&mut materialization)?;
                self.report_failure(entry, ReflectionState::Active)
            }
            // nothing to do for non-terminal states
            JobState::Pending | JobState::Running => Ok(()),
        }
    }

    /// Best-effort dependency learning from an attempt that did not
    /// complete: the planner may have attached its decision before the
    /// job died.
    fn update_dependencies_if_possible(&self, entry: &ReflectionEntry, job: &Job) {
        if self.dependencies.reflection_has_known_dependencies(&entry.id) {
            return;
        }
        if let Err(e) = self.refresh_done_handler().learn_dependencies(entry, job) {
            warn!("couldn't retrieve any dependency for reflection {}: {}", entry.id, e);
        }
    }

    fn handle_successful_refresh_job(
        &self,
        entry: &mut ReflectionEntry,
        materialization: &mut Materialization,
        job: &Job,
    ) -> Result<()> {
        match entry.state {
            ReflectionState::Refreshing => self.refreshing_job_succeeded(entry, materialization, job),
            ReflectionState::MetadataRefresh => {
                self.metadata_refresh_job_succeeded(entry, materialization)
            }
            state => Err(EmberError::invalid_state(format!(
                "completed refresh job for reflection {} in state {:?}",
                entry.id, state
            ))),
        }
    }

    fn refreshing_job_succeeded(
        &self,
        entry: &mut ReflectionEntry,
        materialization: &mut Materialization,
        job: &Job,
    ) -> Result<()> {
        match self
            .refresh_done_handler()
            .handle(entry, materialization, job)
        {
            Ok(decision) => {
                entry.refresh_method = decision.method;
                entry.refresh_field = decision.refresh_field.clone();
                entry.dataset_hash = Some(decision.dataset_hash);
                entry.dont_give_up = self.dependencies.dont_give_up(&entry.id);
            }
            Err(e) => {
                // bookkeeping is deliberately skipped here: an entry whose
                // successful refreshes cannot be digested is quiesced by
                // the failure counter
                warn!(
                    "failed to handle the finished refresh of reflection {}: {}",
                    entry.id, e
                );
                materialization.state = MaterializationState::Failed;
                materialization.failure = Some(MaterializationFailure::new(format!(
                    "Failed to handle successful refresh job {}",
                    job.id
                )));
            }
        }

        if materialization.state != MaterializationState::Failed {
            // dependent reflections key off this timestamp even when the
            // build wrote no data: they may have failed last time and
            // still benefit from a refresh
            entry.last_successful_refresh = now_millis();

            if !self
                .stores
                .materializations
                .get_refreshes(materialization)
                .is_empty()
            {
                if let Err(e) = self.refresh_metadata(entry, materialization) {
                    warn!(
                        "failed to start a metadata load for materialization {}: {}",
                        materialization.id, e
                    );
                    materialization.state = MaterializationState::Failed;
                    materialization.failure = Some(MaterializationFailure::new(
                        "Failed to start a LOAD MATERIALIZATION job",
                    ));
                }
            } else {
                // an empty incremental build: nothing to load, the
                // reflection keeps serving its previous refreshes
                materialization.state = MaterializationState::Done;
                entry.state = ReflectionState::Active;
                entry.num_failures = 0;
            }
        }

        if materialization.state == MaterializationState::Failed {
            self.report_failure(entry, ReflectionState::Active)?;
        }

        self.stores.materializations.save(materialization)?;
        self.stores.entries.save(entry)
    }

    fn metadata_refresh_job_succeeded(
        &self,
        entry: &mut ReflectionEntry,
        materialization: &mut Materialization,
    ) -> Result<()> {
        if let Err(e) = self.descriptor_cache.update(materialization) {
            warn!(
                "failed to update the descriptor cache for materialization {}: {}",
                materialization.id, e
            );
            materialization.state = MaterializationState::Failed;
            materialization.failure = Some(MaterializationFailure::new("Cache update failed"));
        }

        if materialization.state == MaterializationState::Failed {
            self.report_failure(entry, ReflectionState::Active)?;
        } else {
            materialization.state = MaterializationState::Done;
            entry.state = ReflectionState::Active;
            entry.num_failures = 0;
        }

        self.stores.materializations.save(materialization)?;
        self.stores.entries.save(entry)
    }

    /// Submit the metadata-load job for a freshly built materialization.
    fn refresh_metadata(
        &self,
        entry: &mut ReflectionEntry,
        materialization: &Materialization,
    ) -> Result<()> {
        let dataset = self
            .namespace
            .find_dataset_by_uuid(&entry.dataset_id)
            .ok_or_else(|| {
                EmberError::namespace(format!(
                    "dataset {} not found for reflection {}",
                    entry.dataset_id, entry.id
                ))
            })?;

        let sql = load_materialization_query(&materialization.id);
        let request = JobRequest::new(SqlQuery::system(sql), QueryType::AcceleratorCreate)
            .with_summary(MaterializationSummary {
                dataset_id: Some(entry.dataset_id.clone()),
                reflection_id: Some(entry.id.clone()),
                layout_version: Some(entry.goal_version),
                materialization_id: Some(materialization.id.clone()),
            })
            .with_dataset_path(dataset.full_path)
            .with_dataset_version(entry.dataset_version.clone());
        let job = self
            .jobs
            .submit_job(request, wake_on_job_done(&self.wake_up, "metadata load job"))?;

        entry.state = ReflectionState::MetadataRefresh;
        entry.refresh_job_id = Some(job.id.clone());
        self.stores.entries.save(entry)?;

        debug!(
            "started job {} to load materialization metadata {}",
            job.id, materialization.id
        );
        Ok(())
    }

    /// Submit a refresh build and move the entry to Refreshing.
    fn start_refresh(&self, entry: &mut ReflectionEntry) -> Result<()> {
        let submitted_at = now_millis();
        let job_id = match self.refresh_start_handler().start_job(entry) {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!("failed to refresh reflection {}: {}", entry.id, e);
                // the start handler may have created the Running
                // materialization before faulting
                if let Some(mut materialization) =
                    self.stores.materializations.get_running(&entry.id)
                {
                    materialization.state = MaterializationState::Failed;
                    self.stores.materializations.save(&mut materialization)?;
                }
                return self.report_failure(entry, ReflectionState::Active);
            }
        };

        entry.state = ReflectionState::Refreshing;
        entry.refresh_job_id = Some(job_id);
        entry.last_submitted_refresh = submitted_at;
        self.stores.entries.save(entry)
    }

    /// Bump the failure counter and either keep going or quiesce the
    /// entry into Failed once the retry budget is exhausted.
    fn report_failure(&self, entry: &mut ReflectionEntry, new_state: ReflectionState) -> Result<()> {
        if entry.dont_give_up {
            debug!(
                "ignoring failure on reflection {} as it is marked as don't give up",
                entry.id
            );
            entry.state = new_state;
            entry.num_failures += 1;
            return self.stores.entries.save(entry);
        }

        let num_failures = entry.num_failures + 1;
        let threshold = self.options.read().max_refresh_attempts;
        let failed = num_failures >= threshold;
        entry.num_failures = num_failures;
        entry.state = if failed {
            ReflectionState::Failed
        } else {
            new_state
        };
        self.stores.entries.save(entry)?;

        if failed {
            debug!(
                "reflection {} had {} consecutive failures and was marked failed",
                entry.id, num_failures
            );
            // dependents recompute their schedule without it
            self.dependencies.delete(&entry.id);
        }
        Ok(())
    }

    /// Cancel the in-flight job of a Refreshing or MetadataRefresh entry
    /// and mark its materialization Canceled. A no-op in any other state.
    fn cancel_refresh_job_if_any(&self, entry: &mut ReflectionEntry) -> Result<()> {
        if entry.state != ReflectionState::Refreshing
            && entry.state != ReflectionState::MetadataRefresh
        {
            return Ok(());
        }

        let mut materialization =
            self.stores
                .materializations
                .get_last(&entry.id)
                .ok_or_else(|| {
                    EmberError::invalid_state(format!(
                        "reflection entry {} is refreshing but has no materialization",
                        entry.id
                    ))
                })?;

        if let Some(job_id) = &entry.refresh_job_id {
            debug!("cancelling job {} of reflection {}", job_id, entry.id);
            // cancellation can block while the job service reaches the
            // node running the job; reflection jobs are always submitted
            // on the manager's node, so this stays local
            if let Err(e) = self.jobs.cancel(SYSTEM_USERNAME, job_id) {
                warn!(
                    "failed to cancel the refresh job of reflection {}: {}",
                    entry.id, e
                );
            }
        }

        // the job may still complete and write data; the files go away
        // when the materialization row is deleted
        materialization.state = MaterializationState::Canceled;
        self.stores.materializations.save(&mut materialization)
    }

    /// Mark every Done materialization of a reflection Deprecated.
    fn deprecate_materializations_of(&self, entry: &ReflectionEntry) -> Result<()> {
        for mut materialization in self.stores.materializations.get_all_done(&entry.id) {
            self.deprecate_materialization(&mut materialization)?;
        }
        Ok(())
    }

    fn deprecate_materialization(&self, materialization: &mut Materialization) -> Result<()> {
        debug!(
            "deprecating materialization {}/{}",
            materialization.reflection_id, materialization.id
        );
        materialization.state = MaterializationState::Deprecated;
        self.stores.materializations.save(materialization)?;
        self.descriptor_cache.invalidate(&materialization.id);
        Ok(())
    }

    fn delete_reflection(&self, entry: &ReflectionEntry) {
        debug!("deleting reflection {}", entry.id);
        self.stores.entries.delete(&entry.id);
        self.dependencies.delete(&entry.id);
    }

    /// Pass 5: physically remove dead materializations past the grace
    /// period, at most `limit` per wakeup.
    fn delete_deprecated_materializations(&self, threshold: i64, limit: usize) {
        for materialization in self
            .stores
            .materializations
            .get_deletable_entries_modified_before(threshold, limit)
        {
            debug!("materialization {} due for deletion", materialization.id);
            if let Err(e) = self.delete_materialization(materialization) {
                warn!("couldn't delete a dead materialization: {}", e);
            }
        }
    }

    fn delete_materialization(&self, mut materialization: Materialization) -> Result<()> {
        if self
            .stores
            .materializations
            .get_refreshes_exclusively_owned_by(&materialization)
            .is_empty()
        {
            debug!(
                "materialization {} doesn't own any refresh, deleting the row without a drop job",
                materialization.id
            );
            self.stores.materializations.delete(&materialization.id);
            return Ok(());
        }

        // flipped to Deleted first so the next wakeup doesn't pick it
        // again while the drop job is in flight
        materialization.state = MaterializationState::Deleted;
        self.stores.materializations.save(&mut materialization)?;

        let path = materialization_path(&materialization);
        let request = JobRequest::new(
            SqlQuery::system(drop_table_query(&path)),
            QueryType::AcceleratorDrop,
        )
        .with_summary(MaterializationSummary {
            dataset_id: None,
            reflection_id: Some(materialization.reflection_id.clone()),
            layout_version: Some(materialization.reflection_goal_version),
            materialization_id: Some(materialization.id.clone()),
        });
        if let Err(e) = self.jobs.submit_job(request, noop_job_listener()) {
            warn!(
                "failed to submit the drop job for materialization {}: {}",
                materialization.id, e
            );
        }
        Ok(())
    }

    /// Pass 6: move materializations whose data expired to Deprecated and
    /// drop their descriptors.
    fn deprecate_expired_materializations(&self) {
        let now = now_millis();
        for mut materialization in self.stores.materializations.get_all_expired_when(now) {
            if let Err(e) = self.deprecate_materialization(&mut materialization) {
                warn!(
                    "couldn't deprecate materialization {}: {}",
                    materialization.id, e
                );
            }
        }
    }

    /// Pass 7: physically remove deleted goals past the grace period.
    fn delete_deprecated_goals(&self, threshold: i64) {
        for goal in self.stores.goals.get_deleted_before(threshold) {
            debug!("reflection goal {} due for deletion", goal.id);
            self.stores.goals.delete(&goal.id);
        }
    }

    fn refresh_start_handler(&self) -> RefreshStartHandler {
        RefreshStartHandler::new(
            self.namespace.clone(),
            self.jobs.clone(),
            self.stores.materializations.clone(),
            self.wake_up.clone(),
        )
    }

    fn refresh_done_handler(&self) -> RefreshDoneHandler {
        RefreshDoneHandler::new(self.dependencies.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MemoryDescriptorCache;
    use crate::jobs::MemoryJobsService;
    use crate::namespace::{DatasetConfig, MemoryNamespace};
    use crate::options::ReflectionOptions;
    use crate::types::{GoalType, JobId, Refresh};

    struct Fixture {
        manager: ReflectionManager,
        stores: ReflectionStores,
        dependencies: Arc<DependencyManager>,
        jobs: Arc<MemoryJobsService>,
        namespace: Arc<MemoryNamespace>,
        descriptor_cache: Arc<MemoryDescriptorCache>,
        reflections_to_update: ReflectionsToUpdate,
    }

    fn fixture(options: ReflectionOptions) -> Fixture {
        let stores = ReflectionStores::new();
        let dependencies = Arc::new(DependencyManager::new(stores.entries.clone()));
        let jobs = Arc::new(MemoryJobsService::new());
        let namespace = Arc::new(MemoryNamespace::new());
        let descriptor_cache = Arc::new(MemoryDescriptorCache::new());
        let reflections_to_update: ReflectionsToUpdate = Arc::new(Mutex::new(HashSet::new()));

        let manager = ReflectionManager::new(
            stores.clone(),
            dependencies.clone(),
            jobs.clone(),
            namespace.clone(),
            descriptor_cache.clone(),
            options.into_shared(),
            reflections_to_update.clone(),
            WakeUpCallback::new(),
        );

        Fixture {
            manager,
            stores,
            dependencies,
            jobs,
            namespace,
            descriptor_cache,
            reflections_to_update,
        }
    }

    fn add_dataset(fixture: &Fixture, id: &str) -> DatasetId {
        let dataset_id = DatasetId::new(id);
        fixture.namespace.put_dataset(DatasetConfig::new(
            dataset_id.clone(),
            vec!["source".to_string(), id.to_string()],
            "v1",
        ));
        dataset_id
    }

    fn add_goal(fixture: &Fixture, dataset_id: &DatasetId) -> ReflectionGoal {
        let mut goal = ReflectionGoal::new(dataset_id.clone(), "by_region", GoalType::Aggregation);
        fixture.stores.goals.save(&mut goal).unwrap();
        goal
    }

    #[test]
    fn test_enabled_goal_gets_an_entry_and_a_refresh_job() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);

        f.manager.run();

        let entry = f.stores.entries.get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Refreshing);
        assert_eq!(entry.goal_version, goal.version);
        assert!(entry.refresh_job_id.is_some());
        assert!(entry.last_submitted_refresh > 0);

        let materialization = f.stores.materializations.get_last(&goal.id).unwrap();
        assert_eq!(materialization.state, MaterializationState::Running);
        assert_eq!(f.jobs.job_count(), 1);
    }

    #[test]
    fn test_disabled_goal_gets_no_entry() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let mut goal = ReflectionGoal::new(dataset_id, "r", GoalType::Raw);
        goal.state = GoalState::Disabled;
        f.stores.goals.save(&mut goal).unwrap();

        f.manager.run();

        assert!(f.stores.entries.get(&goal.id).is_none());
        assert_eq!(f.jobs.job_count(), 0);
    }

    #[test]
    fn test_unchanged_goal_is_a_noop() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);

        f.manager.run();
        let before = f.stores.entries.get(&goal.id).unwrap();
        f.manager.run();
        let after = f.stores.entries.get(&goal.id).unwrap();

        // the in-flight job is still pending, nothing moved
        assert_eq!(before.tag, after.tag);
        assert_eq!(after.state, ReflectionState::Refreshing);
        assert_eq!(f.jobs.job_count(), 1);
    }

    #[test]
    fn test_goal_version_bump_while_refreshing_cancels_and_updates() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let mut goal = add_goal(&f, &dataset_id);

        f.manager.run();
        let refreshing = f.stores.entries.get(&goal.id).unwrap();
        let first_job = refreshing.refresh_job_id.clone().unwrap();

        goal.name = "by_region_v2".to_string();
        f.stores.goals.save(&mut goal).unwrap();
        f.manager.run();

        // the first job was cancelled and its materialization dropped out
        // of Running; the entry went through Update and is refreshing
        // again with a fresh job
        assert_eq!(
            f.jobs.get_job(&first_job).unwrap().state,
            JobState::Canceled
        );
        let entry = f.stores.entries.get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Refreshing);
        assert_eq!(entry.goal_version, goal.version);
        assert_eq!(entry.name, "by_region_v2");
        assert_ne!(entry.refresh_job_id.clone().unwrap(), first_job);

        let all = f.stores.materializations.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].state, MaterializationState::Canceled);
        assert_eq!(all[1].state, MaterializationState::Running);
    }

    #[test]
    fn test_disabling_a_goal_deprecates_the_entry() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let mut goal = add_goal(&f, &dataset_id);

        f.manager.run();

        goal.state = GoalState::Disabled;
        f.stores.goals.save(&mut goal).unwrap();
        f.manager.run();

        // Deprecate tears the entry down in the same wakeup
        assert!(f.stores.entries.get(&goal.id).is_none());
    }

    #[test]
    fn test_lost_job_reroutes_through_report_failure() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);

        f.manager.run();
        let entry = f.stores.entries.get(&goal.id).unwrap();
        f.jobs.forget_job(&entry.refresh_job_id.unwrap());

        f.manager.run();

        let entry = f.stores.entries.get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Active);
        assert_eq!(entry.num_failures, 1);
        let materialization = f.stores.materializations.get_last(&goal.id).unwrap();
        assert_eq!(materialization.state, MaterializationState::Failed);
        assert!(materialization
            .failure
            .unwrap()
            .message
            .starts_with("Couldn't retrieve refresh job"));
    }

    #[test]
    fn test_report_failure_quiesces_after_max_attempts() {
        let f = fixture(ReflectionOptions::default().with_max_refresh_attempts(2));
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);
        let mut entry = ReflectionEntry::new(&goal, "v1");
        f.stores.entries.save(&mut entry).unwrap();
        f.dependencies
            .update_dependencies(&entry.id, vec![crate::types::DependencyEntry::Reflection(
                crate::types::ReflectionDependency {
                    reflection_id: ReflectionId::new("upstream"),
                },
            )]);

        f.manager
            .report_failure(&mut entry, ReflectionState::Active)
            .unwrap();
        assert_eq!(entry.state, ReflectionState::Active);
        assert_eq!(entry.num_failures, 1);

        f.manager
            .report_failure(&mut entry, ReflectionState::Active)
            .unwrap();
        assert_eq!(entry.state, ReflectionState::Failed);
        assert_eq!(entry.num_failures, 2);
        // the failed reflection dropped out of the dependency graph
        assert!(!f.dependencies.reflection_has_known_dependencies(&entry.id));
    }

    #[test]
    fn test_report_failure_never_quiesces_dont_give_up() {
        let f = fixture(ReflectionOptions::default().with_max_refresh_attempts(1));
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);
        let mut entry = ReflectionEntry::new(&goal, "v1");
        entry.dont_give_up = true;
        f.stores.entries.save(&mut entry).unwrap();

        for expected in 1..=5 {
            f.manager
                .report_failure(&mut entry, ReflectionState::Active)
                .unwrap();
            assert_eq!(entry.state, ReflectionState::Active);
            assert_eq!(entry.num_failures, expected);
        }
    }

    #[test]
    fn test_forced_update_queue_is_drained_even_on_fault() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);
        f.manager.run();

        // corrupt one entry so forcing it faults: refreshing without a
        // materialization
        let mut broken = {
            let mut broken_goal =
                ReflectionGoal::new(dataset_id.clone(), "broken", GoalType::Raw);
            f.stores.goals.save(&mut broken_goal).unwrap();
            let mut entry = ReflectionEntry::new(&broken_goal, "v1");
            entry.state = ReflectionState::Refreshing;
            entry.refresh_job_id = Some(JobId::new("ghost"));
            entry
        };
        f.stores.entries.save(&mut broken).unwrap();

        {
            let mut pending = f.reflections_to_update.lock();
            pending.insert(goal.id.clone());
            pending.insert(broken.id.clone());
        }

        f.manager.handle_reflections_to_update();

        // both were consumed, the healthy one went to Update
        assert!(f.reflections_to_update.lock().is_empty());
        let entry = f.stores.entries.get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Update);
    }

    #[test]
    fn test_dataset_deletion_marks_goal_deleted() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);
        f.manager.run();

        f.namespace.remove_dataset(&dataset_id);
        f.manager.run();

        let goal = f.stores.goals.get(&goal.id).unwrap();
        assert_eq!(goal.state, GoalState::Deleted);
        // the version bump flowed through goal reconciliation in the same
        // wakeup and tore the entry down
        assert!(f.stores.entries.get(&goal.id).is_none());
    }

    #[test]
    fn test_dataset_deletion_removes_external_reflection() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-ext");
        let mut external = crate::types::ExternalReflection::new(
            "external",
            dataset_id.clone(),
            DatasetId::new("ds-target"),
        );
        f.stores.external_reflections.save(&mut external).unwrap();

        f.manager.run();
        assert!(f.stores.external_reflections.get(&external.id).is_some());

        f.namespace.remove_dataset(&dataset_id);
        f.manager.run();
        assert!(f.stores.external_reflections.get(&external.id).is_none());
    }

    #[test]
    fn test_expired_materialization_is_deprecated_and_invalidated() {
        let mut f = fixture(ReflectionOptions::default());
        let rid = ReflectionId::new("r-1");
        let mut materialization = Materialization::new(rid, 1);
        materialization.state = MaterializationState::Done;
        materialization.expires_at = Some(now_millis() - 1);
        f.stores
            .materializations
            .save(&mut materialization)
            .unwrap();

        f.manager.run();

        let materialization = f
            .stores
            .materializations
            .get(&materialization.id)
            .unwrap();
        assert_eq!(materialization.state, MaterializationState::Deprecated);
        assert_eq!(
            f.descriptor_cache.invalidations(),
            vec![materialization.id]
        );
    }

    #[test]
    fn test_dead_materialization_with_refreshes_gets_a_drop_job() {
        let mut f = fixture(
            ReflectionOptions::default()
                .with_deletion_grace_seconds(0)
                .with_deletion_num_entries(10),
        );
        let rid = ReflectionId::new("r-1");

        let refresh = Refresh::new(rid.clone(), 0);
        f.stores.materializations.save_refresh(refresh.clone());
        let mut owning = Materialization::new(rid.clone(), 1);
        owning.state = MaterializationState::Deprecated;
        owning.refreshes = vec![refresh.id.clone()];
        f.stores.materializations.save(&mut owning).unwrap();

        let mut bare = Materialization::new(rid, 1);
        bare.state = MaterializationState::Deprecated;
        f.stores.materializations.save(&mut bare).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        f.manager.run();

        // the bare row is gone, the owning one turned Deleted and
        // triggered a drop job
        assert!(f.stores.materializations.get(&bare.id).is_none());
        let owning = f.stores.materializations.get(&owning.id).unwrap();
        assert_eq!(owning.state, MaterializationState::Deleted);

        let drops: Vec<_> = f
            .jobs
            .submitted_jobs()
            .into_iter()
            .filter(|job| job.request.query_type == QueryType::AcceleratorDrop)
            .collect();
        assert_eq!(drops.len(), 1);
        assert!(drops[0]
            .request
            .query
            .sql
            .starts_with("DROP TABLE IF EXISTS __accelerator."));
    }

    #[test]
    fn test_deleted_goal_is_purged_after_grace_period() {
        let mut f = fixture(ReflectionOptions::default().with_deletion_grace_seconds(0));
        let dataset_id = add_dataset(&f, "ds-1");
        let mut goal = add_goal(&f, &dataset_id);
        goal.state = GoalState::Deleted;
        f.stores.goals.save(&mut goal).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        f.manager.run();

        assert!(f.stores.goals.get(&goal.id).is_none());
    }

    #[test]
    fn test_failed_submission_counts_as_failure() {
        let mut f = fixture(
            ReflectionOptions::default().with_no_dependency_refresh_period_seconds(0),
        );
        let dataset_id = add_dataset(&f, "ds-1");
        let goal = add_goal(&f, &dataset_id);
        f.jobs.set_fail_submissions(true);

        f.manager.run();

        let entry = f.stores.entries.get(&goal.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Active);
        assert_eq!(entry.num_failures, 1);
        assert!(entry.refresh_job_id.is_none());
    }

    #[test]
    fn test_faulty_entry_does_not_starve_siblings() {
        let mut f = fixture(ReflectionOptions::default());
        let dataset_id = add_dataset(&f, "ds-1");

        // one corrupt entry: refreshing with no materialization and no job
        let broken_goal = {
            let mut goal = ReflectionGoal::new(dataset_id.clone(), "broken", GoalType::Raw);
            f.stores.goals.save(&mut goal).unwrap();
            goal
        };
        let mut broken = ReflectionEntry::new(&broken_goal, "v1");
        broken.state = ReflectionState::Refreshing;
        broken.refresh_job_id = Some(JobId::new("ghost"));
        broken.goal_version = broken_goal.version;
        f.stores.entries.save(&mut broken).unwrap();

        // one healthy goal
        let healthy = add_goal(&f, &dataset_id);

        f.manager.run();

        // the healthy goal still got its entry and job
        let entry = f.stores.entries.get(&healthy.id).unwrap();
        assert_eq!(entry.state, ReflectionState::Refreshing);
        // the broken entry went through report_failure with its own state
        let broken = f.stores.entries.get(&broken.id).unwrap();
        assert_eq!(broken.num_failures, 1);
    }
}

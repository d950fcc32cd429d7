//! Refresh job lifecycle handlers.
//!
//! Starting a refresh and digesting a finished one are the two places
//! where the manager touches the job service with real payloads, so both
//! are factored into small handlers the manager builds per call.

use std::sync::Arc;

use tracing::debug;

use crate::dependencies::DependencyManager;
use crate::error::{EmberError, Result};
use crate::jobs::{
    refresh_reflection_query, Job, JobRequest, JobsService, MaterializationSummary, QueryType,
    SqlQuery,
};
use crate::namespace::NamespaceService;
use crate::store::MaterializationStore;
use crate::types::{now_millis, JobId, Materialization, RefreshDecision, ReflectionEntry};
use crate::wakeup::{wake_on_job_done, WakeUpCallback};

/// Starts a refresh build for a reflection entry.
pub struct RefreshStartHandler {
    namespace: Arc<dyn NamespaceService>,
    jobs: Arc<dyn JobsService>,
    materializations: Arc<MaterializationStore>,
    wake_up: WakeUpCallback,
}

impl RefreshStartHandler {
    pub fn new(
        namespace: Arc<dyn NamespaceService>,
        jobs: Arc<dyn JobsService>,
        materializations: Arc<MaterializationStore>,
        wake_up: WakeUpCallback,
    ) -> Self {
        Self {
            namespace,
            jobs,
            materializations,
            wake_up,
        }
    }

    /// Create the Running materialization and submit the build job.
    /// Returns the job id; the caller transitions the entry.
    pub fn start_job(&self, entry: &ReflectionEntry) -> Result<JobId> {
        let dataset = self
            .namespace
            .find_dataset_by_uuid(&entry.dataset_id)
            .ok_or_else(|| {
                EmberError::namespace(format!(
                    "dataset {} not found for reflection {}",
                    entry.dataset_id, entry.id
                ))
            })?;

        let mut materialization = Materialization::new(entry.id.clone(), entry.goal_version);
        self.materializations.save(&mut materialization)?;

        let sql = refresh_reflection_query(&entry.id, &materialization.id);
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
            .submit_job(request, wake_on_job_done(&self.wake_up, "refresh job"))?;
        debug!(
            "started job {} to materialize reflection {}",
            job.id, entry.id
        );
        Ok(job.id)
    }
}

/// Digests a successfully completed refresh job.
pub struct RefreshDoneHandler {
    dependencies: Arc<DependencyManager>,
}

impl RefreshDoneHandler {
    pub fn new(dependencies: Arc<DependencyManager>) -> Self {
        Self { dependencies }
    }

    /// Extract the refresh outcome from the job, stamp the
    /// materialization's expiry, and feed the learned dependency edges to
    /// the dependency manager. Returns the decision for entry
    /// bookkeeping.
    pub fn handle(
        &self,
        entry: &ReflectionEntry,
        materialization: &mut Materialization,
        job: &Job,
    ) -> Result<RefreshDecision> {
        let decision = job.refresh_decision.clone().ok_or_else(|| {
            EmberError::internal(format!(
                "refresh job {} completed without a refresh decision",
                job.id
            ))
        })?;

        if let Some(ttl_ms) = decision.series_ttl_ms {
            materialization.expires_at = Some(now_millis() + ttl_ms);
        }

        self.dependencies
            .update_dependencies(&entry.id, decision.dependencies.clone());
        Ok(decision)
    }

    /// Best-effort dependency learning from an aborted attempt: the
    /// planner may have attached a decision even though the job did not
    /// complete.
    pub fn learn_dependencies(&self, entry: &ReflectionEntry, job: &Job) -> Result<()> {
        let decision = job.refresh_decision.as_ref().ok_or_else(|| {
            EmberError::internal(format!("job {} carries no refresh decision", job.id))
        })?;
        self.dependencies
            .update_dependencies(&entry.id, decision.dependencies.clone());
        Ok(())
    }
}

//! Job service contract and the SQL sentences the manager emits.
//!
//! Refresh builds, metadata loads and table drops all run as jobs in an
//! external SQL job service. The manager never blocks on a job: it
//! submits with a listener that wakes the reconciliation loop on the
//! job's terminal transition, and polls the stored job state on the next
//! wakeup.
//!
//! [`MemoryJobsService`] is an in-process implementation whose terminal
//! transitions are driven by the embedding (or the test), which makes the
//! out-of-band nature of job completion explicit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{EmberError, Result};
use crate::types::{
    now_millis, DatasetId, JobId, Materialization, MaterializationId, RefreshDecision,
    ReflectionId,
};

/// User every reflection job is submitted as.
pub const SYSTEM_USERNAME: &str = "$ember";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

/// Kind of accelerator job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    AcceleratorCreate,
    AcceleratorDrop,
}

/// A SQL sentence plus the user it runs as.
#[derive(Debug, Clone)]
pub struct SqlQuery {
    pub sql: String,
    pub username: String,
}

impl SqlQuery {
    pub fn new(sql: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            username: username.into(),
        }
    }

    /// A sentence submitted as the system user.
    pub fn system(sql: impl Into<String>) -> Self {
        Self::new(sql, SYSTEM_USERNAME)
    }
}

/// What a job is materializing, for bookkeeping and observability.
#[derive(Debug, Clone, Default)]
pub struct MaterializationSummary {
    pub dataset_id: Option<DatasetId>,
    pub reflection_id: Option<ReflectionId>,
    pub layout_version: Option<u64>,
    pub materialization_id: Option<MaterializationId>,
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub query: SqlQuery,
    pub query_type: QueryType,
    pub summary: MaterializationSummary,
    pub dataset_path: Option<Vec<String>>,
    pub dataset_version: Option<String>,
}

impl JobRequest {
    pub fn new(query: SqlQuery, query_type: QueryType) -> Self {
        Self {
            query,
            query_type,
            summary: MaterializationSummary::default(),
            dataset_path: None,
            dataset_version: None,
        }
    }

    pub fn with_summary(mut self, summary: MaterializationSummary) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_dataset_path(mut self, path: Vec<String>) -> Self {
        self.dataset_path = Some(path);
        self
    }

    pub fn with_dataset_version(mut self, version: impl Into<String>) -> Self {
        self.dataset_version = Some(version.into());
        self
    }
}

/// A submitted job as seen through the job store.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub state: JobState,
    /// Failure message of a Failed job, when the service reported one.
    pub failure_info: Option<String>,
    /// Refresh outcome attached by the executor to a completed (or
    /// aborted-after-planning) refresh job.
    pub refresh_decision: Option<RefreshDecision>,
    pub submitted_at: i64,
}

impl Job {
    fn new(request: JobRequest) -> Self {
        Self {
            id: JobId::generate(),
            request,
            state: JobState::Pending,
            failure_info: None,
            refresh_decision: None,
            submitted_at: now_millis(),
        }
    }
}

/// Callback fired exactly once when a job reaches a terminal state.
pub type JobStatusListener = Arc<dyn Fn(&Job) + Send + Sync>;

/// A listener that ignores the transition.
pub fn noop_job_listener() -> JobStatusListener {
    Arc::new(|_| {})
}

/// Job service contract consumed by the manager.
pub trait JobsService: Send + Sync {
    /// Submit a job. The listener fires once, on the job's terminal
    /// transition.
    fn submit_job(&self, request: JobRequest, listener: JobStatusListener) -> Result<Job>;

    /// Fetch a job from the job store.
    fn get_job(&self, id: &JobId) -> Result<Job>;

    /// Best-effort cancellation.
    fn cancel(&self, username: &str, id: &JobId) -> Result<()>;
}

/// In-process job service driven by the embedding.
pub struct MemoryJobsService {
    jobs: RwLock<HashMap<String, Job>>,
    listeners: Mutex<HashMap<String, JobStatusListener>>,
    fail_submissions: AtomicBool,
}

impl Default for MemoryJobsService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobsService {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            fail_submissions: AtomicBool::new(false),
        }
    }

    /// Every job ever submitted, in submission order.
    pub fn submitted_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.submitted_at);
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Mark a job Running.
    pub fn start_job(&self, id: &JobId) -> Result<()> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id.as_str())
            .ok_or_else(|| EmberError::job_not_found(id.as_str()))?;
        if job.state.is_terminal() {
            return Err(EmberError::job(format!("job {} already terminal", id)));
        }
        job.state = JobState::Running;
        Ok(())
    }

    /// Complete a job, optionally attaching the refresh outcome.
    pub fn complete_job(&self, id: &JobId, decision: Option<RefreshDecision>) -> Result<()> {
        self.finish(id, |job| {
            job.state = JobState::Completed;
            job.refresh_decision = decision;
        })
    }

    /// Fail a job, optionally with a failure message and the refresh
    /// outcome learned before the failure.
    pub fn fail_job(
        &self,
        id: &JobId,
        failure: Option<&str>,
        decision: Option<RefreshDecision>,
    ) -> Result<()> {
        self.finish(id, |job| {
            job.state = JobState::Failed;
            job.failure_info = failure.map(|message| message.to_string());
            job.refresh_decision = decision;
        })
    }

    /// Drop a job row entirely, simulating a job lost by the service.
    pub fn forget_job(&self, id: &JobId) {
        self.jobs.write().remove(id.as_str());
        self.listeners.lock().remove(id.as_str());
    }

    /// Make subsequent submissions fail, to exercise the caller's
    /// failure handling.
    pub fn set_fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    fn finish(&self, id: &JobId, apply: impl FnOnce(&mut Job)) -> Result<()> {
        let job = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(id.as_str())
                .ok_or_else(|| EmberError::job_not_found(id.as_str()))?;
            if job.state.is_terminal() {
                return Err(EmberError::job(format!("job {} already terminal", id)));
            }
            apply(job);
            job.clone()
        };
        // listeners fire outside the job lock, exactly once
        let listener = self.listeners.lock().remove(id.as_str());
        if let Some(listener) = listener {
            listener(&job);
        }
        Ok(())
    }
}

impl JobsService for MemoryJobsService {
    fn submit_job(&self, request: JobRequest, listener: JobStatusListener) -> Result<Job> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(EmberError::job("job submission rejected"));
        }
        let job = Job::new(request);
        debug!(
            "submitted {:?} job {}: {}",
            job.request.query_type, job.id, job.request.query.sql
        );
        self.jobs
            .write()
            .insert(job.id.as_str().to_string(), job.clone());
        self.listeners
            .lock()
            .insert(job.id.as_str().to_string(), listener);
        Ok(job)
    }

    fn get_job(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| EmberError::job_not_found(id.as_str()))
    }

    fn cancel(&self, _username: &str, id: &JobId) -> Result<()> {
        let job = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(id.as_str())
                .ok_or_else(|| EmberError::job_not_found(id.as_str()))?;
            if job.state.is_terminal() {
                return Ok(());
            }
            job.state = JobState::Canceled;
            job.clone()
        };
        let listener = self.listeners.lock().remove(id.as_str());
        if let Some(listener) = listener {
            listener(&job);
        }
        Ok(())
    }
}

/// Storage path of a materialization's table:
/// `__accelerator.<reflection id>.<materialization id>`.
pub fn materialization_path(materialization: &Materialization) -> Vec<String> {
    vec![
        "__accelerator".to_string(),
        materialization.reflection_id.as_str().to_string(),
        materialization.id.as_str().to_string(),
    ]
}

fn is_plain_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Join path segments into a dotted SQL path, double-quoting every segment
/// that is not a plain identifier.
pub fn construct_full_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| {
            if is_plain_identifier(segment) {
                segment.clone()
            } else {
                format!("\"{}\"", segment.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Sentence submitted to build a materialization.
pub fn refresh_reflection_query(
    reflection_id: &ReflectionId,
    materialization_id: &MaterializationId,
) -> String {
    format!(
        "REFRESH REFLECTION '{}' AS '{}'",
        reflection_id, materialization_id
    )
}

/// Sentence submitted to load the metadata of a finished materialization.
/// The downstream parser cares about the exact shape.
pub fn load_materialization_query(materialization_id: &MaterializationId) -> String {
    format!("LOAD MATERIALIZATION METADATA '{}'", materialization_id)
}

/// Sentence submitted to drop a materialization's table.
pub fn drop_table_query(path: &[String]) -> String {
    format!("DROP TABLE IF EXISTS {}", construct_full_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample_request() -> JobRequest {
        JobRequest::new(SqlQuery::system("SELECT 1"), QueryType::AcceleratorCreate)
    }

    #[test]
    fn test_submit_and_get() {
        let service = MemoryJobsService::new();
        let job = service
            .submit_job(sample_request(), noop_job_listener())
            .unwrap();
        assert_eq!(job.state, JobState::Pending);

        let fetched = service.get_job(&job.id).unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.request.query.username, SYSTEM_USERNAME);
    }

    #[test]
    fn test_get_missing_job() {
        let service = MemoryJobsService::new();
        let err = service.get_job(&JobId::new("ghost")).unwrap_err();
        assert!(err.is_job_not_found());
    }

    #[test]
    fn test_listener_fires_once_on_terminal_transition() {
        let service = MemoryJobsService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let job = service
            .submit_job(
                sample_request(),
                Arc::new(move |job: &Job| {
                    assert!(job.state.is_terminal());
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        service.start_job(&job.id).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        service.complete_job(&job.id, None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // a second terminal transition is rejected and does not re-fire
        assert!(service.complete_job(&job.id, None).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_best_effort() {
        let service = MemoryJobsService::new();
        let job = service
            .submit_job(sample_request(), noop_job_listener())
            .unwrap();

        service.cancel(SYSTEM_USERNAME, &job.id).unwrap();
        assert_eq!(service.get_job(&job.id).unwrap().state, JobState::Canceled);

        // cancelling a terminal job is a no-op
        service.cancel(SYSTEM_USERNAME, &job.id).unwrap();

        let err = service
            .cancel(SYSTEM_USERNAME, &JobId::new("ghost"))
            .unwrap_err();
        assert!(err.is_job_not_found());
    }

    #[test]
    fn test_rejected_submissions() {
        let service = MemoryJobsService::new();
        service.set_fail_submissions(true);
        assert!(service
            .submit_job(sample_request(), noop_job_listener())
            .is_err());
        assert_eq!(service.job_count(), 0);
    }

    #[test]
    fn test_sql_sentences() {
        let rid = ReflectionId::new("11f1ab36");
        let mid = MaterializationId::new("5ae9b355");
        assert_eq!(
            refresh_reflection_query(&rid, &mid),
            "REFRESH REFLECTION '11f1ab36' AS '5ae9b355'"
        );
        assert_eq!(
            load_materialization_query(&mid),
            "LOAD MATERIALIZATION METADATA '5ae9b355'"
        );
    }

    #[test]
    fn test_path_quoting() {
        let plain = vec!["__accelerator".to_string(), "abc".to_string()];
        assert_eq!(construct_full_path(&plain), "__accelerator.abc");

        let quoted = vec![
            "__accelerator".to_string(),
            "9d2c-4a".to_string(),
            "with\"quote".to_string(),
        ];
        assert_eq!(
            construct_full_path(&quoted),
            "__accelerator.\"9d2c-4a\".\"with\"\"quote\""
        );
        assert_eq!(
            drop_table_query(&quoted),
            "DROP TABLE IF EXISTS __accelerator.\"9d2c-4a\".\"with\"\"quote\""
        );
    }
}

//! Core data model for reflection lifecycle management.
//!
//! A *reflection* is a declarative request to maintain a materialized
//! acceleration of a dataset. The model splits it into three records:
//!
//! - [`ReflectionGoal`]: the user-facing intent (what the user wants)
//! - [`ReflectionEntry`]: the manager's internal reconciliation state
//! - [`Materialization`]: one concrete build attempt, owning [`Refresh`]
//!   artifacts
//!
//! All persisted records derive serde traits because encoding is owned by
//! the store layer, and carry a store-managed tag for optimistic
//! concurrency.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Identifies a reflection. Shared by the goal and its entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReflectionId(pub String);

impl ReflectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReflectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one build attempt of a reflection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterializationId(pub String);

impl MaterializationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MaterializationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a dataset in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a single refresh artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefreshId(pub String);

impl RefreshId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefreshId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User-visible state of a reflection goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalState {
    Enabled,
    Disabled,
    Deleted,
}

/// Kind of acceleration requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalType {
    /// Raw copy of selected fields.
    Raw,
    /// Pre-aggregated rollup.
    Aggregation,
}

/// Internal state of a reflection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReflectionState {
    /// Needs a build now.
    Refresh,
    /// Build job in flight.
    Refreshing,
    /// Post-build metadata-load job in flight.
    MetadataRefresh,
    /// Built and usable.
    Active,
    /// Must be rebuilt because the goal changed or an update was forced.
    Update,
    /// Entry and its materializations must be torn down.
    Deprecate,
    /// Retry budget exhausted; only a new goal version revives it.
    Failed,
}

/// State of one materialization (build attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterializationState {
    Running,
    Done,
    Deprecated,
    Deleted,
    Failed,
    Canceled,
}

/// How a reflection is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshMethod {
    Full,
    Incremental,
}

/// User-declared intent: "keep this dataset accelerated this way".
///
/// Owned by the user API. The manager only ever flips `state` to
/// [`GoalState::Deleted`] when the underlying dataset vanishes. `version`
/// doubles as the store's optimistic-concurrency tag, so any edit bumps it
/// and the manager observes the change through
/// `get_modified_or_created_since`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionGoal {
    pub id: ReflectionId,
    pub dataset_id: DatasetId,
    /// Monotonically bumped on every save.
    pub version: u64,
    pub name: String,
    pub goal_type: GoalType,
    pub state: GoalState,
    pub created_at: i64,
    pub modified_at: i64,
}

impl ReflectionGoal {
    /// Create a new enabled goal. The version starts at 0 and becomes 1 on
    /// the first save.
    pub fn new(dataset_id: DatasetId, name: impl Into<String>, goal_type: GoalType) -> Self {
        let now = now_millis();
        Self {
            id: ReflectionId::generate(),
            dataset_id,
            version: 0,
            name: name.into(),
            goal_type,
            state: GoalState::Enabled,
            created_at: now,
            modified_at: now,
        }
    }
}

/// The manager's view of a reflection: reconciliation state plus refresh
/// bookkeeping. Created on first sight of an enabled goal, mutated only by
/// the manager, deleted when its teardown finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub id: ReflectionId,
    /// Goal version this entry was last reconciled against.
    pub goal_version: u64,
    pub dataset_id: DatasetId,
    pub dataset_version: String,
    pub name: String,
    pub goal_type: GoalType,
    pub state: ReflectionState,
    /// Job in flight while state is Refreshing or MetadataRefresh.
    pub refresh_job_id: Option<JobId>,
    pub last_submitted_refresh: i64,
    pub last_successful_refresh: i64,
    pub refresh_method: RefreshMethod,
    pub refresh_field: Option<String>,
    pub dataset_hash: Option<i64>,
    /// Consecutive failures since the last success.
    pub num_failures: u32,
    /// When set, failures never quiesce the entry into Failed.
    pub dont_give_up: bool,
    pub modified_at: i64,
    /// Store-managed optimistic-concurrency tag.
    pub tag: u64,
}

impl ReflectionEntry {
    /// Build the entry for a freshly observed goal. Starts in
    /// [`ReflectionState::Refresh`].
    pub fn new(goal: &ReflectionGoal, dataset_version: impl Into<String>) -> Self {
        Self {
            id: goal.id.clone(),
            goal_version: goal.version,
            dataset_id: goal.dataset_id.clone(),
            dataset_version: dataset_version.into(),
            name: goal.name.clone(),
            goal_type: goal.goal_type,
            state: ReflectionState::Refresh,
            refresh_job_id: None,
            last_submitted_refresh: 0,
            last_successful_refresh: 0,
            refresh_method: RefreshMethod::Full,
            refresh_field: None,
            dataset_hash: None,
            num_failures: 0,
            dont_give_up: false,
            modified_at: now_millis(),
            tag: 0,
        }
    }
}

/// Why a materialization failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationFailure {
    pub message: String,
}

impl MaterializationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One concrete build of a reflection.
///
/// Owns refresh artifacts by id; incremental builds may share refreshes
/// with earlier materializations of the same reflection. At most one
/// materialization per reflection is Running at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Materialization {
    pub id: MaterializationId,
    pub reflection_id: ReflectionId,
    pub reflection_goal_version: u64,
    pub state: MaterializationState,
    pub failure: Option<MaterializationFailure>,
    /// When the materialized data stops being servable.
    pub expires_at: Option<i64>,
    /// Refresh artifacts this build logically owns.
    pub refreshes: Vec<RefreshId>,
    pub created_at: i64,
    pub modified_at: i64,
    /// Creation-order stamp assigned by the store on first save. Totally
    /// orders the materializations of a reflection even when two are
    /// created within the same millisecond.
    pub seq: u64,
    /// Store-managed optimistic-concurrency tag.
    pub tag: u64,
}

impl Materialization {
    /// Create a new Running materialization for a build that is about to be
    /// submitted.
    pub fn new(reflection_id: ReflectionId, reflection_goal_version: u64) -> Self {
        let now = now_millis();
        Self {
            id: MaterializationId::generate(),
            reflection_id,
            reflection_goal_version,
            state: MaterializationState::Running,
            failure: None,
            expires_at: None,
            refreshes: Vec::new(),
            created_at: now,
            modified_at: now,
            seq: 0,
            tag: 0,
        }
    }
}

/// A single refresh artifact (one incremental or full build output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refresh {
    pub id: RefreshId,
    pub reflection_id: ReflectionId,
    /// Position within the reflection's refresh series.
    pub series_ordinal: u32,
    pub created_at: i64,
}

impl Refresh {
    pub fn new(reflection_id: ReflectionId, series_ordinal: u32) -> Self {
        Self {
            id: RefreshId::generate(),
            reflection_id,
            series_ordinal,
            created_at: now_millis(),
        }
    }
}

/// An externally managed reflection. Observed only to detect dataset
/// deletion; never scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReflection {
    pub id: ReflectionId,
    pub name: String,
    /// Dataset whose queries this reflection accelerates.
    pub query_dataset_id: DatasetId,
    /// Dataset holding the externally maintained data.
    pub target_dataset_id: DatasetId,
    pub created_at: i64,
    pub modified_at: i64,
    /// Store-managed optimistic-concurrency tag.
    pub tag: u64,
}

impl ExternalReflection {
    pub fn new(
        name: impl Into<String>,
        query_dataset_id: DatasetId,
        target_dataset_id: DatasetId,
    ) -> Self {
        let now = now_millis();
        Self {
            id: ReflectionId::generate(),
            name: name.into(),
            query_dataset_id,
            target_dataset_id,
            created_at: now,
            modified_at: now,
            tag: 0,
        }
    }
}

/// One edge in the dependency graph: something a reflection's freshness
/// depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyEntry {
    Dataset(DatasetDependency),
    Reflection(ReflectionDependency),
}

/// Dependency on a physical dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDependency {
    pub dataset_id: DatasetId,
    pub path: Vec<String>,
    /// How often the dataset's acceleration settings want a refresh.
    pub refresh_period_ms: i64,
    /// The dataset's settings mandate retrying forever.
    pub infinite_retry: bool,
}

/// Dependency on another reflection's materialized data.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionDependency {
    pub reflection_id: ReflectionId,
}

/// Outcome of a completed refresh job: how the reflection was built and
/// what it turned out to depend on. Attached to the job by the executor
/// and consumed when the manager observes the terminal state.
#[derive(Debug, Clone)]
pub struct RefreshDecision {
    pub method: RefreshMethod,
    pub refresh_field: Option<String>,
    /// Fingerprint of the dataset definition the build was planned against.
    pub dataset_hash: i64,
    /// Time-to-live of the materialized data, when the settings bound it.
    pub series_ttl_ms: Option<i64>,
    pub dependencies: Vec<DependencyEntry>,
}

impl RefreshDecision {
    /// A full refresh with no learned dependencies and no expiry.
    pub fn full() -> Self {
        Self {
            method: RefreshMethod::Full,
            refresh_field: None,
            dataset_hash: 0,
            series_ttl_ms: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: RefreshMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_refresh_field(mut self, field: impl Into<String>) -> Self {
        self.refresh_field = Some(field.into());
        self
    }

    pub fn with_dataset_hash(mut self, hash: i64) -> Self {
        self.dataset_hash = hash;
        self
    }

    pub fn with_series_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.series_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<DependencyEntry>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ReflectionId::generate(), ReflectionId::generate());
        assert_ne!(MaterializationId::generate(), MaterializationId::generate());
    }

    #[test]
    fn test_new_goal_starts_enabled_at_version_zero() {
        let goal = ReflectionGoal::new(DatasetId::new("ds-1"), "by_region", GoalType::Aggregation);
        assert_eq!(goal.state, GoalState::Enabled);
        assert_eq!(goal.version, 0);
        assert_eq!(goal.created_at, goal.modified_at);
    }

    #[test]
    fn test_new_entry_mirrors_goal() {
        let goal = ReflectionGoal::new(DatasetId::new("ds-1"), "raw_copy", GoalType::Raw);
        let entry = ReflectionEntry::new(&goal, "v7");
        assert_eq!(entry.id, goal.id);
        assert_eq!(entry.goal_version, goal.version);
        assert_eq!(entry.state, ReflectionState::Refresh);
        assert_eq!(entry.dataset_version, "v7");
        assert_eq!(entry.num_failures, 0);
        assert!(!entry.dont_give_up);
    }

    #[test]
    fn test_new_materialization_is_running() {
        let m = Materialization::new(ReflectionId::new("r-1"), 3);
        assert_eq!(m.state, MaterializationState::Running);
        assert_eq!(m.reflection_goal_version, 3);
        assert!(m.refreshes.is_empty());
        assert!(m.expires_at.is_none());
    }

    #[test]
    fn test_refresh_decision_builder() {
        let decision = RefreshDecision::full()
            .with_method(RefreshMethod::Incremental)
            .with_refresh_field("event_ts")
            .with_dataset_hash(42)
            .with_series_ttl_ms(3_600_000);
        assert_eq!(decision.method, RefreshMethod::Incremental);
        assert_eq!(decision.refresh_field.as_deref(), Some("event_ts"));
        assert_eq!(decision.dataset_hash, 42);
        assert_eq!(decision.series_ttl_ms, Some(3_600_000));
    }
}

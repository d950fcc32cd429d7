//! In-memory stores for goals, entries, materializations and external
//! reflections.
//!
//! Every store follows the same contract:
//!
//! - `get` and scans hand out independent copies decoded from the stored
//!   document, so callers never alias store-internal state
//! - `save` uses optimistic concurrency: writing a record whose tag no
//!   longer matches the stored tag fails with
//!   [`EmberError::ConcurrentModification`] and leaves the store unchanged
//! - scans are computed from a snapshot, so iteration tolerates concurrent
//!   writes (the reconciliation loop is idempotent across wakeups either
//!   way)
//!
//! Encoding is owned by this layer: records are serialized on save and
//! decoded on read.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EmberError, Result};
use crate::types::{
    now_millis, ExternalReflection, GoalState, Materialization, MaterializationId,
    MaterializationState, Refresh, RefreshId, ReflectionEntry, ReflectionGoal, ReflectionId,
};

/// Behavior shared by every persisted record.
pub trait StoredRecord: Serialize + DeserializeOwned + Clone {
    /// Store key.
    fn key(&self) -> &str;
    /// Current optimistic-concurrency tag (0 = never saved).
    fn tag(&self) -> u64;
    fn set_tag(&mut self, tag: u64);
    /// Stamp the modification time; called by the store on save.
    fn touch(&mut self, now: i64);
}

impl StoredRecord for ReflectionGoal {
    fn key(&self) -> &str {
        self.id.as_str()
    }

    // The goal's user-visible version IS the concurrency tag: any edit,
    // including the manager marking the goal deleted, must be observable
    // as a version change by the reconciliation loop.
    fn tag(&self) -> u64 {
        self.version
    }

    fn set_tag(&mut self, tag: u64) {
        self.version = tag;
    }

    fn touch(&mut self, now: i64) {
        self.modified_at = now;
    }
}

impl StoredRecord for ReflectionEntry {
    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn tag(&self) -> u64 {
        self.tag
    }

    fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    fn touch(&mut self, now: i64) {
        self.modified_at = now;
    }
}

impl StoredRecord for Materialization {
    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn tag(&self) -> u64 {
        self.tag
    }

    fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    fn touch(&mut self, now: i64) {
        self.modified_at = now;
    }
}

impl StoredRecord for ExternalReflection {
    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn tag(&self) -> u64 {
        self.tag
    }

    fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    fn touch(&mut self, now: i64) {
        self.modified_at = now;
    }
}

/// One stored row: concurrency tag plus the encoded document.
struct Row {
    tag: u64,
    doc: String,
}

/// One keyed section of the backing store.
struct KvSection<T> {
    entity: &'static str,
    rows: RwLock<HashMap<String, Row>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: StoredRecord> KvSection<T> {
    fn new(entity: &'static str) -> Self {
        Self {
            entity,
            rows: RwLock::new(HashMap::new()),
            _record: PhantomData,
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let rows = self.rows.read();
        rows.get(key).and_then(|row| serde_json::from_str(&row.doc).ok())
    }

    fn save(&self, record: &mut T) -> Result<()> {
        let mut rows = self.rows.write();
        let current = rows.get(record.key()).map(|row| row.tag).unwrap_or(0);
        if record.tag() != current {
            return Err(EmberError::concurrent_modification(format!(
                "{} {}",
                self.entity,
                record.key()
            )));
        }
        record.set_tag(current + 1);
        record.touch(now_millis());
        let doc = serde_json::to_string(record)?;
        rows.insert(
            record.key().to_string(),
            Row {
                tag: current + 1,
                doc,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) {
        self.rows.write().remove(key);
    }

    fn scan(&self) -> Vec<T> {
        let rows = self.rows.read();
        rows.values()
            .filter_map(|row| serde_json::from_str(&row.doc).ok())
            .collect()
    }
}

/// Store of user-declared reflection goals.
pub struct GoalStore {
    goals: KvSection<ReflectionGoal>,
}

impl Default for GoalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GoalStore {
    pub fn new() -> Self {
        Self {
            goals: KvSection::new("reflection goal"),
        }
    }

    pub fn get(&self, id: &ReflectionId) -> Option<ReflectionGoal> {
        self.goals.get(id.as_str())
    }

    pub fn save(&self, goal: &mut ReflectionGoal) -> Result<()> {
        self.goals.save(goal)
    }

    pub fn delete(&self, id: &ReflectionId) {
        self.goals.delete(id.as_str());
    }

    /// All goals the user has not deleted, regardless of enabled state.
    pub fn get_all_not_deleted(&self) -> Vec<ReflectionGoal> {
        self.goals
            .scan()
            .into_iter()
            .filter(|goal| goal.state != GoalState::Deleted)
            .collect()
    }

    /// Goals created or modified at or after `since`. Inclusive, so a
    /// caller passing `last wakeup - overlap` cannot skip writes whose
    /// commit timestamp precedes their visibility.
    pub fn get_modified_or_created_since(&self, since: i64) -> Vec<ReflectionGoal> {
        self.goals
            .scan()
            .into_iter()
            .filter(|goal| goal.modified_at >= since || goal.created_at >= since)
            .collect()
    }

    /// Deleted goals whose last modification is older than `before`.
    pub fn get_deleted_before(&self, before: i64) -> Vec<ReflectionGoal> {
        self.goals
            .scan()
            .into_iter()
            .filter(|goal| goal.state == GoalState::Deleted && goal.modified_at < before)
            .collect()
    }
}

/// Store of the manager's internal reflection entries.
pub struct EntryStore {
    entries: KvSection<ReflectionEntry>,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryStore {
    pub fn new() -> Self {
        Self {
            entries: KvSection::new("reflection entry"),
        }
    }

    pub fn get(&self, id: &ReflectionId) -> Option<ReflectionEntry> {
        self.entries.get(id.as_str())
    }

    pub fn save(&self, entry: &mut ReflectionEntry) -> Result<()> {
        self.entries.save(entry)
    }

    pub fn delete(&self, id: &ReflectionId) {
        self.entries.delete(id.as_str());
    }

    /// All entries.
    pub fn find(&self) -> Vec<ReflectionEntry> {
        self.entries.scan()
    }
}

/// Store of materializations and the refresh artifacts they own.
pub struct MaterializationStore {
    materializations: KvSection<Materialization>,
    refreshes: RwLock<HashMap<String, Refresh>>,
    next_seq: AtomicU64,
}

impl Default for MaterializationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterializationStore {
    pub fn new() -> Self {
        Self {
            materializations: KvSection::new("materialization"),
            refreshes: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn get(&self, id: &MaterializationId) -> Option<Materialization> {
        self.materializations.get(id.as_str())
    }

    pub fn save(&self, materialization: &mut Materialization) -> Result<()> {
        if materialization.tag == 0 && materialization.seq == 0 {
            materialization.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        }
        self.materializations.save(materialization)
    }

    /// Delete a materialization row together with the refresh artifacts it
    /// exclusively owns. Shared refreshes stay behind for the
    /// materializations that still reference them.
    pub fn delete(&self, id: &MaterializationId) {
        if let Some(materialization) = self.get(id) {
            let exclusive = self.get_refreshes_exclusively_owned_by(&materialization);
            let mut refreshes = self.refreshes.write();
            for refresh in exclusive {
                refreshes.remove(refresh.id.as_str());
            }
        }
        self.materializations.delete(id.as_str());
    }

    /// All materializations, most recent last.
    pub fn get_all(&self) -> Vec<Materialization> {
        let mut all = self.materializations.scan();
        all.sort_by_key(|m| m.seq);
        all
    }

    /// The most recently created materialization of a reflection,
    /// regardless of state.
    pub fn get_last(&self, reflection_id: &ReflectionId) -> Option<Materialization> {
        self.materializations
            .scan()
            .into_iter()
            .filter(|m| &m.reflection_id == reflection_id)
            .max_by_key(|m| m.seq)
    }

    /// The Running materialization of a reflection, if any. The manager
    /// keeps at most one per reflection.
    pub fn get_running(&self, reflection_id: &ReflectionId) -> Option<Materialization> {
        self.materializations
            .scan()
            .into_iter()
            .find(|m| &m.reflection_id == reflection_id && m.state == MaterializationState::Running)
    }

    /// All Done materializations of a reflection.
    pub fn get_all_done(&self, reflection_id: &ReflectionId) -> Vec<Materialization> {
        self.materializations
            .scan()
            .into_iter()
            .filter(|m| &m.reflection_id == reflection_id && m.state == MaterializationState::Done)
            .collect()
    }

    /// Done materializations whose data has expired as of `when`.
    pub fn get_all_expired_when(&self, when: i64) -> Vec<Materialization> {
        self.materializations
            .scan()
            .into_iter()
            .filter(|m| {
                m.state == MaterializationState::Done
                    && m.expires_at.map(|expiry| expiry <= when).unwrap_or(false)
            })
            .collect()
    }

    /// Dead materializations (deprecated, failed or canceled) last touched
    /// before `before`, oldest first, capped at `limit` rows.
    pub fn get_deletable_entries_modified_before(
        &self,
        before: i64,
        limit: usize,
    ) -> Vec<Materialization> {
        let mut deletable: Vec<Materialization> = self
            .materializations
            .scan()
            .into_iter()
            .filter(|m| {
                matches!(
                    m.state,
                    MaterializationState::Deprecated
                        | MaterializationState::Failed
                        | MaterializationState::Canceled
                ) && m.modified_at < before
            })
            .collect();
        deletable.sort_by_key(|m| m.modified_at);
        deletable.truncate(limit);
        deletable
    }

    /// Record a refresh artifact.
    pub fn save_refresh(&self, refresh: Refresh) {
        self.refreshes
            .write()
            .insert(refresh.id.as_str().to_string(), refresh);
    }

    pub fn get_refresh(&self, id: &RefreshId) -> Option<Refresh> {
        self.refreshes.read().get(id.as_str()).cloned()
    }

    /// The refresh artifacts a materialization owns (shared or not).
    pub fn get_refreshes(&self, materialization: &Materialization) -> Vec<Refresh> {
        let refreshes = self.refreshes.read();
        materialization
            .refreshes
            .iter()
            .filter_map(|id| refreshes.get(id.as_str()).cloned())
            .collect()
    }

    /// The refresh artifacts owned by this materialization and referenced
    /// by no other.
    pub fn get_refreshes_exclusively_owned_by(
        &self,
        materialization: &Materialization,
    ) -> Vec<Refresh> {
        let all_materializations = self.materializations.scan();
        let shared: HashSet<&RefreshId> = all_materializations
            .iter()
            .filter(|m| m.id != materialization.id)
            .flat_map(|m| m.refreshes.iter())
            .collect();
        let refreshes = self.refreshes.read();
        materialization
            .refreshes
            .iter()
            .filter(|id| !shared.contains(id))
            .filter_map(|id| refreshes.get(id.as_str()).cloned())
            .collect()
    }
}

/// Store of externally managed reflections.
pub struct ExternalReflectionStore {
    reflections: KvSection<ExternalReflection>,
}

impl Default for ExternalReflectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalReflectionStore {
    pub fn new() -> Self {
        Self {
            reflections: KvSection::new("external reflection"),
        }
    }

    pub fn get(&self, id: &ReflectionId) -> Option<ExternalReflection> {
        self.reflections.get(id.as_str())
    }

    pub fn save(&self, reflection: &mut ExternalReflection) -> Result<()> {
        self.reflections.save(reflection)
    }

    pub fn delete(&self, id: &ReflectionId) {
        self.reflections.delete(id.as_str());
    }

    pub fn get_all(&self) -> Vec<ExternalReflection> {
        self.reflections.scan()
    }
}

/// Convenience bundle of the four stores, shared between the manager and
/// the service facade.
#[derive(Clone)]
pub struct ReflectionStores {
    pub goals: Arc<GoalStore>,
    pub entries: Arc<EntryStore>,
    pub materializations: Arc<MaterializationStore>,
    pub external_reflections: Arc<ExternalReflectionStore>,
}

impl Default for ReflectionStores {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflectionStores {
    pub fn new() -> Self {
        Self {
            goals: Arc::new(GoalStore::new()),
            entries: Arc::new(EntryStore::new()),
            materializations: Arc::new(MaterializationStore::new()),
            external_reflections: Arc::new(ExternalReflectionStore::new()),
        }
    }
}

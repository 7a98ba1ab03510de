use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::cache::{DurableCache, IDENTITY_BLOB_KEY};
use crate::degrade::DegradedOps;
use crate::error::{Result, StrideError};
use crate::models::{
    Entity, EntityKind, Goal, GoalChanges, Integration, IntegrationChanges, PersistOutcome,
    SyncStatus, Task, TaskChanges,
};

#[derive(Debug, Clone, Default)]
struct Collections {
    tasks: HashMap<String, Task>,
    goals: HashMap<String, Goal>,
    integrations: HashMap<String, Integration>,
}

/// Full previous value of one collection, captured at mutation time.
#[derive(Debug, Clone)]
pub enum CollectionSnapshot {
    Tasks(HashMap<String, Task>),
    Goals(HashMap<String, Goal>),
    Integrations(HashMap<String, Integration>),
}

impl CollectionSnapshot {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Tasks(_) => EntityKind::Tasks,
            Self::Goals(_) => EntityKind::Goals,
            Self::Integrations(_) => EntityKind::Integrations,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Tasks(map) => map.len(),
            Self::Goals(map) => map.len(),
            Self::Integrations(map) => map.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable rollback value: the collection it belongs to and the exact
/// state the collection had immediately before the mutation. Applying it
/// through `OptimisticStateStore::rollback` restores that state in memory
/// and in the durable cache.
///
/// Patches compose into undo stacks, but only when applied in reverse
/// chronological order: a patch captured before mutation A knows nothing
/// about a later mutation B on the same collection.
#[derive(Debug, Clone)]
pub struct Patch {
    previous: CollectionSnapshot,
}

impl Patch {
    #[must_use]
    pub fn collection(&self) -> EntityKind {
        self.previous.kind()
    }

    #[must_use]
    pub fn previous(&self) -> &CollectionSnapshot {
        &self.previous
    }
}

/// What one mutation returned: the rollback patch and whether the
/// write-through persistence step reached the durable cache.
#[derive(Debug)]
pub struct MutationReceipt {
    pub patch: Patch,
    pub persistence: PersistOutcome,
}

/// Sealed-ish plumbing mapping an entity type onto its slot in
/// `Collections`. Keeps the add/update/delete flows generic without
/// exposing the map fields.
trait Slot: Entity {
    fn slot(collections: &Collections) -> &HashMap<String, Self>;
    fn slot_mut(collections: &mut Collections) -> &mut HashMap<String, Self>;
    fn into_snapshot(map: HashMap<String, Self>) -> CollectionSnapshot;
}

impl Slot for Task {
    fn slot(collections: &Collections) -> &HashMap<String, Self> {
        &collections.tasks
    }
    fn slot_mut(collections: &mut Collections) -> &mut HashMap<String, Self> {
        &mut collections.tasks
    }
    fn into_snapshot(map: HashMap<String, Self>) -> CollectionSnapshot {
        CollectionSnapshot::Tasks(map)
    }
}

impl Slot for Goal {
    fn slot(collections: &Collections) -> &HashMap<String, Self> {
        &collections.goals
    }
    fn slot_mut(collections: &mut Collections) -> &mut HashMap<String, Self> {
        &mut collections.goals
    }
    fn into_snapshot(map: HashMap<String, Self>) -> CollectionSnapshot {
        CollectionSnapshot::Goals(map)
    }
}

impl Slot for Integration {
    fn slot(collections: &Collections) -> &HashMap<String, Self> {
        &collections.integrations
    }
    fn slot_mut(collections: &mut Collections) -> &mut HashMap<String, Self> {
        &mut collections.integrations
    }
    fn into_snapshot(map: HashMap<String, Self>) -> CollectionSnapshot {
        CollectionSnapshot::Integrations(map)
    }
}

/// Authoritative in-memory view of the three entity collections, with
/// write-through best-effort persistence to the durable cache.
///
/// Mutations apply to memory synchronously and fully before the call
/// returns; only the persistence step can fail, and that failure is
/// swallowed into `DegradedOps` and reported as
/// `PersistOutcome::MemoryOnly`. Memory and durable storage therefore agree
/// again no later than the next successful mutation or remote replace.
#[derive(Clone)]
pub struct OptimisticStateStore {
    collections: Arc<RwLock<Collections>>,
    sync_status: Arc<RwLock<SyncStatus>>,
    cache: DurableCache,
    degraded: DegradedOps,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for OptimisticStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticStateStore")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl OptimisticStateStore {
    #[must_use]
    pub fn new(cache: DurableCache, degraded: DegradedOps) -> Self {
        Self {
            collections: Arc::new(RwLock::new(Collections::default())),
            sync_status: Arc::new(RwLock::new(SyncStatus::Idle)),
            cache,
            degraded,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Monotone counter bumped by `reset`. Remote fetches capture it at
    /// start and drop their result if it moved (defunct-state guard).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
            .read()
            .map(|status| *status)
            .unwrap_or(SyncStatus::Idle)
    }

    /// Shared cell the status machine writes into.
    pub(crate) fn sync_status_cell(&self) -> Arc<RwLock<SyncStatus>> {
        Arc::clone(&self.sync_status)
    }

    // ---- readers ------------------------------------------------------

    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.read_sorted(|c| c.tasks.values().cloned().collect())
    }

    #[must_use]
    pub fn goals(&self) -> Vec<Goal> {
        self.read_sorted(|c| c.goals.values().cloned().collect())
    }

    #[must_use]
    pub fn integrations(&self) -> Vec<Integration> {
        self.read_sorted(|c| c.integrations.values().cloned().collect())
    }

    fn read_sorted<T: Entity>(&self, extract: impl FnOnce(&Collections) -> Vec<T>) -> Vec<T> {
        let mut items = self
            .collections
            .read()
            .map(|guard| extract(&guard))
            .unwrap_or_default();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        items
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<Task> {
        self.collections
            .read()
            .ok()
            .and_then(|guard| guard.tasks.get(id).cloned())
    }

    #[must_use]
    pub fn goal(&self, id: &str) -> Option<Goal> {
        self.collections
            .read()
            .ok()
            .and_then(|guard| guard.goals.get(id).cloned())
    }

    #[must_use]
    pub fn integration(&self, id: &str) -> Option<Integration> {
        self.collections
            .read()
            .ok()
            .and_then(|guard| guard.integrations.get(id).cloned())
    }

    /// Synchronous read of a collection's quick-access blob, available as
    /// soon as the cache opens (next process start, before hydration).
    #[must_use]
    pub fn quick_snapshot(&self, kind: EntityKind) -> Option<String> {
        self.cache.read_blob(kind.blob_key()).ok().flatten()
    }

    // ---- mutations ----------------------------------------------------

    pub fn add_task(&self, task: Task) -> Result<MutationReceipt> {
        task.validate()?;
        self.apply(move |map: &mut HashMap<String, Task>| {
            map.insert(task.id.clone(), task);
            Ok(())
        })
    }

    pub fn update_task(&self, id: &str, changes: TaskChanges) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Task>| {
            let task = map
                .get_mut(&id)
                .ok_or_else(|| StrideError::NotFound(format!("task {id}")))?;
            if let Some(title) = changes.title {
                task.title = title;
            }
            if let Some(notes) = changes.notes {
                task.notes = Some(notes);
            }
            if let Some(done) = changes.done {
                task.done = done;
            }
            if let Some(due_date) = changes.due_date {
                task.due_date = Some(due_date);
            }
            task.touch(Utc::now());
            task.validate()
        })
    }

    pub fn delete_task(&self, id: &str) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Task>| {
            map.remove(&id)
                .map(|_| ())
                .ok_or_else(|| StrideError::NotFound(format!("task {id}")))
        })
    }

    pub fn add_goal(&self, goal: Goal) -> Result<MutationReceipt> {
        goal.validate()?;
        self.apply(move |map: &mut HashMap<String, Goal>| {
            map.insert(goal.id.clone(), goal);
            Ok(())
        })
    }

    pub fn update_goal(&self, id: &str, changes: GoalChanges) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Goal>| {
            let goal = map
                .get_mut(&id)
                .ok_or_else(|| StrideError::NotFound(format!("goal {id}")))?;
            if let Some(title) = changes.title {
                goal.title = title;
            }
            if let Some(notes) = changes.notes {
                goal.notes = Some(notes);
            }
            if let Some(target_date) = changes.target_date {
                goal.target_date = Some(target_date);
            }
            if let Some(progress) = changes.progress {
                goal.progress = progress;
            }
            goal.touch(Utc::now());
            goal.validate()
        })
    }

    pub fn delete_goal(&self, id: &str) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Goal>| {
            map.remove(&id)
                .map(|_| ())
                .ok_or_else(|| StrideError::NotFound(format!("goal {id}")))
        })
    }

    pub fn add_integration(&self, integration: Integration) -> Result<MutationReceipt> {
        integration.validate()?;
        self.apply(move |map: &mut HashMap<String, Integration>| {
            map.insert(integration.id.clone(), integration);
            Ok(())
        })
    }

    pub fn update_integration(
        &self,
        id: &str,
        changes: IntegrationChanges,
    ) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Integration>| {
            let integration = map
                .get_mut(&id)
                .ok_or_else(|| StrideError::NotFound(format!("integration {id}")))?;
            if let Some(display_name) = changes.display_name {
                integration.display_name = display_name;
            }
            if let Some(enabled) = changes.enabled {
                integration.enabled = enabled;
            }
            integration.touch(Utc::now());
            integration.validate()
        })
    }

    pub fn delete_integration(&self, id: &str) -> Result<MutationReceipt> {
        let id = id.to_string();
        self.apply(move |map: &mut HashMap<String, Integration>| {
            map.remove(&id)
                .map(|_| ())
                .ok_or_else(|| StrideError::NotFound(format!("integration {id}")))
        })
    }

    /// Snapshot, compute next value, apply to memory, write through.
    /// A closure error (validation, missing id) leaves memory untouched:
    /// the next value is built on a clone and only swapped in on success.
    fn apply<T: Slot>(
        &self,
        mutate: impl FnOnce(&mut HashMap<String, T>) -> Result<()>,
    ) -> Result<MutationReceipt> {
        let (previous, next) = {
            let mut guard = self
                .collections
                .write()
                .map_err(|_| StrideError::Internal("collections lock poisoned".to_string()))?;
            let previous = T::slot(&guard).clone();
            let mut next = previous.clone();
            mutate(&mut next)?;
            *T::slot_mut(&mut guard) = next.clone();
            (previous, next)
        };

        let persistence = self.persist::<T>(&next);
        Ok(MutationReceipt {
            patch: Patch {
                previous: T::into_snapshot(previous),
            },
            persistence,
        })
    }

    /// Re-applies a captured snapshot to memory and durable storage.
    pub fn rollback(&self, patch: &Patch) -> PersistOutcome {
        match patch.previous() {
            CollectionSnapshot::Tasks(map) => self.restore::<Task>(map.clone()),
            CollectionSnapshot::Goals(map) => self.restore::<Goal>(map.clone()),
            CollectionSnapshot::Integrations(map) => self.restore::<Integration>(map.clone()),
        }
    }

    fn restore<T: Slot>(&self, map: HashMap<String, T>) -> PersistOutcome {
        if let Ok(mut guard) = self.collections.write() {
            *T::slot_mut(&mut guard) = map.clone();
        }
        self.persist::<T>(&map)
    }

    /// Full replacement of one collection (remote reconciliation). Never a
    /// merge: whatever the remote resolved is the new truth.
    pub fn replace_tasks(&self, tasks: Vec<Task>) -> PersistOutcome {
        self.restore::<Task>(tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
    }

    pub fn replace_goals(&self, goals: Vec<Goal>) -> PersistOutcome {
        self.restore::<Goal>(goals.into_iter().map(|g| (g.id.clone(), g)).collect())
    }

    pub fn replace_integrations(&self, integrations: Vec<Integration>) -> PersistOutcome {
        self.restore::<Integration>(
            integrations.into_iter().map(|i| (i.id.clone(), i)).collect(),
        )
    }

    /// Write-through of the full collection value: partition rows plus the
    /// synchronous quick-access blob. Failures are sampled and swallowed.
    fn persist<T: Slot>(&self, map: &HashMap<String, T>) -> PersistOutcome {
        let kind = T::KIND;
        let mut values: Vec<&T> = map.values().collect();
        values.sort_by(|a, b| a.id().cmp(b.id()));

        let mut items = Vec::with_capacity(values.len());
        let mut blob_items = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::to_value(value) {
                Ok(json) => {
                    items.push((value.id().to_string(), json.clone()));
                    blob_items.push(json);
                }
                Err(err) => {
                    self.degraded.record("store.persist.serialize", &err.into());
                    return PersistOutcome::MemoryOnly;
                }
            }
        }

        let blob = serde_json::Value::Array(blob_items).to_string();
        let mut outcome = PersistOutcome::Durable;
        if let Err(err) = self.cache.replace_partition(kind.partition(), &items) {
            self.degraded.record("store.persist.partition", &err);
            outcome = PersistOutcome::MemoryOnly;
        }
        if let Err(err) = self.cache.write_blob(kind.blob_key(), &blob) {
            self.degraded.record("store.persist.blob", &err);
            outcome = PersistOutcome::MemoryOnly;
        }
        outcome
    }

    /// Loads the three cache partitions into memory. Rows that fail to
    /// deserialize are skipped and sampled, never fatal: the cache is
    /// best-effort and hydration must finish on whatever it finds.
    pub(crate) fn load_from_cache(&self) {
        let tasks = self.load_partition::<Task>();
        let goals = self.load_partition::<Goal>();
        let integrations = self.load_partition::<Integration>();

        if let Ok(mut guard) = self.collections.write() {
            guard.tasks = tasks;
            guard.goals = goals;
            guard.integrations = integrations;
        }
    }

    fn load_partition<T: Slot>(&self) -> HashMap<String, T> {
        let values = match self.cache.get_all(T::KIND.partition()) {
            Ok(values) => values,
            Err(err) => {
                self.degraded.record("store.load", &err);
                return HashMap::new();
            }
        };

        let mut map = HashMap::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<T>(value) {
                Ok(entity) => {
                    map.insert(entity.id().to_string(), entity);
                }
                Err(err) => self.degraded.record("store.load.row", &err.into()),
            }
        }
        map
    }

    /// Sign-out: empties all three collections, purges their cache
    /// partitions, and removes all four quick-access blobs. Bumps the
    /// generation so in-flight remote results are dropped on arrival.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.collections.write() {
            *guard = Collections::default();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        for kind in EntityKind::ALL {
            if let Err(err) = self.cache.clear(kind.partition()) {
                self.degraded.record("store.reset.partition", &err);
            }
            if let Err(err) = self.cache.remove_blob(kind.blob_key()) {
                self.degraded.record("store.reset.blob", &err);
            }
        }
        if let Err(err) = self.cache.remove_blob(IDENTITY_BLOB_KEY) {
            self.degraded.record("store.reset.identity", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store_on_disk(dir: &tempfile::TempDir) -> (OptimisticStateStore, DurableCache) {
        let cache = DurableCache::open(dir.path().join("cache.sqlite3"));
        let store = OptimisticStateStore::new(cache.clone(), DegradedOps::default());
        (store, cache)
    }

    #[test]
    fn add_rollback_restores_memory_and_cache() {
        let temp = tempdir().expect("tempdir");
        let (store, cache) = store_on_disk(&temp);

        let receipt = store
            .add_task(Task::new("t1", "Write weekly review"))
            .expect("add");
        assert_eq!(receipt.persistence, PersistOutcome::Durable);
        assert_eq!(store.tasks().len(), 1);
        assert_eq!(cache.get_all("tasks").expect("cache").len(), 1);

        store.rollback(&receipt.patch);
        assert!(store.tasks().is_empty());
        assert!(cache.get_all("tasks").expect("cache after").is_empty());
        assert_eq!(
            cache.read_blob("snapshot:tasks").expect("blob").as_deref(),
            Some("[]")
        );
    }

    #[test]
    fn update_refreshes_updated_at_and_is_rollbackable() {
        let temp = tempdir().expect("tempdir");
        let (store, _cache) = store_on_disk(&temp);

        store.add_task(Task::new("t1", "Draft")).expect("add");
        let before = store.task("t1").expect("present");

        let receipt = store
            .update_task(
                "t1",
                TaskChanges {
                    title: Some("Final".into()),
                    done: Some(true),
                    ..TaskChanges::default()
                },
            )
            .expect("update");

        let after = store.task("t1").expect("still present");
        assert_eq!(after.title, "Final");
        assert!(after.done);
        assert!(after.updated_at >= before.updated_at);

        store.rollback(&receipt.patch);
        let restored = store.task("t1").expect("restored");
        assert_eq!(restored.title, "Draft");
        assert!(!restored.done);
    }

    #[test]
    fn failed_mutation_leaves_state_untouched() {
        let temp = tempdir().expect("tempdir");
        let (store, _cache) = store_on_disk(&temp);
        store.add_goal(Goal::new("g1", "Read more")).expect("add");

        let err = store
            .update_goal(
                "g1",
                GoalChanges {
                    progress: Some(150),
                    ..GoalChanges::default()
                },
            )
            .expect_err("validation must fail");
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert_eq!(store.goal("g1").expect("goal").progress, 0);

        let err = store.delete_goal("missing").expect_err("not found");
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(store.goals().len(), 1);
    }

    #[test]
    fn stacked_rollbacks_restore_in_reverse_order() {
        let temp = tempdir().expect("tempdir");
        let (store, _cache) = store_on_disk(&temp);

        let first = store.add_task(Task::new("t1", "A")).expect("add a");
        let second = store.add_task(Task::new("t2", "B")).expect("add b");

        store.rollback(&second.patch);
        assert_eq!(store.tasks().len(), 1);
        store.rollback(&first.patch);
        assert!(store.tasks().is_empty());
    }

    #[test]
    fn degraded_cache_still_mutates_memory() {
        let degraded = DegradedOps::default();
        let store = OptimisticStateStore::new(DurableCache::unavailable(), degraded.clone());

        let receipt = store
            .add_goal(Goal::new("g1", "Ship the release"))
            .expect("mutation must not fail");
        assert_eq!(receipt.persistence, PersistOutcome::MemoryOnly);
        assert_eq!(store.goals().len(), 1);
        assert!(!degraded.snapshot().is_empty());

        store.rollback(&receipt.patch);
        assert!(store.goals().is_empty());
    }

    #[test]
    fn replace_is_full_not_merge() {
        let temp = tempdir().expect("tempdir");
        let (store, _cache) = store_on_disk(&temp);

        store.add_task(Task::new("local", "Local only")).expect("add");
        store.replace_tasks(vec![Task::new("remote", "From server")]);

        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "remote");
    }

    #[test]
    fn reset_purges_collections_partitions_and_blobs() {
        let temp = tempdir().expect("tempdir");
        let (store, cache) = store_on_disk(&temp);

        store.add_task(Task::new("t1", "T")).expect("task");
        store.add_goal(Goal::new("g1", "G")).expect("goal");
        store
            .add_integration(Integration::new("i1", "calendar", "Calendar"))
            .expect("integration");
        cache
            .write_blob(IDENTITY_BLOB_KEY, "{\"user_id\":\"u1\"}")
            .expect("identity blob");

        let generation_before = store.generation();
        store.reset();

        assert!(store.tasks().is_empty());
        assert!(store.goals().is_empty());
        assert!(store.integrations().is_empty());
        assert!(store.generation() > generation_before);

        for kind in EntityKind::ALL {
            assert!(cache.get_all(kind.partition()).expect("partition").is_empty());
            assert!(cache.read_blob(kind.blob_key()).expect("blob").is_none());
        }
        assert!(cache.read_blob(IDENTITY_BLOB_KEY).expect("identity").is_none());
    }

    #[test]
    fn load_from_cache_restores_persisted_state() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("cache.sqlite3");

        {
            let cache = DurableCache::open(&path);
            let store = OptimisticStateStore::new(cache, DegradedOps::default());
            store.add_task(Task::new("t1", "Persisted")).expect("add");
        }

        let cache = DurableCache::open(&path);
        let store = OptimisticStateStore::new(cache, DegradedOps::default());
        assert!(store.tasks().is_empty());
        store.load_from_cache();
        assert_eq!(store.tasks().len(), 1);
        assert_eq!(store.tasks()[0].title, "Persisted");
    }

    #[test]
    fn quick_snapshot_blob_tracks_every_mutation() {
        let temp = tempdir().expect("tempdir");
        let (store, _cache) = store_on_disk(&temp);

        store.add_task(Task::new("t1", "One")).expect("add");
        let blob = store.quick_snapshot(EntityKind::Tasks).expect("blob");
        let parsed: Vec<Task> = serde_json::from_str(&blob).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "t1");
    }
}

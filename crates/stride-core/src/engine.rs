use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::cache::{DurableCache, IDENTITY_BLOB_KEY};
use crate::degrade::DegradedOps;
use crate::error::{Result, StrideError};
use crate::models::{EngineDiagnostics, Goal, Identity, Integration, Task};
use crate::queue::MutationQueue;
use crate::remote::{AuthCollaborator, RemoteDataSource};
use crate::status::{DEFAULT_IDLE_DELAY, SyncStatusMachine};
use crate::store::OptimisticStateStore;

/// The sync engine: one explicit service object wiring the durable cache,
/// the optimistic store, the mutation queue, and the status machine around
/// constructor-injected remote collaborators. No globals; tests build as
/// many isolated instances as they want.
///
/// Lifecycle: `new` → `init` (hydrate from cache, then reconcile with the
/// remote) → mutations/refreshes → `teardown`.
#[derive(Clone)]
pub struct SyncEngine {
    cache: DurableCache,
    store: OptimisticStateStore,
    queue: MutationQueue,
    status: SyncStatusMachine,
    remote: Arc<dyn RemoteDataSource>,
    auth: Arc<dyn AuthCollaborator>,
    degraded: DegradedOps,
    hydrated: Arc<AtomicBool>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("hydrated", &self.hydrated())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthCollaborator>,
    ) -> Result<Self> {
        Self::with_idle_delay(root_dir, remote, auth, DEFAULT_IDLE_DELAY)
    }

    /// Same as `new` with a custom synced→idle window (tests shrink it).
    pub fn with_idle_delay(
        root_dir: impl Into<PathBuf>,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthCollaborator>,
        idle_delay: Duration,
    ) -> Result<Self> {
        let root = root_dir.into();
        fs::create_dir_all(&root)?;

        let cache = DurableCache::open(root.join(".stride_cache.sqlite3"));
        let degraded = DegradedOps::default();
        let store = OptimisticStateStore::new(cache.clone(), degraded.clone());
        let queue = MutationQueue::new(cache.clone(), degraded.clone());
        let status = SyncStatusMachine::new(store.sync_status_cell(), idle_delay);

        Ok(Self {
            cache,
            store,
            queue,
            status,
            remote,
            auth,
            degraded,
            hydrated: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Hydration bootstrap. Consults the auth collaborator once; when a
    /// user is signed in, loads the cached collections into memory, flips
    /// `hydrated`, and only then reconciles against the remote. Without a
    /// signed-in user the engine stays uninitialized.
    pub fn init(&self) -> Result<()> {
        self.hydrate_cached()?;
        self.refresh_all();
        Ok(())
    }

    /// The cache-only half of `init`: identity check and cache load,
    /// without touching the remote. Offline surfaces hydrate through this.
    pub fn hydrate_cached(&self) -> Result<()> {
        let Some(identity) = self.auth.current_user()? else {
            return Ok(());
        };

        match serde_json::to_string(&identity) {
            Ok(blob) => {
                if let Err(err) = self.cache.write_blob(IDENTITY_BLOB_KEY, &blob) {
                    self.degraded.record("engine.init.identity", &err);
                }
            }
            Err(err) => self.degraded.record("engine.init.identity", &err.into()),
        }

        self.store.load_from_cache();
        self.hydrated.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[must_use]
    pub fn hydrated(&self) -> bool {
        self.hydrated.load(Ordering::SeqCst)
    }

    /// Re-fetches all three collections concurrently. Each collection
    /// replaces local state independently as it resolves; any failure moves
    /// the status machine to `error`, success to `synced` then `idle`.
    /// A no-op before hydration: a replace must never land on state that
    /// was not loaded first.
    pub fn refresh_all(&self) {
        if !self.hydrated() {
            return;
        }

        self.status.begin_sync();
        let generation = self.store.generation();

        let outcomes: [Result<()>; 3] = thread::scope(|scope| {
            let tasks = scope.spawn(|| {
                self.remote
                    .fetch_tasks()
                    .map(|items| self.apply_remote_tasks(generation, items))
            });
            let goals = scope.spawn(|| {
                self.remote
                    .fetch_goals()
                    .map(|items| self.apply_remote_goals(generation, items))
            });
            let integrations = scope.spawn(|| {
                self.remote
                    .fetch_integrations()
                    .map(|items| self.apply_remote_integrations(generation, items))
            });
            [
                join_fetch(tasks.join()),
                join_fetch(goals.join()),
                join_fetch(integrations.join()),
            ]
        });

        if outcomes.iter().any(Result::is_err) {
            self.status.fail();
        } else {
            self.status.complete();
        }
    }

    /// Liveness guard for late-arriving results: the replace is dropped
    /// when the store generation moved (sign-out) since the fetch started.
    fn still_live(&self, generation: u64) -> bool {
        self.hydrated() && self.store.generation() == generation
    }

    fn apply_remote_tasks(&self, generation: u64, items: Vec<Task>) {
        if self.still_live(generation) {
            self.store.replace_tasks(items);
        }
    }

    fn apply_remote_goals(&self, generation: u64, items: Vec<Goal>) {
        if self.still_live(generation) {
            self.store.replace_goals(items);
        }
    }

    fn apply_remote_integrations(&self, generation: u64, items: Vec<Integration>) {
        if self.still_live(generation) {
            self.store.replace_integrations(items);
        }
    }

    /// Signed-in identity cached from the last successful `init`, readable
    /// without a network round trip.
    #[must_use]
    pub fn cached_identity(&self) -> Option<Identity> {
        let blob = self.cache.read_blob(IDENTITY_BLOB_KEY).ok().flatten()?;
        serde_json::from_str(&blob).ok()
    }

    /// Sign-out: empties the collections, purges their partitions and all
    /// quick-access blobs, and drops queued intents (they are scoped to
    /// the signed-out identity). The engine must be re-`init`ed afterwards.
    pub fn sign_out(&self) -> Result<()> {
        self.hydrated.store(false, Ordering::SeqCst);
        self.store.reset();
        self.queue.clear()?;
        Ok(())
    }

    pub fn teardown(&self) {
        self.status.teardown();
    }

    #[must_use]
    pub fn store(&self) -> &OptimisticStateStore {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    #[must_use]
    pub fn status(&self) -> &SyncStatusMachine {
        &self.status
    }

    #[must_use]
    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            hydrated: self.hydrated(),
            generation: self.store.generation(),
            sync_status: Some(self.store.sync_status()),
            pending_mutations: self.queue.len(),
            cache_available: self.cache.is_available(),
            degraded_ops: self.degraded.snapshot(),
        }
    }
}

fn join_fetch(joined: std::thread::Result<Result<()>>) -> Result<()> {
    match joined {
        Ok(outcome) => outcome,
        Err(_) => Err(StrideError::Internal("fetch worker panicked".to_string())),
    }
}

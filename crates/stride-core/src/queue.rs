use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::cache::{DurableCache, PENDING_MUTATIONS};
use crate::degrade::DegradedOps;
use crate::error::Result;
use crate::models::{MutationKind, PendingMutation};

/// Ordered, persisted queue of write intents awaiting remote confirmation.
///
/// Entries live in the cache's `pending_mutations` partition and are removed
/// only by `remove`/`clear`. While the cache backend is unavailable, appended
/// entries are held in a process-lifetime memory overlay: `list` stays
/// truthful for the running process, but those entries are lost if the
/// process exits before the backend comes back. Retry scheduling is the
/// external synchronizer's job (see `policy`); this component only stores
/// `retry_count` for that decision.
#[derive(Clone)]
pub struct MutationQueue {
    cache: DurableCache,
    overlay: Arc<Mutex<Vec<PendingMutation>>>,
    degraded: DegradedOps,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue").finish_non_exhaustive()
    }
}

fn mutation_id() -> String {
    // Millisecond prefix keeps ids roughly chronological; the v4 suffix
    // makes collisions within one millisecond a non-issue.
    format!(
        "{:013x}-{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

impl MutationQueue {
    #[must_use]
    pub fn new(cache: DurableCache, degraded: DegradedOps) -> Self {
        Self {
            cache,
            overlay: Arc::new(Mutex::new(Vec::new())),
            degraded,
        }
    }

    /// Appends a new intent and returns the stored record. Persistence is
    /// best-effort: a failed write lands in the memory overlay instead.
    pub fn add(&self, kind: MutationKind, payload: serde_json::Value) -> Result<PendingMutation> {
        let mutation = PendingMutation {
            id: mutation_id(),
            kind,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        };

        let value = serde_json::to_value(&mutation)?;
        if let Err(err) = self.cache.put(PENDING_MUTATIONS, &mutation.id, &value) {
            self.degraded.record("queue.add", &err);
            if let Ok(mut overlay) = self.overlay.lock() {
                overlay.push(mutation.clone());
            }
        }
        Ok(mutation)
    }

    /// All pending mutations in insertion order.
    pub fn list(&self) -> Result<Vec<PendingMutation>> {
        let mut entries = match self.cache.get_all(PENDING_MUTATIONS) {
            Ok(values) => {
                let mut entries = Vec::with_capacity(values.len());
                for value in values {
                    entries.push(serde_json::from_value::<PendingMutation>(value)?);
                }
                entries
            }
            Err(err) => {
                self.degraded.record("queue.list", &err);
                Vec::new()
            }
        };

        if let Ok(overlay) = self.overlay.lock() {
            for mutation in overlay.iter() {
                if !entries.iter().any(|e| e.id == mutation.id) {
                    entries.push(mutation.clone());
                }
            }
        }
        Ok(entries)
    }

    pub fn len(&self) -> u64 {
        self.list().map(|entries| entries.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        if let Err(err) = self.cache.delete(PENDING_MUTATIONS, id) {
            self.degraded.record("queue.remove", &err);
        }
        if let Ok(mut overlay) = self.overlay.lock() {
            overlay.retain(|m| m.id != id);
        }
        Ok(())
    }

    pub fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<()> {
        match self.cache.get(PENDING_MUTATIONS, id) {
            Ok(Some(value)) => {
                let mut mutation: PendingMutation = serde_json::from_value(value)?;
                mutation.retry_count = retry_count;
                let next = serde_json::to_value(&mutation)?;
                if let Err(err) = self.cache.put(PENDING_MUTATIONS, id, &next) {
                    self.degraded.record("queue.update_retry_count", &err);
                }
            }
            Ok(None) => {}
            Err(err) => self.degraded.record("queue.update_retry_count", &err),
        }

        if let Ok(mut overlay) = self.overlay.lock() {
            if let Some(mutation) = overlay.iter_mut().find(|m| m.id == id) {
                mutation.retry_count = retry_count;
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if let Err(err) = self.cache.clear(PENDING_MUTATIONS) {
            self.degraded.record("queue.clear", &err);
        }
        if let Ok(mut overlay) = self.overlay.lock() {
            overlay.clear();
        }
        Ok(())
    }
}

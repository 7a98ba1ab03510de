use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, StrideError};

/// Partition backing the pending-mutation queue; the entity partitions are
/// named by `EntityKind::partition`.
pub const PENDING_MUTATIONS: &str = "pending_mutations";

/// Quick-access blob key for the signed-in identity.
pub const IDENTITY_BLOB_KEY: &str = "snapshot:identity";

#[derive(Clone)]
enum Backend {
    Open(Arc<Mutex<Connection>>),
    Unavailable(String),
}

/// Partitioned on-device key-value store. Best-effort by contract: when the
/// backend cannot be opened every operation fails with
/// `StorageUnavailable`, which call sites swallow. Correctness never depends
/// on this store; the in-memory state is authoritative.
#[derive(Clone)]
pub struct DurableCache {
    backend: Backend,
}

impl std::fmt::Debug for DurableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCache")
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl DurableCache {
    /// Opens (or creates) the cache database. A backend that cannot be
    /// opened yields a degraded cache rather than an error.
    pub fn open(path: impl AsRef<Path>) -> Self {
        match Connection::open(path.as_ref()) {
            Ok(conn) => {
                let cache = Self {
                    backend: Backend::Open(Arc::new(Mutex::new(conn))),
                };
                match cache.init() {
                    Ok(()) => cache,
                    Err(err) => Self {
                        backend: Backend::Unavailable(err.to_string()),
                    },
                }
            }
            Err(err) => Self {
                backend: Backend::Unavailable(err.to_string()),
            },
        }
    }

    /// A cache whose backend is permanently absent. Used on platforms with
    /// no writable storage and by tests that force degraded operation.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            backend: Backend::Unavailable("backend disabled".to_string()),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self.backend, Backend::Open(_))
    }

    /// Idempotent schema migration; safe to call any number of times.
    pub fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS cache_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                partition TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(partition, id)
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_partition
            ON cache_entries(partition, seq);

            CREATE TABLE IF NOT EXISTS snapshot_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        match &self.backend {
            Backend::Open(conn) => conn
                .lock()
                .map_err(|_| StrideError::Internal("sqlite mutex poisoned".to_string())),
            Backend::Unavailable(reason) => {
                Err(StrideError::StorageUnavailable(reason.clone()))
            }
        }
    }

    /// All payloads of a partition in insertion order.
    pub fn get_all(&self, partition: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM cache_entries WHERE partition = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![partition], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for raw in rows {
            items.push(serde_json::from_str(&raw?)?);
        }
        Ok(items)
    }

    pub fn get(&self, partition: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT payload FROM cache_entries WHERE partition = ?1 AND id = ?2",
                params![partition, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Upserts by id. A replaced row keeps its original insertion position.
    pub fn put(&self, partition: &str, id: &str, payload: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cache_entries(partition, id, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(partition, id) DO UPDATE SET
              payload=excluded.payload,
              updated_at=excluded.updated_at
            "#,
            params![partition, id, payload.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Atomic batch upsert: either every item is persisted or none are.
    pub fn put_many(
        &self,
        partition: &str,
        items: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (id, payload) in items {
            tx.execute(
                r#"
                INSERT INTO cache_entries(partition, id, payload, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(partition, id) DO UPDATE SET
                  payload=excluded.payload,
                  updated_at=excluded.updated_at
                "#,
                params![partition, id, payload.to_string(), now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, partition: &str, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE partition = ?1 AND id = ?2",
            params![partition, id],
        )?;
        Ok(())
    }

    pub fn clear(&self, partition: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE partition = ?1",
            params![partition],
        )?;
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            DELETE FROM cache_entries;
            DELETE FROM snapshot_kv;
            "#,
        )?;
        Ok(())
    }

    /// Replaces a partition's full contents in one transaction.
    pub fn replace_partition(
        &self,
        partition: &str,
        items: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM cache_entries WHERE partition = ?1",
            params![partition],
        )?;
        let now = Utc::now().to_rfc3339();
        for (id, payload) in items {
            tx.execute(
                "INSERT INTO cache_entries(partition, id, payload, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![partition, id, payload.to_string(), now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_blob(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM snapshot_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn write_blob(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO snapshot_kv(key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_blob(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM snapshot_kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_cache(dir: &tempfile::TempDir) -> DurableCache {
        let cache = DurableCache::open(dir.path().join("cache.sqlite3"));
        assert!(cache.is_available());
        cache
    }

    #[test]
    fn init_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        cache.init().expect("first");
        cache.init().expect("second");
    }

    #[test]
    fn put_is_an_idempotent_upsert() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        let payload = serde_json::json!({"id": "t1", "title": "Write report"});

        cache.put("tasks", "t1", &payload).expect("put 1");
        cache.put("tasks", "t1", &payload).expect("put 2");

        let items = cache.get_all("tasks").expect("get_all");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0], payload);
    }

    #[test]
    fn upsert_preserves_insertion_order() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        cache
            .put("queue", "a", &serde_json::json!({"n": 1}))
            .expect("a");
        cache
            .put("queue", "b", &serde_json::json!({"n": 2}))
            .expect("b");
        cache
            .put("queue", "a", &serde_json::json!({"n": 3}))
            .expect("a again");

        let items = cache.get_all("queue").expect("get_all");
        assert_eq!(items[0]["n"], 3);
        assert_eq!(items[1]["n"], 2);
    }

    #[test]
    fn put_many_is_atomic_per_partition() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        let items = vec![
            ("a".to_string(), serde_json::json!({"id": "a"})),
            ("b".to_string(), serde_json::json!({"id": "b"})),
        ];
        cache.put_many("goals", &items).expect("put_many");
        assert_eq!(cache.get_all("goals").expect("get_all").len(), 2);
        assert!(cache.get_all("tasks").expect("other").is_empty());
    }

    #[test]
    fn delete_clear_and_clear_all() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        cache
            .put("tasks", "t1", &serde_json::json!({"id": "t1"}))
            .expect("put t");
        cache
            .put("goals", "g1", &serde_json::json!({"id": "g1"}))
            .expect("put g");
        cache.write_blob("snapshot:tasks", "[]").expect("blob");

        cache.delete("tasks", "t1").expect("delete");
        assert!(cache.get("tasks", "t1").expect("get").is_none());

        cache.clear("goals").expect("clear");
        assert!(cache.get_all("goals").expect("get_all").is_empty());

        cache.clear_all().expect("clear_all");
        assert!(cache.read_blob("snapshot:tasks").expect("blob read").is_none());
    }

    #[test]
    fn blobs_round_trip_and_remove() {
        let temp = tempdir().expect("tempdir");
        let cache = open_cache(&temp);
        cache.write_blob("snapshot:goals", "{\"g\":1}").expect("write");
        assert_eq!(
            cache.read_blob("snapshot:goals").expect("read").as_deref(),
            Some("{\"g\":1}")
        );
        cache.remove_blob("snapshot:goals").expect("remove");
        assert!(cache.read_blob("snapshot:goals").expect("read2").is_none());
    }

    #[test]
    fn unavailable_backend_fails_with_storage_unavailable() {
        let cache = DurableCache::unavailable();
        assert!(!cache.is_available());
        let err = cache
            .put("tasks", "t1", &serde_json::json!({}))
            .expect_err("must fail");
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        let err = cache.get_all("tasks").expect_err("reads fail too");
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
    }
}

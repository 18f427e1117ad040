//! Pending-event cache.
//!
//! Holds buffered records that could not be uploaded yet. Records are stored
//! as opaque bincode blobs in insertion order and loaded back first when the
//! next batch is built.

use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const EVENT_CACHE_DB_NAME: &str = "pending-events.db";

/// Default ceiling on the total size of cached records.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 10 * 1024 * 1024;

/// A cached record together with its row id.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord<T> {
    pub id: i64,
    pub record: T,
    pub cost: usize,
}

pub struct EventCache {
    path: PathBuf,
    max_bytes: u64,
    conn: Mutex<Connection>,
}

impl EventCache {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {}", e))?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| format!("Failed to open event cache: {}", e))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create pending_events table: {}", e))?;

        Ok(EventCache {
            path,
            max_bytes,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends records in order. Records that would push the cache past its
    /// size limit are dropped. Returns how many were stored.
    pub fn store<T: Serialize>(&self, records: &[T]) -> Result<usize, String> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let mut used: u64 = conn
            .query_row(
                "SELECT COALESCE(SUM(length(record)), 0) FROM pending_events",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(|e| format!("Failed to measure event cache: {}", e))?;

        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin cache transaction: {}", e))?;
        let mut stored = 0;
        {
            let mut insert = tx
                .prepare_cached("INSERT INTO pending_events (record) VALUES (?1)")
                .map_err(|e| format!("Failed to prepare cache insert: {}", e))?;
            for record in records {
                let blob = bincode::serialize(record)
                    .map_err(|e| format!("Failed to serialize cached record: {}", e))?;
                if used + blob.len() as u64 > self.max_bytes {
                    warn!(
                        "Event cache full ({} bytes); dropping {} record(s)",
                        used,
                        records.len() - stored
                    );
                    break;
                }
                insert
                    .execute(params![blob])
                    .map_err(|e| format!("Failed to insert cached record: {}", e))?;
                used += blob.len() as u64;
                stored += 1;
            }
        }
        tx.commit()
            .map_err(|e| format!("Failed to commit cache transaction: {}", e))?;

        info!("Flushed {} record(s) to the pending-event cache", stored);
        Ok(stored)
    }

    /// Loads records in insertion order until `max_bytes` would be exceeded.
    /// Corrupt rows are removed and skipped.
    pub fn load<T: DeserializeOwned>(
        &self,
        max_bytes: Option<usize>,
    ) -> Result<Vec<CachedRecord<T>>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, record FROM pending_events ORDER BY id")
            .map_err(|e| format!("Failed to prepare cache load: {}", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .map_err(|e| format!("Failed to load event cache: {}", e))?;

        let mut records = Vec::new();
        let mut corrupt = Vec::new();
        let mut total = 0usize;
        for row in rows {
            let (id, blob) = row.map_err(|e| format!("Failed to read cached record: {}", e))?;
            if let Some(limit) = max_bytes {
                if total + blob.len() > limit {
                    break;
                }
            }
            match bincode::deserialize::<T>(&blob) {
                Ok(record) => {
                    total += blob.len();
                    records.push(CachedRecord {
                        id,
                        record,
                        cost: blob.len(),
                    });
                }
                Err(e) => {
                    warn!("Discarding corrupt cached record {}: {}", id, e);
                    corrupt.push(id);
                }
            }
        }
        drop(stmt);

        for id in corrupt {
            conn.execute("DELETE FROM pending_events WHERE id = ?1", params![id])
                .map_err(|e| format!("Failed to remove corrupt record: {}", e))?;
        }
        Ok(records)
    }

    /// Removes records that were uploaded.
    pub fn remove(&self, ids: &[i64]) -> Result<(), String> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to begin cache transaction: {}", e))?;
        {
            let mut delete = tx
                .prepare_cached("DELETE FROM pending_events WHERE id = ?1")
                .map_err(|e| format!("Failed to prepare cache delete: {}", e))?;
            for id in ids {
                delete
                    .execute(params![id])
                    .map_err(|e| format!("Failed to remove cached record: {}", e))?;
            }
        }
        tx.commit()
            .map_err(|e| format!("Failed to commit cache removal: {}", e))
    }

    pub fn clear(&self) -> Result<(), String> {
        self.conn
            .lock()
            .execute("DELETE FROM pending_events", [])
            .map(|_| ())
            .map_err(|e| format!("Failed to clear event cache: {}", e))
    }

    pub fn len(&self) -> Result<usize, String> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM pending_events", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
            .map_err(|e| format!("Failed to count cached records: {}", e))
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        self.len().map(|n| n == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_remove() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = EventCache::open(
            tmp_dir.path().join(EVENT_CACHE_DB_NAME),
            DEFAULT_MAX_CACHE_BYTES,
        )
        .unwrap();

        let stored = cache
            .store(&["first".to_string(), "second".to_string()])
            .unwrap();
        assert_eq!(stored, 2);

        let loaded: Vec<CachedRecord<String>> = cache.load(None).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].record, "first");
        assert_eq!(loaded[1].record, "second");

        cache.remove(&[loaded[0].id]).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_size_limits() {
        let tmp_dir = tempfile::tempdir().unwrap();
        // Each u64 record is eight bytes once encoded.
        let cache = EventCache::open(tmp_dir.path().join(EVENT_CACHE_DB_NAME), 20).unwrap();

        assert_eq!(cache.store(&[1u64, 2, 3]).unwrap(), 2);

        let limited: Vec<CachedRecord<u64>> = cache.load(Some(8)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].record, 1);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join(EVENT_CACHE_DB_NAME);
        {
            let cache = EventCache::open(&path, DEFAULT_MAX_CACHE_BYTES).unwrap();
            cache.store(&[42u32]).unwrap();
        }
        let cache = EventCache::open(&path, DEFAULT_MAX_CACHE_BYTES).unwrap();
        let loaded: Vec<CachedRecord<u32>> = cache.load(None).unwrap();
        assert_eq!(loaded[0].record, 42);
    }
}

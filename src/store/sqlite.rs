//! SQLite-backed Durable Store
//!
//! Items live in `todos`. Queued mutations live in `sync_queue` as JSON
//! alongside the columns needed for ordering and retargeting; `seq` breaks
//! ties between records enqueued in the same instant.

use super::{fresh_attempt, DurableStore, StorageEstimate};
use crate::error::{Result, SyncError};
use crate::models::{Item, MutationRecord};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS todos (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_todos_created ON todos(created_at);

CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT UNIQUE NOT NULL,
    item_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_enqueued ON sync_queue(enqueued_at);
CREATE INDEX IF NOT EXISTS idx_queue_item ON sync_queue(item_id);

CREATE TABLE IF NOT EXISTS sync_dead_letter (
    id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    record TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    quota_bytes: Option<u64>,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened sqlite store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            quota_bytes: None,
        })
    }

    /// Non-persistent database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            quota_bytes: None,
        })
    }

    /// Soft quota reported by [`DurableStore::estimate`]
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        title: row.get(1)?,
        completed: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn records_from_json(rows: Vec<String>) -> Result<Vec<MutationRecord>> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(SyncError::from))
        .collect()
}

fn upsert_item(conn: &Connection, item: &Item) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO todos (id, title, completed, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            completed = excluded.completed,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![item.id, item.title, item.completed, item.created_at, item.updated_at],
    )
}

fn insert_record(conn: &Connection, record: &MutationRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO sync_queue (id, item_id, kind, enqueued_at, record)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.item_id(),
            record.kind.as_str(),
            record.enqueued_at,
            json
        ],
    )?;
    Ok(())
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<Item>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, completed, created_at, updated_at
             FROM todos ORDER BY created_at, id",
        )?;
        let items = stmt
            .query_map([], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    async fn get(&self, id: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                "SELECT id, title, completed, created_at, updated_at FROM todos WHERE id = ?1",
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    async fn put(&self, item: &Item) -> Result<()> {
        let conn = self.conn.lock();
        upsert_item(&conn, item)?;
        Ok(())
    }

    async fn add(&self, item: &Item) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO todos (id, title, completed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item.id, item.title, item.completed, item.created_at, item.updated_at],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(SyncError::AlreadyExists(item.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM todos WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn bulk_put(&self, items: &[Item]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for item in items {
            upsert_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn replace_all(&self, items: &[Item]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM todos", [])?;
        for item in items {
            upsert_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn enqueue(&self, record: &MutationRecord) -> Result<()> {
        let conn = self.conn.lock();
        insert_record(&conn, record)
    }

    async fn list_queue(&self) -> Result<Vec<MutationRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT record FROM sync_queue ORDER BY enqueued_at, seq")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        records_from_json(rows)
    }

    async fn remove_from_queue(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn clear_queue(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }

    async fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn update_queue_record(&self, record: &MutationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sync_queue SET item_id = ?2, record = ?3 WHERE id = ?1",
            params![record.id, record.item_id(), json],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("queued mutation {}", record.id)));
        }
        Ok(())
    }

    async fn retarget_queue(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT record FROM sync_queue WHERE item_id = ?1")?;
            let rows = stmt
                .query_map(params![old_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut changed = 0;
        for mut record in records_from_json(rows)? {
            if record.retarget(old_id, new_id) {
                let json = serde_json::to_string(&record)?;
                tx.execute(
                    "UPDATE sync_queue SET item_id = ?2, record = ?3 WHERE id = ?1",
                    params![record.id, new_id, json],
                )?;
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    async fn dead_letter(&self, record: &MutationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_dead_letter (id, item_id, kind, failed_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id, record.item_id(), record.kind.as_str(), Utc::now(), json],
        )?;
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![record.id])?;
        tx.commit()?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<MutationRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT record FROM sync_dead_letter ORDER BY failed_at, id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        records_from_json(rows)
    }

    async fn requeue_dead_letters(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT record FROM sync_dead_letter ORDER BY failed_at, id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let records = records_from_json(rows)?;
        for record in &records {
            insert_record(&tx, &fresh_attempt(record))?;
        }
        tx.execute("DELETE FROM sync_dead_letter", [])?;
        tx.commit()?;
        Ok(records.len())
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.lock();
        let writable = conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS health_probe (id INTEGER PRIMARY KEY, checked_at TEXT);
                 INSERT OR REPLACE INTO health_probe (id, checked_at) VALUES (1, datetime('now'));",
            )
            .is_ok();
        let intact = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map(|status| status == "ok")
            .unwrap_or(false);

        if !(writable && intact) {
            warn!(writable, intact, "storage health check failed");
        }
        writable && intact
    }

    async fn estimate(&self) -> Option<StorageEstimate> {
        let conn = self.conn.lock();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0)).ok()?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0)).ok()?;
        Some(StorageEstimate {
            usage_bytes: (page_count * page_size).max(0) as u64,
            quota_bytes: self.quota_bytes,
        })
    }
}

//! Iamages Lock - SQLite record store
//!
//! Each record is one row holding its JSON form, with a few columns pulled
//! out for listing. Conditional updates run inside an IMMEDIATE transaction,
//! so read-check-write on one image is a single unit across connections.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{RecordStore, RecordUpdate};
use crate::error::{LockError, LockResult};
use crate::model::{ImageId, ImageRecord};

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> LockResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> LockResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LockResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                owner TEXT,
                is_locked INTEGER NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_owner ON images(owner);
            CREATE INDEX IF NOT EXISTS idx_created ON images(created_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Identifiers newest first
    pub fn list_ids(&self) -> LockResult<Vec<ImageId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM images ORDER BY created_at DESC, id DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?.parse()?);
        }
        Ok(ids)
    }

    pub fn count(&self) -> LockResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn created_at(record: &ImageRecord) -> String {
    record
        .id
        .created_on()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn load(conn: &Connection, id: &ImageId) -> LockResult<ImageRecord> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record FROM images WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    let json = json.ok_or_else(|| LockError::NotFound(format!("image {id}")))?;
    Ok(serde_json::from_str(&json)?)
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, id: &ImageId) -> LockResult<ImageRecord> {
        load(&self.conn.lock(), id)
    }

    fn insert(&self, record: &ImageRecord) -> LockResult<()> {
        record.check_consistency()?;
        let json = serde_json::to_string(record)?;

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO images (id, owner, is_locked, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.owner,
                record.lock.is_locked(),
                json,
                created_at(record),
            ],
        )?;

        if inserted == 0 {
            return Err(LockError::Storage(format!("image {} already exists", record.id)));
        }
        Ok(())
    }

    fn update(&self, id: &ImageId, update: &RecordUpdate) -> LockResult<ImageRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = load(&tx, id)?;
        update.apply(&mut record)?;

        tx.execute(
            "UPDATE images SET is_locked = ?2, record = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                record.lock.is_locked(),
                serde_json::to_string(&record)?,
            ],
        )?;
        tx.commit()?;

        Ok(record)
    }

    fn delete(&self, id: &ImageId) -> LockResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM images WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

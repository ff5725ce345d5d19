//! SQLite-backed document store.
//!
//! Each document is one row keyed by path, with the payload stored as a
//! MessagePack blob. Change notifications are delivered through an
//! in-process [`WatchHub`], so subscribers see writes made through this
//! `SqliteStore` instance only; another process writing the same file is not
//! observed until the next subscribe.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{DocumentPath, DocumentStore, Subscription, WatchHub};
use crate::{CatalogError, Result};

/// Document store persisted in a SQLite database.
pub struct SqliteStore {
    db: Mutex<Connection>,
    hub: WatchHub,
}

impl SqliteStore {
    /// Open (or create) a store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        info!("[SqliteStore] Opening {}", db_path);
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            db: Mutex::new(conn),
            hub: WatchHub::new(),
        })
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> Result<u32> {
        let db = self.lock()?;
        let count: u32 = db.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }

    fn load(&self, path: &DocumentPath) -> Result<Option<Value>> {
        let db = self.lock()?;
        let blob: Option<Vec<u8>> = db
            .query_row(
                "SELECT payload FROM documents WHERE path = ?",
                params![path.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(bytes) => {
                let value: Value = rmp_serde::from_slice(&bytes).map_err(|e| {
                    CatalogError::InvalidDocument {
                        path: path.to_string(),
                        message: e.to_string(),
                    }
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn store(&self, path: &DocumentPath, payload: &Value) -> Result<()> {
        let blob = rmp_serde::to_vec(payload)?;
        let db = self.lock()?;
        db.execute(
            "INSERT OR REPLACE INTO documents (path, payload, updated_at) VALUES (?, ?, ?)",
            params![path.as_str(), blob, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| CatalogError::Persistence {
            message: format!("database lock poisoned: {}", e),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn read(&self, path: &DocumentPath) -> Result<Option<Value>> {
        self.load(path)
    }

    async fn write(&self, path: &DocumentPath, payload: Value) -> Result<()> {
        self.store(path, &payload)?;
        debug!("[SqliteStore] write {}", path);
        self.hub.publish(path, Some(payload));
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> Result<Subscription> {
        let current = self.load(path)?;
        let receiver = self.hub.subscribe(path, current.clone());
        // Channel may predate rows written by an earlier instance
        self.hub.publish_if_changed(path, current);
        Ok(Subscription::new(receiver))
    }
}

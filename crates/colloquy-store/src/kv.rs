use std::collections::HashMap;

use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::debug;

use crate::database::Database;
use crate::error::StoreError;

/// Synchronous key-value persistence of JSON documents. Each `set` replaces
/// the whole value for its key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// [`KvStore`] over the `kv` table.
#[derive(Clone)]
pub struct SqliteKv {
    db: Database,
}

impl SqliteKv {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        })?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, text, now],
            )?;
            Ok(())
        })?;
        debug!(key, bytes = text.len(), "kv set");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }
}

/// Process-local [`KvStore`] for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let _ = self.entries.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.entries.lock().remove(key);
        Ok(())
    }
}

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use quorum_models::store_schema::RECORDS_TABLE_DDL;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Key-value store for agent descriptors and ticker groups.
///
/// Values are stored as JSON under `(kind, key)`.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(RECORDS_TABLE_DDL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(RECORDS_TABLE_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("records mutex poisoned: {e}")))
    }

    /// Insert or replace a record.
    pub fn put<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO records (kind, key, value_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![kind, key, value_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT value_json FROM records WHERE kind = ?1 AND key = ?2")?;
        let value_json: String =
            match stmt.query_row(rusqlite::params![kind, key], |row| row.get(0)) {
                Ok(json) => json,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(StoreError::Sqlite(e)),
            };
        Ok(Some(serde_json::from_str(&value_json)?))
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, kind: &str, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM records WHERE kind = ?1 AND key = ?2",
            rusqlite::params![kind, key],
        )?;
        Ok(deleted > 0)
    }

    /// All records of one kind, ordered by key.
    pub fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT value_json FROM records WHERE kind = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map(rusqlite::params![kind], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

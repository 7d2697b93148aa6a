use chrono::Utc;
use quorum_models::store_schema::{CacheRow, CACHE_TABLE_DDL};
use rusqlite::{Connection, OpenFlags, Row};

use crate::error::StoreError;

/// SQLite accessor for the shared market-context cache.
///
/// External data pipelines write `cache_entries`; quorum reads them when building
/// agent context. The daemon also uses a read-write handle to purge expired rows.
pub struct SqliteCache {
    conn: Connection,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        key: row.get(0)?,
        category: row.get(1)?,
        value_json: row.get(2)?,
        source: row.get(3)?,
        symbol: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl SqliteCache {
    /// Open a read-write connection, creating the schema and enabling WAL so
    /// readers are not blocked by the pipeline's writes.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CACHE_TABLE_DDL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self { conn })
    }

    /// Open a read-only connection to a cache maintained by someone else.
    pub fn open_read_only(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Open an in-memory database with the schema created. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_TABLE_DDL)?;
        Ok(Self { conn })
    }

    /// Get a single entry by key. Returns None if not found or expired.
    pub fn get(&self, key: &str) -> Result<Option<CacheRow>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, category, value_json, source, symbol, created_at, expires_at, updated_at \
             FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
        )?;

        match stmt.query_row(rusqlite::params![key, now], map_row) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Get all non-expired entries for an instrument.
    pub fn get_by_symbol(&self, symbol: &str) -> Result<Vec<CacheRow>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, category, value_json, source, symbol, created_at, expires_at, updated_at \
             FROM cache_entries WHERE symbol = ?1 AND expires_at > ?2 ORDER BY key",
        )?;

        let rows = stmt
            .query_map(rusqlite::params![symbol, now], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or replace an entry. In production the data pipeline writes directly.
    pub fn insert(&self, row: &CacheRow) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries \
             (key, category, value_json, source, symbol, created_at, expires_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                row.key,
                row.category,
                row.value_json,
                row.source,
                row.symbol,
                row.created_at,
                row.expires_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Delete all expired entries. Returns the number of rows deleted.
    pub fn expire_stale(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        let deleted = self.conn.execute(
            "DELETE FROM cache_entries WHERE expires_at < ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count)
    }
}

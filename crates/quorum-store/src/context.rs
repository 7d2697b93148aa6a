use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quorum_models::MarketContext;
use tracing::debug;

use crate::error::StoreError;
use crate::memory::MemoryCache;
use crate::sqlite::SqliteCache;

/// Supplies the market context an agent needs for one instrument.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn get_context(&self, instrument_id: &str) -> Result<MarketContext, StoreError>;
}

/// Provider that always returns an empty snapshot. For deployments whose agents
/// fetch their own data.
pub struct EmptyContextProvider;

#[async_trait]
impl ContextProvider for EmptyContextProvider {
    async fn get_context(&self, instrument_id: &str) -> Result<MarketContext, StoreError> {
        Ok(MarketContext::empty(instrument_id))
    }
}

/// Read-through context provider: moka (hot) → SQLite (shared) → empty snapshot.
///
/// On a SQLite read the snapshot is promoted to moka, so concurrent tasks for the
/// same instrument share one read. SQLite access is synchronized via `Mutex`
/// since `rusqlite::Connection` is not `Sync`.
pub struct ContextReader {
    memory: MemoryCache,
    sqlite: Mutex<SqliteCache>,
}

impl ContextReader {
    pub fn new(sqlite: SqliteCache, max_capacity: u64, memory_ttl: Duration) -> Self {
        Self {
            memory: MemoryCache::new(max_capacity, memory_ttl),
            sqlite: Mutex::new(sqlite),
        }
    }

    /// Merge every live cache entry for an instrument into one JSON object.
    pub fn build_snapshot(&self, instrument_id: &str) -> Result<MarketContext, StoreError> {
        let rows = {
            let sqlite = self
                .sqlite
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("SQLite mutex poisoned: {e}")))?;
            sqlite.get_by_symbol(instrument_id)?
        };

        let mut map = serde_json::Map::new();
        for row in rows {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&row.value_json) {
                map.insert(row.key, value);
            }
        }
        Ok(MarketContext {
            instrument_id: instrument_id.to_string(),
            as_of: Utc::now(),
            data: serde_json::Value::Object(map),
        })
    }

    /// Drop the in-memory snapshot so the next read goes to SQLite.
    pub async fn invalidate(&self, instrument_id: &str) {
        self.memory.invalidate(instrument_id).await;
    }

    pub fn hot_cache_size(&self) -> u64 {
        self.memory.entry_count()
    }
}

#[async_trait]
impl ContextProvider for ContextReader {
    async fn get_context(&self, instrument_id: &str) -> Result<MarketContext, StoreError> {
        if let Some(context) = self.memory.get(instrument_id).await {
            return Ok(context);
        }

        let context = self.build_snapshot(instrument_id)?;
        debug!(
            instrument = %instrument_id,
            keys = context.data.as_object().map(|m| m.len()).unwrap_or(0),
            "Loaded market context from SQLite"
        );
        self.memory.insert(context.clone()).await;
        Ok(context)
    }
}

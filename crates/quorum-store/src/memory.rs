use moka::future::Cache;
use quorum_models::MarketContext;
use std::time::Duration;

/// In-memory hot cache of market contexts, keyed by instrument.
///
/// Entries are evicted after TTL so agents never see a snapshot older than
/// the configured window.
pub struct MemoryCache {
    inner: Cache<String, MarketContext>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, instrument_id: &str) -> Option<MarketContext> {
        self.inner.get(instrument_id).await
    }

    pub async fn insert(&self, context: MarketContext) {
        self.inner
            .insert(context.instrument_id.clone(), context)
            .await;
    }

    pub async fn invalidate(&self, instrument_id: &str) {
        self.inner.invalidate(instrument_id).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

use serde::{Deserialize, Serialize};

/// Categories for organizing market-context cache keys.
/// The data pipeline uses these when writing to the shared SQLite cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    MarketData,
    Indicator,
    Fundamental,
    News,
    Alternative,
}

/// Market context written by external data pipelines and read by quorum.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS cache_entries (
///     key         TEXT PRIMARY KEY,
///     category    TEXT NOT NULL,
///     value_json  TEXT NOT NULL,
///     source      TEXT NOT NULL,
///     symbol      TEXT,
///     created_at  TEXT NOT NULL,
///     expires_at  TEXT NOT NULL,
///     updated_at  TEXT NOT NULL
/// );
/// ```
pub const CACHE_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    category    TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    source      TEXT NOT NULL,
    symbol      TEXT,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_category ON cache_entries(category);
CREATE INDEX IF NOT EXISTS idx_cache_symbol ON cache_entries(symbol);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
";

/// Key-value records for agent descriptors and ticker groups.
pub const RECORDS_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS records (
    kind        TEXT NOT NULL,
    key         TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (kind, key)
);
";

/// Append-only log of signals and aggregated signals, for audit and replay.
pub const JOURNAL_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS journal (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_kind    TEXT NOT NULL,
    instrument_id TEXT NOT NULL,
    request_id    TEXT,
    value_json    TEXT NOT NULL,
    recorded_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_journal_instrument ON journal(instrument_id, seq);
";

/// Record kinds stored in the `records` table.
pub mod record_kinds {
    pub const AGENT: &str = "agent";
    pub const GROUP: &str = "group";
}

/// Key pattern conventions for the market-context cache.
///
/// - Bars: `bars:{symbol}:{timeframe}` (e.g., `bars:AAPL:1d`)
/// - Quotes: `quote:{symbol}`
/// - Indicators: `indicator:{name}:{symbol}` (e.g., `indicator:rsi_14:AAPL`)
/// - Fundamentals: `fundamental:{metric}:{symbol}` (e.g., `fundamental:pe:AAPL`)
/// - News: `news:{source}:{symbol}`
pub mod key_patterns {
    pub fn bars(symbol: &str, timeframe: &str) -> String {
        format!("bars:{symbol}:{timeframe}")
    }

    pub fn quote(symbol: &str) -> String {
        format!("quote:{symbol}")
    }

    pub fn indicator(name: &str, symbol: &str) -> String {
        format!("indicator:{name}:{symbol}")
    }

    pub fn fundamental(metric: &str, symbol: &str) -> String {
        format!("fundamental:{metric}:{symbol}")
    }

    pub fn news(source: &str, symbol: &str) -> String {
        format!("news:{source}:{symbol}")
    }
}

/// A raw market-context row as read from SQLite.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub key: String,
    pub category: String,
    pub value_json: String,
    pub source: String,
    pub symbol: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub updated_at: String,
}

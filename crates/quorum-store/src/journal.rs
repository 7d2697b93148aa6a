use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use quorum_models::store_schema::JOURNAL_TABLE_DDL;
use quorum_models::{AggregatedSignal, Signal};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// One journaled item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum JournalEntry {
    Signal(Signal),
    Aggregate(AggregatedSignal),
}

impl JournalEntry {
    fn kind(&self) -> &'static str {
        match self {
            JournalEntry::Signal(_) => "signal",
            JournalEntry::Aggregate(_) => "aggregate",
        }
    }

    fn instrument_id(&self) -> &str {
        match self {
            JournalEntry::Signal(s) => &s.instrument_id,
            JournalEntry::Aggregate(a) => &a.instrument_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JournalRecord {
    pub seq: i64,
    pub request_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
    pub entry: JournalEntry,
}

/// Append-only log of signals and aggregate versions.
///
/// Nothing is ever updated or deleted; superseded aggregates stay readable for
/// audit, and signals can be replayed to rebuild a window after a restart.
pub struct SignalJournal {
    conn: Mutex<Connection>,
}

impl SignalJournal {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(JOURNAL_TABLE_DDL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(JOURNAL_TABLE_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("journal mutex poisoned: {e}")))
    }

    /// Append an entry and return its sequence number.
    pub fn append(&self, request_id: Option<Uuid>, entry: &JournalEntry) -> Result<i64, StoreError> {
        let value_json = serde_json::to_string(entry)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO journal (entry_kind, instrument_id, request_id, value_json, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.kind(),
                entry.instrument_id(),
                request_id.map(|id| id.to_string()),
                value_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn append_signal(&self, request_id: Option<Uuid>, signal: &Signal) -> Result<i64, StoreError> {
        self.append(request_id, &JournalEntry::Signal(signal.clone()))
    }

    pub fn append_aggregate(
        &self,
        request_id: Option<Uuid>,
        aggregate: &AggregatedSignal,
    ) -> Result<i64, StoreError> {
        self.append(request_id, &JournalEntry::Aggregate(aggregate.clone()))
    }

    /// Every entry for an instrument, oldest first.
    pub fn replay(&self, instrument_id: &str) -> Result<Vec<JournalRecord>, StoreError> {
        self.query(
            "SELECT seq, request_id, recorded_at, value_json FROM journal \
             WHERE instrument_id = ?1 ORDER BY seq",
            rusqlite::params![instrument_id],
        )
    }

    /// Every entry with a sequence number greater than `seq`, oldest first.
    pub fn since(&self, seq: i64) -> Result<Vec<JournalRecord>, StoreError> {
        self.query(
            "SELECT seq, request_id, recorded_at, value_json FROM journal \
             WHERE seq > ?1 ORDER BY seq",
            rusqlite::params![seq],
        )
    }

    /// Signals for an instrument that are still within their ttl.
    pub fn live_signals(
        &self,
        instrument_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Signal>, StoreError> {
        Ok(self
            .replay(instrument_id)?
            .into_iter()
            .filter_map(|record| match record.entry {
                JournalEntry::Signal(signal) if signal.is_live(now) => Some(signal),
                _ => None,
            })
            .collect())
    }

    pub fn latest_aggregate(
        &self,
        instrument_id: &str,
    ) -> Result<Option<AggregatedSignal>, StoreError> {
        Ok(self
            .replay(instrument_id)?
            .into_iter()
            .rev()
            .find_map(|record| match record.entry {
                JournalEntry::Aggregate(aggregate) => Some(aggregate),
                _ => None,
            }))
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<JournalRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let raw = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(seq, request_id, recorded_at, value_json)| {
                let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StoreError::Unavailable(format!("bad journal timestamp: {e}")))?;
                Ok(JournalRecord {
                    seq,
                    request_id: request_id.and_then(|id| Uuid::parse_str(&id).ok()),
                    recorded_at,
                    entry: serde_json::from_str(&value_json)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use quorum_models::{AggregationPhase, Direction};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn signal(instrument: &str, agent: &str, ttl_seconds: u64, age_seconds: i64) -> Signal {
        Signal {
            instrument_id: instrument.to_string(),
            agent_id: agent.to_string(),
            direction: Direction::Buy,
            confidence: dec!(0.7),
            rationale: "test".to_string(),
            produced_at: Utc::now() - Duration::seconds(age_seconds),
            ttl_seconds,
        }
    }

    fn aggregate(instrument: &str, version: u32) -> AggregatedSignal {
        AggregatedSignal {
            instrument_id: instrument.to_string(),
            version,
            consensus_direction: Some(Direction::Buy),
            consensus_confidence: dec!(1),
            completeness: Decimal::ONE,
            phase: AggregationPhase::Finalized,
            contributing_signals: vec![],
            conflict_flags: vec![],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn replay_is_per_instrument_and_ordered() {
        let journal = SignalJournal::open_in_memory().unwrap();
        let request_id = Uuid::new_v4();
        journal
            .append_signal(Some(request_id), &signal("AAPL", "tech", 60, 0))
            .unwrap();
        journal
            .append_signal(Some(request_id), &signal("MSFT", "tech", 60, 0))
            .unwrap();
        journal
            .append_aggregate(Some(request_id), &aggregate("AAPL", 1))
            .unwrap();

        let records = journal.replay("AAPL").unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].seq < records[1].seq);
        assert!(matches!(records[0].entry, JournalEntry::Signal(_)));
        assert!(matches!(records[1].entry, JournalEntry::Aggregate(_)));
        assert_eq!(records[0].request_id, Some(request_id));
    }

    #[test]
    fn superseded_aggregates_are_retained() {
        let journal = SignalJournal::open_in_memory().unwrap();
        journal.append_aggregate(None, &aggregate("AAPL", 1)).unwrap();
        journal.append_aggregate(None, &aggregate("AAPL", 2)).unwrap();

        assert_eq!(journal.replay("AAPL").unwrap().len(), 2);
        assert_eq!(journal.latest_aggregate("AAPL").unwrap().unwrap().version, 2);
    }

    #[test]
    fn live_signals_skip_expired() {
        let journal = SignalJournal::open_in_memory().unwrap();
        journal
            .append_signal(None, &signal("AAPL", "fresh", 60, 0))
            .unwrap();
        journal
            .append_signal(None, &signal("AAPL", "stale", 60, 120))
            .unwrap();

        let live = journal.live_signals("AAPL", Utc::now()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].agent_id, "fresh");
    }

    #[test]
    fn since_returns_tail() {
        let journal = SignalJournal::open_in_memory().unwrap();
        let first = journal
            .append_signal(None, &signal("AAPL", "a", 60, 0))
            .unwrap();
        journal
            .append_signal(None, &signal("MSFT", "b", 60, 0))
            .unwrap();

        let tail = journal.since(first).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(matches!(&tail[0].entry, JournalEntry::Signal(s) if s.instrument_id == "MSFT"));
    }
}

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::task::FailureKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Buy, Direction::Sell, Direction::Hold];

    /// Tie-break rank when two directions score identically. Lower wins,
    /// so an exact tie settles on the more conservative call.
    pub fn tie_rank(self) -> u8 {
        match self {
            Direction::Hold => 0,
            Direction::Sell => 1,
            Direction::Buy => 2,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
            Direction::Hold => "hold",
        };
        f.write_str(s)
    }
}

/// One agent's directional call for one instrument. Never mutated after creation;
/// a correction is a new signal with a later `produced_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub instrument_id: String,
    pub agent_id: String,
    pub direction: Direction,
    /// 0.0 to 1.0
    pub confidence: Decimal,
    pub rationale: String,
    pub produced_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Identity used to deduplicate repeated deliveries of the same signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub instrument_id: String,
    pub agent_id: String,
    pub produced_at: DateTime<Utc>,
}

impl Signal {
    pub fn key(&self) -> SignalKey {
        SignalKey {
            instrument_id: self.instrument_id.clone(),
            agent_id: self.agent_id.clone(),
            produced_at: self.produced_at,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.produced_at + Duration::seconds(self.ttl_seconds as i64)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }
}

/// How a required slot of the aggregation window was (or was not) filled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContributionOutcome {
    Responded,
    Pending,
    Missing(FailureKind),
}

/// One entry of an aggregated signal's contributor list. Missing agents are
/// listed with `signal: None` so completeness is visible to consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    pub capability: String,
    pub agent_id: Option<String>,
    pub outcome: ContributionOutcome,
    /// Static weight applied to this agent's vote.
    pub weight: Decimal,
    pub signal: Option<Signal>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictFlag {
    /// Top two directions scored within the configured margin of each other.
    LowMarginConsensus,
    /// No live signal was available when the aggregate was computed.
    NoData,
    /// At least one required agent failed, timed out or was cancelled.
    MissingAgents,
    /// At least one responded signal had outlived its ttl and was excluded.
    StaleSignals,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationPhase {
    #[default]
    Awaiting,
    PartiallyAggregated,
    Finalized,
}

/// Consensus for one instrument at `computed_at`. Each recomputation produces a
/// new version; earlier versions are kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedSignal {
    pub instrument_id: String,
    pub version: u32,
    /// `None` when no live signal was available.
    pub consensus_direction: Option<Direction>,
    pub consensus_confidence: Decimal,
    /// Responded agents over required agents.
    pub completeness: Decimal,
    pub phase: AggregationPhase,
    pub contributing_signals: Vec<Contribution>,
    pub conflict_flags: Vec<ConflictFlag>,
    pub computed_at: DateTime<Utc>,
}

impl AggregatedSignal {
    pub fn has_flag(&self, flag: ConflictFlag) -> bool {
        self.conflict_flags.contains(&flag)
    }
}

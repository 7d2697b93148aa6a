use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::signal::{Direction, Signal};

/// Market context for one instrument, supplied by the data provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub instrument_id: String,
    pub as_of: DateTime<Utc>,
    /// Cache key -> value snapshot (bars, quotes, indicators, news...).
    pub data: serde_json::Value,
}

impl MarketContext {
    pub fn empty(instrument_id: &str) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            as_of: Utc::now(),
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Input handed to an agent unit for one invocation (serialized as JSON for
/// out-of-process agents).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInput {
    pub instrument_id: String,
    /// The capability this invocation is serving.
    pub capability: String,
    pub as_of: DateTime<Utc>,
    pub context: MarketContext,
    /// Signals from completed prerequisite tasks of the same instrument.
    #[serde(default)]
    pub upstream: Vec<Signal>,
}

/// What an agent returns. The scheduler stamps it into a [`Signal`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentVerdict {
    pub direction: Direction,
    /// 0.0 to 1.0 confidence in `direction`.
    pub confidence: Decimal,
    pub rationale: String,
}

impl AgentVerdict {
    pub fn new(direction: Direction, confidence: Decimal, rationale: &str) -> Self {
        Self {
            direction,
            confidence,
            rationale: rationale.to_string(),
        }
    }

    pub fn confidence_in_range(&self) -> bool {
        self.confidence >= Decimal::ZERO && self.confidence <= Decimal::ONE
    }
}

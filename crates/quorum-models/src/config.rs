use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::agent::LatencyClass;
use crate::group::TickerGroup;

/// Top-level configuration for quorum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QuorumConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub groups: Vec<TickerGroup>,
}

/// Configuration for the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// SQLite file holding records, the signal journal and the shared context cache.
    pub sqlite_path: String,
    /// Maximum number of market contexts kept in the in-memory moka cache.
    pub memory_max_capacity: u64,
    /// How long a market context stays in memory, in seconds.
    pub memory_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/quorum.db".to_string(),
            memory_max_capacity: 10_000,
            memory_ttl_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of agent invocations allowed to run at once.
    pub worker_pool_size: usize,
    /// Latency budget for `fast` agents, in milliseconds.
    pub fast_deadline_ms: u64,
    /// Latency budget for `slow` agents, in milliseconds.
    pub slow_deadline_ms: u64,
    /// Dispatch attempts per task, across candidate agents.
    pub max_attempts: u32,
    /// Overall deadline for one request, after which aggregation is force-finalized.
    pub request_deadline_seconds: u64,
}

impl SchedulerConfig {
    pub fn budget_ms(&self, class: LatencyClass) -> u64 {
        match class {
            LatencyClass::Fast => self.fast_deadline_ms,
            LatencyClass::Slow => self.slow_deadline_ms,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            fast_deadline_ms: 5_000,
            slow_deadline_ms: 45_000,
            max_attempts: 2,
            request_deadline_seconds: 120,
        }
    }
}

/// How an individual signal's vote is scored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightingScheme {
    /// `confidence × weight`
    #[default]
    ConfidenceWeighted,
    /// `weight` only; confidence is ignored.
    MajorityVote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    pub weighting: WeightingScheme,
    /// Flag a consensus whose lead over the runner-up is below this fraction
    /// of the leading score.
    pub conflict_threshold: Decimal,
    /// Emit a partial aggregate for every instrument once this long has passed
    /// since submission, even if nothing arrived.
    pub aggregation_deadline_ms: u64,
    /// ttl stamped on signals produced by the scheduler.
    pub signal_ttl_seconds: u64,
    /// Weight for agents without an entry in `agent_weights`.
    pub default_weight: Decimal,
    /// Static per-agent weights, keyed by agent id.
    pub agent_weights: HashMap<String, Decimal>,
}

impl AggregatorConfig {
    pub fn weight_for(&self, agent_id: &str) -> Decimal {
        self.agent_weights
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            weighting: WeightingScheme::default(),
            conflict_threshold: Decimal::new(10, 2),
            aggregation_deadline_ms: 10_000,
            signal_ttl_seconds: 3_600,
            default_weight: Decimal::ONE,
            agent_weights: HashMap::new(),
        }
    }
}

/// Configuration for the bundled LLM-backed agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Default model for agents without an override.
    pub default_model: String,
    /// Hard cap on one CLI invocation, in seconds. The scheduler's latency
    /// budget usually ends the call first.
    pub timeout_seconds: u64,
    pub units: Vec<AgentUnitConfig>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-3-5-haiku-latest".to_string(),
            timeout_seconds: 60,
            units: vec![
                AgentUnitConfig::new("technical", "technical", LatencyClass::Fast),
                AgentUnitConfig::new("fundamental", "fundamental", LatencyClass::Slow),
                AgentUnitConfig::new("sentiment", "sentiment", LatencyClass::Fast),
                AgentUnitConfig::new("alternative", "alternative", LatencyClass::Slow),
            ],
        }
    }
}

impl AgentsConfig {
    /// Every capability offered by an enabled unit, sorted and deduplicated.
    pub fn enabled_capabilities(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .units
            .iter()
            .filter(|u| u.enabled)
            .flat_map(|u| u.capabilities.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Configuration for a single agent unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentUnitConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub latency_class: LatencyClass,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: Decimal,
    #[serde(default = "default_version")]
    pub version: String,
    /// Override model for this agent. Falls back to `AgentsConfig::default_model`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AgentUnitConfig {
    fn new(id: &str, capability: &str, latency_class: LatencyClass) -> Self {
        Self {
            id: id.to_string(),
            capabilities: vec![capability.to_string()],
            latency_class,
            cost_weight: default_cost_weight(),
            version: default_version(),
            model: None,
            enabled: true,
        }
    }
}

fn default_cost_weight() -> Decimal {
    Decimal::ONE
}
fn default_version() -> String {
    "1".to_string()
}
fn default_true() -> bool {
    true
}

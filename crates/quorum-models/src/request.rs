use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group::PriorityTier;
use crate::signal::AggregatedSignal;
use crate::task::TaskReport;

/// Matches every other requested capability in a [`DependencyEdge`].
pub const ALL_CAPABILITIES: &str = "*";

/// A caller-declared dependency between two capabilities.
///
/// Applies to every instrument of the group unless `instrument_id` is set.
/// `requires_instrument_id` exists so callers can express (and get rejected for)
/// cross-instrument edges; when set it must equal the dependent's instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyEdge {
    pub capability: String,
    /// Prerequisite capability, or `"*"` for all other requested capabilities.
    pub requires: String,
    #[serde(default)]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub requires_instrument_id: Option<String>,
}

impl DependencyEdge {
    pub fn new(capability: &str, requires: &str) -> Self {
        Self {
            capability: capability.to_string(),
            requires: requires.to_string(),
            instrument_id: None,
            requires_instrument_id: None,
        }
    }
}

/// An analysis request for one ticker group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub group_id: String,
    pub capabilities: Vec<String>,
    /// Overrides the group's tier for this request.
    #[serde(default)]
    pub priority_tier: Option<PriorityTier>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

impl AnalysisRequest {
    pub fn new(group_id: &str, capabilities: &[&str]) -> Self {
        Self {
            group_id: group_id.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            priority_tier: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, edge: DependencyEdge) -> Self {
        self.dependencies.push(edge);
        self
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.priority_tier = Some(tier);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Running,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, RequestStatus::Running)
    }
}

/// What a caller polling a request gets back. Always present once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub request_id: Uuid,
    pub group_id: String,
    pub status: RequestStatus,
    /// Responded agents over requested agents across all instruments.
    pub completeness: Decimal,
    /// Latest version per instrument, in group order.
    pub aggregated_signals: Vec<AggregatedSignal>,
    /// Every version emitted, oldest first.
    pub history: Vec<AggregatedSignal>,
    pub tasks: Vec<TaskReport>,
}

impl AnalysisResult {
    pub fn signal_for(&self, instrument_id: &str) -> Option<&AggregatedSignal> {
        self.aggregated_signals
            .iter()
            .find(|s| s.instrument_id == instrument_id)
    }
}

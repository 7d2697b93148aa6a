use serde::{Deserialize, Serialize};

/// Scheduling tier of a ticker group. Ordered from most to least urgent.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

/// What a group was built from. Informational only; scheduling ignores it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Portfolio,
    Sector,
    #[default]
    Watchlist,
    Correlation,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SchedulingPolicy {
    /// Hard cap on concurrently running tasks for this group.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Overall deadline for a request on this group. Falls back to
    /// `SchedulerConfig::request_deadline_seconds`.
    #[serde(default)]
    pub request_deadline_seconds: Option<u64>,
}

/// A named set of instruments analyzed and prioritized together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickerGroup {
    pub id: String,
    #[serde(default)]
    pub kind: GroupKind,
    pub instrument_ids: Vec<String>,
    #[serde(default)]
    pub priority_tier: PriorityTier,
    #[serde(default)]
    pub scheduling_policy: SchedulingPolicy,
}

impl TickerGroup {
    pub fn new(id: &str, instruments: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            kind: GroupKind::default(),
            instrument_ids: instruments.iter().map(|s| s.to_string()).collect(),
            priority_tier: PriorityTier::default(),
            scheduling_policy: SchedulingPolicy::default(),
        }
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.priority_tier = tier;
        self
    }

    pub fn with_kind(mut self, kind: GroupKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling_policy = policy;
        self
    }
}

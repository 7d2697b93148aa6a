pub mod agent;
pub mod agent_message;
pub mod config;
pub mod group;
pub mod request;
pub mod signal;
pub mod store_schema;
pub mod task;

pub use agent::{AgentDescriptor, HealthStatus, LatencyClass};
pub use agent_message::{AgentInput, AgentVerdict, MarketContext};
pub use config::{
    AgentUnitConfig, AgentsConfig, AggregatorConfig, QuorumConfig, SchedulerConfig, StoreConfig,
    WeightingScheme,
};
pub use group::{GroupKind, PriorityTier, SchedulingPolicy, TickerGroup};
pub use request::{
    AnalysisRequest, AnalysisResult, DependencyEdge, RequestStatus, ALL_CAPABILITIES,
};
pub use signal::{
    AggregatedSignal, AggregationPhase, ConflictFlag, Contribution, ContributionOutcome,
    Direction, Signal, SignalKey,
};
pub use store_schema::{CacheCategory, CacheRow};
pub use task::{FailureKind, Task, TaskReport, TaskState};

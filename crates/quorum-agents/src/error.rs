use thiserror::Error;
use uuid::Uuid;

/// Errors raised while invoking a single agent unit.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Claude CLI error: {0}")]
    Cli(String),

    #[error("Agent response parse error: {0}")]
    Parse(String),

    #[error("Agent timed out after {0} ms")]
    Timeout(u64),

    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Context error: {0}")]
    Context(#[from] quorum_store::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a request's task graph is rejected before any dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("request names no capabilities")]
    NoCapabilities,

    #[error("capability requested more than once: {0}")]
    DuplicateCapability(String),

    #[error("dependency references a capability that was not requested: {0}")]
    UnknownCapability(String),

    #[error("dependency references an instrument outside the group: {0}")]
    UnknownInstrument(String),

    #[error(
        "dependency {capability}@{instrument} -> {requires}@{requires_instrument} crosses instruments"
    )]
    CrossInstrument {
        capability: String,
        instrument: String,
        requires: String,
        requires_instrument: String,
    },

    #[error("dependency cycle among capabilities: {0:?}")]
    Cycle(Vec<String>),
}

/// Errors surfaced by the registry, group manager and orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("ticker group already exists: {0}")]
    DuplicateGroup(String),

    #[error("ticker group not found: {0}")]
    GroupNotFound(String),

    #[error("invalid ticker group: {0}")]
    InvalidGroup(String),

    #[error("invalid task graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error("request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("scheduler is not running")]
    SchedulerStopped,

    #[error("Store error: {0}")]
    Store(#[from] quorum_store::StoreError),
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// Why a task (or an aggregation slot) produced no signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// No healthy or degraded agent serves the capability.
    CapabilityUnavailable,
    /// The agent did not answer within its latency budget.
    TaskTimeout,
    /// The agent returned an error or its worker panicked.
    AgentCrash,
    /// The request was cancelled before the agent answered.
    Cancelled,
    /// The overall request deadline passed before the agent answered.
    AggregationIncomplete,
    /// The agent's signal outlived its ttl.
    Expired,
}

impl FailureKind {
    pub fn task_state(self) -> TaskState {
        match self {
            FailureKind::TaskTimeout => TaskState::TimedOut,
            FailureKind::Cancelled => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }
}

/// One unit of scheduled work: one capability for one instrument.
///
/// Owned by the scheduler's coordination loop until it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub request_id: Uuid,
    pub group_id: String,
    pub instrument_id: String,
    pub capability: String,
    /// Agent currently assigned. Set at dispatch; `None` before the first dispatch
    /// or when no candidate could be resolved.
    pub agent_id: Option<String>,
    /// Agents able to serve the capability, cheapest first.
    pub candidate_agents: Vec<String>,
    /// Number of dispatch attempts made so far.
    pub attempt: u32,
    /// Higher runs first within a priority tier.
    pub priority: u8,
    /// Prerequisite tasks. Always for the same instrument.
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Set when the task is dispatched, from the agent's latency class.
    pub deadline: Option<DateTime<Utc>>,
    pub state: TaskState,
}

/// Terminal summary of a task, exposed with request results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub instrument_id: String,
    pub capability: String,
    pub agent_id: Option<String>,
    pub state: TaskState,
    pub failure: Option<FailureKind>,
    pub reason: Option<String>,
    pub attempts: u32,
    /// Time spent queued before the final dispatch.
    pub wait_ms: u64,
    /// Time spent running on the final attempt.
    pub elapsed_ms: u64,
}

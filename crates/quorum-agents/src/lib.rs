pub mod aggregator;
pub mod bus;
pub mod claude_cli;
pub mod error;
pub mod groups;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod registry;
pub mod scheduler;
pub mod unit;

pub mod test_support;

pub use aggregator::{aggregate, SignalAggregator};
pub use bus::{Envelope, EventBus, Subscription};
pub use error::{AgentError, GraphError, OrchestratorError};
pub use groups::TickerGroupManager;
pub use orchestrator::Orchestrator;
pub use registry::{AgentRegistry, HealthEvent};
pub use scheduler::{build_task_graph, TaskEvent, TaskGraph, TaskOutcome};
pub use unit::{AgentUnit, ClaudeAgent};

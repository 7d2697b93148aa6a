use quorum_agents::OrchestratorError;
use quorum_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

//! Quorum - multi-agent signal orchestration
//!
//! Fans analysis requests for ticker groups out to independent agent units,
//! schedules them fairly over a bounded worker pool and aggregates their
//! directional signals into a per-instrument consensus.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use quorum::models::{AnalysisRequest, QuorumConfig, TickerGroup};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = QuorumConfig::default();
//! let orchestrator = quorum::build_orchestrator(&config)?;
//! orchestrator.groups().upsert(TickerGroup::new("megacap", &["AAPL", "MSFT"]))?;
//! let result = quorum::analyze(
//!     &orchestrator,
//!     AnalysisRequest::new("megacap", &["technical", "fundamental"]),
//! )
//! .await?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub use quorum_agents as agents;
pub use quorum_models as models;
pub use quorum_store as store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quorum_agents::claude_cli::ClaudeCliConfig;
use quorum_agents::{AgentRegistry, ClaudeAgent, Orchestrator, OrchestratorError, TickerGroupManager};
use quorum_models::{
    AgentDescriptor, AnalysisRequest, AnalysisResult, HealthStatus, QuorumConfig,
};
use quorum_store::{ContextReader, RecordStore, SignalJournal, SqliteCache};
use tracing::info;

/// Read and parse a TOML configuration file.
pub fn load_config(path: &str) -> Result<QuorumConfig, anyhow::Error> {
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config: {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("Failed to parse config: {path}"))
}

/// Register one `ClaudeAgent` per configured unit. Disabled units are
/// registered `Disabled`, so they are never dispatched. Re-enabling a unit in
/// the configuration brings it back on the next build.
pub fn register_agents(
    registry: &AgentRegistry,
    config: &QuorumConfig,
) -> Result<(), OrchestratorError> {
    for unit in &config.agents.units {
        let descriptor = AgentDescriptor {
            id: unit.id.clone(),
            capability_tags: unit.capabilities.clone(),
            latency_class: unit.latency_class,
            cost_weight: unit.cost_weight,
            version: unit.version.clone(),
            health: if unit.enabled {
                HealthStatus::Healthy
            } else {
                HealthStatus::Disabled
            },
        };
        let cli_config = ClaudeCliConfig {
            model: unit
                .model
                .clone()
                .unwrap_or_else(|| config.agents.default_model.clone()),
            timeout: Duration::from_secs(config.agents.timeout_seconds),
            ..ClaudeCliConfig::default()
        };
        registry.register(descriptor, Arc::new(ClaudeAgent::new(unit.id.clone(), cli_config)))?;
    }
    Ok(())
}

/// Build an Orchestrator from configuration.
///
/// Records, the signal journal and the market-context cache all live in the
/// configured SQLite file. Must be called inside a tokio runtime.
pub fn build_orchestrator(config: &QuorumConfig) -> Result<Orchestrator, anyhow::Error> {
    let path = &config.store.sqlite_path;
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let records = Arc::new(RecordStore::open(path).context("Failed to open record store")?);
    let journal = Arc::new(SignalJournal::open(path).context("Failed to open signal journal")?);
    let context = Arc::new(ContextReader::new(
        SqliteCache::open(path).context("Failed to open context cache")?,
        config.store.memory_max_capacity,
        Duration::from_secs(config.store.memory_ttl_seconds),
    ));

    let registry = Arc::new(AgentRegistry::new().with_store(Arc::clone(&records)));
    register_agents(&registry, config)?;

    let groups = Arc::new(TickerGroupManager::new().with_store(records));
    let restored = groups.load()?;
    for group in &config.groups {
        groups.upsert(group.clone())?;
    }
    info!(
        path = %path,
        agents = registry.len(),
        groups = groups.list().len(),
        restored,
        "Orchestrator built"
    );

    Ok(Orchestrator::new(config, registry, groups, context).with_journal(journal))
}

/// Submit a request and wait for it to finish.
pub async fn analyze(
    orchestrator: &Orchestrator,
    request: AnalysisRequest,
) -> Result<AnalysisResult, OrchestratorError> {
    let request_id = orchestrator.submit(request)?;
    orchestrator.wait(request_id).await
}

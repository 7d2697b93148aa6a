use quorum_models::{AgentsConfig, QuorumConfig};
use serde::{Deserialize, Serialize};

/// Daemon configuration: the full quorum configuration plus a `[daemon]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    /// Interval in seconds between re-analyses of each group.
    pub refresh_interval_seconds: u64,
    /// Groups to re-analyze. Empty means every known group.
    pub groups: Vec<String>,
    /// Capabilities to request. Empty means every capability of an enabled agent.
    pub capabilities: Vec<String>,
    /// Interval in seconds between expired context row cleanups.
    pub cleanup_interval_seconds: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 300,
            groups: Vec::new(),
            capabilities: Vec::new(),
            cleanup_interval_seconds: 600,
        }
    }
}

impl DaemonSettings {
    pub fn resolve_capabilities(&self, agents: &AgentsConfig) -> Vec<String> {
        if !self.capabilities.is_empty() {
            return self.capabilities.clone();
        }
        agents.enabled_capabilities()
    }
}

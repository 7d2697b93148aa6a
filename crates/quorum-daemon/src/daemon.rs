use std::sync::{Arc, Mutex};
use std::time::Duration;

use quorum_agents::Orchestrator;
use quorum_models::{AnalysisRequest, AnalysisResult};
use quorum_store::SqliteCache;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonSettings;
use crate::error::DaemonError;

/// The quorum daemon. Re-analyzes ticker groups on a fixed interval and keeps
/// the shared context cache free of expired rows.
pub struct Daemon {
    settings: DaemonSettings,
    capabilities: Vec<String>,
    orchestrator: Arc<Orchestrator>,
    cache: Option<Arc<Mutex<SqliteCache>>>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(
        settings: DaemonSettings,
        capabilities: Vec<String>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            settings,
            capabilities,
            orchestrator,
            cache: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Periodically expire stale rows in this context cache.
    pub fn with_cleanup(mut self, cache: SqliteCache) -> Self {
        self.cache = Some(Arc::new(Mutex::new(cache)));
        self
    }

    /// Returns a CancellationToken that can be used to trigger shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Group ids this daemon refreshes. Every configured id must exist.
    fn groups(&self) -> Result<Vec<String>, DaemonError> {
        if self.settings.groups.is_empty() {
            return Ok(self
                .orchestrator
                .groups()
                .list()
                .into_iter()
                .map(|g| g.id)
                .collect());
        }
        for group_id in &self.settings.groups {
            self.orchestrator.groups().get(group_id)?;
        }
        Ok(self.settings.groups.clone())
    }

    /// Run the daemon until cancelled, then shut the orchestrator down.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let groups = self.groups()?;
        if self.capabilities.is_empty() {
            return Err(DaemonError::Config(
                "no capabilities to request; enable an agent or set daemon.capabilities".into(),
            ));
        }
        tracing::info!(
            groups = ?groups,
            capabilities = ?self.capabilities,
            interval_secs = self.settings.refresh_interval_seconds,
            "Quorum daemon starting"
        );

        let mut join_set = tokio::task::JoinSet::new();

        let interval = Duration::from_secs(self.settings.refresh_interval_seconds.max(1));
        for group_id in groups {
            let orchestrator = Arc::clone(&self.orchestrator);
            let capabilities = self.capabilities.clone();
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                refresh_loop(orchestrator, group_id, capabilities, interval, cancel).await;
            });
        }

        if let Some(cache) = &self.cache {
            let cache = Arc::clone(cache);
            let cancel = self.cancel.clone();
            let interval_secs = self.settings.cleanup_interval_seconds.max(1);
            join_set.spawn(async move {
                cleanup_loop(cache, interval_secs, cancel).await;
            });
        }

        tracing::info!(tasks = join_set.len(), "All daemon tasks started");

        // Wait for all tasks to complete (they run until cancelled)
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Daemon task ended abnormally");
            }
        }

        self.orchestrator.shutdown().await;
        tracing::info!("Quorum daemon stopped");
        Ok(())
    }
}

/// Re-analyze one group immediately, then every `interval`. A refresh that
/// runs past the interval delays the next one rather than overlapping it.
async fn refresh_loop(
    orchestrator: Arc<Orchestrator>,
    group_id: String,
    capabilities: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        run_refresh(&orchestrator, &group_id, &capabilities, &cancel).await;

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(group = %group_id, "Refresh loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Execute one refresh cycle for a group. Returns `None` if the request could
/// not be submitted or the daemon was cancelled while it ran.
pub async fn run_refresh(
    orchestrator: &Orchestrator,
    group_id: &str,
    capabilities: &[String],
    cancel: &CancellationToken,
) -> Option<AnalysisResult> {
    let request = AnalysisRequest {
        capabilities: capabilities.to_vec(),
        ..AnalysisRequest::new(group_id, &[])
    };
    let request_id = match orchestrator.submit(request) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(group = %group_id, error = %e, "Failed to submit refresh");
            return None;
        }
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = orchestrator.cancel(request_id) {
                tracing::warn!(request = %request_id, error = %e, "Failed to cancel refresh");
            }
            None
        }
        result = orchestrator.wait(request_id) => match result {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(request = %request_id, error = %e, "Refresh failed");
                None
            }
        },
    };

    if let Some(result) = &result {
        for signal in &result.aggregated_signals {
            tracing::info!(
                group = %group_id,
                instrument = %signal.instrument_id,
                direction = ?signal.consensus_direction,
                confidence = %signal.consensus_confidence,
                completeness = %signal.completeness,
                flags = ?signal.conflict_flags,
                "Consensus updated"
            );
        }
        orchestrator.forget(request_id);
    }
    result
}

/// Expire stale context rows at startup, then periodically.
async fn cleanup_loop(cache: Arc<Mutex<SqliteCache>>, interval_secs: u64, cancel: CancellationToken) {
    let interval = Duration::from_secs(interval_secs);

    loop {
        match cache.lock() {
            Ok(c) => match c.expire_stale() {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, "Cleaned up stale cache entries");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Stale cleanup failed");
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Cache lock poisoned during cleanup");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Cleanup loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

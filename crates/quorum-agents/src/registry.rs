use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use quorum_models::store_schema::record_kinds;
use quorum_models::{AgentDescriptor, HealthStatus};
use quorum_store::RecordStore;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::unit::AgentUnit;

const HEALTH_CHANNEL_CAPACITY: usize = 256;

/// Emitted on every health transition. Repeated reports of the same status
/// produce no event.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub agent_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub at: DateTime<Utc>,
}

struct RegisteredAgent {
    descriptor: AgentDescriptor,
    unit: Arc<dyn AgentUnit>,
}

/// Catalog of agent units, their capabilities and health.
///
/// Lookups take a read lock; registration and health changes take the write
/// lock, so a resolve never observes a half-applied update. When a
/// [`RecordStore`] is attached, descriptors are written through so the catalog
/// survives restarts.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    health_tx: broadcast::Sender<HealthEvent>,
    store: Option<Arc<RecordStore>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            health_tx,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an agent. Fails if the id is already taken.
    ///
    /// A previously persisted health status for the same id is restored, so an
    /// agent disabled through [`report_health`](Self::report_health) before a
    /// restart stays disabled. A descriptor registered as `Disabled` is off for
    /// this registry only: it keeps that status and the persisted one is left
    /// as it was.
    pub fn register(
        &self,
        mut descriptor: AgentDescriptor,
        unit: Arc<dyn AgentUnit>,
    ) -> Result<(), OrchestratorError> {
        let registered_off = descriptor.health == HealthStatus::Disabled;
        let mut persisted = descriptor.clone();
        if registered_off {
            persisted.health = HealthStatus::Healthy;
        }
        if let Some(store) = &self.store {
            if let Some(saved) =
                store.get::<AgentDescriptor>(record_kinds::AGENT, &descriptor.id)?
            {
                persisted.health = saved.health;
            }
        }
        if !registered_off {
            descriptor.health = persisted.health;
        }

        let mut agents = self.write();
        if agents.contains_key(&descriptor.id) {
            return Err(OrchestratorError::DuplicateAgent(descriptor.id));
        }
        if let Some(store) = &self.store {
            store.put(record_kinds::AGENT, &persisted.id, &persisted)?;
        }

        info!(
            agent = %descriptor.id,
            capabilities = ?descriptor.capability_tags,
            health = ?descriptor.health,
            "Agent registered"
        );
        agents.insert(descriptor.id.clone(), RegisteredAgent { descriptor, unit });
        Ok(())
    }

    /// Remove an agent. Tasks already running on it finish normally.
    pub fn deregister(&self, agent_id: &str) -> Result<AgentDescriptor, OrchestratorError> {
        let mut agents = self.write();
        let removed = agents
            .remove(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
        if let Some(store) = &self.store {
            store.delete(record_kinds::AGENT, agent_id)?;
        }
        info!(agent = %agent_id, "Agent deregistered");
        Ok(removed.descriptor)
    }

    /// Healthy and degraded agents serving `capability`, cheapest first. Ties on
    /// cost are broken by id so resolution is deterministic.
    pub fn resolve(&self, capability: &str) -> Vec<AgentDescriptor> {
        let agents = self.read();
        let mut matches: Vec<AgentDescriptor> = agents
            .values()
            .map(|a| &a.descriptor)
            .filter(|d| d.health.is_dispatchable() && d.serves(capability))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.cost_weight.cmp(&b.cost_weight).then_with(|| a.id.cmp(&b.id)));
        matches
    }

    /// Record a health observation. Idempotent: reporting the current status
    /// again changes nothing and emits no event.
    pub fn report_health(
        &self,
        agent_id: &str,
        status: HealthStatus,
    ) -> Result<(), OrchestratorError> {
        let mut agents = self.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;

        let previous = agent.descriptor.health;
        if previous == status {
            return Ok(());
        }
        agent.descriptor.health = status;
        if let Some(store) = &self.store {
            store.put(record_kinds::AGENT, agent_id, &agent.descriptor)?;
        }

        match status {
            HealthStatus::Disabled => {
                warn!(agent = %agent_id, ?previous, "Agent disabled")
            }
            _ => info!(agent = %agent_id, ?previous, current = ?status, "Agent health changed"),
        }
        // No receivers is fine.
        let _ = self.health_tx.send(HealthEvent {
            agent_id: agent_id.to_string(),
            previous,
            current: status,
            at: Utc::now(),
        });
        Ok(())
    }

    /// The unit and current descriptor for an agent, if it may take new work.
    /// Checked at dispatch time, so an agent disabled after graph construction
    /// is skipped.
    pub fn dispatchable(&self, agent_id: &str) -> Option<(AgentDescriptor, Arc<dyn AgentUnit>)> {
        let agents = self.read();
        agents
            .get(agent_id)
            .filter(|a| a.descriptor.health.is_dispatchable())
            .map(|a| (a.descriptor.clone(), Arc::clone(&a.unit)))
    }

    pub fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.read().get(agent_id).map(|a| a.descriptor.clone())
    }

    /// Every registered descriptor, ordered by id.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> =
            self.read().values().map(|a| a.descriptor.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

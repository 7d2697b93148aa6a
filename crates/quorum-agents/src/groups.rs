use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use quorum_models::store_schema::record_kinds;
use quorum_models::TickerGroup;
use quorum_store::RecordStore;
use tracing::info;

use crate::error::OrchestratorError;

/// Named ticker groups. Updates are whole-group replacements, so a request
/// expanding a group sees either the old or the new instrument list.
pub struct TickerGroupManager {
    groups: RwLock<BTreeMap<String, TickerGroup>>,
    store: Option<Arc<RecordStore>>,
}

impl Default for TickerGroupManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim and uppercase instrument ids, drop duplicates keeping first occurrence.
fn normalize(mut group: TickerGroup) -> Result<TickerGroup, OrchestratorError> {
    group.id = group.id.trim().to_string();
    if group.id.is_empty() {
        return Err(OrchestratorError::InvalidGroup("group id is blank".to_string()));
    }

    let mut seen = HashSet::new();
    let mut instruments = Vec::with_capacity(group.instrument_ids.len());
    for raw in &group.instrument_ids {
        let id = raw.trim().to_uppercase();
        if id.is_empty() {
            return Err(OrchestratorError::InvalidGroup(format!(
                "group {} contains a blank instrument id",
                group.id
            )));
        }
        if seen.insert(id.clone()) {
            instruments.push(id);
        }
    }
    if instruments.is_empty() {
        return Err(OrchestratorError::InvalidGroup(format!(
            "group {} has no instruments",
            group.id
        )));
    }
    group.instrument_ids = instruments;
    Ok(group)
}

impl TickerGroupManager {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(BTreeMap::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, TickerGroup>> {
        self.groups.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, TickerGroup>> {
        self.groups.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Load persisted groups into memory. Returns how many were loaded.
    pub fn load(&self) -> Result<usize, OrchestratorError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let saved: Vec<TickerGroup> = store.list(record_kinds::GROUP)?;
        let mut groups = self.write();
        let count = saved.len();
        for group in saved {
            groups.insert(group.id.clone(), group);
        }
        Ok(count)
    }

    pub fn create(&self, group: TickerGroup) -> Result<TickerGroup, OrchestratorError> {
        let group = normalize(group)?;
        let mut groups = self.write();
        if groups.contains_key(&group.id) {
            return Err(OrchestratorError::DuplicateGroup(group.id));
        }
        if let Some(store) = &self.store {
            store.put(record_kinds::GROUP, &group.id, &group)?;
        }
        info!(
            group = %group.id,
            instruments = group.instrument_ids.len(),
            tier = ?group.priority_tier,
            "Ticker group created"
        );
        groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Replace an existing group. Requests already submitted keep the
    /// instrument list they were expanded with.
    pub fn update(&self, group: TickerGroup) -> Result<TickerGroup, OrchestratorError> {
        let group = normalize(group)?;
        let mut groups = self.write();
        if !groups.contains_key(&group.id) {
            return Err(OrchestratorError::GroupNotFound(group.id));
        }
        if let Some(store) = &self.store {
            store.put(record_kinds::GROUP, &group.id, &group)?;
        }
        info!(group = %group.id, instruments = group.instrument_ids.len(), "Ticker group updated");
        groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Create or replace.
    pub fn upsert(&self, group: TickerGroup) -> Result<TickerGroup, OrchestratorError> {
        let exists = self.read().contains_key(group.id.trim());
        if exists {
            self.update(group)
        } else {
            self.create(group)
        }
    }

    pub fn delete(&self, group_id: &str) -> Result<TickerGroup, OrchestratorError> {
        let mut groups = self.write();
        let removed = groups
            .remove(group_id)
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))?;
        if let Some(store) = &self.store {
            store.delete(record_kinds::GROUP, group_id)?;
        }
        info!(group = %group_id, "Ticker group deleted");
        Ok(removed)
    }

    pub fn get(&self, group_id: &str) -> Result<TickerGroup, OrchestratorError> {
        self.read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::GroupNotFound(group_id.to_string()))
    }

    /// All groups, ordered by id.
    pub fn list(&self) -> Vec<TickerGroup> {
        self.read().values().cloned().collect()
    }

    /// Instrument ids of a group, in declaration order.
    pub fn expand(&self, group_id: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.get(group_id)?.instrument_ids)
    }
}

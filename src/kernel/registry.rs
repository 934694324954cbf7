//! Agent registry.
//!
//! Tracks every registered agent together with its lifecycle record and its
//! health record. The three are created in one step and removed in one step,
//! so an agent can never exist without exactly one of each.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::health::AgentHealth;
use super::lifecycle::{AgentLifecycle, LifecycleUpdate};
use crate::agent::Agent;
use crate::types::AgentId;

// =============================================================================
// Registry Entry
// =============================================================================

/// Everything the kernel tracks for one registered agent.
pub struct AgentEntry {
    pub agent: Arc<dyn Agent>,
    pub lifecycle: AgentLifecycle,
    pub health: AgentHealth,
    /// Set when the kernel paused the agent; cleared on resume.
    pub paused: bool,
}

impl AgentEntry {
    fn new(agent: Arc<dyn Agent>) -> Self {
        let id = agent.id().clone();
        Self {
            agent,
            lifecycle: AgentLifecycle::new(id.clone()),
            health: AgentHealth::new(id),
            paused: false,
        }
    }
}

impl fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEntry")
            .field("agent", &self.agent.id())
            .field("lifecycle", &self.lifecycle)
            .field("health", &self.health)
            .field("paused", &self.paused)
            .finish()
    }
}

// =============================================================================
// Agent Registry
// =============================================================================

/// Registry of agents keyed by id.
///
/// All methods take `&self`; the map lives behind an async lock that is
/// never held across an agent call.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    inner: RwLock<HashMap<AgentId, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Insert an agent, creating its lifecycle and health records.
    /// Returns false if the id is already registered.
    pub async fn insert(&self, agent: Arc<dyn Agent>) -> bool {
        let id = agent.id().clone();
        let mut inner = self.inner.write().await;
        if inner.contains_key(&id) {
            return false;
        }
        inner.insert(id, AgentEntry::new(agent));
        true
    }

    /// Remove an agent and all its records.
    pub async fn remove(&self, id: &AgentId) -> Option<AgentEntry> {
        self.inner.write().await.remove(id)
    }

    pub async fn contains(&self, id: &AgentId) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Clone out the agent handle for a registered id.
    pub async fn agent(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.agent))
    }

    /// All registered ids, sorted for stable iteration.
    pub async fn ids(&self) -> Vec<AgentId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<AgentId> = inner.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    // =========================================================================
    // Lifecycle Records
    // =========================================================================

    pub async fn lifecycle(&self, id: &AgentId) -> Option<AgentLifecycle> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|entry| entry.lifecycle.clone())
    }

    /// Merge a partial update into the stored lifecycle record and return
    /// the merged copy. `None` when the id is not registered.
    pub async fn apply_lifecycle(
        &self,
        id: &AgentId,
        update: &LifecycleUpdate,
    ) -> Option<AgentLifecycle> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(id)?;
        entry.lifecycle.apply(update);
        Some(entry.lifecycle.clone())
    }

    // =========================================================================
    // Health Records
    // =========================================================================

    pub async fn health(&self, id: &AgentId) -> Option<AgentHealth> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|entry| entry.health.clone())
    }

    /// Mutate the stored health record and return the updated copy.
    pub async fn update_health(
        &self,
        id: &AgentId,
        mutate: impl FnOnce(&mut AgentHealth),
    ) -> Option<AgentHealth> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(id)?;
        mutate(&mut entry.health);
        Some(entry.health.clone())
    }

    /// Health records for every registered agent, sorted by id.
    pub async fn health_snapshot(&self) -> Vec<AgentHealth> {
        let inner = self.inner.read().await;
        let mut snapshot: Vec<AgentHealth> =
            inner.values().map(|entry| entry.health.clone()).collect();
        snapshot.sort_by(|a, b| a.agent_id.as_str().cmp(b.agent_id.as_str()));
        snapshot
    }

    // =========================================================================
    // Pause Flag
    // =========================================================================

    pub async fn set_paused(&self, id: &AgentId, paused: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(entry) => {
                entry.paused = paused;
                true
            }
            None => false,
        }
    }

    pub async fn is_paused(&self, id: &AgentId) -> Option<bool> {
        self.inner.read().await.get(id).map(|entry| entry.paused)
    }
}

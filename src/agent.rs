//! The agent contract.
//!
//! Agents are the executors at the end of the cognitive pipeline: the kernel
//! registers them, drives their lifecycle, and hands them actions chosen by
//! the decide stage. Implementations keep their own state behind interior
//! mutability; every trait method takes `&self` so agents can be shared as
//! `Arc<dyn Agent>` across the kernel, the health monitor and the pipeline.

use crate::bus::Event;
use crate::types::{AgentId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time view of an agent's condition.
///
/// `running` flips on successful `start` and off on `stop`; `error` carries
/// the last failure the agent wants the health monitor to see. An agent is
/// considered healthy only when it is running with no error recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    pub running: bool,
    pub error: Option<String>,
}

impl AgentStatus {
    pub fn healthy(&self) -> bool {
        self.running && self.error.is_none()
    }
}

/// A registered executor in the kernel.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier the registry keys on.
    fn id(&self) -> &AgentId;

    /// Action names this agent advertises. Informational only.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// One-time setup, run by the kernel before the first `start`.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Bring the agent into the running state.
    async fn start(&self) -> Result<()>;

    /// Take the agent out of the running state.
    async fn stop(&self) -> Result<()>;

    /// Temporarily suspend work without losing state.
    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    /// Resume from a paused state.
    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Perform one action chosen by the pipeline.
    ///
    /// `parameters` carries whatever the understand stage extracted from the
    /// input. The returned value is attached to the execution record and
    /// echoed on the agent's response topic.
    async fn execute_action(
        &self,
        action: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value>;

    /// Observe a bus event the agent subscribed to. Default: ignore.
    async fn process_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Current condition. Must not block.
    fn status(&self) -> AgentStatus;
}

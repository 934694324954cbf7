//! Kernel - agent registry, lifecycle enforcement and background services.
//!
//! The kernel is the hub the rest of the crate hangs off:
//!   - Owns the event bus, policy engine and memory engine
//!   - Tracks registered agents with their lifecycle and health records
//!   - Enforces lifecycle transitions requested by the cognitive pipeline
//!   - Runs the health monitor and memory sweeper as background services
//!
//! All methods take `&self`; subsystems synchronize internally, so a single
//! kernel instance is shared freely across tasks. Agent lifecycle failures
//! are published as `agent:lifecycle_error` events rather than returned,
//! so a misbehaving agent cannot fail the operation that touched it.

pub mod health;
pub mod lifecycle;
pub mod recovery;
pub mod registry;

pub use health::{AgentHealth, HealthConfig, HealthMonitor};
pub use lifecycle::{AgentLifecycle, LifecycleUpdate};
pub use registry::{AgentEntry, AgentRegistry};

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::bus::{topics, BusStats, Event, EventBus, Subscription};
use crate::memory::{MemoryCleanup, MemoryEngine, MemoryStats};
use crate::policy::{PolicyEngine, PolicyStats};
use crate::types::{AgentId, Config, Error, Result};
use recovery::{with_recovery, with_recovery_async};

// =============================================================================
// Kernel
// =============================================================================

/// Background services owned by the kernel, started and stopped with it.
#[derive(Debug)]
struct BackgroundServices {
    health: HealthMonitor,
    memory_sweep: MemoryCleanup,
    handles: Vec<JoinHandle<()>>,
}

/// Central coordinator for agents, events, policies and memory.
#[derive(Debug)]
pub struct Kernel {
    config: Config,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    memory: Arc<MemoryEngine>,
    services: StdMutex<BackgroundServices>,
    running: AtomicBool,
}

/// Aggregated statistics across every kernel subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStats {
    pub running: bool,
    pub agents: usize,
    pub bus: BusStats,
    pub memory: MemoryStats,
    pub policy: PolicyStats,
    pub health: Vec<AgentHealth>,
}

impl Kernel {
    pub fn new(config: Config) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(AgentRegistry::new());
        let memory = Arc::new(MemoryEngine::new(config.memory.clone()));

        let services = BackgroundServices {
            health: HealthMonitor::new(
                Arc::clone(&registry),
                Arc::clone(&bus),
                config.health.clone(),
            ),
            memory_sweep: MemoryCleanup::new(Arc::clone(&memory)),
            handles: Vec::new(),
        };

        Self {
            config,
            bus,
            registry,
            policy: Arc::new(PolicyEngine::with_defaults()),
            memory,
            services: StdMutex::new(services),
            running: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Startup / Shutdown
    // =========================================================================

    /// Start background services and boot every registered agent.
    /// Calling start on a running kernel is a warning-level no-op.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("kernel_already_running");
            return Ok(());
        }

        {
            let mut services = self
                .services
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let health_handle = services.health.start();
            let sweep_handle = services.memory_sweep.start();
            services.handles.push(health_handle);
            services.handles.push(sweep_handle);
        }

        let ids = self.registry.ids().await;
        for id in &ids {
            self.boot_agent(id).await;
        }

        self.bus
            .publish(topics::KERNEL_STARTED, json!({ "agents": ids.len() }))
            .await;
        tracing::info!("kernel_started: agents={}", ids.len());
        Ok(())
    }

    /// Stop background services, stop every agent best-effort and clear
    /// working memory. Long-term memory survives shutdown.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("kernel_not_running");
            return Ok(());
        }

        let handles = {
            let mut services = self
                .services
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            services.health.stop();
            services.memory_sweep.stop();
            std::mem::take(&mut services.handles)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!("service_task_failed: error={}", err);
            }
        }

        let ids = self.registry.ids().await;
        let mut stops = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(agent) = self.registry.agent(id).await {
                let id = id.clone();
                stops.push(async move {
                    if let Err(err) = with_recovery_async(|| agent.stop(), "agent_stop").await {
                        tracing::warn!("agent_stop_failed: agent={}, error={}", id, err);
                    }
                });
            }
        }
        futures::future::join_all(stops).await;

        self.memory.clear_working();

        self.bus
            .publish(topics::KERNEL_STOPPED, json!({ "agents": ids.len() }))
            .await;
        tracing::info!("kernel_stopped: agents={}", ids.len());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Agent Registration
    // =========================================================================

    /// Register an agent. Returns false (after a warning) when the id is
    /// already registered, leaving the existing entry untouched. On a
    /// running kernel the agent is initialized and started immediately;
    /// boot failures are published, not returned.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> bool {
        let id = agent.id().clone();
        let capabilities = agent.capabilities();

        if !self.registry.insert(agent).await {
            tracing::warn!("agent_already_registered: agent={}", id);
            return false;
        }

        tracing::info!(
            "agent_registered: agent={}, capabilities={:?}",
            id,
            capabilities
        );
        self.bus
            .publish(
                topics::AGENT_REGISTERED,
                json!({ "agent": id.as_str(), "capabilities": capabilities }),
            )
            .await;

        if self.running.load(Ordering::SeqCst) {
            self.boot_agent(&id).await;
        }
        true
    }

    /// Unregister an agent, stopping it best-effort first.
    /// Unknown ids are a warning-level no-op.
    pub async fn unregister_agent(&self, id: &AgentId) -> bool {
        let Some(entry) = self.registry.remove(id).await else {
            tracing::warn!("agent_not_registered: agent={}", id);
            return false;
        };

        if let Err(err) = with_recovery_async(|| entry.agent.stop(), "agent_stop").await {
            tracing::warn!("agent_stop_failed: agent={}, error={}", id, err);
        }

        self.bus
            .publish(topics::AGENT_UNREGISTERED, json!({ "agent": id.as_str() }))
            .await;
        tracing::info!("agent_unregistered: agent={}", id);
        true
    }

    pub async fn get_agent(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.registry.agent(id).await
    }

    /// Initialize and start one agent, publishing any failure as an
    /// `agent:lifecycle_error`. Already-running agents are left alone.
    async fn boot_agent(&self, id: &AgentId) {
        let Some(agent) = self.registry.agent(id).await else {
            return;
        };

        if probe_running(&agent) {
            tracing::debug!("agent_already_running: agent={}", id);
            return;
        }

        if let Err(err) = with_recovery_async(|| agent.init(), "agent_init").await {
            self.lifecycle_error(id, "init", &err).await;
            return;
        }
        if let Err(err) = with_recovery_async(|| agent.start(), "agent_start").await {
            self.lifecycle_error(id, "start", &err).await;
        }
    }

    async fn lifecycle_error(&self, id: &AgentId, phase: &str, err: &Error) {
        tracing::warn!(
            "agent_lifecycle_error: agent={}, phase={}, error={}",
            id,
            phase,
            err
        );
        self.bus
            .publish(
                topics::AGENT_LIFECYCLE_ERROR,
                json!({ "agent": id.as_str(), "phase": phase, "error": err.to_string() }),
            )
            .await;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Merge a partial lifecycle update into the agent's record, then
    /// enforce the merged flags against the agent's actual state:
    /// stop a running agent, start a stopped unpaused one, pause or resume.
    /// Returns the merged record. Agent call failures are published as
    /// lifecycle errors; only an unknown id is returned as an error.
    pub async fn update_lifecycle(
        &self,
        id: &AgentId,
        update: LifecycleUpdate,
    ) -> Result<AgentLifecycle> {
        let merged = self
            .registry
            .apply_lifecycle(id, &update)
            .await
            .ok_or_else(|| Error::not_found(format!("agent not registered: {}", id)))?;

        if let Some(agent) = self.registry.agent(id).await {
            self.enforce_lifecycle(id, &merged, &agent).await;
        }
        Ok(merged)
    }

    pub async fn get_agent_lifecycle(&self, id: &AgentId) -> Option<AgentLifecycle> {
        self.registry.lifecycle(id).await
    }

    pub async fn get_agent_health(&self, id: &AgentId) -> Option<AgentHealth> {
        self.registry.health(id).await
    }

    pub async fn is_paused(&self, id: &AgentId) -> Option<bool> {
        self.registry.is_paused(id).await
    }

    async fn enforce_lifecycle(
        &self,
        id: &AgentId,
        lifecycle: &AgentLifecycle,
        agent: &Arc<dyn Agent>,
    ) {
        let paused = self.registry.is_paused(id).await.unwrap_or(false);
        let running = probe_running(agent);

        if lifecycle.should_stop && running {
            if let Err(err) = with_recovery_async(|| agent.stop(), "agent_stop").await {
                self.lifecycle_error(id, "stop", &err).await;
            }
        } else if lifecycle.should_start && !running && !paused {
            if let Err(err) = with_recovery_async(|| agent.start(), "agent_start").await {
                self.lifecycle_error(id, "start", &err).await;
            }
        }

        // Re-probe so a start or stop above is visible to the pause rules.
        let running = probe_running(agent);
        if lifecycle.should_pause && running && !paused {
            match with_recovery_async(|| agent.pause(), "agent_pause").await {
                Ok(()) => {
                    self.registry.set_paused(id, true).await;
                    tracing::debug!("agent_paused: agent={}, reason={}", id, lifecycle.reason);
                }
                Err(err) => self.lifecycle_error(id, "pause", &err).await,
            }
        } else if lifecycle.should_resume && paused {
            match with_recovery_async(|| agent.resume(), "agent_resume").await {
                Ok(()) => {
                    self.registry.set_paused(id, false).await;
                    tracing::debug!("agent_resumed: agent={}", id);
                }
                Err(err) => self.lifecycle_error(id, "resume", &err).await,
            }
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Emit an event on the kernel bus.
    pub async fn emit(&self, event: Event) -> Result<usize> {
        self.bus.emit(event).await
    }

    /// Subscribe a callback on the kernel bus.
    pub async fn on(
        &self,
        pattern: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.bus.on(pattern, handler).await
    }

    /// Subscribe via a channel on the kernel bus.
    pub async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Event>)> {
        self.bus.subscribe(pattern).await
    }

    /// Deliver an event directly to one agent, bypassing the bus.
    pub async fn dispatch_to_agent(&self, id: &AgentId, event: &Event) -> Result<()> {
        let agent = self
            .registry
            .agent(id)
            .await
            .ok_or_else(|| Error::not_found(format!("agent not registered: {}", id)))?;
        with_recovery_async(|| agent.process_event(event), "agent_process_event").await
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn memory(&self) -> &Arc<MemoryEngine> {
        &self.memory
    }

    /// Aggregate statistics from every subsystem.
    pub async fn get_stats(&self) -> KernelStats {
        KernelStats {
            running: self.running.load(Ordering::SeqCst),
            agents: self.registry.len().await,
            bus: self.bus.get_stats().await,
            memory: self.memory.get_stats(),
            policy: self.policy.get_stats(),
            health: self.registry.health_snapshot().await,
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn probe_running(agent: &Arc<dyn Agent>) -> bool {
    with_recovery(|| Ok(agent.status()), "agent_status_probe")
        .map(|status| status.running)
        .unwrap_or(false)
}

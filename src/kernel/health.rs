//! Agent health monitoring and automatic recovery.
//!
//! A background ticker probes every registered agent's status on a fixed
//! interval. An agent is healthy when it reports running with no error.
//! Once an agent accumulates `max_failures` consecutive failed probes it is
//! recovered in place: best-effort stop, a grace delay, then start. The
//! outcome is published as `health:agent_recovered` or
//! `health:recovery_failed`. A check cycle never propagates errors; a
//! panicking status probe counts as one more failed check.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::recovery::{with_recovery, with_recovery_async};
use super::registry::AgentRegistry;
use crate::agent::Agent;
use crate::bus::{topics, EventBus};
use crate::types::AgentId;

// =============================================================================
// Configuration
// =============================================================================

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between check cycles.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Consecutive failed probes before recovery is attempted.
    pub max_failures: u32,

    /// Delay between stopping and restarting a failed agent.
    #[serde(with = "humantime_serde")]
    pub restart_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_failures: 3,
            restart_grace: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Health Record
// =============================================================================

/// Health record for one agent, updated by the monitor on every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub is_healthy: bool,
    pub last_check: Option<chrono::DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub registered_at: chrono::DateTime<Utc>,
    /// Duration of the most recent status probe.
    pub response_time_ms: Option<u64>,
}

impl AgentHealth {
    /// Fresh record for a newly registered agent; presumed healthy until
    /// the first probe says otherwise.
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            is_healthy: true,
            last_check: None,
            consecutive_failures: 0,
            last_error: None,
            registered_at: Utc::now(),
            response_time_ms: None,
        }
    }

    /// Seconds since the agent was registered.
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.registered_at).num_seconds()
    }
}

// =============================================================================
// Health Monitor
// =============================================================================

/// Background service that checks agent health and recovers failed agents.
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    config: HealthConfig,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<EventBus>, config: HealthConfig) -> Self {
        Self {
            registry,
            bus,
            config,
            stop_tx: None,
        }
    }

    /// Start the periodic check loop. Returns the task handle; the loop
    /// exits when `stop` is called.
    pub fn start(&mut self) -> JoinHandle<()> {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.check_interval);

            tracing::info!(
                "health_monitor_started: interval={:?}, max_failures={}",
                config.check_interval,
                config.max_failures
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (checked, unhealthy) = run_checks(&registry, &bus, &config).await;
                        if unhealthy > 0 {
                            tracing::warn!(
                                "health_cycle_completed: checked={}, unhealthy={}",
                                checked,
                                unhealthy
                            );
                        } else {
                            tracing::debug!(
                                "health_cycle_completed: checked={}, unhealthy={}",
                                checked,
                                unhealthy
                            );
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the check loop to stop.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    /// Run one check cycle immediately. Returns (checked, unhealthy).
    pub async fn run_checks_once(&self) -> (usize, usize) {
        run_checks(&self.registry, &self.bus, &self.config).await
    }
}

/// One check cycle over every registered agent.
async fn run_checks(
    registry: &AgentRegistry,
    bus: &EventBus,
    config: &HealthConfig,
) -> (usize, usize) {
    let mut checked = 0;
    let mut unhealthy = 0;

    for id in registry.ids().await {
        let Some(agent) = registry.agent(&id).await else {
            continue;
        };
        checked += 1;

        let probe_started = std::time::Instant::now();
        let probe = with_recovery(|| Ok(agent.status()), "agent_status_probe");
        let elapsed_ms = probe_started.elapsed().as_millis() as u64;
        let now = Utc::now();

        match probe {
            Ok(status) if status.healthy() => {
                registry
                    .update_health(&id, |health| {
                        health.is_healthy = true;
                        health.consecutive_failures = 0;
                        health.last_error = None;
                        health.last_check = Some(now);
                        health.response_time_ms = Some(elapsed_ms);
                    })
                    .await;
            }
            probe => {
                unhealthy += 1;
                let error = match probe {
                    Ok(status) => status
                        .error
                        .unwrap_or_else(|| "agent not running".to_string()),
                    Err(err) => err.to_string(),
                };

                let updated = registry
                    .update_health(&id, |health| {
                        health.is_healthy = false;
                        health.consecutive_failures += 1;
                        health.last_error = Some(error.clone());
                        health.last_check = Some(now);
                        health.response_time_ms = Some(elapsed_ms);
                    })
                    .await;

                let failures = updated.map(|health| health.consecutive_failures).unwrap_or(0);
                tracing::warn!(
                    "agent_check_failed: agent={}, failures={}, error={}",
                    id,
                    failures,
                    error
                );

                if failures >= config.max_failures {
                    recover_agent(registry, bus, config, &id, &agent).await;
                }
            }
        }
    }

    (checked, unhealthy)
}

/// Stop, wait out the grace period, then restart a failed agent.
/// Publishes the outcome; never propagates errors.
async fn recover_agent(
    registry: &AgentRegistry,
    bus: &EventBus,
    config: &HealthConfig,
    id: &AgentId,
    agent: &Arc<dyn Agent>,
) {
    tracing::warn!("agent_recovery_started: agent={}", id);

    if let Err(err) = with_recovery_async(|| agent.stop(), "recovery_stop").await {
        tracing::debug!("recovery_stop_failed: agent={}, error={}", id, err);
    }

    tokio::time::sleep(config.restart_grace).await;

    match with_recovery_async(|| agent.start(), "recovery_start").await {
        Ok(()) => {
            registry
                .update_health(id, |health| {
                    health.is_healthy = true;
                    health.consecutive_failures = 0;
                    health.last_error = None;
                })
                .await;
            bus.publish(topics::AGENT_RECOVERED, json!({ "agent": id.as_str() }))
                .await;
            tracing::info!("agent_recovered: agent={}", id);
        }
        Err(err) => {
            registry
                .update_health(id, |health| {
                    health.last_error = Some(err.to_string());
                })
                .await;
            bus.publish(
                topics::RECOVERY_FAILED,
                json!({ "agent": id.as_str(), "error": err.to_string() }),
            )
            .await;
            tracing::error!("agent_recovery_failed: agent={}, error={}", id, err);
        }
    }
}

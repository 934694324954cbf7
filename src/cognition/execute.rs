//! Execute stage: policy gate, lifecycle management and the guarded
//! agent call.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::agent::Agent;
use crate::bus::topics;
use crate::kernel::recovery::with_recovery;
use crate::kernel::LifecycleUpdate;
use crate::resilience::StageGuard;
use crate::types::{Error, Priority, Result};

use super::decide::Decision;
use super::understand::Understanding;
use super::{AppState, CognitiveLoop, Need};

/// How far one decision got.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The agent ran the action and returned a result.
    Completed { result: serde_json::Value },
    /// Policy said no; the agent was never called.
    Denied { reason: String },
    /// Policy wants a human to confirm first; the agent was never called.
    AwaitingApproval { reason: String },
    /// The routed agent is not registered.
    AgentUnavailable,
    /// The agent call itself failed or timed out.
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }
}

impl CognitiveLoop {
    /// Gate, steer and finally run one decision.
    ///
    /// Blocked and degraded paths are ordinary outcomes, not errors, so the
    /// surrounding stage guard only sees a failure when the stage itself
    /// breaks.
    pub(super) async fn execute_stage(
        &self,
        understanding: &Understanding,
        decision: &Decision,
    ) -> Result<ExecutionOutcome> {
        let bus = self.kernel.bus();

        let verdict = self.kernel.policy().evaluate(&decision.action);
        if !verdict.allowed {
            bus.publish(
                topics::POLICY_DENIED,
                json!({
                    "action": decision.action,
                    "agent": decision.agent,
                    "reason": verdict.reason,
                }),
            )
            .await;
            return Ok(ExecutionOutcome::Denied {
                reason: verdict.reason,
            });
        }
        if let Some(warning) = &verdict.warning {
            tracing::warn!(
                "policy_warning: action={} warning={}",
                decision.action,
                warning
            );
        }
        if verdict.requires_approval {
            bus.publish(
                topics::APPROVAL_REQUIRED,
                json!({
                    "action": decision.action,
                    "agent": decision.agent,
                    "reason": verdict.reason,
                }),
            )
            .await;
            return Ok(ExecutionOutcome::AwaitingApproval {
                reason: verdict.reason,
            });
        }
        if verdict.requires_auth {
            // Advisory flag: execution proceeds, the surface owning the
            // session is expected to verify.
            tracing::info!("action_requires_auth: action={}", decision.action);
        }

        let Some(agent) = self.kernel.get_agent(&decision.agent).await else {
            tracing::warn!(
                "agent_not_found: agent={} action={}",
                decision.agent,
                decision.action
            );
            bus.publish(
                topics::AGENT_NOT_FOUND,
                json!({
                    "agent": decision.agent,
                    "action": decision.action,
                }),
            )
            .await;
            return Ok(ExecutionOutcome::AgentUnavailable);
        };

        self.manage_lifecycle(&agent, understanding, decision).await;

        Ok(self.call_agent(&agent, decision).await)
    }

    /// Translate the decision and situational needs into lifecycle flags.
    ///
    /// The rules fire independently and in this order; a later notification
    /// rule overrides an earlier one.
    pub(super) async fn manage_lifecycle(
        &self,
        agent: &Arc<dyn Agent>,
        understanding: &Understanding,
        decision: &Decision,
    ) {
        let status = {
            let agent = Arc::clone(agent);
            with_recovery(move || Ok(agent.status()), "agent_status_probe").unwrap_or_default()
        };
        let paused = self
            .kernel
            .is_paused(&decision.agent)
            .await
            .unwrap_or(false);

        let mut update = LifecycleUpdate::default();

        if decision.priority.is_elevated() && !status.running && !paused {
            update = update.merge(
                LifecycleUpdate::start()
                    .with_reason(format!("{} priority decision", decision.priority.as_str())),
            );
        }
        if decision.priority == Priority::Low
            && status.running
            && (understanding.needs.contains(&Need::QuietMode)
                || understanding.needs.contains(&Need::BatterySave))
        {
            update = update.merge(LifecycleUpdate::pause().with_reason("conserving while idle"));
        }
        if understanding.app_state == AppState::Background && status.running {
            update =
                update.merge(LifecycleUpdate::pause().with_reason("app moved to the background"));
        }
        if understanding.app_state == AppState::Foreground
            && decision.priority != Priority::Low
            && paused
        {
            update =
                update.merge(LifecycleUpdate::resume().with_reason("app back in the foreground"));
        }

        if decision.priority == Priority::Critical {
            update = update.merge(LifecycleUpdate::notify(decision.priority));
        }
        if decision.priority == Priority::High && understanding.app_state != AppState::Foreground {
            update = update.merge(LifecycleUpdate::notify(decision.priority));
        }
        if understanding.needs.contains(&Need::UrgentAttention)
            || understanding.needs.contains(&Need::Sos)
        {
            update = update.merge(LifecycleUpdate::notify(Priority::Critical));
        }
        if understanding.needs.contains(&Need::QuietMode)
            || understanding.needs.contains(&Need::DoNotDisturb)
        {
            update = update.merge(LifecycleUpdate::silence());
        }

        if update.is_empty() {
            return;
        }
        if let Err(err) = self.kernel.update_lifecycle(&decision.agent, update).await {
            tracing::warn!(
                "lifecycle_update_failed: agent={} error={}",
                decision.agent,
                err
            );
        }
    }

    /// Run the action through the agent's breaker and the retry policy,
    /// with a hard per-call timeout underneath both.
    pub(super) async fn call_agent(
        &self,
        agent: &Arc<dyn Agent>,
        decision: &Decision,
    ) -> ExecutionOutcome {
        let breaker = self.agent_breakers.breaker(decision.agent.as_str());
        let guard = StageGuard::new(breaker, self.retry.clone());
        let timeout = self.config.action_timeout;

        let attempt = guard.run(|| {
            let agent = Arc::clone(agent);
            let action = decision.action.clone();
            let parameters = decision.parameters.clone();
            async move {
                match tokio::time::timeout(timeout, agent.execute_action(&action, &parameters))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "action '{}' exceeded {:?}",
                        action, timeout
                    ))),
                }
            }
        });

        match attempt.await {
            Ok(result) => {
                tracing::debug!(
                    "action_executed: agent={} action={}",
                    decision.agent,
                    decision.action
                );
                self.kernel
                    .bus()
                    .publish(
                        &topics::agent_response(&decision.agent),
                        json!({
                            "action": decision.action,
                            "result": result,
                        }),
                    )
                    .await;
                ExecutionOutcome::Completed { result }
            }
            Err(err) => {
                tracing::error!(
                    "action_failed: agent={} action={} error={}",
                    decision.agent,
                    decision.action,
                    err
                );
                self.kernel
                    .bus()
                    .publish(
                        &topics::agent_error(&decision.agent),
                        json!({
                            "action": decision.action,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                ExecutionOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CognitiveLoop, InputContext};
    use super::*;
    use crate::agent::AgentStatus;
    use crate::kernel::Kernel;
    use crate::types::{AgentId, Config, DecisionId, PolicyId, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct StubAgent {
        id: AgentId,
        running: AtomicBool,
        fail_message: Option<String>,
        hang: bool,
        calls: AtomicU32,
        starts: AtomicU32,
        pauses: AtomicU32,
    }

    impl StubAgent {
        fn new(id: &str, running: bool) -> Self {
            Self {
                id: AgentId::new(id),
                running: AtomicBool::new(running),
                fail_message: None,
                hang: false,
                calls: AtomicU32::new(0),
                starts: AtomicU32::new(0),
                pauses: AtomicU32::new(0),
            }
        }

        fn failing(id: &str, message: &str) -> Self {
            let mut stub = Self::new(id, true);
            stub.fail_message = Some(message.to_string());
            stub
        }

        fn hanging(id: &str) -> Self {
            let mut stub = Self::new(id, true);
            stub.hang = true;
            stub
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn id(&self) -> &AgentId {
            &self.id
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_action(
            &self,
            action: &str,
            _parameters: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            match &self.fail_message {
                Some(message) => Err(Error::execution(message.clone())),
                None => Ok(json!({ "done": action })),
            }
        }

        fn status(&self) -> AgentStatus {
            AgentStatus {
                running: self.running.load(Ordering::SeqCst),
                error: None,
            }
        }
    }

    fn decision_for(action: &str, agent: &str, priority: Priority) -> Decision {
        Decision {
            id: DecisionId::generate(),
            action: action.to_string(),
            agent: AgentId::new(agent),
            parameters: serde_json::Map::new(),
            confidence: 0.9,
            reasoning: "routed".to_string(),
            priority,
            timestamp: Utc::now(),
        }
    }

    fn neutral_understanding() -> Understanding {
        Understanding::fallback(&InputContext::default())
    }

    async fn setup() -> (Arc<Kernel>, Arc<CognitiveLoop>) {
        let kernel = Arc::new(Kernel::new(Config::default()));
        let pipeline = Arc::new(CognitiveLoop::new(Arc::clone(&kernel)));
        (kernel, pipeline)
    }

    // ===== Policy gate =====

    #[tokio::test]
    async fn test_denied_action_never_reaches_agent() {
        let (kernel, pipeline) = setup().await;
        kernel
            .policy()
            .map_keyword("send", &PolicyId::new("system_guard"));
        let stub = Arc::new(StubAgent::new("messenger", true));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;
        let (_sub, mut rx) = kernel.subscribe(topics::POLICY_DENIED).await.unwrap();

        let decision = decision_for("send_message", "messenger", Priority::Medium);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Denied { .. }));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_payment_waits_for_approval_by_default() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::new("payments", true));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;
        let (_sub, mut rx) = kernel.subscribe(topics::APPROVAL_REQUIRED).await.unwrap();

        let decision = decision_for("process_payment", "payments", Priority::High);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::AwaitingApproval { .. }));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_missing_agent_is_reported_not_thrown() {
        let (kernel, pipeline) = setup().await;
        let (_sub, mut rx) = kernel.subscribe(topics::AGENT_NOT_FOUND).await.unwrap();

        let decision = decision_for("navigate", "maps", Priority::Medium);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::AgentUnavailable));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.data["agent"], "maps");
    }

    // ===== Agent call =====

    #[tokio::test]
    async fn test_successful_call_starts_stopped_agent_and_completes() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::new("builder", false));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;
        let (_sub, mut rx) = kernel.subscribe("agent:builder:response").await.unwrap();

        let decision = decision_for("build_app", "builder", Priority::High);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.data["result"]["done"], "build_app");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_call_retries_then_reports_failure() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::failing("builder", "connection refused by device"));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;
        let (_sub, mut rx) = kernel.subscribe("agent:builder:error").await.unwrap();

        let decision = decision_for("build_app", "builder", Priority::Medium);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        // max_retries defaults to 3, so four total attempts.
        assert_eq!(stub.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_agent_is_cut_off_by_timeout() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::hanging("builder"));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;

        let decision = decision_for("build_app", "builder", Priority::Medium);
        let outcome = pipeline
            .execute_stage(&neutral_understanding(), &decision)
            .await
            .unwrap();

        // Timeouts are retryable, so every attempt runs into the cap.
        assert_eq!(stub.calls.load(Ordering::SeqCst), 4);
        match outcome {
            ExecutionOutcome::Failed { error } => assert!(error.contains("exceeded")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    // ===== Lifecycle steering =====

    #[tokio::test]
    async fn test_backgrounded_app_pauses_running_agent() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::new("files", true));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;

        let mut understanding = neutral_understanding();
        understanding.app_state = AppState::Background;
        let decision = decision_for("file_operation", "files", Priority::Medium);
        pipeline.execute_stage(&understanding, &decision).await.unwrap();

        assert_eq!(stub.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.is_paused(&AgentId::new("files")).await, Some(true));
    }

    #[tokio::test]
    async fn test_quiet_mode_silences_forced_notification() {
        let (kernel, pipeline) = setup().await;
        let stub = Arc::new(StubAgent::new("messenger", true));
        kernel.register_agent(Arc::clone(&stub) as Arc<dyn Agent>).await;

        let mut understanding = neutral_understanding();
        understanding.needs = vec![Need::Sos, Need::QuietMode];
        let decision = decision_for("send_message", "messenger", Priority::Medium);
        pipeline.execute_stage(&understanding, &decision).await.unwrap();

        let lifecycle = kernel
            .get_agent_lifecycle(&AgentId::new("messenger"))
            .await
            .unwrap();
        assert!(!lifecycle.needs_notification);
        assert_eq!(lifecycle.notification_priority, Priority::Critical);
    }
}

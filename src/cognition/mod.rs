//! Cognitive pipeline: understand -> reason -> decide -> execute -> learn.
//!
//! - `understand`: input validation, memory-enriched context, emotion and
//!   intent classification
//! - `reason`: urgency and complexity assessment
//! - `decide`: deterministic intent routing with priority adjustments
//! - `execute`: policy gate, lifecycle steering and the guarded agent call
//! - `learn`: interaction memory, pattern frequencies and learned events
//!
//! Each stage runs behind its own named circuit breaker and retry policy;
//! a failed understand/reason/decide stage is replaced by that stage's
//! fallback value so the pipeline always completes. [`CognitiveLoop::process_input`]
//! is the supervisory boundary: it catches anything unexpected, including
//! panics, and converts it into a low-confidence fallback decision, so it
//! never returns an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::bus::{topics, Event, Subscription};
use crate::kernel::recovery::with_recovery_async;
use crate::kernel::Kernel;
use crate::resilience::{BreakerRegistry, BreakerSnapshot, RetryMechanism, StageGuard};
use crate::types::Result;

pub mod decide;
pub mod execute;
pub mod learn;
pub mod reason;
pub mod understand;

pub use decide::Decision;
pub use execute::ExecutionOutcome;
pub use learn::{InteractionRecord, Sentiment};
pub use reason::{Assessment, Complexity, Urgency};
pub use understand::{Emotion, EmotionKind, Intent, IntentKind, Understanding};

use self::decide::{decide, fallback_decision};
use self::learn::PatternLog;
use self::reason::assess;
use self::understand::understand;

// =============================================================================
// Configuration
// =============================================================================

/// Bounds and knobs for the cognitive loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitionConfig {
    /// Decisions kept in the history log before FIFO eviction.
    pub decision_history_cap: usize,
    /// Distinct pattern keys tracked before oldest-key eviction.
    pub pattern_cap: usize,
    /// Memories pulled in to enrich each understanding.
    pub context_memories: usize,
    /// Interactions kept in the in-process log.
    pub interaction_log_cap: usize,
    /// Hard per-attempt cap on one agent call.
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,
}

impl Default for CognitionConfig {
    fn default() -> Self {
        Self {
            decision_history_cap: 1000,
            pattern_cap: 500,
            context_memories: 5,
            interaction_log_cap: 200,
            action_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Input model
// =============================================================================

/// Whether the companion UI is on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Foreground,
    Background,
}

/// A standing condition the user has declared, carried on each input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Need {
    QuietMode,
    BatterySave,
    DoNotDisturb,
    UrgentAttention,
    Sos,
}

/// Situational context accompanying an input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputContext {
    #[serde(default)]
    pub app_state: AppState,
    #[serde(default)]
    pub needs: Vec<Need>,
}

/// One raw input for the pipeline, from any channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub text: Option<String>,
    /// Opaque audio payload; presence alone marks the input usable.
    #[serde(default)]
    pub audio: Option<serde_json::Value>,
    /// Originating channel, filled from the topic when inputs arrive by bus.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub context: InputContext,
}

impl UserInput {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// An input with neither text nor an audio payload cannot be processed.
    pub fn has_signal(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty()) || self.audio.is_some()
    }
}

// =============================================================================
// CognitiveLoop
// =============================================================================

/// One guarded lane per pipeline stage.
#[derive(Debug)]
struct StageGuards {
    understanding: StageGuard,
    reasoning: StageGuard,
    decision: StageGuard,
    execution: StageGuard,
    learning: StageGuard,
}

impl StageGuards {
    fn new(breakers: &BreakerRegistry, retry: &RetryMechanism) -> Self {
        let guard = |stage: &str| StageGuard::new(breakers.breaker(stage), retry.clone());
        Self {
            understanding: guard("understanding"),
            reasoning: guard("reasoning"),
            decision: guard("decision"),
            execution: guard("execution"),
            learning: guard("learning"),
        }
    }
}

#[derive(Debug)]
struct PumpHandle {
    subscription: Subscription,
    task: JoinHandle<()>,
}

/// Counters and breaker states for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct CognitionStats {
    pub decisions_recorded: usize,
    pub patterns_tracked: usize,
    pub interactions_logged: usize,
    pub stage_breakers: Vec<BreakerSnapshot>,
    pub agent_breakers: Vec<BreakerSnapshot>,
}

/// The decision pipeline, bound to one kernel.
///
/// Shared behind an [`Arc`]; any number of inputs may be in flight at once.
/// The internal locks cover only short map and queue operations and are
/// never held across an await.
#[derive(Debug)]
pub struct CognitiveLoop {
    kernel: Arc<Kernel>,
    config: CognitionConfig,
    guards: StageGuards,
    stage_breakers: Arc<BreakerRegistry>,
    agent_breakers: Arc<BreakerRegistry>,
    retry: RetryMechanism,
    history: StdMutex<VecDeque<Decision>>,
    patterns: StdMutex<PatternLog>,
    interactions: StdMutex<VecDeque<InteractionRecord>>,
    pump_running: AtomicBool,
    pump: StdMutex<Option<PumpHandle>>,
}

impl CognitiveLoop {
    /// Wire the pipeline to a kernel, drawing breaker, retry and loop
    /// bounds from the kernel's configuration.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        let config = kernel.config().cognition.clone();
        let retry = RetryMechanism::new(kernel.config().retry.clone());
        let stage_breakers = Arc::new(BreakerRegistry::new(kernel.config().breaker.clone()));
        let agent_breakers = Arc::new(BreakerRegistry::new(kernel.config().breaker.clone()));
        let guards = StageGuards::new(&stage_breakers, &retry);
        let pattern_cap = config.pattern_cap;

        Self {
            kernel,
            config,
            guards,
            stage_breakers,
            agent_breakers,
            retry,
            history: StdMutex::new(VecDeque::new()),
            patterns: StdMutex::new(PatternLog::new(pattern_cap)),
            interactions: StdMutex::new(VecDeque::new()),
            pump_running: AtomicBool::new(false),
            pump: StdMutex::new(None),
        }
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    /// Run one input through all five stages.
    ///
    /// Never fails and never panics outward. Whatever goes wrong inside,
    /// the caller gets a decision back; the worst case is the fallback
    /// chat decision with the failure in its reasoning.
    pub async fn process_input(&self, input: UserInput) -> Decision {
        let outcome =
            with_recovery_async(|| self.run_pipeline(input), "cognitive_pipeline").await;
        match outcome {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!("pipeline_failed: error={}", err);
                let fallback = fallback_decision(format!("pipeline failure: {err}"));
                self.push_history(fallback.clone());
                fallback
            }
        }
    }

    async fn run_pipeline(&self, input: UserInput) -> Result<Decision> {
        let text = input.text.clone().unwrap_or_default();

        // Understand. Unusable input skips the guard entirely so user
        // mistakes never count against the stage breaker.
        let understanding = if !input.has_signal() {
            tracing::debug!("input_discarded: reason=\"neither text nor audio\"");
            Understanding::fallback(&input.context)
        } else {
            let memory = Arc::clone(self.kernel.memory());
            let limit = self.config.context_memories;
            let attempt = self
                .guards
                .understanding
                .run(|| {
                    let memory = Arc::clone(&memory);
                    let input = input.clone();
                    async move { understand(&input, &memory, limit) }
                })
                .await;
            match attempt {
                Ok(understanding) => understanding,
                Err(err) => {
                    tracing::warn!("understand_stage_failed: error={}", err);
                    Understanding::fallback(&input.context)
                }
            }
        };

        // Reason.
        let assessment = match self
            .guards
            .reasoning
            .run(|| {
                let understanding = understanding.clone();
                async move { Ok(assess(&understanding)) }
            })
            .await
        {
            Ok(assessment) => assessment,
            Err(err) => {
                tracing::warn!("reason_stage_failed: error={}", err);
                Assessment::fallback()
            }
        };

        // Decide. Recorded before execution so the history holds every
        // decision made, even when acting on it fails.
        let decision = match self
            .guards
            .decision
            .run(|| {
                let understanding = understanding.clone();
                let assessment = assessment;
                async move { Ok(decide(&understanding, &assessment)) }
            })
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!("decide_stage_failed: error={}", err);
                fallback_decision(format!("decision stage failed: {err}"))
            }
        };
        self.push_history(decision.clone());
        tracing::info!(
            "decision_made: action={}, agent={}, priority={}, confidence={:.2}",
            decision.action,
            decision.agent,
            decision.priority.as_str(),
            decision.confidence
        );

        // Execute. Blocked and degraded paths are ordinary outcomes; only a
        // broken stage surfaces as an error here.
        let outcome = match self
            .guards
            .execution
            .run(|| {
                let understanding = understanding.clone();
                let decision = decision.clone();
                async move { self.execute_stage(&understanding, &decision).await }
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("execute_stage_failed: error={}", err);
                ExecutionOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        // Learn. Failures are logged and swallowed; a broken learn stage
        // must not cost the caller their decision.
        let learned = self
            .guards
            .learning
            .run(|| {
                let understanding = understanding.clone();
                let decision = decision.clone();
                let text = text.clone();
                let succeeded = outcome.succeeded();
                async move {
                    self.learn_stage(&text, &understanding, &decision, succeeded)
                        .await
                }
            })
            .await;
        if let Err(err) = learned {
            tracing::warn!("learn_stage_failed: error={}", err);
        }

        Ok(decision)
    }

    fn push_history(&self, decision: Decision) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(decision);
        while history.len() > self.config.decision_history_cap {
            history.pop_front();
        }
    }

    // =========================================================================
    // Input pump
    // =========================================================================

    /// Subscribe to `input:*` and feed matching events through the
    /// pipeline until [`stop_input_pump`](Self::stop_input_pump) is called.
    ///
    /// Event data is deserialized as a [`UserInput`]; when it does not name
    /// a source, the topic's second segment is used. Malformed payloads are
    /// logged and skipped.
    pub async fn start_input_pump(self: &Arc<Self>) -> Result<()> {
        if self.pump_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("input_pump_already_running");
            return Ok(());
        }

        let (subscription, mut rx) = match self.kernel.subscribe(topics::INPUT_PATTERN).await {
            Ok(pair) => pair,
            Err(err) => {
                self.pump_running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match input_from_event(&event) {
                    Some(input) => {
                        pipeline.process_input(input).await;
                    }
                    None => {
                        tracing::warn!("input_event_malformed: type={}", event.event_type);
                    }
                }
            }
            tracing::debug!("input_pump_drained");
        });

        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        *pump = Some(PumpHandle { subscription, task });
        tracing::info!("input_pump_started: pattern={}", topics::INPUT_PATTERN);
        Ok(())
    }

    /// Unsubscribe from input events and wait for the pump task to drain.
    pub async fn stop_input_pump(&self) {
        if !self.pump_running.swap(false, Ordering::SeqCst) {
            return;
        }
        let taken = {
            let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
            pump.take()
        };
        let Some(pump) = taken else { return };

        if let Err(err) = self.kernel.bus().unsubscribe(&pump.subscription).await {
            tracing::warn!("input_pump_unsubscribe_failed: error={}", err);
        }
        if let Err(err) = pump.task.await {
            tracing::warn!("input_pump_task_failed: error={}", err);
        }
        tracing::info!("input_pump_stopped");
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The most recent decisions, newest first.
    pub fn get_decision_history(&self, limit: usize) -> Vec<Decision> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Observed `intent:action` patterns, most frequent first.
    pub fn get_improvement_patterns(&self) -> Vec<(String, u64)> {
        let patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns.snapshot()
    }

    /// The most recent interactions, newest first.
    pub fn recent_interactions(&self, limit: usize) -> Vec<InteractionRecord> {
        let interactions = self
            .interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        interactions.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_stats(&self) -> CognitionStats {
        CognitionStats {
            decisions_recorded: self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            patterns_tracked: self
                .patterns
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            interactions_logged: self
                .interactions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            stage_breakers: self.stage_breakers.snapshots(),
            agent_breakers: self.agent_breakers.snapshots(),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }
}

/// Decode a bus event into pipeline input, deriving the source channel
/// from the topic when the payload does not carry one.
fn input_from_event(event: &Event) -> Option<UserInput> {
    let mut input: UserInput = serde_json::from_value(event.data.clone()).ok()?;
    if input.source.is_none() {
        input.source = event
            .event_type
            .split_once(':')
            .map(|(_, rest)| rest.to_string());
    }
    Some(input)
}

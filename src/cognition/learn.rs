//! Learn stage: interaction memory, pattern frequencies and sentiment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::PoisonError;

use crate::bus::topics;
use crate::memory::MemoryType;
use crate::types::{AgentId, Priority, Result};

use super::decide::Decision;
use super::understand::{EmotionKind, Understanding};
use super::CognitiveLoop;

// =============================================================================
// Sentiment
// =============================================================================

/// Coarse polarity stored with each interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn from_emotion(kind: EmotionKind) -> Self {
        match kind {
            EmotionKind::Happy => Sentiment::Positive,
            EmotionKind::Sad
            | EmotionKind::Urgent
            | EmotionKind::Concerned
            | EmotionKind::Frustrated => Sentiment::Negative,
            EmotionKind::Neutral => Sentiment::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }
}

// =============================================================================
// Pattern log
// =============================================================================

/// Bounded frequency map over `intent:action` keys.
///
/// Insertion order is tracked so an overflow evicts the key that has been
/// in the log longest, not the least frequent one.
#[derive(Debug)]
pub struct PatternLog {
    counts: HashMap<String, u64>,
    order: VecDeque<String>,
    cap: usize,
}

impl PatternLog {
    pub fn new(cap: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Bump `key`, returning its new count.
    pub fn record(&mut self, key: impl Into<String>) -> u64 {
        let key = key.into();
        if let Some(count) = self.counts.get_mut(&key) {
            *count += 1;
            return *count;
        }

        self.counts.insert(key.clone(), 1);
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.counts.remove(&oldest);
            }
        }
        1
    }

    /// Keys with counts, most frequent first.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// One processed input as the learn stage remembers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub input: String,
    pub action: String,
    pub agent: AgentId,
    pub sentiment: Sentiment,
    pub succeeded: bool,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Stage
// =============================================================================

impl CognitiveLoop {
    /// Persist what this interaction taught us.
    ///
    /// Failed executions are remembered slightly harder than successes so
    /// the relevance scorer resurfaces them when a similar input returns.
    pub(super) async fn learn_stage(
        &self,
        input_text: &str,
        understanding: &Understanding,
        decision: &Decision,
        succeeded: bool,
    ) -> Result<()> {
        let sentiment = Sentiment::from_emotion(understanding.emotion.kind);

        let mut importance: f64 = match decision.priority {
            Priority::Critical => 0.8,
            Priority::High => 0.7,
            Priority::Low | Priority::Medium => 0.5,
        };
        if !succeeded {
            importance = (importance + 0.1).min(1.0);
        }

        self.kernel.memory().remember(
            MemoryType::Interaction,
            json!({
                "text": input_text,
                "action": decision.action,
                "agent": decision.agent,
                "emotion": understanding.emotion.kind.as_str(),
                "sentiment": sentiment,
                "succeeded": succeeded,
            }),
            importance,
            vec![
                decision.action.clone(),
                understanding.intent.kind.as_str().to_string(),
                sentiment.as_str().to_string(),
            ],
        );

        let pattern = format!(
            "{}:{}",
            understanding.intent.kind.as_str(),
            decision.action
        );
        let frequency = {
            let mut patterns = self
                .patterns
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            patterns.record(pattern.clone())
        };

        {
            let mut interactions = self
                .interactions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            interactions.push_back(InteractionRecord {
                input: input_text.to_string(),
                action: decision.action.clone(),
                agent: decision.agent.clone(),
                sentiment,
                succeeded,
                timestamp: Utc::now(),
            });
            while interactions.len() > self.config.interaction_log_cap {
                interactions.pop_front();
            }
        }

        self.kernel
            .bus()
            .publish(
                topics::LEARNED,
                json!({
                    "pattern": pattern,
                    "frequency": frequency,
                    "sentiment": sentiment,
                }),
            )
            .await;

        tracing::debug!(
            "interaction_learned: pattern={}, frequency={}, importance={}",
            pattern,
            frequency,
            importance
        );

        Ok(())
    }
}

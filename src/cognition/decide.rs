//! Decide stage: deterministic intent routing.
//!
//! One table entry per intent kind; the understood emotion and the declared
//! needs adjust the routed priority afterwards, in a fixed order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, DecisionId, Priority};

use super::reason::Assessment;
use super::understand::{EmotionKind, IntentKind, Understanding};
use super::Need;

/// The structured outcome of the pipeline: which agent does what, and how
/// urgently. Immutable once made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub action: String,
    pub agent: AgentId,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// 0..=1, how sure the pipeline is that this is the right move.
    pub confidence: f64,
    pub reasoning: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

struct Route {
    action: &'static str,
    agent: &'static str,
    confidence: f64,
    priority: Priority,
    note: &'static str,
}

fn route_for(kind: IntentKind) -> Route {
    match kind {
        IntentKind::BuildApp => Route {
            action: "build_app",
            agent: "builder",
            confidence: 0.9,
            priority: Priority::High,
            note: "build request routed to the app builder",
        },
        IntentKind::SecurityAlert => Route {
            action: "security_scan",
            agent: "guardian",
            confidence: 0.95,
            priority: Priority::Critical,
            note: "possible threat routed to the guardian",
        },
        IntentKind::VoiceCommand => Route {
            action: "speak",
            agent: "voice",
            confidence: 0.85,
            priority: Priority::High,
            note: "spoken response requested",
        },
        IntentKind::FileOperation => Route {
            action: "file_operation",
            agent: "files",
            confidence: 0.85,
            priority: Priority::Medium,
            note: "file work routed to the file manager",
        },
        IntentKind::SendMessage => Route {
            action: "send_message",
            agent: "messenger",
            confidence: 0.85,
            priority: Priority::Medium,
            note: "outgoing message routed to the messenger",
        },
        IntentKind::Navigate => Route {
            action: "navigate",
            agent: "maps",
            confidence: 0.8,
            priority: Priority::Medium,
            note: "route planning handed to maps",
        },
        IntentKind::Payment => Route {
            action: "process_payment",
            agent: "payments",
            confidence: 0.85,
            priority: Priority::High,
            note: "payment handed to the payments handler",
        },
        IntentKind::Chat => Route {
            action: "ai_chat",
            agent: "assistant",
            confidence: 0.7,
            priority: Priority::Medium,
            note: "conversational input handled as chat",
        },
    }
}

/// Route an understood input to a concrete decision.
pub fn decide(understanding: &Understanding, assessment: &Assessment) -> Decision {
    // An unclassified, low-confidence input is not worth routing anywhere.
    if understanding.intent.kind == IntentKind::Chat && understanding.intent.confidence < 0.5 {
        return fallback_decision("input too vague to route; defaulting to chat");
    }

    let route = route_for(understanding.intent.kind);
    let mut decision = Decision {
        id: DecisionId::generate(),
        action: route.action.to_string(),
        agent: AgentId::new(route.agent),
        parameters: understanding.intent.parameters.clone(),
        confidence: route.confidence,
        reasoning: format!(
            "{} (urgency {}, complexity {})",
            route.note,
            assessment.urgency.as_str(),
            assessment.complexity.as_str()
        ),
        priority: route.priority,
        timestamp: Utc::now(),
    };

    // Adjustments apply in this order; quiet mode wins over an emotional
    // bump when both fire.
    if matches!(
        understanding.emotion.kind,
        EmotionKind::Concerned | EmotionKind::Urgent
    ) {
        decision.priority = Priority::High;
    }
    if understanding.needs.contains(&Need::QuietMode) {
        decision.priority = Priority::Low;
        decision.reasoning.push_str(" (quiet mode active)");
    }

    decision
}

/// The decision of last resort: hand the input to chat, quietly.
pub fn fallback_decision(reason: impl Into<String>) -> Decision {
    Decision {
        id: DecisionId::generate(),
        action: "ai_chat".to_string(),
        agent: AgentId::new("assistant"),
        parameters: serde_json::Map::new(),
        confidence: 0.3,
        reasoning: reason.into(),
        priority: Priority::Low,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::InputContext;
    use super::*;
    use crate::cognition::understand::{Emotion, Intent};

    fn understanding(
        intent: IntentKind,
        confidence: f64,
        emotion: EmotionKind,
        needs: Vec<Need>,
    ) -> Understanding {
        let mut base = Understanding::fallback(&InputContext::default());
        base.intent = Intent {
            kind: intent,
            confidence,
            parameters: serde_json::Map::new(),
        };
        base.emotion = Emotion {
            kind: emotion,
            intensity: 0.8,
            confidence: 0.8,
        };
        base.needs = needs;
        base
    }

    #[test]
    fn test_build_intent_routes_to_builder() {
        let u = understanding(IntentKind::BuildApp, 0.9, EmotionKind::Neutral, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.action, "build_app");
        assert_eq!(decision.agent.as_str(), "builder");
        assert_eq!(decision.priority, Priority::High);
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn test_security_alert_is_critical() {
        let u = understanding(IntentKind::SecurityAlert, 0.95, EmotionKind::Neutral, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.agent.as_str(), "guardian");
        assert_eq!(decision.priority, Priority::Critical);
    }

    #[test]
    fn test_low_confidence_chat_falls_back() {
        let u = understanding(IntentKind::Chat, 0.3, EmotionKind::Neutral, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.action, "ai_chat");
        assert_eq!(decision.priority, Priority::Low);
        assert_eq!(decision.confidence, 0.3);
    }

    #[test]
    fn test_normal_chat_keeps_table_confidence() {
        let u = understanding(IntentKind::Chat, 0.5, EmotionKind::Neutral, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.action, "ai_chat");
        assert_eq!(decision.confidence, 0.7);
        assert_eq!(decision.priority, Priority::Medium);
    }

    #[test]
    fn test_concerned_emotion_forces_high_priority() {
        let u = understanding(IntentKind::SendMessage, 0.85, EmotionKind::Concerned, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.priority, Priority::High);
    }

    #[test]
    fn test_urgent_emotion_caps_critical_routes_at_high() {
        // The emotional adjustment overwrites rather than raises, so even a
        // critical route lands on high when the wording sounds urgent.
        let u = understanding(IntentKind::SecurityAlert, 0.95, EmotionKind::Urgent, vec![]);
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.priority, Priority::High);
    }

    #[test]
    fn test_quiet_mode_wins_over_emotional_bump() {
        let u = understanding(
            IntentKind::SendMessage,
            0.85,
            EmotionKind::Urgent,
            vec![Need::QuietMode],
        );
        let decision = decide(&u, &Assessment::fallback());
        assert_eq!(decision.priority, Priority::Low);
        assert!(decision.reasoning.contains("quiet mode active"));
    }

    #[test]
    fn test_reasoning_mentions_assessment() {
        let u = understanding(IntentKind::BuildApp, 0.9, EmotionKind::Neutral, vec![]);
        let assessment = Assessment {
            urgency: super::super::Urgency::Medium,
            complexity: super::super::Complexity::Complex,
        };
        let decision = decide(&u, &assessment);
        assert!(decision.reasoning.contains("complexity complex"));
    }
}

//! Reason stage: urgency and complexity assessment.

use serde::{Deserialize, Serialize};

use super::understand::{EmotionKind, IntentKind, Understanding};

/// How soon the decision should be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }
}

/// How involved acting on the intent is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        }
    }
}

/// Output of the reason stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub urgency: Urgency,
    pub complexity: Complexity,
}

impl Assessment {
    /// Conservative stand-in when the stage fails.
    pub fn fallback() -> Self {
        Self {
            urgency: Urgency::Medium,
            complexity: Complexity::Simple,
        }
    }
}

/// Assess how urgent and how involved the understood input is.
pub fn assess(understanding: &Understanding) -> Assessment {
    let pressing_emotion = matches!(
        understanding.emotion.kind,
        EmotionKind::Urgent | EmotionKind::Concerned
    );
    let pressing_intent = matches!(
        understanding.intent.kind,
        IntentKind::SecurityAlert | IntentKind::VoiceCommand
    );
    let urgency = if pressing_emotion || pressing_intent {
        Urgency::High
    } else {
        Urgency::Medium
    };

    let complexity = match understanding.intent.kind {
        IntentKind::BuildApp => Complexity::Complex,
        IntentKind::FileOperation => Complexity::Medium,
        _ => Complexity::Simple,
    };

    Assessment {
        urgency,
        complexity,
    }
}

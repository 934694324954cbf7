//! Understand stage: input validation, memory enrichment and
//! emotion/intent classification.
//!
//! Classification is ordered lookup, first match wins. The cue tables mix
//! Arabic and English surface forms because inputs arrive in either
//! language, often both in one sentence.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::memory::{MemoryEngine, MemoryRecord};
use crate::types::{Error, Result};

use super::{AppState, InputContext, UserInput};

// =============================================================================
// Emotion
// =============================================================================

/// Coarse emotional read of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionKind {
    Happy,
    Sad,
    Urgent,
    Concerned,
    Frustrated,
    Neutral,
}

impl EmotionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionKind::Happy => "happy",
            EmotionKind::Sad => "sad",
            EmotionKind::Urgent => "urgent",
            EmotionKind::Concerned => "concerned",
            EmotionKind::Frustrated => "frustrated",
            EmotionKind::Neutral => "neutral",
        }
    }
}

/// A detected emotion with how strongly and how confidently it registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emotion {
    pub kind: EmotionKind,
    /// 0..=1, how intense the matched cue reads.
    pub intensity: f64,
    pub confidence: f64,
}

impl Emotion {
    pub fn neutral() -> Self {
        Self {
            kind: EmotionKind::Neutral,
            intensity: 0.5,
            confidence: 0.5,
        }
    }
}

/// Ordered cue table; the first category with a keyword hit wins, so the
/// high-stakes categories sit on top.
const EMOTION_RULES: &[(EmotionKind, f64, &[&str])] = &[
    (
        EmotionKind::Urgent,
        0.9,
        &["عاجل", "طوارئ", "بسرعة", "فورا", "urgent", "emergency", "asap", "right now"],
    ),
    (
        EmotionKind::Concerned,
        0.7,
        &["قلق", "خايف", "مشكلة", "worried", "concerned", "problem", "afraid"],
    ),
    (
        EmotionKind::Happy,
        0.8,
        &["سعيد", "ممتاز", "رائع", "شكرا", "happy", "great", "awesome", "thanks"],
    ),
    (
        EmotionKind::Sad,
        0.7,
        &["حزين", "زعلان", "sad", "unhappy", "upset"],
    ),
    (
        EmotionKind::Frustrated,
        0.8,
        &["محبط", "غضبان", "زهقت", "frustrated", "angry", "annoyed"],
    ),
];

/// Keyword-category lookup over the lower-cased input.
pub fn classify_emotion(text: &str) -> Emotion {
    let lower = text.to_lowercase();
    for (kind, intensity, keywords) in EMOTION_RULES {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return Emotion {
                kind: *kind,
                intensity: *intensity,
                confidence: 0.8,
            };
        }
    }
    Emotion::neutral()
}

// =============================================================================
// Intent
// =============================================================================

/// What the user is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    BuildApp,
    SecurityAlert,
    VoiceCommand,
    FileOperation,
    SendMessage,
    Navigate,
    Payment,
    Chat,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::BuildApp => "build_app",
            IntentKind::SecurityAlert => "security_alert",
            IntentKind::VoiceCommand => "voice_command",
            IntentKind::FileOperation => "file_operation",
            IntentKind::SendMessage => "send_message",
            IntentKind::Navigate => "navigate",
            IntentKind::Payment => "payment",
            IntentKind::Chat => "chat",
        }
    }
}

/// A classified intent plus any parameters extracted for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

struct IntentRule {
    kind: IntentKind,
    confidence: f64,
    patterns: Vec<Regex>,
}

/// Ordered pattern table, most specific categories first. `chat` is the
/// fallthrough and has no entry here.
static INTENT_RULES: Lazy<Vec<IntentRule>> = Lazy::new(|| {
    let rule = |kind, confidence, patterns: &[&str]| IntentRule {
        kind,
        confidence,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("static intent pattern"))
            .collect(),
    };

    vec![
        rule(
            IntentKind::BuildApp,
            0.9,
            &[
                r"(ابني|اصنع|أنشئ|سوي)\s+تطبيق",
                r"(?i)\b(build|create|make)\s+(me\s+)?(an?\s+)?(new\s+)?app",
            ],
        ),
        rule(
            IntentKind::SecurityAlert,
            0.95,
            &[
                r"اختراق|تهديد|فيروس|مخترق",
                r"(?i)\b(hack(ed|er)?|threat|virus|malware|breach|intrusion)\b",
            ],
        ),
        rule(
            IntentKind::VoiceCommand,
            0.85,
            &[
                r"قول|اقرأ|اسمع|انطق",
                r"(?i)\b(say|speak|announce)\b",
                r"(?i)\bread\s+(this\s+|it\s+)?aloud\b",
            ],
        ),
        rule(
            IntentKind::FileOperation,
            0.85,
            &[
                r"ملف|مجلد|مستند|احفظ",
                r"(?i)\b(file|folder|document|save|upload|download)\b",
            ],
        ),
        rule(
            IntentKind::SendMessage,
            0.85,
            &[
                r"ارسل|أرسل|رسالة|واتساب",
                r"(?i)\b(send|message|text|whatsapp)\b",
            ],
        ),
        rule(
            IntentKind::Navigate,
            0.8,
            &[
                r"وديني|خذني|طريق|اتجاهات",
                r"(?i)\b(navigate|directions|route)\b",
                r"(?i)\btake\s+me\s+to\b",
            ],
        ),
        rule(
            IntentKind::Payment,
            0.85,
            &[
                r"ادفع|فلوس|فاتورة|حوالة|تحويل",
                r"(?i)\b(pay(ment)?|transfer|invoice|bill)\b",
            ],
        ),
    ]
});

/// Ordered regex lookup; unmatched input is conversational.
pub fn classify_intent(text: &str) -> Intent {
    for rule in INTENT_RULES.iter() {
        if rule.patterns.iter().any(|p| p.is_match(text)) {
            let mut parameters = serde_json::Map::new();
            if rule.kind == IntentKind::BuildApp {
                if let Some(name) = extract_app_name(text) {
                    parameters.insert("app_name".into(), serde_json::Value::String(name));
                }
            }
            return Intent {
                kind: rule.kind,
                confidence: rule.confidence,
                parameters,
            };
        }
    }

    let mut parameters = serde_json::Map::new();
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        parameters.insert(
            "message".into(),
            serde_json::Value::String(trimmed.to_string()),
        );
    }
    Intent {
        kind: IntentKind::Chat,
        confidence: 0.5,
        parameters,
    }
}

/// Whatever follows the app word is the requested name, minus filler.
fn extract_app_name(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let marker = tokens.iter().position(|t| {
        let lower = t.to_lowercase();
        lower == "تطبيق" || lower == "app" || lower == "application"
    })?;

    let mut rest = &tokens[marker + 1..];
    while let Some(first) = rest.first() {
        let lower = first.to_lowercase();
        if lower == "called" || lower == "named" || lower == "اسمه" {
            rest = &rest[1..];
        } else {
            break;
        }
    }

    if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    }
}

// =============================================================================
// Understanding
// =============================================================================

/// Everything the pipeline extracted from one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Understanding {
    /// Memories scored relevant to the input text, most relevant first.
    pub context: Vec<MemoryRecord>,
    pub emotion: Emotion,
    pub intent: Intent,
    pub situation: String,
    pub needs: Vec<super::Need>,
    pub app_state: AppState,
}

impl Understanding {
    /// Neutral stand-in used when the input is unusable or the stage fails.
    /// The low intent confidence steers the decide stage to its fallback.
    pub fn fallback(context: &InputContext) -> Self {
        Self {
            context: Vec::new(),
            emotion: Emotion::neutral(),
            intent: Intent {
                kind: IntentKind::Chat,
                confidence: 0.3,
                parameters: serde_json::Map::new(),
            },
            situation: "no usable input".to_string(),
            needs: context.needs.clone(),
            app_state: context.app_state,
        }
    }
}

/// Run the understand stage over one input.
///
/// Rejects input with neither text nor audio; classification itself always
/// produces a value, falling through to neutral/chat.
pub fn understand(
    input: &UserInput,
    memory: &MemoryEngine,
    context_limit: usize,
) -> Result<Understanding> {
    let text = match input.text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ if input.audio.is_some() => String::new(),
        _ => return Err(Error::validation("input carries neither text nor audio")),
    };

    let context = if text.is_empty() {
        Vec::new()
    } else {
        memory.get_relevant_context(&text, context_limit)
    };
    let emotion = classify_emotion(&text);
    let intent = classify_intent(&text);
    let situation = describe_situation(input, &intent);

    tracing::debug!(
        "input_understood: intent={}, emotion={}, context_memories={}",
        intent.kind.as_str(),
        emotion.kind.as_str(),
        context.len()
    );

    Ok(Understanding {
        context,
        emotion,
        intent,
        situation,
        needs: input.context.needs.clone(),
        app_state: input.context.app_state,
    })
}

fn describe_situation(input: &UserInput, intent: &Intent) -> String {
    let channel = match (&input.text, &input.audio) {
        (Some(_), Some(_)) => "text and audio",
        (Some(_), None) => "text",
        _ => "audio",
    };
    let place = match input.context.app_state {
        AppState::Foreground => "foregrounded",
        AppState::Background => "backgrounded",
    };
    match &input.source {
        Some(source) => format!(
            "{} input from {} ({}) while the app is {}",
            channel,
            source,
            intent.kind.as_str(),
            place
        ),
        None => format!(
            "{} input ({}) while the app is {}",
            channel,
            intent.kind.as_str(),
            place
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Need;
    use super::*;
    use crate::memory::{MemoryConfig, MemoryType};
    use serde_json::json;

    fn text_input(text: &str) -> UserInput {
        UserInput::from_text(text)
    }

    // ===== Classification =====

    #[test]
    fn test_arabic_build_request_classifies_build_app() {
        let intent = classify_intent("ابني تطبيق جديد");
        assert_eq!(intent.kind, IntentKind::BuildApp);
        assert_eq!(intent.confidence, 0.9);
        assert_eq!(
            intent.parameters.get("app_name").and_then(|v| v.as_str()),
            Some("جديد")
        );
    }

    #[test]
    fn test_english_build_request_strips_name_filler() {
        let intent = classify_intent("build me an app called TaskMaster");
        assert_eq!(intent.kind, IntentKind::BuildApp);
        assert_eq!(
            intent.parameters.get("app_name").and_then(|v| v.as_str()),
            Some("TaskMaster")
        );
    }

    #[test]
    fn test_first_emotion_category_wins() {
        // Both urgent and happy cues present; urgent sits first in the table.
        let emotion = classify_emotion("عاجل وانا سعيد");
        assert_eq!(emotion.kind, EmotionKind::Urgent);
        assert_eq!(emotion.intensity, 0.9);
        assert_eq!(emotion.confidence, 0.8);
    }

    #[test]
    fn test_unmatched_input_defaults_to_neutral_chat() {
        let emotion = classify_emotion("xyzzy plugh");
        assert_eq!(emotion.kind, EmotionKind::Neutral);
        assert_eq!(emotion.intensity, 0.5);
        assert_eq!(emotion.confidence, 0.5);

        let intent = classify_intent("xyzzy plugh");
        assert_eq!(intent.kind, IntentKind::Chat);
        assert_eq!(intent.confidence, 0.5);
        assert_eq!(
            intent.parameters.get("message").and_then(|v| v.as_str()),
            Some("xyzzy plugh")
        );
    }

    #[test]
    fn test_payment_words_route_to_payment() {
        assert_eq!(classify_intent("pay my electricity bill").kind, IntentKind::Payment);
        assert_eq!(classify_intent("ادفع الفاتورة").kind, IntentKind::Payment);
    }

    // ===== understand =====

    #[test]
    fn test_empty_input_is_rejected() {
        let memory = MemoryEngine::new(MemoryConfig::default());
        let err = understand(&UserInput::default(), &memory, 5);
        assert!(err.is_err());

        let whitespace = text_input("   ");
        assert!(understand(&whitespace, &memory, 5).is_err());
    }

    #[test]
    fn test_audio_only_input_is_accepted() {
        let memory = MemoryEngine::new(MemoryConfig::default());
        let input = UserInput {
            audio: Some(json!({"format": "opus", "bytes": 512})),
            ..Default::default()
        };
        let understanding = understand(&input, &memory, 5).unwrap();
        assert_eq!(understanding.intent.kind, IntentKind::Chat);
        assert_eq!(understanding.emotion.kind, EmotionKind::Neutral);
        assert!(understanding.context.is_empty());
    }

    #[test]
    fn test_context_is_pulled_from_memory() {
        let memory = MemoryEngine::new(MemoryConfig::default());
        memory.remember(
            MemoryType::Interaction,
            json!({"text": "build an expense tracker app", "action": "build_app"}),
            0.9,
            vec!["build_app".to_string()],
        );

        let input = text_input("build app for expenses");
        let understanding = understand(&input, &memory, 5).unwrap();
        assert!(!understanding.context.is_empty());
    }

    #[test]
    fn test_needs_and_app_state_carry_through() {
        let memory = MemoryEngine::new(MemoryConfig::default());
        let input = UserInput {
            text: Some("hello".to_string()),
            context: super::super::InputContext {
                app_state: AppState::Background,
                needs: vec![Need::QuietMode],
            },
            ..Default::default()
        };
        let understanding = understand(&input, &memory, 5).unwrap();
        assert_eq!(understanding.app_state, AppState::Background);
        assert_eq!(understanding.needs, vec![Need::QuietMode]);
    }

    #[test]
    fn test_fallback_keeps_declared_needs() {
        let context = InputContext {
            app_state: AppState::Foreground,
            needs: vec![Need::DoNotDisturb],
        };
        let fallback = Understanding::fallback(&context);
        assert_eq!(fallback.intent.kind, IntentKind::Chat);
        assert_eq!(fallback.intent.confidence, 0.3);
        assert_eq!(fallback.emotion.kind, EmotionKind::Neutral);
        assert_eq!(fallback.needs, vec![Need::DoNotDisturb]);
    }
}

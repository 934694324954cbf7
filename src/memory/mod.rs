//! Two-tier memory engine.
//!
//! Short-term memory is a sliding window (1 hour, capped at 100 records,
//! oldest-timestamp eviction); records important enough (>= 0.7 at write
//! time) are additionally kept in the unbounded long-term tier. A separate
//! working-memory map holds transient key/value state with FIFO eviction,
//! cleared explicitly between sessions.
//!
//! `get_relevant_context` is the read path the understand stage uses:
//! memories are scored by action match, keyword overlap and emotion match,
//! weighted by importance, then re-sorted with a recency component.

mod cleanup;

pub use cleanup::MemoryCleanup;

use crate::types::MemoryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Memory engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Age after which short-term records expire.
    #[serde(with = "humantime_serde")]
    pub short_term_window: Duration,
    /// Maximum short-term records before oldest-timestamp eviction.
    pub short_term_cap: usize,
    /// Maximum working-memory keys before FIFO eviction.
    pub working_cap: usize,
    /// Importance at or above which a record also reaches long-term.
    pub long_term_threshold: f64,
    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: Duration::from_secs(3600),
            short_term_cap: 100,
            working_cap: 50,
            long_term_threshold: 0.7,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// What kind of fact a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Interaction,
    Preference,
    Pattern,
    Learning,
}

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// Free-form payload; the scorer reads `text`, `action` and `emotion`
    /// keys when present.
    pub content: serde_json::Value,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// 0..=1, decides long-term retention and weights relevance.
    pub importance: f64,
    pub accessed: u64,
    pub last_accessed: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl MemoryRecord {
    pub fn new(memory_type: MemoryType, content: serde_json::Value, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::generate(),
            memory_type,
            content,
            context: serde_json::json!({}),
            timestamp: now,
            importance: importance.clamp(0.0, 1.0),
            accessed: 0,
            last_accessed: now,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Statistics about memory usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub long_term: usize,
    pub working: usize,
    pub cap_evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// MemoryEngine
// =============================================================================

#[derive(Debug, Default)]
struct WorkingMemory {
    values: HashMap<String, serde_json::Value>,
    /// Insertion order for FIFO eviction; re-setting a key keeps its slot.
    order: VecDeque<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    short_term: Vec<MemoryRecord>,
    long_term: Vec<MemoryRecord>,
    working: WorkingMemory,
    cap_evictions: u64,
    expirations: u64,
}

/// Bounded short-term plus gated long-term store.
///
/// All operations are synchronous in-memory mutations; the engine is shared
/// behind an `Arc` between the kernel, the pipeline and the sweeper.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    config: MemoryConfig,
    state: RwLock<MemoryState>,
}

impl MemoryEngine {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MemoryState::default()),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Record a new memory stamped with the current time.
    pub fn remember(
        &self,
        memory_type: MemoryType,
        content: serde_json::Value,
        importance: f64,
        tags: Vec<String>,
    ) -> MemoryId {
        let record = MemoryRecord::new(memory_type, content, importance).with_tags(tags);
        let id = record.id.clone();
        self.remember_record(record);
        id
    }

    /// Insert a fully-formed record, evicting the oldest short-term entry
    /// when the cap is exceeded.
    pub fn remember_record(&self, record: MemoryRecord) {
        let mut state = self.lock_mut();

        if record.importance >= self.config.long_term_threshold {
            state.long_term.push(record.clone());
        }
        state.short_term.push(record);

        while state.short_term.len() > self.config.short_term_cap {
            if let Some(oldest) = state
                .short_term
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(i, _)| i)
            {
                let evicted = state.short_term.swap_remove(oldest);
                state.cap_evictions += 1;
                tracing::debug!(
                    "short_term_evicted: id={} age_s={}",
                    evicted.id,
                    (Utc::now() - evicted.timestamp).num_seconds()
                );
            }
        }
    }

    /// Persist a user preference (long-term by construction).
    pub fn store_preference(&self, key: impl Into<String>, value: serde_json::Value) -> MemoryId {
        let key = key.into();
        self.remember(
            MemoryType::Preference,
            serde_json::json!({ "key": key, "value": value }),
            0.8,
            vec!["preference".to_string()],
        )
    }

    /// Persist an insight the learn stage extracted (long-term by construction).
    pub fn record_learning(&self, subject: &str, insight: serde_json::Value) -> MemoryId {
        self.remember(
            MemoryType::Learning,
            serde_json::json!({ "subject": subject, "insight": insight }),
            0.8,
            vec!["learning".to_string()],
        )
    }

    // =========================================================================
    // Relevance Queries
    // =========================================================================

    /// The top `limit` memories relevant to `query`.
    ///
    /// Primary score: action substring (0.4) + keyword overlap fraction
    /// (0.4) + emotion match (0.2), multiplied by importance. Results are
    /// re-sorted by `score*0.7 + recency*0.3` and their access metadata is
    /// bumped.
    pub fn get_relevant_context(&self, query: &str, limit: usize) -> Vec<MemoryRecord> {
        let mut state = self.lock_mut();
        let state = &mut *state;
        let now = Utc::now();

        let query_lower = query.to_lowercase();
        let query_words = words(&query_lower);

        let mut seen: HashSet<MemoryId> = HashSet::new();
        let mut scored: Vec<(f64, MemoryId)> = Vec::new();

        for record in state.short_term.iter().chain(state.long_term.iter()) {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            let score = relevance(record, &query_lower, &query_words);
            if score <= 0.0 {
                continue;
            }
            let age_hours = (now - record.timestamp).num_seconds().max(0) as f64 / 3600.0;
            let recency = 1.0 / (1.0 + age_hours);
            scored.push((score * 0.7 + recency * 0.3, record.id.clone()));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (_, id) in &scored {
            // Bump both tiers so the copies stay in sync.
            for record in state
                .short_term
                .iter_mut()
                .chain(state.long_term.iter_mut())
                .filter(|r| &r.id == id)
            {
                record.accessed += 1;
                record.last_accessed = now;
            }
            if let Some(record) = state.short_term.iter().find(|r| &r.id == id) {
                results.push(record.clone());
            } else if let Some(record) = state.long_term.iter().find(|r| &r.id == id) {
                results.push(record.clone());
            }
        }
        results
    }

    // =========================================================================
    // Working Memory
    // =========================================================================

    /// Set a transient key; the oldest key falls out past the cap.
    pub fn set_working(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let mut state = self.lock_mut();

        if state.working.values.insert(key.clone(), value).is_none() {
            state.working.order.push_back(key);
            while state.working.order.len() > self.config.working_cap {
                if let Some(evicted) = state.working.order.pop_front() {
                    state.working.values.remove(&evicted);
                }
            }
        }
    }

    pub fn get_working(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().working.values.get(key).cloned()
    }

    /// Drop all working-memory state. Called between sessions.
    pub fn clear_working(&self) {
        let mut state = self.lock_mut();
        let dropped = state.working.values.len();
        state.working.values.clear();
        state.working.order.clear();
        if dropped > 0 {
            tracing::debug!("working_memory_cleared: dropped={}", dropped);
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop short-term records older than the window. Long-term copies are
    /// untouched. Returns how many expired.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.short_term_window.as_secs() as i64);
        let mut state = self.lock_mut();

        let before = state.short_term.len();
        state.short_term.retain(|record| record.timestamp >= cutoff);
        let expired = before - state.short_term.len();
        state.expirations += expired as u64;
        expired
    }

    /// Get current memory statistics.
    pub fn get_stats(&self) -> MemoryStats {
        let state = self.lock();
        MemoryStats {
            short_term: state.short_term.len(),
            long_term: state.long_term.len(),
            working: state.working.values.len(),
            cap_evictions: state.cap_evictions,
            expirations: state.expirations,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // Poisoning only means a panic elsewhere mid-update; the tiers remain
    // usable, so both paths absorb it.
    fn lock(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mut(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn relevance(record: &MemoryRecord, query_lower: &str, query_words: &HashSet<String>) -> f64 {
    let mut score = 0.0;

    if let Some(action) = record.content.get("action").and_then(|a| a.as_str()) {
        if !action.is_empty() && query_lower.contains(&action.to_lowercase()) {
            score += 0.4;
        }
    }

    if let Some(text) = record.content.get("text").and_then(|t| t.as_str()) {
        let memory_words = words(text);
        if !memory_words.is_empty() {
            let overlap = memory_words.intersection(query_words).count() as f64
                / memory_words.len() as f64;
            score += 0.4 * overlap;
        }
    }

    if let Some(emotion) = record.content.get("emotion").and_then(|e| e.as_str()) {
        if !emotion.is_empty() && query_lower.contains(&emotion.to_lowercase()) {
            score += 0.2;
        }
    }

    score * record.importance
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_engine(cap: usize) -> MemoryEngine {
        MemoryEngine::new(MemoryConfig {
            short_term_cap: cap,
            ..Default::default()
        })
    }

    fn record_at(text: &str, minutes_ago: i64, importance: f64) -> MemoryRecord {
        let mut record = MemoryRecord::new(
            MemoryType::Interaction,
            json!({ "text": text, "action": "ai_chat", "emotion": "neutral" }),
            importance,
        );
        record.timestamp = Utc::now() - chrono::Duration::minutes(minutes_ago);
        record
    }

    #[test]
    fn test_short_term_evicts_oldest_by_timestamp() {
        let engine = small_engine(3);

        let oldest = record_at("first", 30, 0.2);
        let oldest_id = oldest.id.clone();
        engine.remember_record(oldest);
        engine.remember_record(record_at("second", 20, 0.2));
        engine.remember_record(record_at("third", 10, 0.2));
        engine.remember_record(record_at("fourth", 1, 0.2));

        let stats = engine.get_stats();
        assert_eq!(stats.short_term, 3);
        assert_eq!(stats.cap_evictions, 1);
        assert!(engine.get_relevant_context("first", 10).is_empty());
        assert!(engine
            .get_relevant_context("second", 10)
            .iter()
            .all(|r| r.id != oldest_id));
    }

    #[test]
    fn test_cap_overflow_evicts_exactly_one() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        for i in 0..100 {
            engine.remember_record(record_at(&format!("note {i}"), 200 - i, 0.1));
        }
        assert_eq!(engine.get_stats().short_term, 100);

        engine.remember_record(record_at("the 101st", 0, 0.1));
        let stats = engine.get_stats();
        assert_eq!(stats.short_term, 100);
        assert_eq!(stats.cap_evictions, 1);
    }

    #[test]
    fn test_importance_gates_long_term() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        engine.remember(MemoryType::Interaction, json!({"text": "minor"}), 0.5, vec![]);
        engine.remember(MemoryType::Interaction, json!({"text": "major"}), 0.9, vec![]);
        engine.remember(MemoryType::Interaction, json!({"text": "edge"}), 0.7, vec![]);

        let stats = engine.get_stats();
        assert_eq!(stats.short_term, 3);
        assert_eq!(stats.long_term, 2);
    }

    #[test]
    fn test_relevance_prefers_action_match() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        let mut build = MemoryRecord::new(
            MemoryType::Interaction,
            json!({ "text": "built the notes app", "action": "build_app" }),
            0.6,
        );
        build.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let build_id = build.id.clone();
        engine.remember_record(build);

        let mut chat = MemoryRecord::new(
            MemoryType::Interaction,
            json!({ "text": "talked about weather", "action": "ai_chat" }),
            0.6,
        );
        chat.timestamp = Utc::now() - chrono::Duration::minutes(5);
        engine.remember_record(chat);

        let results = engine.get_relevant_context("please build_app again", 5);
        assert!(!results.is_empty());
        assert_eq!(results[0].id, build_id);
    }

    #[test]
    fn test_relevance_weights_importance() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        let mut weak = record_at("remember the meeting", 10, 0.2);
        weak.content = json!({ "text": "remember the meeting" });
        engine.remember_record(weak);

        let mut strong = record_at("remember the meeting", 10, 0.9);
        strong.content = json!({ "text": "remember the meeting" });
        let strong_id = strong.id.clone();
        engine.remember_record(strong);

        let results = engine.get_relevant_context("remember the meeting", 2);
        assert_eq!(results[0].id, strong_id);
    }

    #[test]
    fn test_recency_breaks_score_ties() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        let mut stale = record_at("coffee order", 50 * 60, 0.5);
        stale.content = json!({ "text": "coffee order" });
        engine.remember_record(stale);

        let mut fresh = record_at("coffee order", 1, 0.5);
        fresh.content = json!({ "text": "coffee order" });
        let fresh_id = fresh.id.clone();
        engine.remember_record(fresh);

        let results = engine.get_relevant_context("coffee order", 2);
        assert_eq!(results[0].id, fresh_id);
    }

    #[test]
    fn test_access_metadata_bumped_on_read() {
        let engine = MemoryEngine::new(MemoryConfig::default());
        engine.remember(
            MemoryType::Interaction,
            json!({ "text": "play some music" }),
            0.5,
            vec![],
        );

        let first = engine.get_relevant_context("play some music", 1);
        assert_eq!(first[0].accessed, 1);

        let second = engine.get_relevant_context("play some music", 1);
        assert_eq!(second[0].accessed, 2);
    }

    #[test]
    fn test_unrelated_memories_excluded() {
        let engine = MemoryEngine::new(MemoryConfig::default());
        engine.remember(
            MemoryType::Interaction,
            json!({ "text": "watered the plants" }),
            0.9,
            vec![],
        );

        assert!(engine.get_relevant_context("quarterly report", 5).is_empty());
    }

    #[test]
    fn test_preferences_and_learnings_are_long_term() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        engine.store_preference("language", json!("ar"));
        engine.record_learning("greeting", json!({"style": "short"}));

        let stats = engine.get_stats();
        assert_eq!(stats.long_term, 2);
    }

    #[test]
    fn test_working_memory_fifo_eviction() {
        let engine = MemoryEngine::new(MemoryConfig {
            working_cap: 3,
            ..Default::default()
        });

        engine.set_working("a", json!(1));
        engine.set_working("b", json!(2));
        engine.set_working("c", json!(3));
        // Re-setting an existing key must not evict anything.
        engine.set_working("a", json!(10));
        assert_eq!(engine.get_stats().working, 3);

        engine.set_working("d", json!(4));
        assert!(engine.get_working("a").is_none());
        assert_eq!(engine.get_working("b"), Some(json!(2)));
        assert_eq!(engine.get_working("d"), Some(json!(4)));
    }

    #[test]
    fn test_clear_working_drops_everything() {
        let engine = MemoryEngine::new(MemoryConfig::default());
        engine.set_working("session", json!("s1"));
        engine.clear_working();
        assert!(engine.get_working("session").is_none());
        assert_eq!(engine.get_stats().working, 0);
    }

    #[test]
    fn test_cleanup_expires_only_old_short_term() {
        let engine = MemoryEngine::new(MemoryConfig::default());

        engine.remember_record(record_at("old important", 120, 0.9));
        engine.remember_record(record_at("recent", 5, 0.9));

        let expired = engine.cleanup_expired();
        assert_eq!(expired, 1);

        let stats = engine.get_stats();
        assert_eq!(stats.short_term, 1);
        // The long-term copy of the expired record survives.
        assert_eq!(stats.long_term, 2);
        assert_eq!(stats.expirations, 1);
    }
}

//! Policy engine.
//!
//! A static rule table gating every action the pipeline wants to execute.
//! Policies are pulled in by substring match of the action string against a
//! keyword map, sorted by ascending priority and evaluated rule by rule.
//! Evaluation is synchronous and total: any internal failure (including a
//! panicking rule or a poisoned table lock) fails closed.

use crate::kernel::recovery::with_recovery;
use crate::types::{Error, PolicyId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

// =============================================================================
// Policy Model
// =============================================================================

/// What concern a policy covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Permission,
    Security,
    Usage,
    Privacy,
}

/// What a matched rule does to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    Warn,
    RequireAuth,
}

/// When a rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCondition {
    /// Applies to every action the policy was selected for.
    Always,
    /// Applies only when the action contains this substring.
    ActionContains(String),
}

impl RuleCondition {
    fn matches(&self, action: &str) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::ActionContains(needle) => action.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    /// Rule-specific extras, e.g. `{"approval": true}` on a `require_auth`
    /// rule to escalate the auth flag into an approval requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    pub rules: Vec<PolicyRule>,
    pub enabled: bool,
    /// Lower evaluates first.
    pub priority: u32,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub reason: String,
    pub requires_auth: bool,
    pub requires_approval: bool,
    pub warning: Option<String>,
    pub policy: Option<PolicyId>,
}

impl PolicyVerdict {
    fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_auth: false,
            requires_approval: false,
            warning: None,
            policy: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_auth: false,
            requires_approval: false,
            warning: None,
            policy: None,
        }
    }
}

/// Statistics about policy usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PolicyStats {
    pub policies: usize,
    pub enabled_policies: usize,
    pub keywords: usize,
    pub evaluations: u64,
    pub denials: u64,
}

// =============================================================================
// PolicyEngine
// =============================================================================

#[derive(Debug)]
struct PolicyTable {
    policies: HashMap<PolicyId, Policy>,
    /// keyword substring -> policy pulled in when the action contains it.
    keywords: Vec<(String, PolicyId)>,
}

/// Synchronous policy gate.
///
/// Owned by the kernel and shared read-mostly; admin operations mutate the
/// table, evaluation only reads it.
#[derive(Debug)]
pub struct PolicyEngine {
    table: RwLock<PolicyTable>,
    evaluations: AtomicU64,
    denials: AtomicU64,
}

impl PolicyEngine {
    /// An engine with an empty table: everything evaluates to allowed.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(PolicyTable {
                policies: HashMap::new(),
                keywords: Vec::new(),
            }),
            evaluations: AtomicU64::new(0),
            denials: AtomicU64::new(0),
        }
    }

    /// An engine preloaded with the stock protection policies.
    pub fn with_defaults() -> Self {
        let engine = Self::new();

        engine.set_policy(Policy {
            id: PolicyId::new("system_guard"),
            name: "System Guard".to_string(),
            kind: PolicyKind::Security,
            rules: vec![PolicyRule {
                id: "block_destructive".to_string(),
                condition: RuleCondition::Always,
                action: RuleAction::Deny,
                params: None,
            }],
            enabled: true,
            priority: 1,
        });
        engine.map_keyword("wipe", &PolicyId::new("system_guard"));
        engine.map_keyword("factory_reset", &PolicyId::new("system_guard"));

        engine.set_policy(Policy {
            id: PolicyId::new("payment_protection"),
            name: "Payment Protection".to_string(),
            kind: PolicyKind::Permission,
            rules: vec![PolicyRule {
                id: "approve_payments".to_string(),
                condition: RuleCondition::Always,
                action: RuleAction::RequireAuth,
                params: Some(serde_json::json!({ "approval": true })),
            }],
            enabled: true,
            priority: 5,
        });
        engine.map_keyword("pay", &PolicyId::new("payment_protection"));
        engine.map_keyword("transfer", &PolicyId::new("payment_protection"));

        engine.set_policy(Policy {
            id: PolicyId::new("file_access"),
            name: "File Access".to_string(),
            kind: PolicyKind::Security,
            rules: vec![PolicyRule {
                id: "auth_file_access".to_string(),
                condition: RuleCondition::Always,
                action: RuleAction::RequireAuth,
                params: None,
            }],
            enabled: true,
            priority: 10,
        });
        engine.map_keyword("vault", &PolicyId::new("file_access"));
        engine.map_keyword("file", &PolicyId::new("file_access"));
        engine.map_keyword("document", &PolicyId::new("file_access"));

        engine.set_policy(Policy {
            id: PolicyId::new("location_privacy"),
            name: "Location Privacy".to_string(),
            kind: PolicyKind::Privacy,
            rules: vec![PolicyRule {
                id: "warn_location".to_string(),
                condition: RuleCondition::Always,
                action: RuleAction::Warn,
                params: Some(serde_json::json!({
                    "message": "location data is being shared"
                })),
            }],
            enabled: true,
            priority: 20,
        });
        engine.map_keyword("location", &PolicyId::new("location_privacy"));
        engine.map_keyword("track", &PolicyId::new("location_privacy"));

        engine.set_policy(Policy {
            id: PolicyId::new("api_usage"),
            name: "External API Usage".to_string(),
            kind: PolicyKind::Usage,
            rules: vec![PolicyRule {
                id: "allow_api".to_string(),
                condition: RuleCondition::Always,
                action: RuleAction::Allow,
                params: None,
            }],
            enabled: true,
            priority: 30,
        });
        engine.map_keyword("api", &PolicyId::new("api_usage"));
        engine.map_keyword("external", &PolicyId::new("api_usage"));

        engine
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate an action string against the table.
    ///
    /// Never fails open: panics and lock poisoning both come back as a
    /// denied verdict.
    pub fn evaluate(&self, action: &str) -> PolicyVerdict {
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let verdict = match with_recovery(|| self.evaluate_inner(action), "policy_evaluate") {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::error!("policy_evaluation_failed: action={} error={}", action, err);
                PolicyVerdict::denied(format!("policy evaluation failed: {err}"))
            }
        };

        if !verdict.allowed {
            self.denials.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("action_denied: action={} reason={}", action, verdict.reason);
        }
        verdict
    }

    fn evaluate_inner(&self, action: &str) -> Result<PolicyVerdict> {
        let table = self
            .table
            .read()
            .map_err(|_| Error::internal("policy table lock poisoned"))?;

        let action_lower = action.to_lowercase();

        let mut selected_ids: HashSet<&PolicyId> = HashSet::new();
        for (keyword, policy_id) in &table.keywords {
            if action_lower.contains(keyword.as_str()) {
                selected_ids.insert(policy_id);
            }
        }

        let mut selected: Vec<&Policy> = selected_ids
            .into_iter()
            .filter_map(|id| table.policies.get(id))
            .filter(|policy| policy.enabled)
            .collect();

        if selected.is_empty() {
            return Ok(PolicyVerdict::allowed("No policies defined"));
        }

        // Ascending priority; id as tie-break so evaluation order is stable.
        selected.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        let mut verdict = PolicyVerdict::allowed(format!("allowed for action '{action}'"));

        for policy in selected {
            for rule in &policy.rules {
                if !rule.condition.matches(&action_lower) {
                    continue;
                }
                match rule.action {
                    RuleAction::Deny => {
                        let mut denied = PolicyVerdict::denied(format!(
                            "denied by policy '{}'",
                            policy.name
                        ));
                        denied.policy = Some(policy.id.clone());
                        return Ok(denied);
                    }
                    RuleAction::Allow => {
                        if verdict.policy.is_none() {
                            verdict.policy = Some(policy.id.clone());
                        }
                    }
                    RuleAction::Warn => {
                        if verdict.warning.is_none() {
                            let message = rule
                                .params
                                .as_ref()
                                .and_then(|p| p.get("message"))
                                .and_then(|m| m.as_str())
                                .unwrap_or("policy warning");
                            verdict.warning = Some(format!("{}: {message}", policy.name));
                            verdict.policy.get_or_insert_with(|| policy.id.clone());
                        }
                    }
                    RuleAction::RequireAuth => {
                        verdict.requires_auth = true;
                        verdict.reason =
                            format!("authentication required by policy '{}'", policy.name);
                        verdict.policy = Some(policy.id.clone());

                        let wants_approval = rule
                            .params
                            .as_ref()
                            .and_then(|p| p.get("approval"))
                            .and_then(|a| a.as_bool())
                            .unwrap_or(false);
                        if wants_approval {
                            verdict.requires_approval = true;
                        }
                    }
                }
            }
        }

        Ok(verdict)
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Insert or replace a policy.
    pub fn set_policy(&self, policy: Policy) {
        let mut table = self.lock_table_mut();
        tracing::debug!("policy_set: id={} priority={}", policy.id, policy.priority);
        table.policies.insert(policy.id.clone(), policy);
    }

    /// Enable or disable a policy in place.
    pub fn set_policy_enabled(&self, id: &PolicyId, enabled: bool) -> Result<()> {
        let mut table = self.lock_table_mut();
        let policy = table
            .policies
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("policy '{id}'")))?;
        policy.enabled = enabled;
        tracing::debug!("policy_enabled: id={} enabled={}", id, enabled);
        Ok(())
    }

    /// Route actions containing `keyword` to `policy_id`.
    pub fn map_keyword(&self, keyword: impl Into<String>, policy_id: &PolicyId) {
        let keyword = keyword.into().to_lowercase();
        let mut table = self.lock_table_mut();
        table.keywords.retain(|(existing, _)| existing != &keyword);
        table.keywords.push((keyword, policy_id.clone()));
    }

    pub fn get_policy(&self, id: &PolicyId) -> Option<Policy> {
        let table = self.lock_table();
        table.policies.get(id).cloned()
    }

    /// All policies, lowest priority first.
    pub fn list_policies(&self) -> Vec<Policy> {
        let table = self.lock_table();
        let mut all: Vec<Policy> = table.policies.values().cloned().collect();
        all.sort_by_key(|p| p.priority);
        all
    }

    /// Get current engine statistics.
    pub fn get_stats(&self) -> PolicyStats {
        let table = self.lock_table();
        PolicyStats {
            policies: table.policies.len(),
            enabled_policies: table.policies.values().filter(|p| p.enabled).count(),
            keywords: table.keywords.len(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
        }
    }

    // Admin paths absorb poisoning so an operator can still repair the
    // table; evaluation converts it to a fail-closed denial instead.
    fn lock_table(&self) -> std::sync::RwLockReadGuard<'_, PolicyTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table_mut(&self) -> std::sync::RwLockWriteGuard<'_, PolicyTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_vault_action_requires_auth() {
        let engine = PolicyEngine::with_defaults();

        let verdict = engine.evaluate("open_vault");
        assert!(verdict.allowed);
        assert!(verdict.requires_auth);
        assert_eq!(verdict.policy, Some(PolicyId::new("file_access")));
    }

    #[test]
    fn test_unmatched_action_allowed_with_stock_reason() {
        let engine = PolicyEngine::with_defaults();

        let verdict = engine.evaluate("compose_music");
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "No policies defined");
        assert!(verdict.policy.is_none());
    }

    #[test]
    fn test_destructive_action_denied() {
        let engine = PolicyEngine::with_defaults();

        let verdict = engine.evaluate("factory_reset_device");
        assert!(!verdict.allowed);
        assert_eq!(verdict.policy, Some(PolicyId::new("system_guard")));
    }

    #[test]
    fn test_deny_short_circuits_remaining_rules() {
        let engine = PolicyEngine::new();
        let id = PolicyId::new("mixed");
        engine.set_policy(Policy {
            id: id.clone(),
            name: "Mixed".to_string(),
            kind: PolicyKind::Security,
            rules: vec![
                PolicyRule {
                    id: "deny_first".to_string(),
                    condition: RuleCondition::Always,
                    action: RuleAction::Deny,
                    params: None,
                },
                PolicyRule {
                    id: "auth_later".to_string(),
                    condition: RuleCondition::Always,
                    action: RuleAction::RequireAuth,
                    params: None,
                },
            ],
            enabled: true,
            priority: 1,
        });
        engine.map_keyword("risky", &id);

        let verdict = engine.evaluate("risky_call");
        assert!(!verdict.allowed);
        assert!(!verdict.requires_auth);
    }

    #[test]
    fn test_policies_evaluated_in_ascending_priority() {
        let engine = PolicyEngine::new();
        for (id, priority, message) in [("late", 20u32, "second"), ("early", 2, "first")] {
            let policy_id = PolicyId::new(id);
            engine.set_policy(Policy {
                id: policy_id.clone(),
                name: id.to_string(),
                kind: PolicyKind::Privacy,
                rules: vec![PolicyRule {
                    id: format!("warn_{id}"),
                    condition: RuleCondition::Always,
                    action: RuleAction::Warn,
                    params: Some(serde_json::json!({ "message": message })),
                }],
                enabled: true,
                priority,
            });
            engine.map_keyword("shared", &policy_id);
        }

        // First warning wins, so the lower-priority-number policy speaks.
        let verdict = engine.evaluate("shared_action");
        assert!(verdict.allowed);
        assert!(verdict.warning.as_deref().unwrap_or("").contains("first"));
    }

    #[test]
    fn test_disabled_policy_is_skipped() {
        let engine = PolicyEngine::with_defaults();
        engine
            .set_policy_enabled(&PolicyId::new("system_guard"), false)
            .unwrap();

        let verdict = engine.evaluate("wipe_storage");
        assert!(verdict.allowed);
    }

    #[test]
    fn test_payment_escalates_to_approval() {
        let engine = PolicyEngine::with_defaults();

        let verdict = engine.evaluate("process_payment");
        assert!(verdict.allowed);
        assert!(verdict.requires_auth);
        assert!(verdict.requires_approval);
    }

    #[test]
    fn test_location_action_warns_but_allows() {
        let engine = PolicyEngine::with_defaults();

        let verdict = engine.evaluate("track_location");
        assert!(verdict.allowed);
        assert!(verdict.warning.is_some());
    }

    #[test]
    fn test_condition_scoped_rule_only_fires_on_match() {
        let engine = PolicyEngine::new();
        let id = PolicyId::new("scoped");
        engine.set_policy(Policy {
            id: id.clone(),
            name: "Scoped".to_string(),
            kind: PolicyKind::Security,
            rules: vec![PolicyRule {
                id: "deny_delete".to_string(),
                condition: RuleCondition::ActionContains("delete".to_string()),
                action: RuleAction::Deny,
                params: None,
            }],
            enabled: true,
            priority: 1,
        });
        engine.map_keyword("file", &id);

        assert!(engine.evaluate("read_file").allowed);
        assert!(!engine.evaluate("delete_file").allowed);
    }

    #[test]
    fn test_poisoned_table_fails_closed() {
        let engine = Arc::new(PolicyEngine::with_defaults());

        let poisoner = Arc::clone(&engine);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.table.write().unwrap();
            panic!("poison the table");
        })
        .join();

        let verdict = engine.evaluate("compose_music");
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("policy evaluation failed"));
    }

    #[test]
    fn test_unknown_policy_toggle_errors() {
        let engine = PolicyEngine::new();
        let result = engine.set_policy_enabled(&PolicyId::new("ghost"), true);
        assert!(result.is_err());
    }

    #[test]
    fn test_stats_count_evaluations_and_denials() {
        let engine = PolicyEngine::with_defaults();
        engine.evaluate("compose_music");
        engine.evaluate("wipe_storage");

        let stats = engine.get_stats();
        assert_eq!(stats.policies, 5);
        assert_eq!(stats.evaluations, 2);
        assert_eq!(stats.denials, 1);
    }
}

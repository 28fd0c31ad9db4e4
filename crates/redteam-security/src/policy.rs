//! User-defined policy evaluation.
//!
//! Loads each tenant's enabled rules from the store, compiles their
//! conditions once, and caches the compiled set for five minutes. Every
//! condition runs in the restricted interpreter under a 10 ms wall-clock
//! cap; any compile or evaluation failure downgrades that rule to
//! "did not match" and is logged, never propagated.

use crate::condition::{self, Budget, Context, Program, Value};
use dashmap::DashMap;
use redteam_core::{EventStore, LoggedEvent, PolicyRule, RuleAction, RuleSeverity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rule cache TTL.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Wall-clock cap per rule condition.
const RULE_WALL_CLOCK: Duration = Duration::from_millis(10);

/// Operation-fuel cap per rule condition.
const RULE_FUEL: u32 = 10_000;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// A rule whose condition evaluated to `true` for an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: i64,
    pub rule_name: String,
    pub action: RuleAction,
    pub severity: RuleSeverity,
}

/// Result of the policy engine for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReport {
    /// `Block` if any violated rule blocks, else `Alert` if any alerts,
    /// else `Allow`.
    pub action: RuleAction,
    /// Sum of violated rules' severity scores, capped at 100.
    pub score: u8,
    pub violations: Vec<PolicyViolation>,
}

impl PolicyReport {
    /// The empty report: no rules matched.
    pub fn allow() -> Self {
        Self {
            action: RuleAction::Allow,
            score: 0,
            violations: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled rules and cache
// ---------------------------------------------------------------------------

/// A policy rule with its condition compiled.
///
/// `program` is `None` when compilation failed; such a rule never matches.
struct CompiledRule {
    rule: PolicyRule,
    program: Option<Program>,
}

struct CachedRules {
    rules: Arc<Vec<CompiledRule>>,
    loaded_at: Instant,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Policy engine with exclusive ownership of the per-tenant rule cache.
pub struct PolicyEngine {
    store: Arc<dyn EventStore>,
    cache: DashMap<i64, CachedRules>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Evaluate every enabled rule for the event's tenant.
    ///
    /// A store failure during rule load yields the empty report; policy
    /// evaluation must never add availability risk to the proxy path.
    pub async fn evaluate(&self, event: &LoggedEvent) -> PolicyReport {
        let rules = match self.load_rules(event.tenant_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(tenant_id = event.tenant_id, error = %e, "policy rule load failed");
                return PolicyReport::allow();
            }
        };
        if rules.is_empty() {
            return PolicyReport::allow();
        }

        let ctx = build_context(event);
        let mut violations = Vec::new();

        for compiled in rules.iter() {
            let Some(ref program) = compiled.program else {
                continue;
            };
            let mut budget = Budget::new(RULE_WALL_CLOCK, RULE_FUEL);
            match program.matches(&ctx, &mut budget) {
                Ok(true) => {
                    violations.push(PolicyViolation {
                        rule_id: compiled.rule.id,
                        rule_name: compiled.rule.name.clone(),
                        action: compiled.rule.action,
                        severity: compiled.rule.severity,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        rule_id = compiled.rule.id,
                        rule_name = %compiled.rule.name,
                        error = %e,
                        "policy condition failed; treating as non-match"
                    );
                }
            }
        }

        for violation in &violations {
            if let Err(e) = self.store.record_rule_hit(violation.rule_id).await {
                debug!(rule_id = violation.rule_id, error = %e, "failed to record rule hit");
            }
        }

        let action = if violations.iter().any(|v| v.action == RuleAction::Block) {
            RuleAction::Block
        } else if violations.iter().any(|v| v.action == RuleAction::Alert) {
            RuleAction::Alert
        } else {
            RuleAction::Allow
        };
        let score: u32 = violations.iter().map(|v| v.severity.score()).sum();

        PolicyReport {
            action,
            score: score.min(100) as u8,
            violations,
        }
    }

    /// Fetch the compiled rule set for a tenant, reloading on a stale or
    /// missing cache entry. Readers always observe either the prior set or
    /// the fully-compiled new one.
    async fn load_rules(
        &self,
        tenant_id: i64,
    ) -> redteam_core::Result<Arc<Vec<CompiledRule>>> {
        if let Some(entry) = self.cache.get(&tenant_id) {
            if entry.loaded_at.elapsed() < CACHE_TTL {
                return Ok(Arc::clone(&entry.rules));
            }
        }

        let rules = self.store.enabled_rules(tenant_id).await?;
        let compiled: Vec<CompiledRule> = rules.into_iter().map(compile_rule).collect();
        let compiled = Arc::new(compiled);
        self.cache.insert(
            tenant_id,
            CachedRules {
                rules: Arc::clone(&compiled),
                loaded_at: Instant::now(),
            },
        );
        Ok(compiled)
    }

    /// Drop a tenant's cache entry so the next evaluation reloads.
    pub fn invalidate(&self, tenant_id: i64) {
        self.cache.remove(&tenant_id);
    }
}

fn compile_rule(rule: PolicyRule) -> CompiledRule {
    let program = match condition::compile(&rule.condition) {
        Ok(program) => Some(program),
        Err(e) => {
            warn!(
                rule_id = rule.id,
                rule_name = %rule.name,
                error = %e,
                "policy condition failed to compile; rule will never match"
            );
            None
        }
    };
    CompiledRule { rule, program }
}

/// Bind the evaluation context for an event: `event` (field map), `tools`,
/// `model`, `cost`, `agentId`. The tool list is the interceptor's pre-parsed
/// list, shared with the scanner.
fn build_context(event: &LoggedEvent) -> Context {
    let event_json = serde_json::json!({
        "model": event.model,
        "cost": event.cost_usd,
        "agent_id": event.agent_id,
        "prompt_tokens": event.prompt_tokens,
        "completion_tokens": event.completion_tokens,
        "latency_ms": event.latency_ms,
        "tool_names": event.tool_names,
        "request_length": event.raw_request.len(),
    });
    Context::new()
        .bind("event", Value::from_json(&event_json))
        .bind(
            "tools",
            Value::List(
                event
                    .tool_names
                    .iter()
                    .map(|t| Value::Str(t.clone()))
                    .collect(),
            ),
        )
        .bind("model", Value::Str(event.model.clone()))
        .bind("cost", Value::Num(event.cost_usd))
        .bind(
            "agentId",
            event
                .agent_id
                .as_ref()
                .map(|a| Value::Str(a.clone()))
                .unwrap_or(Value::Null),
        )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use redteam_storage::MemoryEventStore;

    fn event(tenant_id: i64) -> LoggedEvent {
        LoggedEvent {
            id: 1,
            timestamp: Utc::now(),
            tenant_id,
            agent_id: Some("agent-1".to_string()),
            model: "gpt-4o".to_string(),
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: 0.75,
            latency_ms: 200,
            tool_names: vec!["exec_shell".to_string()],
            request_sha256: String::new(),
            response_preview: String::new(),
            raw_request: "{}".to_string(),
            raw_response: "{}".to_string(),
            risk_score: 0,
            blocked: false,
            flags: Vec::new(),
        }
    }

    fn rule(tenant_id: i64, name: &str, cond: &str, action: RuleAction, severity: RuleSeverity) -> PolicyRule {
        PolicyRule {
            id: 0,
            tenant_id,
            name: name.to_string(),
            description: String::new(),
            condition: cond.to_string(),
            action,
            severity,
            enabled: true,
            hit_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_no_rules_allows() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = PolicyEngine::new(store);
        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Allow);
        assert_eq!(report.score, 0);
        assert!(report.violations.is_empty());
    }

    #[tokio::test]
    async fn test_cost_block_rule() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(1, "expensive-call", "cost > 0.50", RuleAction::Block, RuleSeverity::High))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Block);
        assert_eq!(report.score, 30);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule_name, "expensive-call");
    }

    #[tokio::test]
    async fn test_action_precedence_block_over_alert() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(1, "alert", "cost > 0.1", RuleAction::Alert, RuleSeverity::Low))
            .await;
        store
            .add_rule(rule(1, "block", "tools.includes('exec_shell')", RuleAction::Block, RuleSeverity::Critical))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Block);
        // 10 + 40
        assert_eq!(report.score, 50);
        assert_eq!(report.violations.len(), 2);
    }

    #[tokio::test]
    async fn test_matched_allow_rule_keeps_action_allow() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(1, "note", "model == 'gpt-4o'", RuleAction::Allow, RuleSeverity::Low))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Allow);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.score, 10);
    }

    #[tokio::test]
    async fn test_broken_condition_never_matches_and_never_propagates() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(1, "broken", "while(true){}", RuleAction::Block, RuleSeverity::Critical))
            .await;
        store
            .add_rule(rule(1, "works", "cost > 0.5", RuleAction::Alert, RuleSeverity::Medium))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        // The broken rule is inert; the healthy rule still evaluates.
        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Alert);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule_name, "works");
    }

    #[tokio::test]
    async fn test_type_error_condition_is_non_match() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(1, "bad-types", "tools + 3 > 1", RuleAction::Block, RuleSeverity::High))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Allow);
        assert!(report.violations.is_empty());
    }

    #[tokio::test]
    async fn test_rule_hits_recorded() {
        let store = Arc::new(MemoryEventStore::new());
        let rule_id = store
            .add_rule(rule(1, "hit-me", "true == true", RuleAction::Alert, RuleSeverity::Low))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        engine.evaluate(&event(1)).await;
        engine.evaluate(&event(1)).await;

        let rules = store.enabled_rules(1).await.unwrap();
        assert_eq!(rules.iter().find(|r| r.id == rule_id).unwrap().hit_count, 2);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_rules_until_invalidated() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        // Prime the cache with the empty rule set
        let report = engine.evaluate(&event(1)).await;
        assert!(report.violations.is_empty());

        // A rule added after priming is invisible until the cache drops
        store
            .add_rule(rule(1, "late", "cost > 0", RuleAction::Alert, RuleSeverity::Low))
            .await;
        let report = engine.evaluate(&event(1)).await;
        assert!(report.violations.is_empty());

        engine.invalidate(1);
        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_event_context_fields() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(
                1,
                "big-prompt",
                "event.prompt_tokens >= 100 && agentId == 'agent-1'",
                RuleAction::Alert,
                RuleSeverity::Medium,
            ))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_are_tenant_scoped() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .add_rule(rule(2, "other-tenant", "true == true", RuleAction::Block, RuleSeverity::High))
            .await;
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);

        let report = engine.evaluate(&event(1)).await;
        assert_eq!(report.action, RuleAction::Allow);
    }

    #[tokio::test]
    async fn test_score_capped_at_100() {
        let store = Arc::new(MemoryEventStore::new());
        for i in 0..4 {
            store
                .add_rule(rule(1, &format!("r{i}"), "cost > 0", RuleAction::Alert, RuleSeverity::Critical))
                .await;
        }
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn EventStore>);
        let report = engine.evaluate(&event(1)).await;
        // 4 × 40 = 160, capped
        assert_eq!(report.score, 100);
    }
}

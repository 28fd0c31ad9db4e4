//! In-memory event store for testing.
//!
//! Stores all data in `Vec`s behind `RwLock`s. Not intended for production
//! use; all reads are linear scans.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redteam_core::{
    EventStore, LoggedEvent, PolicyRule, Result, SecurityResult, Tenant,
};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// In-memory implementation of [`EventStore`].
///
/// Data is lost when the struct is dropped.
pub struct MemoryEventStore {
    events: RwLock<Vec<LoggedEvent>>,
    tenants: RwLock<Vec<Tenant>>,
    rules: RwLock<Vec<PolicyRule>>,
    blocked_agents: RwLock<Vec<(i64, String)>>,
    next_event_id: AtomicI64,
    next_row_id: AtomicI64,
}

impl MemoryEventStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            tenants: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            blocked_agents: RwLock::new(Vec::new()),
            next_event_id: AtomicI64::new(1),
            next_row_id: AtomicI64::new(1),
        }
    }

    /// Add a tenant, assigning it an id.
    pub async fn add_tenant(&self, mut tenant: Tenant) -> i64 {
        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        tenant.id = id;
        self.tenants.write().await.push(tenant);
        id
    }

    /// Add a policy rule, assigning it an id.
    pub async fn add_rule(&self, mut rule: PolicyRule) -> i64 {
        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        rule.id = id;
        self.rules.write().await.push(rule);
        id
    }

    /// Number of stored events.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_event(&self, event: &LoggedEvent) -> Result<i64> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = event.clone();
        stored.id = id;
        self.events.write().await.push(stored);
        Ok(id)
    }

    async fn update_security_result(&self, event_id: i64, result: &SecurityResult) -> Result<()> {
        let mut events = self.events.write().await;
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.risk_score = result.risk_score;
            event.blocked = result.blocked;
            event.flags = result.flags.clone();
        }
        Ok(())
    }

    async fn get_event(&self, event_id: i64) -> Result<Option<LoggedEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .find(|e| e.id == event_id)
            .cloned())
    }

    async fn count_events_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.timestamp >= since)
            .count() as i64)
    }

    async fn get_tenant_by_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(self
            .tenants
            .read()
            .await
            .iter()
            .find(|t| t.api_key == api_key)
            .cloned())
    }

    async fn enabled_rules(&self, tenant_id: i64) -> Result<Vec<PolicyRule>> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.enabled)
            .cloned()
            .collect())
    }

    async fn record_rule_hit(&self, rule_id: i64) -> Result<()> {
        let mut rules = self.rules.write().await;
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            rule.hit_count += 1;
        }
        Ok(())
    }

    async fn is_agent_blocked(&self, tenant_id: i64, agent_id: &str) -> Result<bool> {
        Ok(self
            .blocked_agents
            .read()
            .await
            .iter()
            .any(|(t, a)| *t == tenant_id && a == agent_id))
    }

    async fn block_agent(&self, tenant_id: i64, agent_id: &str) -> Result<()> {
        let mut blocked = self.blocked_agents.write().await;
        if !blocked
            .iter()
            .any(|(t, a)| *t == tenant_id && a == agent_id)
        {
            blocked.push((tenant_id, agent_id.to_string()));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redteam_core::{RuleAction, RuleSeverity};

    fn sample_event(tenant_id: i64) -> LoggedEvent {
        LoggedEvent {
            id: 0,
            timestamp: Utc::now(),
            tenant_id,
            agent_id: None,
            model: "claude-3-5-sonnet".to_string(),
            prompt_tokens: 5,
            completion_tokens: 5,
            cost_usd: 0.0,
            latency_ms: 1,
            tool_names: Vec::new(),
            request_sha256: String::new(),
            response_preview: String::new(),
            risk_score: 0,
            blocked: false,
            flags: Vec::new(),
            raw_request: String::new(),
            raw_response: String::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryEventStore::new();
        let a = store.insert_event(&sample_event(1)).await.unwrap();
        let b = store.insert_event(&sample_event(1)).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let store = MemoryEventStore::new();
        let id = store.insert_event(&sample_event(1)).await.unwrap();
        store
            .update_security_result(
                id,
                &SecurityResult {
                    risk_score: 55,
                    blocked: false,
                    flags: vec!["burst_spike".to_string()],
                },
            )
            .await
            .unwrap();
        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.risk_score, 55);
        assert_eq!(event.flags, vec!["burst_spike".to_string()]);
    }

    #[tokio::test]
    async fn test_rules_and_hits() {
        let store = MemoryEventStore::new();
        let rule_id = store
            .add_rule(PolicyRule {
                id: 0,
                tenant_id: 3,
                name: "r".to_string(),
                description: String::new(),
                condition: "cost > 1".to_string(),
                action: RuleAction::Block,
                severity: RuleSeverity::Critical,
                enabled: true,
                hit_count: 0,
                created_at: Utc::now(),
            })
            .await;

        store.record_rule_hit(rule_id).await.unwrap();
        let rules = store.enabled_rules(3).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].hit_count, 1);
        assert!(store.enabled_rules(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_block_is_tenant_scoped() {
        let store = MemoryEventStore::new();
        store.block_agent(1, "a").await.unwrap();
        assert!(store.is_agent_blocked(1, "a").await.unwrap());
        assert!(!store.is_agent_blocked(2, "a").await.unwrap());
    }
}

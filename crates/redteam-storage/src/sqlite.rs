//! SQLite-backed event store.
//!
//! Events, tenants, policy rules, and the agent block list each live in
//! their own table. List-valued columns (`tool_names`, `flags`) are stored
//! as JSON TEXT. Schema is created on open with idempotent statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redteam_core::{
    EventStore, LoggedEvent, PolicyRule, ProxyError, Result, RuleAction, RuleSeverity,
    SecurityResult, Tenant,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        tenant_id INTEGER NOT NULL,
        agent_id TEXT,
        model TEXT NOT NULL,
        prompt_tokens INTEGER NOT NULL DEFAULT 0,
        completion_tokens INTEGER NOT NULL DEFAULT 0,
        cost_usd REAL NOT NULL DEFAULT 0,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        tool_names TEXT NOT NULL DEFAULT '[]',
        request_sha256 TEXT NOT NULL,
        response_preview TEXT NOT NULL DEFAULT '',
        risk_score INTEGER NOT NULL DEFAULT 0,
        blocked INTEGER NOT NULL DEFAULT 0,
        flags TEXT NOT NULL DEFAULT '[]',
        raw_request TEXT NOT NULL,
        raw_response TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_tenant_ts ON events(tenant_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS tenants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        api_key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        monthly_event_limit INTEGER NOT NULL DEFAULT 10000,
        blocked INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS policy_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        condition TEXT NOT NULL,
        action TEXT NOT NULL DEFAULT 'ALERT',
        severity TEXT NOT NULL DEFAULT 'MEDIUM',
        enabled INTEGER NOT NULL DEFAULT 1,
        hit_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rules_tenant ON policy_rules(tenant_id, enabled)",
    "CREATE TABLE IF NOT EXISTS blocked_agents (
        tenant_id INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        blocked_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, agent_id)
    )",
];

// ---------------------------------------------------------------------------
// Pool builder
// ---------------------------------------------------------------------------

/// Open (or create) a SQLite connection pool for the proxy.
async fn open_pool(database_path: &str) -> Result<SqlitePool> {
    let url = if database_path.starts_with("sqlite:") {
        database_path.to_string()
    } else {
        format!("sqlite:{database_path}")
    };
    let connect_opts = SqliteConnectOptions::from_str(&url)
        .map_err(|e| ProxyError::Storage(format!("invalid database path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // In-memory databases give every connection its own database, so pin
    // the pool to a single connection for a consistent view.
    let max_conns: u32 = if url.contains(":memory:") { 1 } else { 10 };

    sqlx::pool::PoolOptions::<Sqlite>::new()
        .max_connections(max_conns)
        .connect_with(connect_opts)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to connect to SQLite: {e}")))
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProxyError::Storage(format!("invalid datetime '{s}': {e}")))
}

fn string_list(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| ProxyError::Storage(format!("invalid list column JSON: {e}")))
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LoggedEvent> {
    Ok(LoggedEvent {
        id: row.get("id"),
        timestamp: parse_datetime(&row.get::<String, _>("timestamp"))?,
        tenant_id: row.get("tenant_id"),
        agent_id: row.get("agent_id"),
        model: row.get("model"),
        prompt_tokens: row.get::<i64, _>("prompt_tokens") as u32,
        completion_tokens: row.get::<i64, _>("completion_tokens") as u32,
        cost_usd: row.get("cost_usd"),
        latency_ms: row.get::<i64, _>("latency_ms") as u64,
        tool_names: string_list(&row.get::<String, _>("tool_names"))?,
        request_sha256: row.get("request_sha256"),
        response_preview: row.get("response_preview"),
        risk_score: row.get::<i64, _>("risk_score") as u8,
        blocked: row.get::<i64, _>("blocked") != 0,
        flags: string_list(&row.get::<String, _>("flags"))?,
        raw_request: row.get("raw_request"),
        raw_response: row.get("raw_response"),
    })
}

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PolicyRule> {
    Ok(PolicyRule {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        description: row.get("description"),
        condition: row.get("condition"),
        action: RuleAction::parse(&row.get::<String, _>("action")),
        severity: RuleSeverity::parse(&row.get::<String, _>("severity")),
        enabled: row.get::<i64, _>("enabled") != 0,
        hit_count: row.get("hit_count"),
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

// ---------------------------------------------------------------------------
// SqliteEventStore
// ---------------------------------------------------------------------------

/// SQLite-backed implementation of [`EventStore`].
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (or create) the database at `database_path` and run migrations.
    pub async fn new(database_path: &str) -> Result<Self> {
        let pool = open_pool(database_path).await?;
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| ProxyError::Storage(format!("migration failed: {e}")))?;
        }
        Ok(Self { pool })
    }

    /// Insert a tenant row. Used by provisioning tooling and tests.
    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO tenants (api_key, name, monthly_event_limit, blocked)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&tenant.api_key)
        .bind(&tenant.name)
        .bind(tenant.monthly_event_limit)
        .bind(tenant.blocked as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to insert tenant: {e}")))?;
        Ok(result.last_insert_rowid())
    }

    /// Insert a policy rule row. Used by provisioning tooling and tests.
    pub async fn insert_rule(&self, rule: &PolicyRule) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO policy_rules
                (tenant_id, name, description, condition, action, severity, enabled, hit_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.condition)
        .bind(rule.action.as_str())
        .bind(rule.severity.as_str())
        .bind(rule.enabled as i64)
        .bind(rule.hit_count)
        .bind(rule.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to insert rule: {e}")))?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert_event(&self, event: &LoggedEvent) -> Result<i64> {
        let tool_names = serde_json::to_string(&event.tool_names)?;
        let flags = serde_json::to_string(&event.flags)?;

        let result = sqlx::query(
            "INSERT INTO events (
                timestamp, tenant_id, agent_id, model,
                prompt_tokens, completion_tokens, cost_usd, latency_ms,
                tool_names, request_sha256, response_preview,
                risk_score, blocked, flags, raw_request, raw_response
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8,
                ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16
            )",
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(event.tenant_id)
        .bind(&event.agent_id)
        .bind(&event.model)
        .bind(event.prompt_tokens as i64)
        .bind(event.completion_tokens as i64)
        .bind(event.cost_usd)
        .bind(event.latency_ms as i64)
        .bind(tool_names)
        .bind(&event.request_sha256)
        .bind(&event.response_preview)
        .bind(event.risk_score as i64)
        .bind(event.blocked as i64)
        .bind(flags)
        .bind(&event.raw_request)
        .bind(&event.raw_response)
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to insert event: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    async fn update_security_result(&self, event_id: i64, result: &SecurityResult) -> Result<()> {
        let flags = serde_json::to_string(&result.flags)?;
        sqlx::query("UPDATE events SET risk_score = ?1, blocked = ?2, flags = ?3 WHERE id = ?4")
            .bind(result.risk_score as i64)
            .bind(result.blocked as i64)
            .bind(flags)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::Storage(format!("failed to update event {event_id}: {e}")))?;
        Ok(())
    }

    async fn get_event(&self, event_id: i64) -> Result<Option<LoggedEvent>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProxyError::Storage(format!("failed to fetch event {event_id}: {e}")))?;
        row.map(|r| event_from_row(&r)).transpose()
    }

    async fn count_events_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt FROM events WHERE tenant_id = ?1 AND timestamp >= ?2",
        )
        .bind(tenant_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to count events: {e}")))?;
        Ok(row.get("cnt"))
    }

    async fn get_tenant_by_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE api_key = ?1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProxyError::Storage(format!("failed to fetch tenant: {e}")))?;
        Ok(row.map(|r| Tenant {
            id: r.get("id"),
            api_key: r.get("api_key"),
            name: r.get("name"),
            monthly_event_limit: r.get("monthly_event_limit"),
            blocked: r.get::<i64, _>("blocked") != 0,
        }))
    }

    async fn enabled_rules(&self, tenant_id: i64) -> Result<Vec<PolicyRule>> {
        let rows =
            sqlx::query("SELECT * FROM policy_rules WHERE tenant_id = ?1 AND enabled = 1")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ProxyError::Storage(format!("failed to fetch rules: {e}")))?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn record_rule_hit(&self, rule_id: i64) -> Result<()> {
        sqlx::query("UPDATE policy_rules SET hit_count = hit_count + 1 WHERE id = ?1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::Storage(format!("failed to record rule hit: {e}")))?;
        Ok(())
    }

    async fn is_agent_blocked(&self, tenant_id: i64, agent_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM blocked_agents WHERE tenant_id = ?1 AND agent_id = ?2",
        )
        .bind(tenant_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to check agent block: {e}")))?;
        Ok(row.is_some())
    }

    async fn block_agent(&self, tenant_id: i64, agent_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO blocked_agents (tenant_id, agent_id, blocked_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(tenant_id)
        .bind(agent_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::Storage(format!("failed to block agent: {e}")))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::Storage(format!("health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteEventStore {
        SqliteEventStore::new("sqlite::memory:").await.unwrap()
    }

    fn sample_event(tenant_id: i64) -> LoggedEvent {
        LoggedEvent {
            id: 0,
            timestamp: Utc::now(),
            tenant_id,
            agent_id: Some("agent-7".to_string()),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            cost_usd: 0.000225,
            latency_ms: 42,
            tool_names: vec!["web_search".to_string()],
            request_sha256: "00".repeat(32),
            response_preview: "hello".to_string(),
            risk_score: 0,
            blocked: false,
            flags: Vec::new(),
            raw_request: r#"{"model":"gpt-4o"}"#.to_string(),
            raw_response: r#"{"choices":[]}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_event() {
        let store = store().await;
        let id = store.insert_event(&sample_event(1)).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.tenant_id, 1);
        assert_eq!(fetched.model, "gpt-4o");
        assert_eq!(fetched.tool_names, vec!["web_search".to_string()]);
        assert_eq!(fetched.risk_score, 0);
        assert!(!fetched.blocked);
    }

    #[tokio::test]
    async fn test_update_security_result() {
        let store = store().await;
        let id = store.insert_event(&sample_event(1)).await.unwrap();

        let result = SecurityResult {
            risk_score: 91,
            blocked: true,
            flags: vec!["credential_access".to_string(), "jailbreak".to_string()],
        };
        store.update_security_result(id, &result).await.unwrap();

        let fetched = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(fetched.risk_score, 91);
        assert!(fetched.blocked);
        assert_eq!(fetched.flags, result.flags);
    }

    #[tokio::test]
    async fn test_count_events_since() {
        let store = store().await;
        let since = Utc::now() - chrono::Duration::minutes(1);
        for _ in 0..3 {
            store.insert_event(&sample_event(5)).await.unwrap();
        }
        // Other tenant's events don't count
        store.insert_event(&sample_event(6)).await.unwrap();

        assert_eq!(store.count_events_since(5, since).await.unwrap(), 3);
        assert_eq!(store.count_events_since(6, since).await.unwrap(), 1);
        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(store.count_events_since(5, future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tenant_lookup() {
        let store = store().await;
        let id = store
            .insert_tenant(&Tenant {
                id: 0,
                api_key: "rt_live_abc".to_string(),
                name: "acme".to_string(),
                monthly_event_limit: 500,
                blocked: false,
            })
            .await
            .unwrap();

        let tenant = store.get_tenant_by_key("rt_live_abc").await.unwrap().unwrap();
        assert_eq!(tenant.id, id);
        assert_eq!(tenant.monthly_event_limit, 500);
        assert!(!tenant.blocked);

        assert!(store.get_tenant_by_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enabled_rules_filters_disabled() {
        let store = store().await;
        let mut rule = PolicyRule {
            id: 0,
            tenant_id: 2,
            name: "expensive".to_string(),
            description: String::new(),
            condition: "cost > 0.50".to_string(),
            action: RuleAction::Block,
            severity: RuleSeverity::High,
            enabled: true,
            hit_count: 0,
            created_at: Utc::now(),
        };
        store.insert_rule(&rule).await.unwrap();
        rule.enabled = false;
        rule.name = "disabled".to_string();
        store.insert_rule(&rule).await.unwrap();

        let rules = store.enabled_rules(2).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "expensive");
        assert_eq!(rules[0].action, RuleAction::Block);
        assert_eq!(rules[0].severity, RuleSeverity::High);
    }

    #[tokio::test]
    async fn test_record_rule_hit() {
        let store = store().await;
        let rule_id = store
            .insert_rule(&PolicyRule {
                id: 0,
                tenant_id: 1,
                name: "r".to_string(),
                description: String::new(),
                condition: "true".to_string(),
                action: RuleAction::Alert,
                severity: RuleSeverity::Low,
                enabled: true,
                hit_count: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.record_rule_hit(rule_id).await.unwrap();
        store.record_rule_hit(rule_id).await.unwrap();

        let rules = store.enabled_rules(1).await.unwrap();
        assert_eq!(rules[0].hit_count, 2);
    }

    #[tokio::test]
    async fn test_agent_block_list() {
        let store = store().await;
        assert!(!store.is_agent_blocked(1, "rogue").await.unwrap());

        store.block_agent(1, "rogue").await.unwrap();
        // Idempotent
        store.block_agent(1, "rogue").await.unwrap();

        assert!(store.is_agent_blocked(1, "rogue").await.unwrap());
        // Namespaced by tenant
        assert!(!store.is_agent_blocked(2, "rogue").await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = store().await;
        assert!(store.health_check().await.is_ok());
    }
}

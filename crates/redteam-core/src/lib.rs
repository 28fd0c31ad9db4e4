//! Core types, traits, and errors for the RedTeamingAI proxy
//!
//! This crate contains the foundational data structures shared across all
//! proxy components: intercepted events, tenants, policy rules, the
//! persistence trait, configuration, and the error enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod config;

pub use config::{LoggingConfig, ProxyConfig, StorageConfig};

// ---------------------------------------------------------------------------
// Logged events
// ---------------------------------------------------------------------------

/// One intercepted LLM API call.
///
/// Created once per request by the interceptor with `risk_score = 0` and
/// `blocked = false`, then mutated exactly once after analysis via
/// [`EventStore::update_security_result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Row id assigned by the store; `0` until inserted.
    pub id: i64,
    /// When the request was intercepted.
    pub timestamp: DateTime<Utc>,
    /// Tenant that issued the request.
    pub tenant_id: i64,
    /// Caller-supplied agent identifier, if any.
    pub agent_id: Option<String>,
    /// Model name from the request body (empty if unparseable).
    pub model: String,
    /// Prompt/input tokens reported by the upstream (0 if absent).
    pub prompt_tokens: u32,
    /// Completion/output tokens reported by the upstream (0 if absent).
    pub completion_tokens: u32,
    /// Estimated cost in USD, truncated to 8 decimals.
    pub cost_usd: f64,
    /// Request latency in milliseconds (first-byte time for streams).
    pub latency_ms: u64,
    /// Tool names requested in the request body.
    pub tool_names: Vec<String>,
    /// Hex SHA-256 of the raw request body.
    pub request_sha256: String,
    /// First 256 characters of the raw response.
    pub response_preview: String,
    /// Combined risk score, 0–100.
    pub risk_score: u8,
    /// Whether the security pipeline blocked this call.
    pub blocked: bool,
    /// Deduplicated flag names from all three engines.
    pub flags: Vec<String>,
    /// Verbatim raw request body.
    pub raw_request: String,
    /// Verbatim raw response body.
    pub raw_response: String,
}

/// The post-analysis projection persisted onto a [`LoggedEvent`] row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityResult {
    /// Combined risk score, 0–100.
    pub risk_score: u8,
    /// Final block decision.
    pub blocked: bool,
    /// Deduplicated flag names, first-seen order.
    pub flags: Vec<String>,
}

/// Truncate a string to at most `max` characters (not bytes), preserving
/// UTF-8 boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

/// A customer account. Consumed read-only by the proxy core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    /// Opaque API key presented in `X-RedTeamingAI-Key`.
    pub api_key: String,
    pub name: String,
    /// Maximum events per calendar month.
    pub monthly_event_limit: i64,
    /// A blocked tenant fails authentication outright.
    pub blocked: bool,
}

// ---------------------------------------------------------------------------
// Policy rules
// ---------------------------------------------------------------------------

/// Action taken when a policy rule's condition matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Allow,
    Block,
    Alert,
}

impl RuleAction {
    /// Stable string form used in storage and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "ALLOW",
            RuleAction::Block => "BLOCK",
            RuleAction::Alert => "ALERT",
        }
    }

    /// Parse from the stable string form. Unknown values map to `Allow`
    /// so a corrupt row can never escalate to a block.
    pub fn parse(s: &str) -> Self {
        match s {
            "BLOCK" => RuleAction::Block,
            "ALERT" => RuleAction::Alert,
            _ => RuleAction::Allow,
        }
    }
}

/// Severity of a policy rule, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RuleSeverity {
    /// Contribution to the policy engine score when a rule matches.
    pub fn score(&self) -> u32 {
        match self {
            RuleSeverity::Low => 10,
            RuleSeverity::Medium => 20,
            RuleSeverity::High => 30,
            RuleSeverity::Critical => 40,
        }
    }

    /// Stable string form used in storage and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSeverity::Low => "LOW",
            RuleSeverity::Medium => "MEDIUM",
            RuleSeverity::High => "HIGH",
            RuleSeverity::Critical => "CRITICAL",
        }
    }

    /// Parse from the stable string form; unknown values map to `Low`.
    pub fn parse(s: &str) -> Self {
        match s {
            "MEDIUM" => RuleSeverity::Medium,
            "HIGH" => RuleSeverity::High,
            "CRITICAL" => RuleSeverity::Critical,
            _ => RuleSeverity::Low,
        }
    }
}

/// A tenant-owned security policy rule.
///
/// The `condition` field holds source text for the restricted condition
/// interpreter. Disabled rules are never evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub description: String,
    /// Condition source text, e.g. `cost > 0.50 && tools.contains("exec")`.
    pub condition: String,
    pub action: RuleAction,
    pub severity: RuleSeverity,
    pub enabled: bool,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error type for the proxy.
///
/// Only the interceptor turns these into client-visible responses; every
/// other component converts its failures into a non-match or empty result.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("authentication required")]
    AuthMissing,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("agent {agent_id} is blocked")]
    AgentBlocked { agent_id: String },

    #[error("monthly event limit of {limit} reached")]
    QuotaExceeded { limit: i64 },

    #[error("no upstream provider for path {0}")]
    UnsupportedProvider(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProxyError {
    /// Stable machine-readable code included in client-visible error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::AuthMissing => "AUTH_REQUIRED",
            ProxyError::AuthInvalid => "AUTH_INVALID",
            ProxyError::AgentBlocked { .. } => "AGENT_BLOCKED",
            ProxyError::QuotaExceeded { .. } => "PLAN_LIMIT",
            ProxyError::UnsupportedProvider(_)
            | ProxyError::Upstream(_)
            | ProxyError::Storage(_)
            | ProxyError::Config(_)
            | ProxyError::Serialization(_) => "PROXY_ERROR",
        }
    }

    /// HTTP status the interceptor uses when surfacing this error.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::AuthMissing | ProxyError::AuthInvalid => 401,
            ProxyError::AgentBlocked { .. } => 403,
            ProxyError::QuotaExceeded { .. } => 429,
            ProxyError::UnsupportedProvider(_) => 404,
            _ => 502,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

// ---------------------------------------------------------------------------
// Persistence trait
// ---------------------------------------------------------------------------

/// Persistence handle for events, tenants, policy rules, and agent blocks.
///
/// Implementations serialize their own writes; callers treat `insert_event`
/// and `update_security_result` as atomic operations.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Insert an event (the `id` field is ignored) and return the assigned id.
    async fn insert_event(&self, event: &LoggedEvent) -> Result<i64>;

    /// Atomically apply the post-analysis security result to an event row.
    async fn update_security_result(&self, event_id: i64, result: &SecurityResult) -> Result<()>;

    /// Fetch a single event by id.
    async fn get_event(&self, event_id: i64) -> Result<Option<LoggedEvent>>;

    /// Count events logged for a tenant since `since` (inclusive).
    async fn count_events_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<i64>;

    /// Look up a tenant by its opaque API key.
    async fn get_tenant_by_key(&self, api_key: &str) -> Result<Option<Tenant>>;

    /// Fetch the enabled policy rules for a tenant.
    async fn enabled_rules(&self, tenant_id: i64) -> Result<Vec<PolicyRule>>;

    /// Increment a rule's hit counter.
    async fn record_rule_hit(&self, rule_id: i64) -> Result<()>;

    /// Whether the given (tenant, agent) pair is on the block list.
    async fn is_agent_blocked(&self, tenant_id: i64, agent_id: &str) -> Result<bool>;

    /// Add a (tenant, agent) pair to the block list. Idempotent.
    async fn block_agent(&self, tenant_id: i64, agent_id: &str) -> Result<()>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

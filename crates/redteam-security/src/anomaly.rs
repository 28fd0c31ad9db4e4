//! Heuristic anomaly detection engine.
//!
//! Scores each intercepted event against its agent's sliding window plus a
//! set of fixed per-event heuristics. Every rule emits at most one flag;
//! scores are additive and capped at 100. Two rules (`file_exfiltration`,
//! `credential_access`) are hard blocks regardless of total score.

use crate::window::SlidingWindowStore;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use redteam_core::LoggedEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Score at or above which the engine requests a block on its own.
const BLOCK_SCORE_THRESHOLD: u32 = 80;

/// Raw request size above which `large_payload` fires, in bytes.
const LARGE_PAYLOAD_BYTES: usize = 51_200;

/// Cost above which `excessive_cost` fires, in USD.
const EXCESSIVE_COST_USD: f64 = 0.50;

static EXTERNAL_NETWORK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)http|fetch|request|webhook").unwrap());
static CREDENTIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)secret|password|api.?key|token|credential").unwrap());
static RECURSIVE_SPAWN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)agent|delegate|spawn").unwrap());
static ERROR_RESPONSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)error|fail(ed|ure)?|exception").unwrap());

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Result of the anomaly engine for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Additive score, capped at 100.
    pub score: u8,
    /// Names of the rules that fired, in rule order.
    pub flags: Vec<String>,
    /// Block hint: score ≥ 80 or any hard-block rule fired.
    pub should_block: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Sliding-window anomaly engine.
pub struct AnomalyEngine {
    windows: Arc<SlidingWindowStore>,
}

impl AnomalyEngine {
    pub fn new(windows: Arc<SlidingWindowStore>) -> Self {
        Self { windows }
    }

    /// Record the event into its agent's window and evaluate every rule.
    pub fn analyze(&self, event: &LoggedEvent, now: DateTime<Utc>) -> AnomalyReport {
        let is_error = is_error_response(&event.raw_response);

        // Record first, then read back counts, so the current call is part
        // of the window it is judged against.
        let (calls_10s, calls_5m, errors_10m, distinct_tools) = self.windows.with_window(
            event.tenant_id,
            event.agent_id.as_deref(),
            |window| {
                window.call_timestamps.push(now);
                window
                    .observed_tools
                    .extend(event.tool_names.iter().cloned());
                if is_error {
                    window.error_timestamps.push(now);
                }
                (
                    window.calls_within(Duration::seconds(10), now),
                    window.calls_within(Duration::minutes(5), now),
                    window.errors_within(Duration::minutes(10), now),
                    window.distinct_tools(),
                )
            },
        );

        let mut score: u32 = 0;
        let mut flags = Vec::new();
        let mut hard_block = false;
        let mut hit = |name: &str, points: u32, hard: bool| {
            score += points;
            flags.push(name.to_string());
            hard_block |= hard;
        };

        if calls_5m > 20 {
            hit("high_frequency", 40, false);
        }
        if calls_10s > 5 {
            hit("burst_spike", 35, false);
        }
        if event.raw_request.len() > LARGE_PAYLOAD_BYTES {
            hit("large_payload", 25, false);
        }
        if event.cost_usd > EXCESSIVE_COST_USD {
            hit("excessive_cost", 30, false);
        }
        let exfil_calls = event
            .tool_names
            .iter()
            .filter(|t| *t == "file_read" || *t == "list_directory")
            .count();
        if exfil_calls > 10 {
            hit("file_exfiltration", 50, true);
        }
        if event
            .tool_names
            .iter()
            .any(|t| EXTERNAL_NETWORK_RE.is_match(t))
        {
            hit("external_network", 45, false);
        }
        if event.tool_names.iter().any(|t| CREDENTIAL_RE.is_match(t)) {
            hit("credential_access", 60, true);
        }
        if event
            .tool_names
            .iter()
            .any(|t| RECURSIVE_SPAWN_RE.is_match(t))
        {
            hit("recursive_spawn", 35, false);
        }
        if errors_10m > 5 {
            hit("repeated_failures", 30, false);
        }
        if distinct_tools > 8 {
            hit("tool_enumeration", 45, false);
        }

        let capped = score.min(100);
        let should_block = capped >= BLOCK_SCORE_THRESHOLD || hard_block;

        if !flags.is_empty() {
            debug!(
                tenant_id = event.tenant_id,
                agent_id = ?event.agent_id,
                score = capped,
                ?flags,
                should_block,
                "anomaly flags raised"
            );
        }

        AnomalyReport {
            score: capped as u8,
            flags,
            should_block,
        }
    }
}

/// Classify a raw response body as an error.
///
/// Either the text matches the error keyword pattern, or it parses as JSON
/// carrying an `error` field.
fn is_error_response(raw_response: &str) -> bool {
    if ERROR_RESPONSE_RE.is_match(raw_response) {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(raw_response)
        .ok()
        .map(|v| v.get("error").is_some())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AnomalyEngine {
        AnomalyEngine::new(Arc::new(SlidingWindowStore::new()))
    }

    fn event(tenant_id: i64, agent_id: &str) -> LoggedEvent {
        LoggedEvent {
            id: 0,
            timestamp: Utc::now(),
            tenant_id,
            agent_id: Some(agent_id.to_string()),
            model: "gpt-4o".to_string(),
            prompt_tokens: 10,
            completion_tokens: 10,
            cost_usd: 0.001,
            latency_ms: 50,
            tool_names: Vec::new(),
            request_sha256: String::new(),
            response_preview: String::new(),
            raw_request: "{}".to_string(),
            raw_response: r#"{"choices":[{"message":{"content":"ok"}}]}"#.to_string(),
            risk_score: 0,
            blocked: false,
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_quiet_event_scores_zero() {
        let report = engine().analyze(&event(1, "a"), Utc::now());
        assert_eq!(report.score, 0);
        assert!(report.flags.is_empty());
        assert!(!report.should_block);
    }

    #[test]
    fn test_burst_spike_on_sixth_call() {
        let engine = engine();
        let now = Utc::now();
        let e = event(1, "bursty");
        for i in 0..5 {
            let report = engine.analyze(&e, now + Duration::seconds(i));
            assert!(
                !report.flags.contains(&"burst_spike".to_string()),
                "call {} should not trip the burst rule",
                i + 1
            );
        }
        let report = engine.analyze(&e, now + Duration::seconds(5));
        assert!(report.flags.contains(&"burst_spike".to_string()));
        assert_eq!(report.score, 35);
    }

    #[test]
    fn test_high_frequency() {
        let engine = engine();
        let now = Utc::now();
        let e = event(1, "chatty");
        // Spread calls so the 10s burst rule stays quiet
        for i in 0..20 {
            engine.analyze(&e, now + Duration::seconds(i * 12));
        }
        let report = engine.analyze(&e, now + Duration::seconds(20 * 12));
        assert!(report.flags.contains(&"high_frequency".to_string()));
        assert!(!report.flags.contains(&"burst_spike".to_string()));
    }

    #[test]
    fn test_large_payload() {
        let mut e = event(1, "a");
        e.raw_request = "x".repeat(LARGE_PAYLOAD_BYTES + 1);
        let report = engine().analyze(&e, Utc::now());
        assert_eq!(report.flags, vec!["large_payload".to_string()]);
        assert_eq!(report.score, 25);
    }

    #[test]
    fn test_excessive_cost() {
        let mut e = event(1, "a");
        e.cost_usd = 0.75;
        let report = engine().analyze(&e, Utc::now());
        assert!(report.flags.contains(&"excessive_cost".to_string()));
    }

    #[test]
    fn test_file_exfiltration_hard_block() {
        let mut e = event(1, "a");
        e.tool_names = vec!["file_read".to_string(); 11];
        let report = engine().analyze(&e, Utc::now());
        assert!(report.flags.contains(&"file_exfiltration".to_string()));
        assert!(report.should_block);
    }

    #[test]
    fn test_file_exfiltration_needs_exact_names() {
        let mut e = event(1, "a");
        e.tool_names = vec!["file_reader".to_string(); 11];
        let report = engine().analyze(&e, Utc::now());
        assert!(!report.flags.contains(&"file_exfiltration".to_string()));
    }

    #[test]
    fn test_credential_access_hard_block() {
        let mut e = event(1, "a");
        e.tool_names = vec!["read_api_key".to_string()];
        let report = engine().analyze(&e, Utc::now());
        assert!(report.flags.contains(&"credential_access".to_string()));
        assert!(report.should_block);
        // Matches the pattern with or without a separator
        let mut e2 = event(1, "b");
        e2.tool_names = vec!["get_apikey".to_string()];
        assert!(engine()
            .analyze(&e2, Utc::now())
            .flags
            .contains(&"credential_access".to_string()));
    }

    #[test]
    fn test_external_network_and_spawn() {
        let mut e = event(1, "a");
        e.tool_names = vec!["http_get".to_string(), "spawn_subagent".to_string()];
        let report = engine().analyze(&e, Utc::now());
        assert!(report.flags.contains(&"external_network".to_string()));
        assert!(report.flags.contains(&"recursive_spawn".to_string()));
        // 45 + 35 lands exactly on the block threshold
        assert_eq!(report.score, 80);
        assert!(report.should_block);
    }

    #[test]
    fn test_repeated_failures() {
        let engine = engine();
        let now = Utc::now();
        let mut e = event(1, "flaky");
        e.raw_response = r#"{"error":{"message":"rate limited"}}"#.to_string();
        for i in 0..5 {
            engine.analyze(&e, now + Duration::seconds(i * 20));
        }
        let report = engine.analyze(&e, now + Duration::seconds(120));
        assert!(report.flags.contains(&"repeated_failures".to_string()));
    }

    #[test]
    fn test_tool_enumeration() {
        let engine = engine();
        let now = Utc::now();
        let mut e = event(1, "prober");
        e.tool_names = (0..9).map(|i| format!("probe_{i}")).collect();
        let report = engine.analyze(&e, now);
        assert!(report.flags.contains(&"tool_enumeration".to_string()));
    }

    #[test]
    fn test_score_capped_at_100() {
        let engine = engine();
        let now = Utc::now();
        let mut e = event(1, "worst");
        e.cost_usd = 5.0;
        e.raw_request = "x".repeat(LARGE_PAYLOAD_BYTES + 1);
        e.tool_names = vec!["file_read".to_string(); 11];
        e.tool_names.push("http_post".to_string());
        e.tool_names.push("read_secret".to_string());
        let report = engine.analyze(&e, now);
        assert_eq!(report.score, 100);
        assert!(report.should_block);
    }

    #[test]
    fn test_agents_do_not_share_windows() {
        let engine = engine();
        let now = Utc::now();
        for i in 0..6 {
            engine.analyze(&event(1, "busy"), now + Duration::seconds(i));
        }
        let report = engine.analyze(&event(1, "idle"), now + Duration::seconds(6));
        assert!(!report.flags.contains(&"burst_spike".to_string()));
    }

    #[test]
    fn test_error_classification() {
        assert!(is_error_response("Internal Server Error"));
        assert!(is_error_response("request FAILED"));
        assert!(is_error_response("unhandled exception in worker"));
        assert!(is_error_response(r#"{"error":"bad request"}"#));
        assert!(!is_error_response(r#"{"choices":[]}"#));
        assert!(!is_error_response("all good"));
    }
}

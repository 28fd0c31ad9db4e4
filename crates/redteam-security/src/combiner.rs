//! Score combiner.
//!
//! Blends the three engine scores into a single risk score and computes the
//! disjunctive block decision. Scores are always blended even when one
//! engine already mandates a block, so telemetry stays complete.

use crate::anomaly::AnomalyReport;
use crate::policy::PolicyReport;
use crate::scanner::ScanReport;
use redteam_core::{RuleAction, SecurityResult};
use serde::{Deserialize, Serialize};

/// Engine weights: anomaly 0.35, injection 0.45, policy 0.20.
const ANOMALY_WEIGHT: f64 = 0.35;
const INJECTION_WEIGHT: f64 = 0.45;
const POLICY_WEIGHT: f64 = 0.20;

/// Scanner confidence at or above which the combiner blocks.
const INJECTION_BLOCK_CONFIDENCE: u8 = 80;

/// The complete security decision for one event.
///
/// Never persisted standalone; its fields are projected into the event row
/// via [`SecurityDecision::to_result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDecision {
    pub event_id: i64,
    /// Weighted blend of the three engine scores, 0–100.
    pub risk_score: u8,
    pub blocked: bool,
    /// First-seen-ordered deduplicated union of all engine flag names.
    pub flags: Vec<String>,
    pub anomaly: AnomalyReport,
    pub injection: ScanReport,
    pub policy: PolicyReport,
    /// Wall-clock time the pipeline spent on this event.
    pub processing_ms: u64,
}

impl SecurityDecision {
    /// Project into the persisted security result.
    pub fn to_result(&self) -> SecurityResult {
        SecurityResult {
            risk_score: self.risk_score,
            blocked: self.blocked,
            flags: self.flags.clone(),
        }
    }
}

/// Blend the three engine reports into a [`SecurityDecision`].
pub fn combine(
    event_id: i64,
    anomaly: AnomalyReport,
    injection: ScanReport,
    policy: PolicyReport,
    processing_ms: u64,
) -> SecurityDecision {
    let blended = ANOMALY_WEIGHT * normalize(anomaly.score as f64)
        + INJECTION_WEIGHT * normalize(injection.score as f64)
        + POLICY_WEIGHT * normalize(policy.score as f64);
    let risk_score = blended.round().clamp(0.0, 100.0) as u8;

    let blocked = anomaly.should_block
        || injection.confidence >= INJECTION_BLOCK_CONFIDENCE
        || policy.action == RuleAction::Block;

    let mut flags = Vec::new();
    let mut push_unique = |name: &str| {
        if !flags.iter().any(|f| f == name) {
            flags.push(name.to_string());
        }
    };
    for flag in &anomaly.flags {
        push_unique(flag);
    }
    for pattern in &injection.patterns {
        push_unique(&pattern.name);
    }
    for violation in &policy.violations {
        push_unique(&violation.rule_name);
    }

    SecurityDecision {
        event_id,
        risk_score,
        blocked,
        flags,
        anomaly,
        injection,
        policy,
        processing_ms,
    }
}

/// Clamp a score into [0, 100]; non-finite values normalize to 0.
fn normalize(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{MatchedPattern, ScanLayer};

    fn anomaly(score: u8, flags: &[&str], should_block: bool) -> AnomalyReport {
        AnomalyReport {
            score,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            should_block,
        }
    }

    fn injection(confidence: u8, names: &[&str]) -> ScanReport {
        ScanReport {
            confidence,
            score: confidence,
            injection_detected: confidence >= 40,
            patterns: names
                .iter()
                .map(|n| MatchedPattern {
                    name: n.to_string(),
                    layer: ScanLayer::Regex,
                    confidence: 30,
                    matched_text: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_weighted_blend() {
        let decision = combine(
            1,
            anomaly(40, &[], false),
            injection(60, &[]),
            PolicyReport::allow(),
            3,
        );
        // 0.35*40 + 0.45*60 + 0.20*0 = 41
        assert_eq!(decision.risk_score, 41);
        assert!(!decision.blocked);
    }

    #[test]
    fn test_rounding() {
        let decision = combine(1, anomaly(25, &[], false), injection(25, &[]), PolicyReport::allow(), 0);
        // 0.35*25 + 0.45*25 = 20.0 exactly
        assert_eq!(decision.risk_score, 20);

        let decision = combine(1, anomaly(30, &[], false), injection(15, &[]), PolicyReport::allow(), 0);
        // 10.5 + 6.75 = 17.25 → 17
        assert_eq!(decision.risk_score, 17);
    }

    #[test]
    fn test_block_on_anomaly_hint() {
        let decision = combine(1, anomaly(60, &[], true), injection(0, &[]), PolicyReport::allow(), 0);
        assert!(decision.blocked);
        // Score is still the blend, independent of the block decision
        assert_eq!(decision.risk_score, 21);
    }

    #[test]
    fn test_block_on_injection_confidence() {
        let at = combine(1, anomaly(0, &[], false), injection(80, &[]), PolicyReport::allow(), 0);
        assert!(at.blocked);
        let below = combine(1, anomaly(0, &[], false), injection(79, &[]), PolicyReport::allow(), 0);
        assert!(!below.blocked);
    }

    #[test]
    fn test_block_on_policy_action() {
        let mut policy = PolicyReport::allow();
        policy.action = RuleAction::Block;
        policy.score = 40;
        let decision = combine(1, anomaly(0, &[], false), injection(0, &[]), policy, 0);
        assert!(decision.blocked);
        assert_eq!(decision.risk_score, 8);
    }

    #[test]
    fn test_alert_action_does_not_block() {
        let mut policy = PolicyReport::allow();
        policy.action = RuleAction::Alert;
        let decision = combine(1, anomaly(0, &[], false), injection(0, &[]), policy, 0);
        assert!(!decision.blocked);
    }

    #[test]
    fn test_flags_deduplicated_first_seen_order() {
        let mut policy = PolicyReport::allow();
        policy.violations.push(crate::policy::PolicyViolation {
            rule_id: 1,
            rule_name: "burst_spike".to_string(), // collides with the anomaly flag
            action: RuleAction::Alert,
            severity: redteam_core::RuleSeverity::Low,
        });
        policy.violations.push(crate::policy::PolicyViolation {
            rule_id: 2,
            rule_name: "no-secrets".to_string(),
            action: RuleAction::Alert,
            severity: redteam_core::RuleSeverity::Low,
        });
        let decision = combine(
            1,
            anomaly(35, &["burst_spike"], false),
            injection(30, &["ignore_all_previous", "burst_spike"]),
            policy,
            0,
        );
        assert_eq!(
            decision.flags,
            vec![
                "burst_spike".to_string(),
                "ignore_all_previous".to_string(),
                "no-secrets".to_string(),
            ]
        );
    }

    #[test]
    fn test_risk_clamped() {
        let decision = combine(1, anomaly(100, &[], true), injection(100, &[]), {
            let mut p = PolicyReport::allow();
            p.score = 100;
            p
        }, 0);
        assert_eq!(decision.risk_score, 100);
    }

    #[test]
    fn test_to_result_projection() {
        let decision = combine(9, anomaly(40, &["excessive_cost"], false), injection(0, &[]), PolicyReport::allow(), 2);
        let result = decision.to_result();
        assert_eq!(result.risk_score, decision.risk_score);
        assert_eq!(result.blocked, decision.blocked);
        assert_eq!(result.flags, decision.flags);
    }

    #[test]
    fn test_normalize_non_finite() {
        assert_eq!(normalize(f64::NAN), 0.0);
        assert_eq!(normalize(f64::INFINITY), 0.0);
        assert_eq!(normalize(-5.0), 0.0);
        assert_eq!(normalize(250.0), 100.0);
    }
}

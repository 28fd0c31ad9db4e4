//! Security analysis engines for the RedTeamingAI proxy
//!
//! Three engines score every intercepted event:
//!
//! - [`AnomalyEngine`]: heuristics over per-agent sliding windows.
//! - [`InjectionScanner`]: pattern scan over the raw request payload.
//! - [`PolicyEngine`]: user-defined rules evaluated in a restricted,
//!   budgeted condition interpreter.
//!
//! [`SecurityPipeline`] runs all three and blends their scores into a
//! [`SecurityDecision`] via the combiner. The pipeline is fail-open: it
//! always produces a decision, and exceeding the soft latency budget is
//! logged rather than aborted.

pub mod anomaly;
pub mod combiner;
pub mod condition;
pub mod policy;
pub mod scanner;
pub mod window;

pub use anomaly::{AnomalyEngine, AnomalyReport};
pub use combiner::{combine, SecurityDecision};
pub use policy::{PolicyEngine, PolicyReport, PolicyViolation};
pub use scanner::{InjectionScanner, MatchedPattern, ScanLayer, ScanReport};
pub use window::{SlidingWindowStore, EVICTION_INTERVAL_SECS};

use chrono::Utc;
use redteam_core::{EventStore, LoggedEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Soft wall-clock budget for the whole pipeline, in milliseconds.
/// Exceeding it never aborts analysis; it is logged for operators.
const PIPELINE_BUDGET_MS: u64 = 10;

/// Orchestrates the three engines and the combiner.
pub struct SecurityPipeline {
    anomaly: AnomalyEngine,
    scanner: InjectionScanner,
    policy: PolicyEngine,
}

impl SecurityPipeline {
    pub fn new(windows: Arc<SlidingWindowStore>, store: Arc<dyn EventStore>) -> Self {
        Self {
            anomaly: AnomalyEngine::new(windows),
            scanner: InjectionScanner::new(),
            policy: PolicyEngine::new(store),
        }
    }

    /// Analyze one event and produce the blended decision.
    ///
    /// The anomaly and injection scans run synchronously while the policy
    /// engine (which may touch the store on a cold cache) is awaited
    /// concurrently; only its result gates the combiner.
    pub async fn analyze(&self, event: &LoggedEvent) -> SecurityDecision {
        let started = Instant::now();

        let ((anomaly, injection), policy) = tokio::join!(
            async {
                (
                    self.anomaly.analyze(event, Utc::now()),
                    self.scanner.scan(event),
                )
            },
            self.policy.evaluate(event),
        );

        let processing_ms = started.elapsed().as_millis() as u64;
        if processing_ms > PIPELINE_BUDGET_MS {
            warn!(
                event_id = event.id,
                processing_ms,
                budget_ms = PIPELINE_BUDGET_MS,
                "security pipeline exceeded its latency budget"
            );
        }

        combine(event.id, anomaly, injection, policy, processing_ms)
    }

    /// Access the policy engine (cache invalidation on rule changes).
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }
}

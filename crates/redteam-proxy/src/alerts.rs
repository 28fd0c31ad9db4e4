//! Alert signal queue.
//!
//! The proxy core does not deliver alerts; it enqueues an [`AlertSignal`]
//! whenever an event is blocked or scores above the alert threshold, and an
//! external dispatcher drains the queue. Enqueueing is non-blocking: a full
//! queue drops the signal with a warning rather than stalling the request
//! path.

use chrono::{DateTime, Utc};
use redteam_core::LoggedEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Risk score above which an alert is raised even without a block.
const ALERT_RISK_THRESHOLD: u8 = 50;

/// One queued alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSignal {
    pub event_id: i64,
    pub tenant_id: i64,
    pub agent_id: Option<String>,
    pub risk_score: u8,
    pub blocked: bool,
    pub flags: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

/// Sending side of the alert queue, cloned into the interceptor.
#[derive(Clone)]
pub struct AlertSink {
    tx: mpsc::Sender<AlertSignal>,
}

impl AlertSink {
    /// Create a sink with a bounded queue; the receiver goes to the
    /// external alert dispatcher.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertSignal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an alert for a finalized event if it is blocked or its risk
    /// score exceeds the threshold. Returns whether a signal was queued.
    pub fn maybe_signal(&self, event: &LoggedEvent) -> bool {
        if !event.blocked && event.risk_score <= ALERT_RISK_THRESHOLD {
            return false;
        }
        let signal = AlertSignal {
            event_id: event.id,
            tenant_id: event.tenant_id,
            agent_id: event.agent_id.clone(),
            risk_score: event.risk_score,
            blocked: event.blocked,
            flags: event.flags.clone(),
            raised_at: Utc::now(),
        };
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(e) => {
                warn!(event_id = event.id, "alert queue full or closed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(risk_score: u8, blocked: bool) -> LoggedEvent {
        LoggedEvent {
            id: 11,
            timestamp: Utc::now(),
            tenant_id: 1,
            agent_id: None,
            model: "gpt-4o".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            tool_names: Vec::new(),
            request_sha256: String::new(),
            response_preview: String::new(),
            risk_score,
            blocked,
            flags: vec!["f".to_string()],
            raw_request: String::new(),
            raw_response: String::new(),
        }
    }

    #[tokio::test]
    async fn test_signal_on_block() {
        let (sink, mut rx) = AlertSink::new(4);
        assert!(sink.maybe_signal(&event(10, true)));
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.event_id, 11);
        assert!(signal.blocked);
    }

    #[tokio::test]
    async fn test_signal_on_high_risk() {
        let (sink, mut rx) = AlertSink::new(4);
        assert!(sink.maybe_signal(&event(51, false)));
        assert_eq!(rx.recv().await.unwrap().risk_score, 51);
    }

    #[tokio::test]
    async fn test_no_signal_below_threshold() {
        let (sink, _rx) = AlertSink::new(4);
        assert!(!sink.maybe_signal(&event(50, false)));
        assert!(!sink.maybe_signal(&event(0, false)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sink, _rx) = AlertSink::new(1);
        assert!(sink.maybe_signal(&event(90, true)));
        // Queue is full now; the second signal is dropped, not awaited
        assert!(!sink.maybe_signal(&event(90, true)));
    }
}

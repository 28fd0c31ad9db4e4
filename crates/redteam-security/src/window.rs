//! Per-agent sliding windows.
//!
//! Tracks call timestamps, error timestamps, and observed tool names per
//! (tenant, agent) pair. Windows retain ten minutes of history; a periodic
//! sweep drops expired timestamps and removes windows that have gone silent.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// Bucket used when a request carries no agent id.
pub const ANONYMOUS_AGENT: &str = "anonymous";

/// How long window entries are retained, in minutes.
pub const WINDOW_RETENTION_MINUTES: i64 = 10;

/// Interval between eviction sweeps, in seconds.
pub const EVICTION_INTERVAL_SECS: u64 = 60;

/// Map key for a window: agent ids are namespaced by tenant so there is no
/// cross-tenant visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub tenant_id: i64,
    pub agent_id: String,
}

impl WindowKey {
    /// Build a key, mapping an absent agent id to the anonymous bucket.
    pub fn new(tenant_id: i64, agent_id: Option<&str>) -> Self {
        Self {
            tenant_id,
            agent_id: agent_id.unwrap_or(ANONYMOUS_AGENT).to_string(),
        }
    }
}

/// Transient sliding-window state for one (tenant, agent) pair.
#[derive(Debug, Default, Clone)]
pub struct AgentWindow {
    /// Ordered timestamps of intercepted calls.
    pub call_timestamps: Vec<DateTime<Utc>>,
    /// Ordered timestamps of calls whose response classified as an error.
    pub error_timestamps: Vec<DateTime<Utc>>,
    /// Bag of tool names observed within the retention period.
    pub observed_tools: Vec<String>,
}

impl AgentWindow {
    /// Count calls newer than `now - window`.
    pub fn calls_within(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.call_timestamps.iter().filter(|t| **t > cutoff).count()
    }

    /// Count errors newer than `now - window`.
    pub fn errors_within(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.error_timestamps.iter().filter(|t| **t > cutoff).count()
    }

    /// Number of distinct tool names observed.
    pub fn distinct_tools(&self) -> usize {
        self.observed_tools
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Drop timestamps at or before `cutoff`.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        self.call_timestamps.retain(|t| *t > cutoff);
        self.error_timestamps.retain(|t| *t > cutoff);
    }
}

/// Shared store of per-agent sliding windows.
///
/// Mutation happens through [`SlidingWindowStore::with_window`], which holds
/// the map's shard guard for the duration of the closure, so per-window
/// mutations are therefore serialized, and windows never contend with each
/// other across shards.
pub struct SlidingWindowStore {
    windows: DashMap<WindowKey, AgentWindow>,
}

impl SlidingWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Run `f` against the window for `(tenant_id, agent_id)`, creating it
    /// if absent.
    pub fn with_window<R>(
        &self,
        tenant_id: i64,
        agent_id: Option<&str>,
        f: impl FnOnce(&mut AgentWindow) -> R,
    ) -> R {
        let key = WindowKey::new(tenant_id, agent_id);
        let mut entry = self.windows.entry(key).or_default();
        f(entry.value_mut())
    }

    /// Eviction sweep: drop timestamps older than the retention period and
    /// remove windows with no remaining call timestamps. Bounds memory
    /// regardless of tenant churn.
    pub fn evict(&self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(WINDOW_RETENTION_MINUTES);
        self.windows.retain(|_, window| {
            window.evict_before(cutoff);
            !window.call_timestamps.is_empty()
        });
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the store holds no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for SlidingWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

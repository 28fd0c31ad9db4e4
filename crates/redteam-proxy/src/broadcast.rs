//! Live event fan-out to dashboard subscribers.
//!
//! Each subscriber owns a bounded mailbox; [`Broadcaster::publish`] is a
//! non-blocking send that drops the subscriber if its mailbox is full or
//! closed, so the registry lock is never held across a slow consumer. A
//! heartbeat sweep pings every subscriber and force-closes any that misses
//! its pong deadline.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use redteam_core::LoggedEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::proxy::AppState;

/// Interval between heartbeat pings.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// How long a subscriber has to answer a ping before it is force-closed.
const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Mailbox depth per subscriber.
const MAILBOX_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Subscriber handles
// ---------------------------------------------------------------------------

/// A frame queued for one subscriber's socket writer.
#[derive(Debug, Clone)]
pub enum SubscriberFrame {
    /// A serialized `{type:"event", payload}` message.
    Event(Arc<String>),
    Ping,
    Close,
}

/// One live subscriber connection, owned by the registry until close or
/// heartbeat failure.
pub struct Subscriber {
    pub id: Uuid,
    tx: mpsc::Sender<SubscriberFrame>,
    /// Milliseconds since the heartbeat epoch when the pending ping was
    /// sent; 0 when no pong is outstanding.
    ping_sent_at_ms: AtomicI64,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Per-tenant subscriber registry with best-effort fan-out.
pub struct Broadcaster {
    subscribers: DashMap<i64, Vec<Arc<Subscriber>>>,
    epoch: Instant,
    pong_deadline: Duration,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            epoch: Instant::now(),
            pong_deadline: PONG_DEADLINE,
        }
    }

    #[cfg(test)]
    fn with_pong_deadline(pong_deadline: Duration) -> Self {
        Self {
            pong_deadline,
            ..Self::new()
        }
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Register a subscriber mailbox for a tenant, returning its handle.
    pub fn subscribe(&self, tenant_id: i64, tx: mpsc::Sender<SubscriberFrame>) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4(),
            tx,
            ping_sent_at_ms: AtomicI64::new(0),
        });
        self.subscribers
            .entry(tenant_id)
            .or_default()
            .push(Arc::clone(&subscriber));
        info!(tenant_id, subscriber_id = %subscriber.id, "subscriber registered");
        subscriber
    }

    /// Deregister a subscriber.
    pub fn unsubscribe(&self, tenant_id: i64, subscriber_id: Uuid) {
        if let Some(mut entry) = self.subscribers.get_mut(&tenant_id) {
            entry.retain(|s| s.id != subscriber_id);
        }
        self.subscribers
            .remove_if(&tenant_id, |_, subs| subs.is_empty());
        debug!(tenant_id, %subscriber_id, "subscriber deregistered");
    }

    /// Number of live subscribers for a tenant.
    pub fn subscriber_count(&self, tenant_id: i64) -> usize {
        self.subscribers
            .get(&tenant_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Best-effort delivery of a finalized event to every open subscriber
    /// of its tenant. Failing subscribers are dropped.
    pub fn publish(&self, tenant_id: i64, event: &LoggedEvent) {
        let snapshot = match self.subscribers.get(&tenant_id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        if snapshot.is_empty() {
            return;
        }

        let frame = serde_json::json!({ "type": "event", "payload": event });
        let serialized = Arc::new(frame.to_string());

        let mut dropped = Vec::new();
        for subscriber in &snapshot {
            if subscriber
                .tx
                .try_send(SubscriberFrame::Event(Arc::clone(&serialized)))
                .is_err()
            {
                dropped.push(subscriber.id);
            }
        }
        for id in dropped {
            warn!(tenant_id, subscriber_id = %id, "dropping unresponsive subscriber");
            self.unsubscribe(tenant_id, id);
        }
    }

    /// Record a pong from a subscriber, clearing its pending deadline.
    pub fn note_pong(&self, subscriber: &Subscriber) {
        subscriber.ping_sent_at_ms.store(0, Ordering::Relaxed);
    }

    /// Heartbeat sweep: force-close subscribers that missed their pong
    /// deadline, then ping the rest and arm a fresh deadline.
    pub fn heartbeat(&self) {
        let now_ms = self.now_ms();
        let deadline_ms = self.pong_deadline.as_millis() as i64;

        let tenants: Vec<i64> = self.subscribers.iter().map(|e| *e.key()).collect();
        for tenant_id in tenants {
            let snapshot = match self.subscribers.get(&tenant_id) {
                Some(entry) => entry.clone(),
                None => continue,
            };
            for subscriber in snapshot {
                let pending_since = subscriber.ping_sent_at_ms.load(Ordering::Relaxed);
                if pending_since > 0 && now_ms - pending_since > deadline_ms {
                    warn!(
                        tenant_id,
                        subscriber_id = %subscriber.id,
                        "subscriber missed pong deadline; force-closing"
                    );
                    let _ = subscriber.tx.try_send(SubscriberFrame::Close);
                    self.unsubscribe(tenant_id, subscriber.id);
                    continue;
                }
                match subscriber.tx.try_send(SubscriberFrame::Ping) {
                    Ok(()) => {
                        subscriber
                            .ping_sent_at_ms
                            .store(now_ms.max(1), Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.unsubscribe(tenant_id, subscriber.id);
                    }
                }
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoint
// ---------------------------------------------------------------------------

/// `GET /ws?key=<tenant_key>`: authenticate and upgrade to the subscriber
/// channel. An invalid key is rejected with 401 before the upgrade.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(key) = params.get("key") else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let tenant = match state.store.get_tenant_by_key(key).await {
        Ok(Some(tenant)) if !tenant.blocked => tenant,
        Ok(_) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            warn!("tenant lookup failed during ws upgrade: {e}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let tenant_id = tenant.id;
    ws.on_upgrade(move |socket| serve_subscriber(state, tenant_id, socket))
}

/// Pump frames between the registry mailbox and the socket until either
/// side closes.
async fn serve_subscriber(state: Arc<AppState>, tenant_id: i64, socket: WebSocket) {
    let (tx, mut rx) = mpsc::channel::<SubscriberFrame>(MAILBOX_CAPACITY);
    let subscriber = state.broadcaster.subscribe(tenant_id, tx);
    let subscriber_id = subscriber.id;

    let (mut sink, mut stream) = socket.split();

    let write_task = async {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                SubscriberFrame::Event(json) => sink.send(Message::Text(json.to_string())).await,
                SubscriberFrame::Ping => sink.send(Message::Ping(Vec::new())).await,
                SubscriberFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    };

    let broadcaster = &state.broadcaster;
    let subscriber_ref = Arc::clone(&subscriber);
    let read_task = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Pong(_)) => broadcaster.note_pong(&subscriber_ref),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        () = write_task => {}
        () = read_task => {}
    }

    state.broadcaster.unsubscribe(tenant_id, subscriber_id);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Core interceptor: the per-request state machine.
//!
//! authenticate → agent check → quota check → forward → account →
//! persist → analyze → persist final → publish → respond.
//!
//! Fail-open policy: any error after the quota check but before response
//! headers are sent triggers one more forward without analysis and relays
//! the raw upstream response; if that also fails the client gets a 502.
//! After headers are flushed (streaming), errors are logged only.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use redteam_core::{
    truncate_chars, EventStore, LoggedEvent, ProxyConfig, ProxyError, Result, Tenant,
};
use redteam_security::{SecurityDecision, SecurityPipeline, SlidingWindowStore};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertSignal, AlertSink};
use crate::auth;
use crate::broadcast::{ws_handler, Broadcaster};
use crate::forward::{self, Provider, StreamedCopy};
use crate::pricing;

/// Where clients are sent when they hit their plan limit.
const UPGRADE_URL: &str = "https://redteaming.ai/upgrade";

/// Response header carrying the persisted event id.
const EVENT_ID_HEADER: &str = "x-redteamingai-event-id";

/// Response header carrying the combined risk score.
const RISK_SCORE_HEADER: &str = "x-redteamingai-risk-score";

/// Depth of the per-request client sink channel.
const STREAM_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state threaded through axum handlers via [`State`].
pub struct AppState {
    pub config: ProxyConfig,
    /// HTTP client for upstream calls.
    pub client: Client,
    /// Event/tenant/rule persistence.
    pub store: Arc<dyn EventStore>,
    /// The three-engine analysis pipeline.
    pub pipeline: SecurityPipeline,
    /// Sliding windows shared with the anomaly engine (eviction task).
    pub windows: Arc<SlidingWindowStore>,
    /// Live subscriber fan-out.
    pub broadcaster: Broadcaster,
    /// Alert signal queue.
    pub alerts: AlertSink,
    /// Process start, for `/health` uptime.
    pub started_at: Instant,
}

/// Build the shared [`AppState`] from configuration.
pub async fn build_app_state(
    config: ProxyConfig,
) -> Result<(Arc<AppState>, mpsc::Receiver<AlertSignal>)> {
    let client = Client::builder()
        .connect_timeout(std::time::Duration::from_millis(config.connect_timeout_ms))
        .timeout(std::time::Duration::from_millis(config.upstream_timeout_ms))
        .build()
        .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {e}")))?;

    let store: Arc<dyn EventStore> = match config.storage.profile.as_str() {
        "memory" => Arc::new(redteam_storage::MemoryEventStore::new()),
        _ => Arc::new(redteam_storage::SqliteEventStore::new(&config.storage.database_path).await?),
    };

    let windows = Arc::new(SlidingWindowStore::new());
    let pipeline = SecurityPipeline::new(Arc::clone(&windows), Arc::clone(&store));
    let (alerts, alert_rx) = AlertSink::new(256);

    let state = Arc::new(AppState {
        config,
        client,
        store,
        pipeline,
        windows,
        broadcaster: Broadcaster::new(),
        alerts,
        started_at: Instant::now(),
    });
    Ok((state, alert_rx))
}

/// Build the proxy router: the two provider paths, health, and the
/// subscriber channel. Unknown paths get a JSON 404.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(intercept_handler))
        .route("/v1/messages", post(intercept_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .fallback(unknown_path_handler)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Health check: `{status:"ok", uptime:<seconds>}` plus storage detail.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    let storage_ok = state.store.health_check().await.is_ok();
    let body = serde_json::json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "storage": { "healthy": storage_ok },
    });
    json_response(StatusCode::OK, &body)
}

async fn unknown_path_handler(req: Request<Body>) -> Response<Body> {
    error_response(&ProxyError::UnsupportedProvider(
        req.uri().path().to_string(),
    ))
}

/// The interceptor entry point for both provider paths.
pub async fn intercept_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();

    let provider = match forward::route_for_path(&path) {
        Ok(provider) => provider,
        Err(e) => return error_response(&e),
    };

    let body = match axum::body::to_bytes(
        req.into_body(),
        state.config.max_request_size_bytes as usize,
    )
    .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(%path, "failed to read request body: {e}");
            return json_response(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({
                    "error": "failed to read request body",
                    "code": "PROXY_ERROR",
                }),
            );
        }
    };

    // AUTH
    let tenant = match auth::authenticate(state.store.as_ref(), &headers, &body).await {
        Ok(tenant) => tenant,
        Err(e @ (ProxyError::AuthMissing | ProxyError::AuthInvalid)) => {
            return error_response(&e);
        }
        Err(e) => {
            warn!(%path, "auth lookup failed, failing open: {e}");
            return fail_open(&state, provider, body).await;
        }
    };
    let agent_id = auth::extract_agent_id(&headers);

    // AGENT_CHECK
    if let Some(ref agent) = agent_id {
        match state.store.is_agent_blocked(tenant.id, agent).await {
            Ok(true) => {
                return error_response(&ProxyError::AgentBlocked {
                    agent_id: agent.clone(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(tenant_id = tenant.id, "agent block check failed, failing open: {e}");
                return fail_open(&state, provider, body).await;
            }
        }
    }

    // QUOTA_CHECK
    let month_start = auth::month_start(Utc::now());
    match state.store.count_events_since(tenant.id, month_start).await {
        Ok(count) if count >= tenant.monthly_event_limit => {
            info!(
                tenant_id = tenant.id,
                count,
                limit = tenant.monthly_event_limit,
                "monthly event limit reached"
            );
            return json_response(
                StatusCode::TOO_MANY_REQUESTS,
                &serde_json::json!({
                    "error": format!(
                        "monthly event limit of {} reached",
                        tenant.monthly_event_limit
                    ),
                    "code": "PLAN_LIMIT",
                    "upgradeUrl": UPGRADE_URL,
                }),
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(tenant_id = tenant.id, "quota check failed, failing open: {e}");
            return fail_open(&state, provider, body).await;
        }
    }

    // FORWARD → … → RESPOND, with the fail-open wrapper around everything
    // that can still go wrong before headers are sent.
    match run_intercepted(&state, provider, &tenant, agent_id, body.clone()).await {
        Ok(response) => response,
        Err(e) => {
            warn!(tenant_id = tenant.id, %path, "intercept failed, failing open: {e}");
            fail_open(&state, provider, body).await
        }
    }
}

// ---------------------------------------------------------------------------
// The intercepted path
// ---------------------------------------------------------------------------

async fn run_intercepted(
    state: &Arc<AppState>,
    provider: Provider,
    tenant: &Tenant,
    agent_id: Option<String>,
    body: Bytes,
) -> Result<Response<Body>> {
    let upstream =
        forward::send_upstream(&state.client, provider, &state.config, body.clone()).await?;
    let status = upstream.status;
    let response_headers = upstream.headers.clone();
    let started = upstream.started;

    if forward::wants_stream(&response_headers, &body) {
        let mut response = upstream.response;
        let first_chunk = response
            .chunk()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        if let Some(first_chunk) = first_chunk {
            // Streaming path: flush status and headers now, copy chunks in
            // the background, score the event after the stream ends.
            let first_byte_ms = started.elapsed().as_millis() as u64;
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

            let bg_state = Arc::clone(state);
            let bg_tenant = tenant.clone();
            let bg_body = body.clone();
            tokio::spawn(async move {
                let copy =
                    forward::copy_stream(response, first_chunk, first_byte_ms, tx).await;
                finalize_streamed(bg_state, bg_tenant, agent_id, bg_body, copy).await;
            });

            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (name, value) in response_headers.iter() {
                builder = builder.header(name, value);
            }
            return builder
                .body(Body::from_stream(ReceiverStream::new(rx)))
                .map_err(|e| ProxyError::Upstream(format!("failed to build response: {e}")));
        }
        // Empty stream body: fall through and treat as buffered.
        debug!("streamable response had an empty body; handling as buffered");
        return respond_buffered(
            state,
            tenant,
            agent_id,
            body,
            status,
            response_headers,
            Bytes::new(),
            started.elapsed().as_millis() as u64,
        )
        .await;
    }

    let buffered = forward::read_buffered(upstream).await?;
    respond_buffered(
        state,
        tenant,
        agent_id,
        body,
        status,
        response_headers,
        buffered.body,
        buffered.latency_ms,
    )
    .await
}

/// ACCOUNT → PERSIST_INITIAL → ANALYZE → PERSIST_FINAL → PUBLISH → RESPOND
/// for a fully-buffered upstream response.
#[allow(clippy::too_many_arguments)]
async fn respond_buffered(
    state: &Arc<AppState>,
    tenant: &Tenant,
    agent_id: Option<String>,
    request_body: Bytes,
    status: u16,
    response_headers: HeaderMap,
    response_body: Bytes,
    latency_ms: u64,
) -> Result<Response<Body>> {
    let raw_response = String::from_utf8_lossy(&response_body).into_owned();
    let (prompt_tokens, completion_tokens) = parse_usage(&raw_response);

    let mut event = build_event(
        tenant,
        agent_id,
        &request_body,
        &raw_response,
        prompt_tokens,
        completion_tokens,
        latency_ms,
    );

    let event_id = state.store.insert_event(&event).await?;
    event.id = event_id;

    let decision = state.pipeline.analyze(&event).await;

    state
        .store
        .update_security_result(event_id, &decision.to_result())
        .await?;
    apply_decision(&mut event, &decision);

    state.broadcaster.publish(tenant.id, &event);
    state.alerts.maybe_signal(&event);

    if decision.blocked {
        info!(
            event_id,
            tenant_id = tenant.id,
            risk_score = decision.risk_score,
            flags = ?decision.flags,
            "request blocked"
        );
        return Ok(blocked_response(event_id, &decision));
    }

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder = builder
        .header(EVENT_ID_HEADER, event_id.to_string())
        .header(RISK_SCORE_HEADER, decision.risk_score.to_string());
    builder
        .body(Body::from(response_body))
        .map_err(|e| ProxyError::Upstream(format!("failed to build response: {e}")))
}

/// Post-stream accounting and scoring. Headers are long gone, so every
/// failure here is logged and swallowed.
async fn finalize_streamed(
    state: Arc<AppState>,
    tenant: Tenant,
    agent_id: Option<String>,
    request_body: Bytes,
    copy: StreamedCopy,
) {
    if copy.client_disconnected {
        debug!(
            tenant_id = tenant.id,
            "client disconnected mid-stream; event will still be scored"
        );
    }

    let prompt_tokens = copy.accumulator.prompt_tokens.unwrap_or(0);
    let completion_tokens = copy.accumulator.final_completion_tokens();

    let mut event = build_event(
        &tenant,
        agent_id.clone(),
        &request_body,
        &copy.raw_response,
        prompt_tokens,
        completion_tokens,
        copy.latency_ms,
    );

    let event_id = match state.store.insert_event(&event).await {
        Ok(id) => id,
        Err(e) => {
            error!(tenant_id = tenant.id, "failed to persist streamed event: {e}");
            return;
        }
    };
    event.id = event_id;

    let decision = state.pipeline.analyze(&event).await;

    if let Err(e) = state
        .store
        .update_security_result(event_id, &decision.to_result())
        .await
    {
        error!(event_id, "failed to update security result: {e}");
        return;
    }
    apply_decision(&mut event, &decision);

    state.broadcaster.publish(tenant.id, &event);
    state.alerts.maybe_signal(&event);

    // The bytes are already delivered; compensate a late block decision by
    // blocklisting the agent for future calls.
    if decision.blocked {
        info!(
            event_id,
            tenant_id = tenant.id,
            risk_score = decision.risk_score,
            "streamed response retroactively marked blocked"
        );
        if let Some(agent) = agent_id {
            if let Err(e) = state.store.block_agent(tenant.id, &agent).await {
                error!(tenant_id = tenant.id, agent_id = %agent, "failed to blocklist agent: {e}");
            }
        }
    }
}

/// Second forward without analysis; relay the raw upstream response, or
/// 502 if the upstream fails again.
async fn fail_open(state: &Arc<AppState>, provider: Provider, body: Bytes) -> Response<Body> {
    let outcome = async {
        let upstream =
            forward::send_upstream(&state.client, provider, &state.config, body).await?;
        let status = upstream.status;
        let headers = upstream.headers.clone();
        let buffered = forward::read_buffered(upstream).await?;
        Ok::<_, ProxyError>((status, headers, buffered.body))
    }
    .await;

    match outcome {
        Ok((status, headers, body)) => {
            let mut builder =
                Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| error_response(&ProxyError::Upstream("relay failed".into())))
        }
        Err(e) => {
            error!("fail-open forward also failed: {e}");
            error_response(&ProxyError::Upstream(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Event construction
// ---------------------------------------------------------------------------

/// Build the pre-analysis event skeleton (risk 0, not blocked).
fn build_event(
    tenant: &Tenant,
    agent_id: Option<String>,
    request_body: &Bytes,
    raw_response: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
    latency_ms: u64,
) -> LoggedEvent {
    let raw_request = String::from_utf8_lossy(request_body).into_owned();
    let model = parse_model(&raw_request);
    let cost_usd = pricing::cost(&model, prompt_tokens, completion_tokens);

    LoggedEvent {
        id: 0,
        timestamp: Utc::now(),
        tenant_id: tenant.id,
        agent_id,
        model,
        prompt_tokens,
        completion_tokens,
        cost_usd,
        latency_ms,
        tool_names: parse_tool_names(&raw_request),
        request_sha256: hex::encode(Sha256::digest(request_body)),
        response_preview: truncate_chars(raw_response, 256),
        risk_score: 0,
        blocked: false,
        flags: Vec::new(),
        raw_request,
        raw_response: raw_response.to_string(),
    }
}

fn apply_decision(event: &mut LoggedEvent, decision: &SecurityDecision) {
    event.risk_score = decision.risk_score;
    event.blocked = decision.blocked;
    event.flags = decision.flags.clone();
}

/// Model name from the request body, empty when unparseable.
fn parse_model(raw_request: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw_request)
        .ok()
        .and_then(|v| v.get("model")?.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

/// Requested tool names: `tools[].name` with an OpenAI-style
/// `tools[].function.name` fallback. Malformed payloads read as no tools.
pub fn parse_tool_names(raw_request: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw_request) else {
        return Vec::new();
    };
    let Some(tools) = value.get("tools").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|tool| {
            tool.get("name")
                .and_then(|n| n.as_str())
                .or_else(|| {
                    tool.get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                })
                .map(|s| s.to_string())
        })
        .collect()
}

/// Token usage from the upstream response body; absent counts default to 0.
/// Accepts both OpenAI (`prompt_tokens`/`completion_tokens`) and Anthropic
/// (`input_tokens`/`output_tokens`) names.
pub fn parse_usage(raw_response: &str) -> (u32, u32) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw_response) else {
        return (0, 0);
    };
    let usage = &value["usage"];
    let read = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
            .unwrap_or(0) as u32
    };
    (
        read(["prompt_tokens", "input_tokens"]),
        read(["completion_tokens", "output_tokens"]),
    )
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

/// 403 replacement body for a blocked buffered response.
fn blocked_response(event_id: i64, decision: &SecurityDecision) -> Response<Body> {
    json_response(
        StatusCode::FORBIDDEN,
        &serde_json::json!({
            "error": "request blocked by security policy",
            "eventId": event_id,
            "riskScore": decision.risk_score,
            "flags": decision.flags,
        }),
    )
}

/// JSON error body `{error, code}` for a [`ProxyError`].
pub fn error_response(err: &ProxyError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        status,
        &serde_json::json!({
            "error": err.to_string(),
            "code": err.code(),
        }),
    )
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response builds")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

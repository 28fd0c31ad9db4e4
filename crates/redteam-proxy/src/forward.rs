//! Upstream forwarding.
//!
//! Dispatches by exact request path to the configured provider endpoint,
//! sends the verbatim request bytes with provider credentials, and exposes
//! helpers for copying the response back, buffered or chunk-by-chunk for
//! streams. Response headers are copied except `transfer-encoding`.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use redteam_core::{ProxyConfig, ProxyError, Result};
use reqwest::Client;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::streaming::StreamingAccumulator;

/// Anthropic API version sent with every `/v1/messages` call.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default upstream endpoints, overridable in config for testing.
pub const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";

// ---------------------------------------------------------------------------
// Provider dispatch
// ---------------------------------------------------------------------------

/// The upstream provider a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

/// Resolve the provider for a request path. Exact match only.
pub fn route_for_path(path: &str) -> Result<Provider> {
    match path {
        "/v1/chat/completions" => Ok(Provider::OpenAI),
        "/v1/messages" => Ok(Provider::Anthropic),
        other => Err(ProxyError::UnsupportedProvider(other.to_string())),
    }
}

fn upstream_url(provider: Provider, config: &ProxyConfig) -> String {
    match provider {
        Provider::OpenAI => config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| OPENAI_CHAT_COMPLETIONS_URL.to_string()),
        Provider::Anthropic => config
            .anthropic_base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_MESSAGES_URL.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Upstream call
// ---------------------------------------------------------------------------

/// An in-flight upstream response with its timing origin.
pub struct UpstreamResponse {
    pub status: u16,
    /// Response headers with `transfer-encoding` already stripped.
    pub headers: HeaderMap,
    pub response: reqwest::Response,
    pub started: Instant,
}

/// Send the verbatim request bytes to the provider endpoint.
///
/// Provider credentials come from config: bearer auth for OpenAI,
/// `x-api-key` plus `anthropic-version` for Anthropic.
pub async fn send_upstream(
    client: &Client,
    provider: Provider,
    config: &ProxyConfig,
    body: Bytes,
) -> Result<UpstreamResponse> {
    let url = upstream_url(provider, config);
    let started = Instant::now();

    let mut request = client
        .post(&url)
        .header("content-type", "application/json")
        .body(body.to_vec());

    request = match provider {
        Provider::OpenAI => match config.openai_api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        },
        Provider::Anthropic => {
            let request = request.header("anthropic-version", ANTHROPIC_VERSION);
            match config.anthropic_api_key {
                Some(ref key) => request.header("x-api-key", key),
                None => request,
            }
        }
    };

    let response = request
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    debug!(?provider, status = response.status().as_u16(), "upstream responded");

    let status = response.status().as_u16();
    let headers = copy_response_headers(response.headers());

    Ok(UpstreamResponse {
        status,
        headers,
        response,
        started,
    })
}

/// Copy upstream response headers, dropping `transfer-encoding`.
fn copy_response_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if name == reqwest::header::TRANSFER_ENCODING {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Response copy
// ---------------------------------------------------------------------------

/// Fully read a buffered upstream response. Latency is end-to-end.
pub struct BufferedResponse {
    pub body: Bytes,
    pub latency_ms: u64,
}

pub async fn read_buffered(upstream: UpstreamResponse) -> Result<BufferedResponse> {
    let started = upstream.started;
    let body = upstream
        .response
        .bytes()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    Ok(BufferedResponse {
        body,
        latency_ms: started.elapsed().as_millis() as u64,
    })
}

/// Outcome of a streamed copy: the concatenated raw text, parsed usage, and
/// first-byte latency.
pub struct StreamedCopy {
    pub raw_response: String,
    pub accumulator: StreamingAccumulator,
    pub latency_ms: u64,
    /// Whether the client went away before the stream finished.
    pub client_disconnected: bool,
}

/// Copy upstream chunks to the client sink while capturing them.
///
/// `first_chunk` is the chunk already pulled to decide streamability; its
/// arrival time defines the first-byte latency. A client disconnect stops
/// the copy but the already-received bytes are still returned so the event
/// can be persisted and scored.
pub async fn copy_stream(
    mut response: reqwest::Response,
    first_chunk: Bytes,
    first_byte_latency_ms: u64,
    sink: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
) -> StreamedCopy {
    let mut accumulator = StreamingAccumulator::new();
    let mut captured: Vec<u8> = Vec::new();
    let mut client_disconnected = false;

    accumulator.process_chunk(&first_chunk);
    captured.extend_from_slice(&first_chunk);
    if sink.send(Ok(first_chunk)).await.is_err() {
        client_disconnected = true;
    }

    if !client_disconnected {
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    accumulator.process_chunk(&bytes);
                    captured.extend_from_slice(&bytes);
                    if sink.send(Ok(bytes)).await.is_err() {
                        client_disconnected = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("upstream stream error mid-copy: {e}");
                    let _ = sink
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    break;
                }
            }
        }
    }

    StreamedCopy {
        raw_response: String::from_utf8_lossy(&captured).into_owned(),
        accumulator,
        latency_ms: first_byte_latency_ms,
        client_disconnected,
    }
}

/// Whether the request/response pair qualifies for streaming: the upstream
/// content type says `text/event-stream`, or the parsed request body asked
/// for `stream: true`.
pub fn wants_stream(response_headers: &HeaderMap, request_body: &[u8]) -> bool {
    let sse_content_type = response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);
    if sse_content_type {
        return true;
    }
    serde_json::from_slice::<serde_json::Value>(request_body)
        .ok()
        .and_then(|v| v.get("stream")?.as_bool())
        .unwrap_or(false)
}

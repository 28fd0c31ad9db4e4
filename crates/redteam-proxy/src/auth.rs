//! Tenant authentication and quota accounting.
//!
//! The tenant key is read from the `X-RedTeamingAI-Key` header, falling
//! back to an `apiKey` field in the JSON body. Agent ids come from
//! `X-Agent-ID`. Quotas count events in the current calendar month.

use axum::http::HeaderMap;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use redteam_core::{EventStore, ProxyError, Result, Tenant};

/// Header carrying the tenant API key.
pub const KEY_HEADER: &str = "x-redteamingai-key";

/// Header carrying the optional agent id.
pub const AGENT_HEADER: &str = "x-agent-id";

/// Extract the tenant key from the header or the body's `apiKey` field.
pub fn extract_api_key(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(key) = headers.get(KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("apiKey")?.as_str().map(|s| s.to_string()))
}

/// Extract the agent id from the `X-Agent-ID` header.
pub fn extract_agent_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Authenticate the request against the tenant store.
///
/// Missing key → `AuthMissing`; unknown key or blocked tenant →
/// `AuthInvalid`. Store failures propagate so the interceptor can apply
/// its fail-open policy.
pub async fn authenticate(
    store: &dyn EventStore,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Tenant> {
    let key = extract_api_key(headers, body).ok_or(ProxyError::AuthMissing)?;
    let tenant = store
        .get_tenant_by_key(&key)
        .await?
        .ok_or(ProxyError::AuthInvalid)?;
    if tenant.blocked {
        return Err(ProxyError::AuthInvalid);
    }
    Ok(tenant)
}

/// First instant of the calendar month containing `now` (UTC).
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid instant")
}

#[cfg(test)]
mod tests {
    use super::*;
    use redteam_storage::MemoryEventStore;
    use std::sync::Arc;

    fn tenant(key: &str, blocked: bool) -> Tenant {
        Tenant {
            id: 0,
            api_key: key.to_string(),
            name: "t".to_string(),
            monthly_event_limit: 100,
            blocked,
        }
    }

    #[test]
    fn test_extract_key_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, "rt_key_1".parse().unwrap());
        assert_eq!(
            extract_api_key(&headers, b"{}"),
            Some("rt_key_1".to_string())
        );
    }

    #[test]
    fn test_extract_key_from_body_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, br#"{"apiKey":"rt_key_2","model":"gpt-4o"}"#),
            Some("rt_key_2".to_string())
        );
    }

    #[test]
    fn test_header_takes_precedence_over_body() {
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, "header-key".parse().unwrap());
        assert_eq!(
            extract_api_key(&headers, br#"{"apiKey":"body-key"}"#),
            Some("header-key".to_string())
        );
    }

    #[test]
    fn test_extract_key_missing() {
        assert_eq!(extract_api_key(&HeaderMap::new(), b"{}"), None);
        assert_eq!(extract_api_key(&HeaderMap::new(), b"not json"), None);
    }

    #[test]
    fn test_extract_agent_id() {
        let mut headers = HeaderMap::new();
        headers.insert(AGENT_HEADER, "crawler-3".parse().unwrap());
        assert_eq!(extract_agent_id(&headers), Some("crawler-3".to_string()));
        assert_eq!(extract_agent_id(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let store = Arc::new(MemoryEventStore::new());
        store.add_tenant(tenant("good-key", false)).await;
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, "good-key".parse().unwrap());

        let result = authenticate(store.as_ref(), &headers, b"{}").await.unwrap();
        assert_eq!(result.api_key, "good-key");
    }

    #[tokio::test]
    async fn test_authenticate_missing_key() {
        let store = MemoryEventStore::new();
        let err = authenticate(&store, &HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn test_authenticate_unknown_key() {
        let store = MemoryEventStore::new();
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, "who-dis".parse().unwrap());
        let err = authenticate(&store, &headers, b"{}").await.unwrap_err();
        assert_eq!(err.code(), "AUTH_INVALID");
    }

    #[tokio::test]
    async fn test_authenticate_blocked_tenant() {
        let store = Arc::new(MemoryEventStore::new());
        store.add_tenant(tenant("blocked-key", true)).await;
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, "blocked-key".parse().unwrap());
        let err = authenticate(store.as_ref(), &headers, b"{}")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_INVALID");
    }

    #[test]
    fn test_month_start() {
        let now = Utc.with_ymd_and_hms(2025, 6, 17, 13, 45, 12).unwrap();
        let start = month_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    }
}

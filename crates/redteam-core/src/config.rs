//! Proxy configuration.
//!
//! [`ProxyConfig`] is deserialized from YAML, then environment variables are
//! applied on top by the binary (`PORT`, `API_PORT`, `DATABASE_PATH`,
//! `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`).

use serde::{Deserialize, Serialize};

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port the intercepting proxy listens on.
    pub port: u16,
    /// Port the read-side liveness endpoint listens on. The full read API
    /// is served by an external collaborator against the same database.
    pub api_port: u16,
    /// Maximum accepted request body size in bytes.
    pub max_request_size_bytes: u64,
    /// End-to-end upstream request timeout in milliseconds.
    pub upstream_timeout_ms: u64,
    /// Upstream connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// OpenAI API key used when forwarding to `/v1/chat/completions`.
    pub openai_api_key: Option<String>,
    /// Anthropic API key used when forwarding to `/v1/messages`.
    pub anthropic_api_key: Option<String>,
    /// Override for the OpenAI chat-completions endpoint (tests, gateways).
    pub openai_base_url: Option<String>,
    /// Override for the Anthropic messages endpoint (tests, gateways).
    pub anthropic_base_url: Option<String>,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_port: 8081,
            max_request_size_bytes: 10 * 1024 * 1024,
            upstream_timeout_ms: 120_000,
            connect_timeout_ms: 5_000,
            openai_api_key: None,
            anthropic_api_key: None,
            openai_base_url: None,
            anthropic_base_url: None,
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `"sqlite"` (default) or `"memory"` (tests / ephemeral runs).
    pub profile: String,
    /// SQLite database file path.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: "sqlite".to_string(),
            database_path: "redteam.db".to_string(),
        }
    }
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter: trace, debug, info, warn, error.
    pub level: String,
    /// Output format: `"text"` or `"json"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_port, 8081);
        assert_eq!(config.max_request_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.storage.profile, "sqlite");
        assert_eq!(config.logging.level, "info");
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let json = r#"{"port": 9090}"#;
        let config: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.api_port, 8081);
        assert_eq!(config.logging.format, "text");
    }
}

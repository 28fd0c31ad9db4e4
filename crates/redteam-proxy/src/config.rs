//! Configuration loading for the proxy server.
//!
//! Loads [`ProxyConfig`] from a YAML file (or defaults), then applies
//! environment variable overrides: `PORT`, `API_PORT`, `DATABASE_PATH`,
//! `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `REDTEAM_LOG_LEVEL`,
//! `REDTEAM_LOG_FORMAT`.

use redteam_core::ProxyConfig;
use std::path::Path;

/// Load a [`ProxyConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<ProxyConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let config: ProxyConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config YAML: {}", e))?;
    Ok(config)
}

/// Apply environment variable overrides on top of the loaded config.
pub fn apply_env_overrides(config: &mut ProxyConfig) {
    if let Some(port) = env_parse::<u16>("PORT") {
        config.port = port;
    }
    if let Some(port) = env_parse::<u16>("API_PORT") {
        config.api_port = port;
    }
    if let Ok(path) = std::env::var("DATABASE_PATH") {
        if !path.is_empty() {
            config.storage.database_path = path;
        }
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            config.openai_api_key = Some(key);
        }
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            config.anthropic_api_key = Some(key);
        }
    }
    if let Ok(level) = std::env::var("REDTEAM_LOG_LEVEL") {
        if !level.is_empty() {
            config.logging.level = level;
        }
    }
    if let Ok(format) = std::env::var("REDTEAM_LOG_FORMAT") {
        if !format.is_empty() {
            config.logging.format = format;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Validate a resolved configuration.
pub fn validate_config(config: &ProxyConfig) -> anyhow::Result<()> {
    if config.port == config.api_port {
        anyhow::bail!("port and api_port must differ (both {})", config.port);
    }
    if config.max_request_size_bytes == 0 {
        anyhow::bail!("max_request_size_bytes must be positive");
    }
    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("unknown logging format: {other} (expected text or json)"),
    }
    match config.storage.profile.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!("unknown storage profile: {other} (expected sqlite or memory)"),
    }
    if config.storage.profile == "sqlite" && config.storage.database_path.is_empty() {
        anyhow::bail!("storage.database_path must be set for the sqlite profile");
    }
    Ok(())
}

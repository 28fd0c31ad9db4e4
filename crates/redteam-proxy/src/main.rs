//! RedTeamingAI inline security proxy server.
//!
//! Intercepts LLM API calls on their way to OpenAI or Anthropic, scores
//! each request through the three-engine security pipeline, persists and
//! broadcasts the scored event, and relays (or blocks) the upstream
//! response. Streaming SSE responses pass through chunk-by-chunk.

use clap::{Parser, Subcommand};
use redteam_core::ProxyConfig;
use redteam_proxy::broadcast::HEARTBEAT_INTERVAL_SECS;
use redteam_proxy::config;
use redteam_proxy::proxy::{build_app_state, build_router};
use redteam_security::EVICTION_INTERVAL_SECS;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// RedTeamingAI inline security proxy for LLM provider APIs.
#[derive(Parser)]
#[command(name = "redteam-proxy", version, about, long_about = None)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(short, long, global = true, env = "REDTEAM_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Subcommand to run. If omitted, starts the proxy server.
    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and print resolved settings.
    Validate,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_and_merge_config(&cli)?;

    match cli.command {
        Some(Commands::Validate) => run_validate(&config),
        None => {
            init_logging(&config)?;
            config::validate_config(&config)?;
            run_proxy(config).await
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

/// Load configuration from file/defaults, then apply env var and CLI
/// overrides (highest precedence last).
fn load_and_merge_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            // Logging isn't initialised yet, so use eprintln for early diagnostics.
            eprintln!("loading configuration from {}", path.display());
            config::load_config(path)?
        }
        None => ProxyConfig::default(),
    };

    config::apply_env_overrides(&mut config);

    if let Some(ref level) = cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(ref format) = cli.log_format {
        config.logging.format.clone_from(format);
    }

    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand: validate
// ---------------------------------------------------------------------------

fn run_validate(config: &ProxyConfig) -> anyhow::Result<()> {
    config::validate_config(config)?;
    println!("configuration is valid\n");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Structured logging
// ---------------------------------------------------------------------------

/// Initialize structured logging. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(config: &ProxyConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Proxy server
// ---------------------------------------------------------------------------

async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        api_port = config.api_port,
        storage_profile = %config.storage.profile,
        database_path = %config.storage.database_path,
        "starting RedTeamingAI proxy"
    );

    let proxy_addr = format!("0.0.0.0:{}", config.port);
    let api_addr = format!("0.0.0.0:{}", config.api_port);

    let (state, mut alert_rx) = build_app_state(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to build proxy state: {e}"))?;

    // Sliding-window eviction sweep.
    {
        let windows = Arc::clone(&state.windows);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                EVICTION_INTERVAL_SECS,
            ));
            loop {
                ticker.tick().await;
                windows.evict(chrono::Utc::now());
            }
        });
    }

    // Subscriber heartbeat sweep.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                HEARTBEAT_INTERVAL_SECS,
            ));
            loop {
                ticker.tick().await;
                state.broadcaster.heartbeat();
            }
        });
    }

    // Drain the alert queue for the external dispatcher.
    tokio::spawn(async move {
        while let Some(signal) = alert_rx.recv().await {
            debug!(
                event_id = signal.event_id,
                tenant_id = signal.tenant_id,
                risk_score = signal.risk_score,
                blocked = signal.blocked,
                "alert signal queued for dispatch"
            );
        }
    });

    let app = build_router(Arc::clone(&state));

    // A liveness-only surface on the API port for the read-side collaborator.
    let api_app = axum::Router::new()
        .route("/health", axum::routing::get(redteam_proxy::proxy::health_handler))
        .with_state(Arc::clone(&state));

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr).await?;
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!(%proxy_addr, %api_addr, "proxy listening");

    tokio::try_join!(
        async { axum::serve(proxy_listener, app).await },
        async { axum::serve(api_listener, api_app).await },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_merge_config_defaults() {
        let cli = Cli {
            config: None,
            log_level: None,
            log_format: None,
            command: None,
        };
        let config = load_and_merge_config(&cli).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_and_merge_config_cli_overrides() {
        let cli = Cli {
            config: None,
            log_level: Some("debug".to_string()),
            log_format: Some("json".to_string()),
            command: None,
        };
        let config = load_and_merge_config(&cli).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }
}

// =============================================================================
// Aurora Feed — Main Entry Point
// =============================================================================
//
// Market-data aggregation and indicator streaming service. Every WebSocket
// subscriber gets its own session; the provider's rate limiter is the only
// state shared between them.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisory;
mod api;
mod app_state;
mod error;
mod indicators;
mod market_data;
mod provider;
mod runtime_config;
mod session;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisory::Advisor;
use crate::app_state::AppState;
use crate::market_data::DataAggregator;
use crate::provider::{build_provider, RateLimiter};
use crate::runtime_config::{Credentials, RuntimeConfig};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Feed — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = if std::path::Path::new(CONFIG_PATH).exists() {
        RuntimeConfig::load(CONFIG_PATH)?
    } else {
        warn!(path = CONFIG_PATH, "config file not found — using defaults");
        let config = RuntimeConfig::default();
        if let Err(e) = config.save(CONFIG_PATH) {
            warn!(error = %e, "failed to write default config");
        }
        config
    };
    config.apply_env_overrides()?;
    config.validate().context("invalid runtime configuration")?;

    let credentials = Credentials::from_env();
    info!(
        provider = %config.provider,
        symbol = %config.default_symbol,
        intervals = ?config.intervals,
        refresh_secs = config.refresh_secs,
        credentials = ?credentials,
        "configuration ready"
    );

    // ── 2. Data path ─────────────────────────────────────────────────────
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_calls,
        config.rate_window(),
        config.rate_limit.scope,
    ));
    info!(
        scope = ?limiter.scope(),
        max_calls = config.rate_limit.max_calls,
        window_secs = config.rate_limit.window_secs,
        "rate limiter ready"
    );
    let provider = build_provider(&config, &credentials, limiter.clone())?;
    let aggregator = DataAggregator::new(provider, config.fetch_timeout());

    // ── 3. Advisory ──────────────────────────────────────────────────────
    let advisor = Advisor::from_config(&config.advisory, &credentials)?;
    info!(enabled = advisor.is_some(), "market signal advisory");

    // ── 4. HTTP / WebSocket server ───────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, aggregator, advisor, limiter));
    let app = api::rest::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "server listening");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            warn!("Shutdown signal received — stopping gracefully");
        })
        .await
        .context("server error")?;

    info!(
        uptime_secs = state.uptime_secs(),
        "Aurora Feed shut down complete."
    );
    Ok(())
}

// =============================================================================
// Central Application State
// =============================================================================
//
// Shared across every request handler via `Arc<AppState>`. The rate limiter
// is the only mutable state shared between sessions; the provider holds it
// for gating and this state keeps a handle for health reporting. Everything
// else is read-only after startup apart from the session counter.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::advisory::Advisor;
use crate::market_data::DataAggregator;
use crate::provider::RateLimiter;
use crate::runtime_config::RuntimeConfig;
use crate::session::SessionConfig;

pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: RuntimeConfig,

    // ── Data path ───────────────────────────────────────────────────────
    pub aggregator: DataAggregator,
    pub advisor: Option<Arc<Advisor>>,
    pub limiter: Arc<RateLimiter>,

    // ── Operational status ──────────────────────────────────────────────
    active_sessions: AtomicUsize,

    /// Instant when the service was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        aggregator: DataAggregator,
        advisor: Option<Arc<Advisor>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            aggregator,
            advisor,
            limiter,
            active_sessions: AtomicUsize::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from_runtime(&self.config)
    }

    // ── Session accounting ──────────────────────────────────────────────

    pub fn session_opened(&self) -> usize {
        self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn session_closed(&self) -> usize {
        let prev = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Rate-limit key of the default subscription and its in-window count.
    pub fn default_key_usage(&self) -> (String, usize) {
        let symbol = match crate::types::Symbol::parse(&self.config.default_symbol) {
            Ok(symbol) => symbol,
            Err(_) => return (self.config.default_symbol.clone(), 0),
        };
        let key = self
            .limiter
            .scope()
            .key(&symbol, self.config.primary_interval);
        let used = self.limiter.usage(&key);
        (key, used)
    }
}

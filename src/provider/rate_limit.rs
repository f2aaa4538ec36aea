// =============================================================================
// Rate Limiter — per-key sliding-window admission control
// =============================================================================
//
// Upstream quote providers allow a handful of calls per minute on free tiers.
// Every outgoing fetch asks `allow(key)` first; the limiter keeps the instants
// of admitted calls per key and admits a new one only while fewer than
// `max_calls` fall inside the trailing window.
//
// Check and record happen under one lock so concurrent callers on the same key
// can never push the count past the ceiling. Stale instants are pruned during
// the check itself; there is no background timer.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::types::{Interval, Symbol};

/// Default admissions per window.
pub const DEFAULT_MAX_CALLS: usize = 5;
/// Default trailing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Granularity of the rate-limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKeyScope {
    /// One budget per symbol, shared by all intervals.
    Symbol,
    /// One budget per (symbol, interval) pair.
    #[default]
    SymbolInterval,
}

impl RateKeyScope {
    pub fn key(self, symbol: &Symbol, interval: Interval) -> String {
        match self {
            Self::Symbol => symbol.as_str().to_string(),
            Self::SymbolInterval => format!("{symbol}@{interval}"),
        }
    }
}

/// Sliding-window limiter shared by every session through its provider.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_calls: usize,
    window: Duration,
    scope: RateKeyScope,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration, scope: RateKeyScope) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_calls,
            window,
            scope,
        }
    }

    pub fn scope(&self) -> RateKeyScope {
        self.scope
    }

    /// Admit-and-record for `key` at the current instant.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Admit-and-record for `key` as of `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let calls = windows.entry(key.to_string()).or_default();

        while let Some(&oldest) = calls.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() >= self.max_calls {
            warn!(
                key,
                in_window = calls.len(),
                max_calls = self.max_calls,
                "call blocked — would exceed rate limit"
            );
            return false;
        }

        calls.push_back(now);
        debug!(key, in_window = calls.len(), "call admitted");
        true
    }

    /// Gate a fetch for `(symbol, interval)`, mapping a denial to
    /// [`FeedError::RateLimited`].
    pub fn admit(&self, symbol: &Symbol, interval: Interval) -> Result<(), FeedError> {
        let key = self.scope.key(symbol, interval);
        if self.allow(&key) {
            Ok(())
        } else {
            Err(FeedError::RateLimited { key })
        }
    }

    /// Number of admissions for `key` still inside the window.
    pub fn usage(&self, key: &str) -> usize {
        let now = Instant::now();
        self.windows
            .lock()
            .get(key)
            .map_or(0, |calls| {
                calls
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < self.window)
                    .count()
            })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, DEFAULT_WINDOW, RateKeyScope::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.windows.lock().len())
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .field("scope", &self.scope)
            .finish()
    }
}

// =============================================================================
// Runtime Configuration — feed service settings with atomic save
// =============================================================================
//
// Every tunable parameter of the feed service lives here. The file is JSON;
// all fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. A handful of environment variables override
// the file for container deployments.
//
// Credentials are NOT part of the file. They are read from the environment
// into `Credentials`, which is never serialised and redacts itself in Debug.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::indicators::IndicatorParams;
use crate::provider::{ProviderKind, RateKeyScope};
use crate::types::Interval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_symbol() -> String {
    "C:EURUSD".to_string()
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::Day, Interval::Week, Interval::Month]
}

fn default_primary_interval() -> Interval {
    Interval::Day
}

fn default_lookback_days() -> i64 {
    365
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_calls() -> usize {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_advisory_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f64 {
    0.7
}

fn default_context_file() -> PathBuf {
    PathBuf::from("seedInfo.txt")
}

fn default_signal_file() -> PathBuf {
    PathBuf::from("Signaldata.txt")
}

fn default_max_bars_per_interval() -> usize {
    30
}

// =============================================================================
// RateLimitConfig
// =============================================================================

/// Upstream call budget applied before every provider fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per window and key.
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Length of the trailing window in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Whether the budget is per symbol or per (symbol, interval).
    #[serde(default)]
    pub scope: RateKeyScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_secs: default_window_secs(),
            scope: RateKeyScope::default(),
        }
    }
}

// =============================================================================
// AdvisoryConfig
// =============================================================================

/// Settings for the optional market-signal annotator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Run the annotator at all. It is also skipped when no API key is set.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_model")]
    pub model: String,

    /// Upper bound on a single annotation attempt.
    #[serde(default = "default_advisory_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Plain-text context read once per session and appended to the prompt.
    #[serde(default = "default_context_file")]
    pub context_file: PathBuf,

    /// File that receives the most recent annotation (best-effort).
    #[serde(default = "default_signal_file")]
    pub signal_file: PathBuf,

    /// Text sent as `marketSignal` when annotation fails. `None` omits the
    /// field instead.
    #[serde(default)]
    pub placeholder: Option<String>,

    /// Most recent bars per interval included in the prompt.
    #[serde(default = "default_max_bars_per_interval")]
    pub max_bars_per_interval: usize,

    /// Re-annotate on incremental updates, not only on the initial snapshot.
    #[serde(default = "default_true")]
    pub annotate_updates: bool,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            timeout_secs: default_advisory_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_file: default_context_file(),
            signal_file: default_signal_file(),
            placeholder: None,
            max_bars_per_interval: default_max_bars_per_interval(),
            annotate_updates: true,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the feed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the HTTP / WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Upstream quote provider.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Symbol served by `GET /data` when the query omits one.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    /// Intervals fetched for the initial snapshot of every session.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,

    /// Interval refreshed by the live update loop.
    #[serde(default = "default_primary_interval")]
    pub primary_interval: Interval,

    /// History requested for the initial snapshot.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Polling cadence of the refresh loop.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Bound on a single upstream fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Prefer the provider's push feed over polling when it has one.
    #[serde(default = "default_true")]
    pub live_push: bool,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub indicators: IndicatorParams,

    #[serde(default)]
    pub advisory: AdvisoryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            provider: ProviderKind::default(),
            default_symbol: default_symbol(),
            intervals: default_intervals(),
            primary_interval: default_primary_interval(),
            lookback_days: default_lookback_days(),
            refresh_secs: default_refresh_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            live_push: true,
            rate_limit: RateLimitConfig::default(),
            indicators: IndicatorParams::default(),
            advisory: AdvisoryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            provider = %config.provider,
            intervals = ?config.intervals,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(addr) = env_str("FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(provider) = env_str("FEED_PROVIDER") {
            self.provider = provider.parse().context("invalid FEED_PROVIDER")?;
        }
        if let Some(symbol) = env_str("FEED_SYMBOL") {
            self.default_symbol = symbol;
        }
        if let Some(list) = env_str("FEED_INTERVALS") {
            self.intervals = parse_interval_list(&list).context("invalid FEED_INTERVALS")?;
        }
        if let Some(secs) = env_str("FEED_REFRESH_SECS") {
            self.refresh_secs = secs.parse().context("invalid FEED_REFRESH_SECS")?;
        }
        Ok(())
    }

    /// Reject unusable values and normalise the interval set.
    pub fn validate(&mut self) -> Result<()> {
        self.intervals = Interval::normalize_set(&self.intervals);
        if self.intervals.is_empty() {
            anyhow::bail!("at least one interval must be configured");
        }
        if !self.intervals.contains(&self.primary_interval) {
            warn!(
                primary = %self.primary_interval,
                "primary interval missing from interval set — adding it"
            );
            self.intervals.push(self.primary_interval);
            self.intervals.sort();
        }
        if self.refresh_secs == 0 {
            anyhow::bail!("refresh_secs must be greater than zero");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be greater than zero");
        }
        if self.rate_limit.max_calls == 0 {
            anyhow::bail!("rate_limit.max_calls must be greater than zero");
        }
        if self.lookback_days <= 0 {
            anyhow::bail!("lookback_days must be positive");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.lookback_days)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Upstream credentials, read from the environment only.
#[derive(Clone, Default)]
pub struct Credentials {
    pub polygon_api_key: String,
    pub openai_api_key: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            polygon_api_key: env_str("POLYGON_API_KEY").unwrap_or_default(),
            openai_api_key: env_str("OPENAI_API_KEY").unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = |k: &str| if k.is_empty() { "<unset>" } else { "<redacted>" };
        f.debug_struct("Credentials")
            .field("polygon_api_key", &state(&self.polygon_api_key))
            .field("openai_api_key", &state(&self.openai_api_key))
            .finish()
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_interval_list(list: &str) -> Result<Vec<Interval>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Interval>().map_err(anyhow::Error::from))
        .collect()
}

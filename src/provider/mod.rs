// =============================================================================
// Quote Providers — historical bars (and optionally live bars) from upstreams
// =============================================================================
//
// A provider fetches one interval of one symbol per call, gated by the shared
// RateLimiter. Providers never retry: the caller decides whether the next
// scheduled cycle tries again. Live push is an optional capability; sessions
// fall back to polling when `live_bars` yields `None`.
// =============================================================================

pub mod binance;
pub mod polygon;
pub mod rate_limit;
#[cfg(test)]
pub mod scripted;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::FeedError;
use crate::market_data::{Bar, BarSeries};
use crate::runtime_config::{Credentials, RuntimeConfig};
use crate::types::{Interval, Symbol};

pub use rate_limit::{RateKeyScope, RateLimiter};

/// Push feed of live bars. The same bucket may arrive repeatedly while it is
/// still open.
pub type BarStream = BoxStream<'static, Result<Bar, FeedError>>;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bars for `symbol` at `interval` between `from` and `to` (inclusive).
    /// A successful response with no bars is an empty series, not an error.
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarSeries, FeedError>;

    /// Open a live feed for `(symbol, interval)` when the upstream has one.
    async fn live_bars(
        &self,
        _symbol: &Symbol,
        _interval: Interval,
    ) -> Result<Option<BarStream>, FeedError> {
        Ok(None)
    }
}

/// Which upstream this deployment talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Polygon,
    Binance,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polygon => write!(f, "polygon"),
            Self::Binance => write!(f, "binance"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "polygon" => Ok(Self::Polygon),
            "binance" => Ok(Self::Binance),
            other => anyhow::bail!("unknown provider '{other}' (expected polygon or binance)"),
        }
    }
}

/// Construct the configured provider around the shared limiter.
pub fn build_provider(
    config: &RuntimeConfig,
    credentials: &Credentials,
    limiter: Arc<RateLimiter>,
) -> Result<Arc<dyn QuoteProvider>> {
    let provider: Arc<dyn QuoteProvider> = match config.provider {
        ProviderKind::Polygon => {
            if credentials.polygon_api_key.is_empty() {
                warn!("POLYGON_API_KEY is not set — upstream calls will be rejected");
            }
            Arc::new(polygon::PolygonProvider::new(
                credentials.polygon_api_key.clone(),
                config.fetch_timeout(),
                limiter,
            )?)
        }
        ProviderKind::Binance => {
            Arc::new(binance::BinanceProvider::new(config.fetch_timeout(), limiter)?)
        }
    };
    info!(provider = provider.name(), "quote provider ready");
    Ok(provider)
}

// -----------------------------------------------------------------------------
// Upstream failure classification shared by the HTTP providers
// -----------------------------------------------------------------------------

/// Map a non-success HTTP status onto the feed taxonomy. Rate-limit and auth
/// refusals (and other client errors) are rejections; server errors are
/// treated as the upstream being unavailable.
pub(crate) fn classify_status(provider: &str, status: reqwest::StatusCode) -> FeedError {
    use reqwest::StatusCode;

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            FeedError::UpstreamRejected(format!("{provider} rate limit exceeded, please try again later"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FeedError::UpstreamRejected(format!("{provider} refused the credentials"))
        }
        s if s.is_client_error() => {
            FeedError::UpstreamRejected(format!("{provider} rejected the request ({s})"))
        }
        s => FeedError::UpstreamUnavailable(format!("{provider} returned {s}")),
    }
}

/// Map a transport error. The message never includes the request URL, which
/// can carry credentials.
pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> FeedError {
    if err.is_timeout() {
        FeedError::UpstreamUnavailable(format!("{provider} request timed out"))
    } else if err.is_decode() {
        FeedError::UpstreamUnavailable(format!("{provider} sent an undecodable response"))
    } else {
        FeedError::UpstreamUnavailable(format!("{provider} request failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status("polygon", StatusCode::TOO_MANY_REQUESTS),
            FeedError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_status("polygon", StatusCode::FORBIDDEN),
            FeedError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_status("binance", StatusCode::BAD_REQUEST),
            FeedError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_status("binance", StatusCode::BAD_GATEWAY),
            FeedError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn provider_kind_parses() {
        assert_eq!("Polygon".parse::<ProviderKind>().unwrap(), ProviderKind::Polygon);
        assert_eq!("binance".parse::<ProviderKind>().unwrap(), ProviderKind::Binance);
        assert!("kraken".parse::<ProviderKind>().is_err());
    }
}

// =============================================================================
// Polygon.io aggregates client — historical bars over REST
// =============================================================================
//
// SECURITY: the API key travels as the `apiKey` query parameter. It is never
// logged, never included in error messages, and redacted from `Debug`.
//
// Response shape:
//   { "status": "OK", "resultsCount": 2,
//     "results": [ { "t": 1700000000000, "o": 1.08, "h": 1.09, "l": 1.07, "c": 1.085 }, ... ] }
//
// A missing or empty `results` array means "no bars", not a failure.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimiter;
use super::{classify_status, transport_error, QuoteProvider};
use crate::error::FeedError;
use crate::market_data::bar::{parse_epoch_ms, parse_price};
use crate::market_data::{Bar, BarSeries};
use crate::types::{Interval, Symbol};

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

pub struct PolygonProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl PolygonProvider {
    pub fn new(
        api_key: impl Into<String>,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client for PolygonProvider")?;

        debug!(base_url = DEFAULT_BASE_URL, "PolygonProvider initialised");

        Ok(Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            limiter,
        })
    }

    /// `(multiplier, timespan)` path segments for an interval.
    fn range_for(interval: Interval) -> (u32, &'static str) {
        match interval {
            Interval::Minute1 => (1, "minute"),
            Interval::Minute5 => (5, "minute"),
            Interval::Minute15 => (15, "minute"),
            Interval::Hour1 => (1, "hour"),
            Interval::Hour4 => (4, "hour"),
            Interval::Day => (1, "day"),
            Interval::Week => (1, "week"),
            Interval::Month => (1, "month"),
        }
    }
}

#[async_trait]
impl QuoteProvider for PolygonProvider {
    fn name(&self) -> &'static str {
        "polygon"
    }

    #[instrument(skip_all, name = "polygon::fetch", fields(symbol = %symbol, interval = %interval))]
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarSeries, FeedError> {
        self.limiter.admit(symbol, interval)?;

        let (multiplier, timespan) = Self::range_for(interval);
        // Polygon accepts either YYYY-MM-DD or a millisecond epoch for from/to.
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            timespan,
            from.timestamp_millis(),
            to.timestamp_millis()
        );

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(self.name(), &e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "polygon aggregates request refused");
            return Err(classify_status(self.name(), status));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| transport_error(self.name(), &e))?;

        let series = parse_aggregates(&body)?;
        debug!(count = series.len(), "aggregates fetched");
        Ok(series)
    }
}

/// Decode an aggregates response body into a normalised series.
pub fn parse_aggregates(body: &serde_json::Value) -> Result<BarSeries, FeedError> {
    if body["status"].as_str() == Some("ERROR") {
        let msg = body["error"].as_str().unwrap_or("unknown error");
        return Err(FeedError::UpstreamRejected(format!("polygon: {msg}")));
    }

    let Some(raw) = body["results"].as_array() else {
        return Ok(BarSeries::empty());
    };

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let ts = parse_epoch_ms(&entry["t"], "t")?;
        let open = parse_price(&entry["o"], "o")?;
        let high = parse_price(&entry["h"], "h")?;
        let low = parse_price(&entry["l"], "l")?;
        let close = parse_price(&entry["c"], "c")?;

        match Bar::from_epoch_ms(ts, open, high, low, close) {
            Some(bar) => bars.push(bar),
            None => warn!(ts, "skipping aggregate with out-of-range timestamp"),
        }
    }

    Ok(BarSeries::from_unsorted(bars))
}

impl std::fmt::Debug for PolygonProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_results_in_time_order() {
        let body = json!({
            "status": "OK",
            "results": [
                { "t": 1_700_086_400_000i64, "o": 1.09, "h": 1.10, "l": 1.08, "c": 1.095 },
                { "t": 1_700_000_000_000i64, "o": 1.08, "h": 1.09, "l": 1.07, "c": 1.085 }
            ]
        });
        let series = parse_aggregates(&body).unwrap();
        assert_eq!(series.closes(), vec![1.085, 1.095]);
    }

    #[test]
    fn missing_results_is_empty_series() {
        let body = json!({ "status": "OK", "resultsCount": 0 });
        assert!(parse_aggregates(&body).unwrap().is_empty());
    }

    #[test]
    fn error_payload_is_rejection() {
        let body = json!({ "status": "ERROR", "error": "Unknown API Key" });
        assert!(matches!(
            parse_aggregates(&body),
            Err(FeedError::UpstreamRejected(_))
        ));
    }

    #[test]
    fn malformed_price_is_unavailable() {
        let body = json!({ "results": [ { "t": 1, "o": "x", "h": 1.0, "l": 1.0, "c": 1.0 } ] });
        assert!(matches!(
            parse_aggregates(&body),
            Err(FeedError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let p = PolygonProvider::new(
            "secret-key",
            Duration::from_secs(1),
            Arc::new(RateLimiter::default()),
        )
        .unwrap();
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("secret-key"));
    }

    #[tokio::test]
    async fn denied_fetch_never_reaches_upstream() {
        let limiter = Arc::new(RateLimiter::new(
            0,
            Duration::from_secs(60),
            super::super::RateKeyScope::Symbol,
        ));
        let p = PolygonProvider::new("k", Duration::from_secs(1), limiter).unwrap();
        let sym = Symbol::parse("C:EURUSD").unwrap();
        let now = Utc::now();
        let err = p.fetch(&sym, Interval::Day, now, now).await.unwrap_err();
        assert_eq!(err, FeedError::RateLimited { key: "C:EURUSD".into() });
    }
}

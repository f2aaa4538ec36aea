// =============================================================================
// Binance spot market data — REST klines plus the kline WebSocket push feed
// =============================================================================
//
// Only public endpoints are used, so no request signing is needed.
//
// REST kline array indices:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, ...
// Prices arrive as JSON strings.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::RateLimiter;
use super::{classify_status, transport_error, BarStream, QuoteProvider};
use crate::error::FeedError;
use crate::market_data::bar::{parse_epoch_ms, parse_price};
use crate::market_data::{Bar, BarSeries};
use crate::types::{Interval, Symbol};

const REST_BASE_URL: &str = "https://api.binance.com";
const WS_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
/// Largest page the klines endpoint serves.
const KLINE_LIMIT: u32 = 1000;

pub struct BinanceProvider {
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl BinanceProvider {
    pub fn new(timeout: Duration, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client for BinanceProvider")?;

        debug!(base_url = REST_BASE_URL, "BinanceProvider initialised");

        Ok(Self {
            base_url: REST_BASE_URL.to_string(),
            ws_url: WS_BASE_URL.to_string(),
            client,
            limiter,
        })
    }

    fn interval_code(interval: Interval) -> &'static str {
        match interval {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day => "1d",
            Interval::Week => "1w",
            Interval::Month => "1M",
        }
    }
}

#[async_trait]
impl QuoteProvider for BinanceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    #[instrument(skip_all, name = "binance::fetch", fields(symbol = %symbol, interval = %interval))]
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarSeries, FeedError> {
        self.limiter.admit(symbol, interval)?;

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.as_str().to_string()),
                ("interval", Self::interval_code(interval).to_string()),
                ("startTime", from.timestamp_millis().to_string()),
                ("endTime", to.timestamp_millis().to_string()),
                ("limit", KLINE_LIMIT.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(self.name(), &e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "binance klines request refused");
            return Err(classify_status(self.name(), status));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| transport_error(self.name(), &e))?;

        let series = parse_klines(&body)?;
        debug!(count = series.len(), "klines fetched");
        Ok(series)
    }

    async fn live_bars(
        &self,
        symbol: &Symbol,
        interval: Interval,
    ) -> Result<Option<BarStream>, FeedError> {
        let url = format!(
            "{}/{}@kline_{}",
            self.ws_url,
            symbol.as_str().to_lowercase(),
            Self::interval_code(interval)
        );
        info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            warn!(error = %e, "kline WebSocket connect failed");
            FeedError::UpstreamUnavailable("binance live feed connection failed".into())
        })?;

        // The stream is polled as a whole (not split) so tungstenite can flush
        // its automatic pong replies while reading.
        let bars = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(parse_kline_event(&text)),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "kline WebSocket read error");
                    Some(Err(FeedError::UpstreamUnavailable(
                        "binance live feed interrupted".into(),
                    )))
                }
            }
        });

        Ok(Some(bars.boxed()))
    }
}

/// Decode a REST klines body (array of arrays).
pub fn parse_klines(body: &serde_json::Value) -> Result<BarSeries, FeedError> {
    if let Some(msg) = body["msg"].as_str() {
        return Err(FeedError::UpstreamRejected(format!("binance: {msg}")));
    }

    let raw = body
        .as_array()
        .ok_or_else(|| FeedError::UpstreamUnavailable("klines response is not an array".into()))?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(arr) = entry.as_array().filter(|a| a.len() >= 5) else {
            warn!("skipping malformed kline entry");
            continue;
        };

        let open_time = parse_epoch_ms(&arr[0], "openTime")?;
        let open = parse_price(&arr[1], "open")?;
        let high = parse_price(&arr[2], "high")?;
        let low = parse_price(&arr[3], "low")?;
        let close = parse_price(&arr[4], "close")?;

        if let Some(bar) = Bar::from_epoch_ms(open_time, open, high, low, close) {
            bars.push(bar);
        }
    }

    Ok(BarSeries::from_unsorted(bars))
}

/// Decode one kline push event. Accepts both the single-stream payload and
/// the combined-stream `{stream, data}` envelope.
///
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": 1700000000000, "o": "37000.00", ... } }
/// ```
pub fn parse_kline_event(text: &str) -> Result<Bar, FeedError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| FeedError::UpstreamUnavailable("kline event is not valid JSON".into()))?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    let k = &data["k"];

    let open_time = parse_epoch_ms(&k["t"], "k.t")?;
    let open = parse_price(&k["o"], "k.o")?;
    let high = parse_price(&k["h"], "k.h")?;
    let low = parse_price(&k["l"], "k.l")?;
    let close = parse_price(&k["c"], "k.c")?;

    Bar::from_epoch_ms(open_time, open, high, low, close)
        .ok_or_else(|| FeedError::UpstreamUnavailable("kline open time out of range".into()))
}

impl std::fmt::Debug for BinanceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceProvider")
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn klines_decode_string_prices() {
        let body = json!([
            [1_700_000_000_000i64, "37000.00", "37050.00", "36990.00", "37020.00", "123.4", 1_700_000_059_999i64],
            [1_700_000_060_000i64, "37020.00", "37080.00", "37010.00", "37075.50", "98.1", 1_700_000_119_999i64]
        ]);
        let series = parse_klines(&body).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.closes(), vec![37020.0, 37075.5]);
        assert_eq!(series.bars()[0].high, 37050.0);
    }

    #[test]
    fn short_entries_are_skipped() {
        let body = json!([[1_700_000_000_000i64, "1.0"], [1_700_000_060_000i64, "1", "2", "0.5", "1.5"]]);
        let series = parse_klines(&body).unwrap();
        assert_eq!(series.closes(), vec![1.5]);
    }

    #[test]
    fn empty_array_is_empty_series() {
        assert!(parse_klines(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn error_body_is_rejection() {
        let body = json!({ "code": -1121, "msg": "Invalid symbol." });
        assert!(matches!(parse_klines(&body), Err(FeedError::UpstreamRejected(_))));
    }

    #[test]
    fn kline_event_single_and_combined() {
        let single = r#"{"e":"kline","s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"i":"1m",
            "o":"37000.00","h":"37050.00","l":"36990.00","c":"37020.00","x":false}}"#;
        let bar = parse_kline_event(single).unwrap();
        assert_eq!(bar.close, 37020.0);

        let combined = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","s":"BTCUSDT",
            "k":{"t":1700000000000,"o":"1","h":"2","l":"0.5","c":"1.5"}}}"#;
        assert_eq!(parse_kline_event(combined).unwrap().close, 1.5);
    }

    #[test]
    fn kline_event_garbage_is_error() {
        assert!(parse_kline_event("not json").is_err());
        assert!(parse_kline_event(r#"{"e":"kline"}"#).is_err());
    }
}

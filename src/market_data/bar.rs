use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Serialize, Serializer};

use crate::error::FeedError;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLC bucket. Serialised in the chart wire shape `{x, o, h, l, c}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bar {
    #[serde(rename = "x", serialize_with = "serialize_iso")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
}

impl Bar {
    /// Build a bar from an upstream millisecond epoch. `None` when the
    /// timestamp is out of chrono's range.
    pub fn from_epoch_ms(ms: i64, open: f64, high: f64, low: f64, close: f64) -> Option<Self> {
        let timestamp = Utc.timestamp_millis_opt(ms).single()?;
        Some(Self {
            timestamp,
            open,
            high,
            low,
            close,
        })
    }

    fn is_finite(&self) -> bool {
        self.open.is_finite() && self.high.is_finite() && self.low.is_finite() && self.close.is_finite()
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn iso_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_iso<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&iso_timestamp(ts))
}

// ---------------------------------------------------------------------------
// BarSeries -- strictly increasing timestamps, possibly empty
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Normalise bars in whatever order the upstream delivered them: sort by
    /// time, drop bars with non-finite prices, and keep the last bar seen for
    /// any repeated timestamp.
    pub fn from_unsorted(mut bars: Vec<Bar>) -> Self {
        bars.retain(Bar::is_finite);
        // Stable sort keeps arrival order within equal timestamps.
        bars.sort_by_key(|b| b.timestamp);

        let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match out.last_mut() {
                Some(last) if last.timestamp == bar.timestamp => *last = bar,
                _ => out.push(bar),
            }
        }
        Self { bars: out }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Insert `bar`, replacing any bar with the same timestamp. The in-progress
    /// bucket of a live feed arrives many times with the same open time.
    pub fn upsert(&mut self, bar: Bar) {
        if !bar.is_finite() {
            return;
        }
        match self.bars.binary_search_by_key(&bar.timestamp, |b| b.timestamp) {
            Ok(idx) => self.bars[idx] = bar,
            Err(idx) => self.bars.insert(idx, bar),
        }
    }

    /// Drop the oldest bars so at most `max_len` remain.
    pub fn retain_last(&mut self, max_len: usize) {
        let excess = self.bars.len().saturating_sub(max_len);
        if excess > 0 {
            self.bars.drain(..excess);
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream field decoding
// ---------------------------------------------------------------------------

/// Upstreams send prices either as JSON strings or as numbers.
pub fn parse_price(val: &serde_json::Value, name: &str) -> Result<f64, FeedError> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().map_err(|_| {
            FeedError::UpstreamUnavailable(format!("field {name} is not a number: {s}"))
        }),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FeedError::UpstreamUnavailable(format!("field {name} is not a valid f64"))),
        _ => Err(FeedError::UpstreamUnavailable(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

/// Millisecond epoch that may also arrive as a float (`1700000000000.0`).
pub fn parse_epoch_ms(val: &serde_json::Value, name: &str) -> Result<i64, FeedError> {
    val.as_i64()
        .or_else(|| val.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .ok_or_else(|| FeedError::UpstreamUnavailable(format!("missing timestamp field {name}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

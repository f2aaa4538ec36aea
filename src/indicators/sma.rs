// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// SMA_i = mean(close_{i-period+1} ..= close_i), defined for i >= period - 1.
//
// Each point carries the timestamp of the bar it ends on, so chart consumers
// can plot it directly against the bar series.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::market_data::bar::iso_timestamp;
use crate::market_data::BarSeries;

/// One indicator sample in the chart wire shape `{x, y}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Serialize for IndicatorPoint {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("IndicatorPoint", 2)?;
        st.serialize_field("x", &iso_timestamp(&self.timestamp))?;
        st.serialize_field("y", &self.value)?;
        st.end()
    }
}

/// SMA of closes over `period` bars. Empty when `period == 0` or the series
/// has fewer than `period` bars; otherwise `len - period + 1` points.
pub fn sma(series: &BarSeries, period: usize) -> Vec<IndicatorPoint> {
    let bars = series.bars();
    if period == 0 || bars.len() < period {
        return Vec::new();
    }

    // Each window is summed directly rather than with a running sum so that
    // values do not depend on accumulated floating-point drift.
    bars.windows(period)
        .map(|window| {
            let sum: f64 = window.iter().map(|b| b.close).sum();
            IndicatorPoint {
                timestamp: window[period - 1].timestamp,
                value: sum / period as f64,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::daily_series;

    #[test]
    fn sma_length_and_values() {
        let series = daily_series(10, |i| (i + 1) as f64);
        let out = sma(&series, 3);
        assert_eq!(out.len(), 8);
        assert!((out[0].value - 2.0).abs() < 1e-12);
        assert!((out[7].value - 9.0).abs() < 1e-12);
        assert_eq!(out[0].timestamp, series.bars()[2].timestamp);
    }

    #[test]
    fn sma_each_point_is_trailing_mean() {
        let series = daily_series(60, |i| 100.0 + ((i * 7) % 13) as f64);
        let closes = series.closes();
        let p = 20;
        let out = sma(&series, p);
        assert_eq!(out.len(), closes.len() - p + 1);
        for (j, point) in out.iter().enumerate() {
            let mean = closes[j..j + p].iter().sum::<f64>() / p as f64;
            assert!((point.value - mean).abs() < 1e-9);
        }
    }

    #[test]
    fn sma_short_series_is_empty() {
        let series = daily_series(4, |i| i as f64);
        assert!(sma(&series, 5).is_empty());
        assert!(sma(&BarSeries::empty(), 1).is_empty());
    }

    #[test]
    fn sma_period_zero_is_empty() {
        assert!(sma(&daily_series(4, |i| i as f64), 0).is_empty());
    }

    #[test]
    fn sma_period_equals_length() {
        let series = daily_series(3, |i| [2.0, 4.0, 6.0][i]);
        let out = sma(&series, 3);
        assert_eq!(out.len(), 1);
        assert!((out[0].value - 4.0).abs() < 1e-12);
    }

    #[test]
    fn point_serialises_to_xy() {
        let series = daily_series(1, |_| 1.25);
        let v = serde_json::to_value(sma(&series, 1)[0]).unwrap();
        assert_eq!(v["x"], "2024-01-01T00:00:00.000Z");
        assert_eq!(v["y"], 1.25);
    }
}

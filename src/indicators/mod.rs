// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free functions over a BarSeries. Identical input always
// produces identical output; nothing here touches the network or the clock.

pub mod ema;
pub mod macd;
pub mod sma;

use serde::{Deserialize, Serialize};

use crate::market_data::BarSeries;

pub use macd::{macd, MacdParams, MacdSeries};
pub use sma::{sma, IndicatorPoint};

/// Periods for the indicator bundle computed per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    pub sma_fast: usize,
    pub sma_slow: usize,
    #[serde(flatten)]
    pub macd: MacdParams,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            sma_fast: 50,
            sma_slow: 200,
            macd: MacdParams::default(),
        }
    }
}

/// Every indicator series derived from one BarSeries.
///
/// `sma50` and `sma200` are fixed wire names for the fast and slow averages.
/// They keep those names whatever `sma_fast` / `sma_slow` are configured to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSet {
    pub sma50: Vec<IndicatorPoint>,
    pub sma200: Vec<IndicatorPoint>,
    #[serde(flatten)]
    pub macd: MacdSeries,
}

impl IndicatorSet {
    pub fn compute(series: &BarSeries, params: &IndicatorParams) -> Self {
        Self {
            sma50: sma(series, params.sma_fast),
            sma200: sma(series, params.sma_slow),
            macd: macd(series, params.macd),
        }
    }

    /// Latest value of each series, for incremental updates. MACD values
    /// still inside the signal warm-up are reported as absent.
    pub fn tail(&self, params: &IndicatorParams) -> IndicatorTail {
        let warmed = self.macd.len() > params.macd.signal_start();
        let last = |v: &Vec<f64>| if warmed { v.last().copied() } else { None };
        IndicatorTail {
            sma50: self.sma50.last().copied(),
            sma200: self.sma200.last().copied(),
            macd: last(&self.macd.macd_line),
            signal: last(&self.macd.signal_line),
            histogram: last(&self.macd.histogram),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorTail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma50: Option<IndicatorPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma200: Option<IndicatorPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::daily_series;

    #[test]
    fn set_lengths_follow_warm_up_rules() {
        let series = daily_series(200, |i| 100.0 + i as f64);
        let set = IndicatorSet::compute(&series, &IndicatorParams::default());
        assert_eq!(set.sma50.len(), 151);
        assert_eq!(set.sma200.len(), 1);
        assert_eq!(set.macd.len(), 200);
    }

    #[test]
    fn tail_reports_latest_values() {
        let series = daily_series(60, |i| 100.0 + i as f64);
        let params = IndicatorParams::default();
        let set = IndicatorSet::compute(&series, &params);
        let tail = set.tail(&params);
        assert_eq!(tail.sma50, set.sma50.last().copied());
        assert!(tail.sma200.is_none());
        assert_eq!(tail.histogram, set.macd.histogram.last().copied());
    }

    #[test]
    fn tail_hides_macd_during_warm_up() {
        let series = daily_series(10, |i| i as f64);
        let params = IndicatorParams::default();
        let tail = IndicatorSet::compute(&series, &params).tail(&params);
        assert_eq!(tail, IndicatorTail::default());
    }

    #[test]
    fn sma_wire_names_ignore_configured_periods() {
        let params = IndicatorParams {
            sma_fast: 20,
            sma_slow: 100,
            ..IndicatorParams::default()
        };
        let set = IndicatorSet::compute(&daily_series(120, |i| i as f64), &params);
        let v = serde_json::to_value(&set).unwrap();
        assert_eq!(v["sma50"].as_array().unwrap().len(), 101);
        assert_eq!(v["sma200"].as_array().unwrap().len(), 21);
        assert!(v.get("sma20").is_none());
    }

    #[test]
    fn params_deserialise_flat() {
        let p: IndicatorParams =
            serde_json::from_str(r#"{ "sma_fast": 20, "long_period": 30 }"#).unwrap();
        assert_eq!(p.sma_fast, 20);
        assert_eq!(p.sma_slow, 200);
        assert_eq!(p.macd.long_period, 30);
        assert_eq!(p.macd.short_period, 12);
    }
}

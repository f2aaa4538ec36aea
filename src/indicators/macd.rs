// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
//   macd[i]      = EMA_short[i] - EMA_long[i]              (every index)
//   signal[i]    = 0                                        i <  long - 1
//                = macd[long - 1]                           i == long - 1
//                = (macd[i] - signal[i-1]) * k + signal[i-1] i >  long - 1
//   histogram[i] = macd[i] - signal[i] for i >= long - 1, else 0
//
// Both price EMAs are seeded with close[0]. The signal EMA only starts at
// `long - 1`, so the three series are full-length but carry a warm-up prefix.
// Chart consumers slice from `consumer_offset()` = signal + long - 2.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::ema::{ema_series, multiplier};
use crate::market_data::BarSeries;

/// MACD periods. Defaults are the conventional 12 / 26 / 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacdParams {
    pub short_period: usize,
    pub long_period: usize,
    pub signal_period: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            short_period: 12,
            long_period: 26,
            signal_period: 9,
        }
    }
}

impl MacdParams {
    /// First index at which the signal line is defined.
    pub fn signal_start(&self) -> usize {
        self.long_period.saturating_sub(1)
    }

    /// Number of leading points chart consumers drop from all three series.
    pub fn consumer_offset(&self) -> usize {
        (self.signal_period + self.long_period).saturating_sub(2)
    }
}

/// Three index-aligned series, each the same length as the input bars.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacdSeries {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

impl MacdSeries {
    pub fn len(&self) -> usize {
        self.macd_line.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macd_line.is_empty()
    }

    /// Drop the first `offset` points from every series.
    pub fn sliced(&self, offset: usize) -> Self {
        let cut = |v: &Vec<f64>| v.get(offset..).map(<[f64]>::to_vec).unwrap_or_default();
        Self {
            macd_line: cut(&self.macd_line),
            signal_line: cut(&self.signal_line),
            histogram: cut(&self.histogram),
        }
    }
}

pub fn macd(series: &BarSeries, params: MacdParams) -> MacdSeries {
    let closes = series.closes();
    if closes.is_empty() || params.short_period == 0 || params.long_period == 0 {
        return MacdSeries::default();
    }

    let short = ema_series(&closes, params.short_period);
    let long = ema_series(&closes, params.long_period);
    let macd_line: Vec<f64> = short.iter().zip(&long).map(|(s, l)| s - l).collect();

    let n = macd_line.len();
    let start = params.signal_start();
    let k = multiplier(params.signal_period);

    let mut signal_line = vec![0.0; n];
    let mut histogram = vec![0.0; n];
    if start < n {
        signal_line[start] = macd_line[start];
        for i in start + 1..n {
            signal_line[i] = (macd_line[i] - signal_line[i - 1]) * k + signal_line[i - 1];
        }
        for i in start..n {
            histogram[i] = macd_line[i] - signal_line[i];
        }
    }

    MacdSeries {
        macd_line,
        signal_line,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::daily_series;

    fn wavy(n: usize) -> BarSeries {
        daily_series(n, |i| 1.08 + 0.01 * ((i as f64) * 0.3).sin() + 0.0001 * i as f64)
    }

    #[test]
    fn macd_line_starts_at_zero() {
        let out = macd(&wavy(60), MacdParams::default());
        assert_eq!(out.macd_line[0], 0.0);
        assert_eq!(out.len(), 60);
    }

    #[test]
    fn signal_and_histogram_zero_before_warm_up() {
        let params = MacdParams::default();
        let out = macd(&wavy(60), params);
        for i in 0..params.signal_start() {
            assert_eq!(out.signal_line[i], 0.0, "signal at {i}");
            assert_eq!(out.histogram[i], 0.0, "histogram at {i}");
        }
        // Seeded with the MACD value at long - 1.
        assert_eq!(out.signal_line[25], out.macd_line[25]);
        assert_eq!(out.histogram[25], 0.0);
    }

    #[test]
    fn signal_follows_ema_recurrence_after_seed() {
        let params = MacdParams::default();
        let out = macd(&wavy(60), params);
        let k = 2.0 / 10.0;
        for i in 26..60 {
            let expected = (out.macd_line[i] - out.signal_line[i - 1]) * k + out.signal_line[i - 1];
            assert!((out.signal_line[i] - expected).abs() < 1e-15);
            assert!((out.histogram[i] - (out.macd_line[i] - out.signal_line[i])).abs() < 1e-15);
        }
    }

    #[test]
    fn macd_line_is_short_minus_long_ema() {
        let series = wavy(40);
        let closes = series.closes();
        let short = ema_series(&closes, 12);
        let long = ema_series(&closes, 26);
        let out = macd(&series, MacdParams::default());
        for i in 0..40 {
            assert_eq!(out.macd_line[i], short[i] - long[i]);
        }
    }

    #[test]
    fn series_shorter_than_long_period_has_no_signal() {
        let out = macd(&wavy(10), MacdParams::default());
        assert_eq!(out.len(), 10);
        assert!(out.signal_line.iter().all(|&v| v == 0.0));
        assert!(out.histogram.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_series_is_empty() {
        assert!(macd(&BarSeries::empty(), MacdParams::default()).is_empty());
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let series = wavy(250);
        let a = serde_json::to_string(&macd(&series, MacdParams::default())).unwrap();
        let b = serde_json::to_string(&macd(&series.clone(), MacdParams::default())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn consumer_offset_and_slice() {
        let params = MacdParams::default();
        assert_eq!(params.consumer_offset(), 33);
        let out = macd(&wavy(40), params).sliced(params.consumer_offset());
        assert_eq!(out.len(), 7);
        assert_eq!(out.signal_line.len(), 7);
        assert!(macd(&wavy(10), params).sliced(33).is_empty());
    }
}

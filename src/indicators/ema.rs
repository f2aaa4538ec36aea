// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = (value_t - EMA_{t-1}) * multiplier + EMA_{t-1}
//
// The series is seeded with the first value itself (EMA_0 = value_0), not
// with an SMA of the first `period` values, so the output is index-aligned
// with the input from index 0.
// =============================================================================

/// Smoothing factor for `period`.
pub fn multiplier(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Compute the EMA of `values` with look-back `period`, seeded by `values[0]`.
///
/// The result has the same length as the input. `period == 0` or an empty
/// input yields an empty `Vec`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let Some(&seed) = values.first() else {
        return Vec::new();
    };
    if period == 0 {
        return Vec::new();
    }

    let k = multiplier(period);
    let mut out = Vec::with_capacity(values.len());
    out.push(seed);

    let mut prev = seed;
    for &v in &values[1..] {
        let ema = (v - prev) * k + prev;
        out.push(ema);
        prev = ema;
    }
    out
}

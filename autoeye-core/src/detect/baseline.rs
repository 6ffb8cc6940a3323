//! Volatility baselines for the FVG displacement filter.
//!
//! True Range: max(high-low, |high-prev_close|, |low-prev_close|).
//! The ATR here is a plain mean of TR over the window (no smoothing) so the
//! value at a bar depends only on a fixed, bounded lookback.

use crate::domain::Bar;

/// True range of `bar` given the previous close.
pub fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
        .max(0.0)
}

/// Mean true range over the `period` bars ending at `end` (inclusive).
///
/// Every bar in the span needs a previous close, so `end >= period`.
pub fn mean_true_range(bars: &[Bar], end: usize, period: usize) -> Option<f64> {
    if period == 0 || end < period || end >= bars.len() {
        return None;
    }
    let start = end + 1 - period;
    let sum: f64 = (start..=end)
        .map(|i| true_range(&bars[i], bars[i - 1].close))
        .sum();
    Some(sum / period as f64)
}

/// Median candle body over the `period` bars ending at `end` (inclusive).
pub fn median_body(bars: &[Bar], end: usize, period: usize) -> Option<f64> {
    if period == 0 || end + 1 < period || end >= bars.len() {
        return None;
    }
    let mut bodies: Vec<f64> = bars[end + 1 - period..=end].iter().map(Bar::body).collect();
    bodies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = bodies.len();
    Some(if n % 2 == 0 {
        (bodies[n / 2 - 1] + bodies[n / 2]) / 2.0
    } else {
        bodies[n / 2]
    })
}

/// Whether both baselines have their full lookback at `end`.
pub fn lookback_complete(end: usize, atr_period: usize, median_body_period: usize) -> bool {
    end >= atr_period && end + 1 >= median_body_period
}

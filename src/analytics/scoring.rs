//! Small numeric helpers shared by the detectors
//!
//! Every score the engine publishes passes through `clamp_score`.

use crate::error::{Component, EngineError, Result};
use crate::types::Candle;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;

/// Clamp into [0, 100]; NaN collapses to 0
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        SCORE_MIN
    } else {
        value.clamp(SCORE_MIN, SCORE_MAX)
    }
}

/// `value / cap` limited to [0, 1]; a non-positive cap yields 0
pub fn capped_ratio(value: f64, cap: f64) -> f64 {
    if cap > 0.0 && value.is_finite() {
        (value / cap).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Divide, returning `fallback` when the denominator is zero or the result is not finite
pub fn safe_div(numerator: f64, denominator: f64, fallback: f64) -> f64 {
    if denominator == 0.0 {
        return fallback;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Mean volume of up to `lookback` candles before `idx`
pub fn trailing_volume(candles: &[Candle], idx: usize, lookback: usize) -> Option<f64> {
    let start = idx.saturating_sub(lookback);
    mean(candles[start..idx].iter().map(|c| c.volume))
}

/// Linear-interpolated percentile (0..=100) of unsorted values
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

/// Reject candles that would poison downstream arithmetic
pub fn validate_candles(candles: &[Candle], component: Component) -> Result<()> {
    match candles.iter().position(|c| !c.is_well_formed()) {
        Some(idx) => Err(EngineError::computation(
            component,
            format!("candle {} is malformed (non-finite or high < low)", idx),
        )),
        None => Ok(()),
    }
}

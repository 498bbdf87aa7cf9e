//! Risk multiplier and payout calculator for shorts and portfolio bets.
//!
//! Harder targets (bigger percentage moves) and shorter windows earn a
//! larger multiplier. Pure and deterministic.

use super::price::round2;

/// Lower clamp on the multiplier — every winning bet pays at least 1.1x.
pub const MIN_MULTIPLIER: f64 = 1.1;
/// Upper clamp on the multiplier.
pub const MAX_MULTIPLIER: f64 = 10.0;
/// One week, in hours. Windows shorter than this add time risk.
pub const BASELINE_HOURS: f64 = 168.0;

/// Compute the payout multiplier for a target percentage move within a
/// time window, clamped to `[1.1, 10.0]`.
pub fn multiplier(percent_change: f64, time_hours: f64) -> f64 {
    let percent_risk = percent_change / 20.0;
    let time_risk = ((BASELINE_HOURS - time_hours) / BASELINE_HOURS).max(0.0);
    (1.0 + percent_risk + time_risk).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
}

/// Potential payout for a stake at the given target/window, in cents.
pub fn payout(stake: f64, percent_change: f64, time_hours: f64) -> f64 {
    round2(stake * multiplier(percent_change, time_hours))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

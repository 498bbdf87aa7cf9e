//! Demand-driven price engine.
//!
//! Price is a pure function of the cumulative buy/sell counters and the
//! base price, so it can be recomputed idempotently from persisted state
//! after a crash. No side effects, no store access.

/// Per-share growth factor applied for each unit of positive net demand.
const UP_FACTOR: f64 = 1.001;
/// Per-share decay factor applied for each unit of negative net demand.
const DOWN_FACTOR: f64 = 0.999;
/// The decay multiplier never goes below this.
const MIN_MULTIPLIER: f64 = 0.1;
/// Price never drops below half the base price.
pub const PRICE_FLOOR_RATIO: f64 = 0.5;

/// Round to two decimal places (cents).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compute the current price from cumulative counters.
///
/// `net = purchased - sold`. Positive net demand compounds the price up
/// by `1.001^net`; negative net demand decays it by `0.999^|net|`,
/// floored at a 0.1 multiplier. The result is clamped to at least half
/// the base price and rounded to cents.
pub fn price(purchased: u64, sold: u64, base: f64) -> f64 {
    let net = purchased as i64 - sold as i64;
    let multiplier = if net >= 0 {
        UP_FACTOR.powf(net as f64)
    } else {
        DOWN_FACTOR.powf((-net) as f64).max(MIN_MULTIPLIER)
    };
    round2((base * multiplier).max(base * PRICE_FLOOR_RATIO))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

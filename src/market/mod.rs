//! Market math — pricing, risk multipliers, and the anti-arbitrage
//! rate limiter. Pure calculators with no store access except the
//! limiter's transaction-window query.

pub mod limiter;
pub mod price;
pub mod risk;

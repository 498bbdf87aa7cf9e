//! Core engine — the ledger, the settlement state machine, and the
//! agent scheduler that drives both.

pub mod ledger;
pub mod scheduler;
pub mod settlement;

use serde_json::json;
use thiserror::Error;

use crate::store::{collections, from_doc, DocumentStore, QueryFilter, StoreError};
use crate::types::Position;

// ---------------------------------------------------------------------------
// Trade errors
// ---------------------------------------------------------------------------

/// Validation and execution failures for trade entry points. The
/// message of each variant is the user-facing reason string; bots log
/// it and skip the tick, the UI shows it verbatim.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("insufficient balance: need ${needed:.2}, have ${available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("limit of {max} purchases per {window_mins} minutes reached, wait {wait_mins} minute(s)")]
    RateLimited {
        max: usize,
        window_mins: i64,
        wait_mins: i64,
    },

    #[error("quantity must be at least 1")]
    InvalidQuantity,

    #[error("no holdings of this opinion to sell")]
    NoPosition,

    #[error("target percentage must be between {min} and {max}")]
    InvalidPercent { min: f64, max: f64 },

    #[error("time window must be between {min_hours} and {max_hours} hours")]
    InvalidWindow { min_hours: i64, max_hours: i64 },

    #[error("cannot short an opinion you currently hold")]
    AlreadyHoldingLong,

    #[error("unknown opinion")]
    UnknownInstrument,

    #[error("unknown participant")]
    UnknownAgent,

    #[error("cannot bet on your own portfolio")]
    SelfBet,

    /// A transaction closure declined mid-flight (state changed between
    /// validation and commit). Carries the reason string.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TradeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Aborted(reason) => TradeError::Rejected(reason),
            other => TradeError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared projections
// ---------------------------------------------------------------------------

/// Market value of a participant's open positions at current prices.
/// This is the quantity portfolio bets are staked on; cash balance is
/// deliberately excluded.
pub async fn portfolio_value(
    store: &dyn DocumentStore,
    owner_id: &str,
) -> Result<f64, StoreError> {
    let filter = QueryFilter::default().field_eq("owner_id", json!(owner_id));
    let docs = store
        .query(collections::POSITIONS, &filter, None, None)
        .await?;

    let mut total = 0.0;
    for doc in docs {
        let position: Position = from_doc(doc)?;
        let price = store
            .get(collections::INSTRUMENTS, &position.instrument_id)
            .await?
            .and_then(|d| d.get("price").and_then(|p| p.as_f64()))
            .unwrap_or(0.0);
        total += position.market_value(price);
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

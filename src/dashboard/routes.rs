//! Dashboard API route handlers.
//!
//! All endpoints return JSON snapshots read straight from the store;
//! nothing here ever writes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::engine::portfolio_value;
use crate::market::price;
use crate::store::{collections, from_doc, DocumentStore, QueryFilter, StoreError};
use crate::types::{Agent, Instrument, Position, Transaction};

const FEED_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub store: Arc<dyn DocumentStore>,
}

impl DashboardState {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentView {
    pub id: String,
    pub text: String,
    pub price: f64,
    pub base_price: f64,
    pub purchases: u64,
    pub sales: u64,
    pub history: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub agent_id: String,
    pub name: String,
    pub balance: f64,
    pub holdings_value: f64,
    pub net_worth: f64,
    pub total_earnings: f64,
    pub total_losses: f64,
    pub risk_profile: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioResponse {
    pub agent_id: String,
    pub name: String,
    pub balance: f64,
    pub holdings_value: f64,
    pub holdings: Vec<HoldingView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingView {
    pub instrument_id: String,
    pub text: String,
    pub quantity: u32,
    pub avg_cost: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    pub kind: String,
    pub actor_id: String,
    pub instrument_id: Option<String>,
    pub quantity: u32,
    pub amount: f64,
    pub price: f64,
    pub timestamp: String,
}

fn internal(err: StoreError) -> StatusCode {
    error!(error = %err, "dashboard query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/instruments
pub async fn get_instruments(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstrumentView>>, StatusCode> {
    let docs = state
        .store
        .query(collections::INSTRUMENTS, &QueryFilter::default(), Some("text"), None)
        .await
        .map_err(internal)?;

    let mut views = Vec::with_capacity(docs.len());
    for doc in docs {
        let inst: Instrument = from_doc(doc).map_err(internal)?;
        views.push(InstrumentView {
            id: inst.id,
            text: inst.text,
            price: inst.price,
            base_price: inst.base_price,
            purchases: inst.purchases,
            sales: inst.sales,
            history: inst
                .history
                .iter()
                .map(|p| HistoryPoint {
                    timestamp: p.timestamp.to_rfc3339(),
                    price: p.price,
                })
                .collect(),
        });
    }
    Ok(Json(views))
}

/// GET /api/leaderboard
pub async fn get_leaderboard(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, StatusCode> {
    let docs = state
        .store
        .query(collections::AGENTS, &QueryFilter::default(), None, None)
        .await
        .map_err(internal)?;

    let mut entries = Vec::with_capacity(docs.len());
    for doc in docs {
        let agent: Agent = from_doc(doc).map_err(internal)?;
        let holdings_value = portfolio_value(state.store.as_ref(), &agent.id)
            .await
            .map_err(internal)?;
        entries.push(LeaderboardEntry {
            net_worth: price::round2(agent.balance + holdings_value),
            agent_id: agent.id,
            name: agent.name,
            balance: agent.balance,
            holdings_value,
            total_earnings: agent.total_earnings,
            total_losses: agent.total_losses,
            risk_profile: agent.risk_profile.to_string(),
        });
    }
    entries.sort_by(|a, b| {
        b.net_worth
            .partial_cmp(&a.net_worth)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(Json(entries))
}

/// GET /api/agents/:id/portfolio
pub async fn get_portfolio(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<PortfolioResponse>, StatusCode> {
    let agent: Agent = match state
        .store
        .get(collections::AGENTS, &agent_id)
        .await
        .map_err(internal)?
    {
        Some(doc) => from_doc(doc).map_err(internal)?,
        None => return Err(StatusCode::NOT_FOUND),
    };

    let filter = QueryFilter::default().field_eq("owner_id", serde_json::json!(agent_id));
    let docs = state
        .store
        .query(collections::POSITIONS, &filter, None, None)
        .await
        .map_err(internal)?;

    let mut holdings = Vec::with_capacity(docs.len());
    let mut holdings_value = 0.0;
    for doc in docs {
        let pos: Position = from_doc(doc).map_err(internal)?;
        let (text, current_price) = match state
            .store
            .get(collections::INSTRUMENTS, &pos.instrument_id)
            .await
            .map_err(internal)?
        {
            Some(doc) => {
                let inst: Instrument = from_doc(doc).map_err(internal)?;
                (inst.text, inst.price)
            }
            None => continue,
        };
        let market_value = price::round2(current_price * pos.quantity as f64);
        holdings_value += market_value;
        holdings.push(HoldingView {
            instrument_id: pos.instrument_id,
            text,
            quantity: pos.quantity,
            avg_cost: pos.avg_cost,
            current_price,
            market_value,
            unrealized_pnl: price::round2(market_value - pos.total_cost),
        });
    }

    Ok(Json(PortfolioResponse {
        agent_id: agent.id,
        name: agent.name,
        balance: agent.balance,
        holdings_value: price::round2(holdings_value),
        holdings,
    }))
}

/// GET /api/transactions — the most recent entries, newest first.
pub async fn get_transactions(
    State(state): State<AppState>,
) -> Result<Json<Vec<TransactionView>>, StatusCode> {
    let docs = state
        .store
        .query(
            collections::TRANSACTIONS,
            &QueryFilter::default(),
            Some("timestamp"),
            None,
        )
        .await
        .map_err(internal)?;

    let start = docs.len().saturating_sub(FEED_LIMIT);
    let mut views = Vec::with_capacity(docs.len() - start);
    for doc in docs[start..].iter().rev() {
        let txn: Transaction = from_doc(doc.clone()).map_err(internal)?;
        views.push(TransactionView {
            kind: txn.kind.to_string(),
            actor_id: txn.actor_id,
            instrument_id: txn.instrument_id,
            quantity: txn.quantity,
            amount: txn.amount,
            price: txn.price,
            timestamp: txn.timestamp.to_rfc3339(),
        });
    }
    Ok(Json(views))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

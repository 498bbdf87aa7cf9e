//! Portfolio ledger — buy and sell entry points for bots and humans.
//!
//! Every mutation funnels through the conflict resolver and a single
//! store transaction covering the agent, the instrument, and the
//! position, so counters, price, balance and cost basis move together
//! or not at all. Validation happens before any mutation is attempted
//! and re-checked inside the transaction against fresh state.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::TradeError;
use crate::clock::Clock;
use crate::config::MarketConfig;
use crate::market::limiter::RateLimiter;
use crate::market::price;
use crate::store::{
    collections, from_doc, to_doc, ConflictResolver, DocKey, DocumentStore, StoreError, TxnOutput,
    WriteOp,
};
use crate::types::{Agent, Instrument, Position, Transaction, TransactionKind};

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// What a completed trade hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub instrument_id: String,
    /// Shares actually traded (sells clamp to the held quantity).
    pub quantity: u32,
    /// Unit price the trade executed at (spread already applied on sells).
    pub unit_price: f64,
    /// Total debited (buys) or credited (sells).
    pub total: f64,
    /// Instrument price after the counters moved.
    pub new_price: f64,
    /// Realized gain/loss, sells only.
    pub realized_pnl: Option<f64>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct PortfolioLedger {
    store: Arc<dyn DocumentStore>,
    resolver: Arc<ConflictResolver>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    market: MarketConfig,
}

impl PortfolioLedger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resolver: Arc<ConflictResolver>,
        clock: Arc<dyn Clock>,
        market: MarketConfig,
    ) -> Self {
        let limiter = RateLimiter::new(
            chrono::Duration::seconds(market.rate_limit_window_secs),
            market.rate_limit_max_buys,
        );
        Self {
            store,
            resolver,
            limiter,
            clock,
            market,
        }
    }

    /// Buy `quantity` shares of an instrument at its current price.
    pub async fn buy(
        &self,
        agent_id: &str,
        instrument_id: &str,
        quantity: u32,
    ) -> Result<TradeReceipt, TradeError> {
        if quantity == 0 {
            return Err(TradeError::InvalidQuantity);
        }
        let now = self.clock.now();

        // Pre-mutation validation with user-facing failures.
        let agent: Agent = match self.store.get(collections::AGENTS, agent_id).await? {
            Some(doc) => from_doc(doc)?,
            None => return Err(TradeError::UnknownAgent),
        };
        let instrument: Instrument =
            match self.store.get(collections::INSTRUMENTS, instrument_id).await? {
                Some(doc) => from_doc(doc)?,
                None => return Err(TradeError::UnknownInstrument),
            };

        let estimated_cost = price::round2(instrument.price * quantity as f64);
        if agent.balance < estimated_cost {
            return Err(TradeError::InsufficientBalance {
                needed: estimated_cost,
                available: agent.balance,
            });
        }

        let verdict = self
            .limiter
            .check(self.store.as_ref(), agent_id, instrument_id, now)
            .await?;
        if !verdict.allowed {
            return Err(TradeError::RateLimited {
                max: self.limiter.max_buys,
                window_mins: self.limiter.window.num_minutes(),
                wait_mins: verdict.wait_minutes(),
            });
        }

        // Guarded mutation. The transaction re-reads everything, so a
        // retried attempt after a conflict starts from fresh state.
        let store = Arc::clone(&self.store);
        let key = format!("instrument:{instrument_id}");
        let aid = agent_id.to_string();
        let iid = instrument_id.to_string();
        let max_history = self.market.max_price_history;

        let receipt_doc = self
            .resolver
            .run(&key, move || {
                let store = Arc::clone(&store);
                let aid = aid.clone();
                let iid = iid.clone();
                async move {
                    let pos_id = Position::id_for(&aid, &iid);
                    let keys = vec![
                        DocKey::new(collections::AGENTS, &aid),
                        DocKey::new(collections::INSTRUMENTS, &iid),
                        DocKey::new(collections::POSITIONS, &pos_id),
                    ];
                    let aid2 = aid.clone();
                    let iid2 = iid.clone();
                    store
                        .transact(
                            &keys,
                            Box::new(move |snap| {
                                let mut agent: Agent = from_doc(
                                    snap.get(collections::AGENTS, &aid2)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::AGENTS, &aid2)
                                        })?,
                                )?;
                                let mut instrument: Instrument = from_doc(
                                    snap.get(collections::INSTRUMENTS, &iid2)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::INSTRUMENTS, &iid2)
                                        })?,
                                )?;

                                let unit_price = instrument.price;
                                let cost = price::round2(unit_price * quantity as f64);
                                if agent.balance < cost {
                                    return Err(StoreError::Aborted(format!(
                                        "insufficient balance: need ${cost:.2}, have ${:.2}",
                                        agent.balance
                                    )));
                                }

                                agent.balance = price::round2(agent.balance - cost);
                                agent.last_active = now;

                                instrument.purchases += quantity as u64;
                                let new_price = price::price(
                                    instrument.purchases,
                                    instrument.sales,
                                    instrument.base_price,
                                );
                                instrument.record_price(new_price, now, max_history);

                                let position = match snap.get(collections::POSITIONS, &pos_id) {
                                    Some(doc) => {
                                        let mut pos: Position = from_doc(doc.clone())?;
                                        pos.add(quantity, unit_price, now);
                                        pos
                                    }
                                    None => Position::open(
                                        aid2.clone(),
                                        iid2.clone(),
                                        quantity,
                                        unit_price,
                                        now,
                                    ),
                                };

                                let txn = Transaction::new(
                                    TransactionKind::Buy,
                                    aid2.clone(),
                                    Some(iid2.clone()),
                                    quantity,
                                    -cost,
                                    unit_price,
                                    now,
                                );

                                let receipt = TradeReceipt {
                                    instrument_id: iid2.clone(),
                                    quantity,
                                    unit_price,
                                    total: cost,
                                    new_price,
                                    realized_pnl: None,
                                };

                                TxnOutput::with_result(
                                    vec![
                                        WriteOp::set(collections::AGENTS, &aid2, to_doc(&agent)?),
                                        WriteOp::set(
                                            collections::INSTRUMENTS,
                                            &iid2,
                                            to_doc(&instrument)?,
                                        ),
                                        WriteOp::set(
                                            collections::POSITIONS,
                                            &pos_id,
                                            to_doc(&position)?,
                                        ),
                                        WriteOp::set(
                                            collections::TRANSACTIONS,
                                            &txn.id,
                                            to_doc(&txn)?,
                                        ),
                                    ],
                                    &receipt,
                                )
                            }),
                        )
                        .await
                }
            })
            .await?;

        let receipt: TradeReceipt = from_doc(receipt_doc)?;
        info!(
            agent = agent_id,
            instrument = instrument_id,
            qty = receipt.quantity,
            cost = format!("${:.2}", receipt.total),
            new_price = format!("${:.2}", receipt.new_price),
            "buy executed"
        );
        self.store
            .append_log(json!({
                "event": "buy",
                "actor_id": agent_id,
                "instrument_id": instrument_id,
                "quantity": receipt.quantity,
                "amount": -receipt.total,
                "timestamp": now.to_rfc3339(),
            }))
            .await;
        Ok(receipt)
    }

    /// Sell up to `quantity` shares. The quantity is clamped to the
    /// actual holding; proceeds take the fixed spread off the current
    /// price. Never gated by the rate limiter.
    pub async fn sell(
        &self,
        agent_id: &str,
        instrument_id: &str,
        quantity: u32,
    ) -> Result<TradeReceipt, TradeError> {
        if quantity == 0 {
            return Err(TradeError::InvalidQuantity);
        }
        let now = self.clock.now();

        if self.store.get(collections::AGENTS, agent_id).await?.is_none() {
            return Err(TradeError::UnknownAgent);
        }
        if self
            .store
            .get(collections::INSTRUMENTS, instrument_id)
            .await?
            .is_none()
        {
            return Err(TradeError::UnknownInstrument);
        }
        let pos_id = Position::id_for(agent_id, instrument_id);
        match self.store.get(collections::POSITIONS, &pos_id).await? {
            Some(doc) => {
                let pos: Position = from_doc(doc)?;
                if pos.quantity == 0 {
                    return Err(TradeError::NoPosition);
                }
            }
            None => return Err(TradeError::NoPosition),
        }

        let store = Arc::clone(&self.store);
        let key = format!("instrument:{instrument_id}");
        let aid = agent_id.to_string();
        let iid = instrument_id.to_string();
        let max_history = self.market.max_price_history;
        let spread = self.market.sell_spread;

        let receipt_doc = self
            .resolver
            .run(&key, move || {
                let store = Arc::clone(&store);
                let aid = aid.clone();
                let iid = iid.clone();
                async move {
                    let pos_id = Position::id_for(&aid, &iid);
                    let keys = vec![
                        DocKey::new(collections::AGENTS, &aid),
                        DocKey::new(collections::INSTRUMENTS, &iid),
                        DocKey::new(collections::POSITIONS, &pos_id),
                    ];
                    let aid2 = aid.clone();
                    let iid2 = iid.clone();
                    store
                        .transact(
                            &keys,
                            Box::new(move |snap| {
                                let mut agent: Agent = from_doc(
                                    snap.get(collections::AGENTS, &aid2)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::AGENTS, &aid2)
                                        })?,
                                )?;
                                let mut instrument: Instrument = from_doc(
                                    snap.get(collections::INSTRUMENTS, &iid2)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::INSTRUMENTS, &iid2)
                                        })?,
                                )?;
                                let mut position: Position = match snap
                                    .get(collections::POSITIONS, &pos_id)
                                {
                                    Some(doc) => from_doc(doc.clone())?,
                                    None => {
                                        return Err(StoreError::Aborted(
                                            "no holdings of this opinion to sell".into(),
                                        ))
                                    }
                                };
                                if position.quantity == 0 {
                                    return Err(StoreError::Aborted(
                                        "no holdings of this opinion to sell".into(),
                                    ));
                                }

                                // Clamp: never sell more than is held.
                                let sell_qty = quantity.min(position.quantity);
                                let unit_price =
                                    price::round2(instrument.price * (1.0 - spread));
                                let proceeds = price::round2(unit_price * sell_qty as f64);
                                let realized =
                                    price::round2(proceeds - position.avg_cost * sell_qty as f64);

                                instrument.sales += sell_qty as u64;
                                let new_price = price::price(
                                    instrument.purchases,
                                    instrument.sales,
                                    instrument.base_price,
                                );
                                instrument.record_price(new_price, now, max_history);

                                agent.balance = price::round2(agent.balance + proceeds);
                                agent.realize(realized);
                                agent.last_active = now;

                                let txn = Transaction::new(
                                    TransactionKind::Sell,
                                    aid2.clone(),
                                    Some(iid2.clone()),
                                    sell_qty,
                                    proceeds,
                                    unit_price,
                                    now,
                                );

                                let mut writes = vec![
                                    WriteOp::set(collections::AGENTS, &aid2, to_doc(&agent)?),
                                    WriteOp::set(
                                        collections::INSTRUMENTS,
                                        &iid2,
                                        to_doc(&instrument)?,
                                    ),
                                    WriteOp::set(collections::TRANSACTIONS, &txn.id, to_doc(&txn)?),
                                ];

                                position.quantity -= sell_qty;
                                if position.quantity == 0 {
                                    writes.push(WriteOp::delete(collections::POSITIONS, &pos_id));
                                } else {
                                    position.total_cost = price::round2(
                                        position.avg_cost * position.quantity as f64,
                                    );
                                    position.updated_at = now;
                                    writes.push(WriteOp::set(
                                        collections::POSITIONS,
                                        &pos_id,
                                        to_doc(&position)?,
                                    ));
                                }

                                let receipt = TradeReceipt {
                                    instrument_id: iid2.clone(),
                                    quantity: sell_qty,
                                    unit_price,
                                    total: proceeds,
                                    new_price,
                                    realized_pnl: Some(realized),
                                };
                                TxnOutput::with_result(writes, &receipt)
                            }),
                        )
                        .await
                }
            })
            .await?;

        let receipt: TradeReceipt = from_doc(receipt_doc)?;
        debug!(
            agent = agent_id,
            instrument = instrument_id,
            qty = receipt.quantity,
            proceeds = format!("${:.2}", receipt.total),
            pnl = format!("${:+.2}", receipt.realized_pnl.unwrap_or(0.0)),
            "sell executed"
        );
        self.store
            .append_log(json!({
                "event": "sell",
                "actor_id": agent_id,
                "instrument_id": instrument_id,
                "quantity": receipt.quantity,
                "amount": receipt.total,
                "timestamp": now.to_rfc3339(),
            }))
            .await;
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

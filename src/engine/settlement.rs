//! Short positions and portfolio bets, from opening through settlement.
//!
//! Stakes are debited at open. A sweep evaluates every active record:
//! shorts win as soon as a sweep observes the target price before the
//! deadline and expire once the deadline passes; portfolio bets are
//! only evaluated at window end. Terminal states are written inside a
//! transaction that re-reads the record, so a record settles exactly
//! once no matter how many sweeps race.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{portfolio_value, TradeError};
use crate::clock::Clock;
use crate::market::{price, risk};
use crate::store::{
    collections, from_doc, to_doc, ConflictResolver, DocKey, DocumentStore, QueryFilter,
    StoreError, TxnOutput, WriteOp,
};
use crate::types::{
    Agent, BetDirection, Instrument, PortfolioBet, Position, SettlementStatus, ShortPosition,
    Transaction, TransactionKind,
};

const MIN_WINDOW_HOURS: f64 = 1.0;
const MAX_WINDOW_HOURS: f64 = 168.0;
const MAX_DROP_PCT: f64 = 99.0;

/// Outcome counts of one settlement sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub shorts_won: usize,
    pub shorts_expired: usize,
    pub bets_won: usize,
    pub bets_lost: usize,
    pub bets_expired: usize,
}

impl SweepReport {
    pub fn settled(&self) -> usize {
        self.shorts_won + self.shorts_expired + self.bets_won + self.bets_lost + self.bets_expired
    }
}

pub struct PositionSettlement {
    store: Arc<dyn DocumentStore>,
    resolver: Arc<ConflictResolver>,
    clock: Arc<dyn Clock>,
}

impl PositionSettlement {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resolver: Arc<ConflictResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
        }
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Stake on an instrument's price dropping by `target_drop_pct`
    /// within `window_hours`. The stake leaves the balance immediately.
    pub async fn open_short(
        &self,
        agent_id: &str,
        instrument_id: &str,
        stake: f64,
        target_drop_pct: f64,
        window_hours: f64,
    ) -> Result<ShortPosition, TradeError> {
        if !(target_drop_pct > 0.0 && target_drop_pct <= MAX_DROP_PCT) {
            return Err(TradeError::InvalidPercent {
                min: 0.0,
                max: MAX_DROP_PCT,
            });
        }
        if !(MIN_WINDOW_HOURS..=MAX_WINDOW_HOURS).contains(&window_hours) {
            return Err(TradeError::InvalidWindow {
                min_hours: MIN_WINDOW_HOURS as i64,
                max_hours: MAX_WINDOW_HOURS as i64,
            });
        }
        let now = self.clock.now();

        let agent: Agent = match self.store.get(collections::AGENTS, agent_id).await? {
            Some(doc) => from_doc(doc)?,
            None => return Err(TradeError::UnknownAgent),
        };
        if stake <= 0.0 || stake > agent.balance {
            return Err(TradeError::InsufficientBalance {
                needed: stake,
                available: agent.balance,
            });
        }
        if self
            .store
            .get(collections::INSTRUMENTS, instrument_id)
            .await?
            .is_none()
        {
            return Err(TradeError::UnknownInstrument);
        }
        // Shorting an opinion the agent also holds long hedges the
        // price move in both directions, so it is rejected outright.
        let pos_id = Position::id_for(agent_id, instrument_id);
        if let Some(doc) = self.store.get(collections::POSITIONS, &pos_id).await? {
            let pos: Position = from_doc(doc)?;
            if pos.quantity > 0 {
                return Err(TradeError::AlreadyHoldingLong);
            }
        }

        let short_id = Uuid::new_v4().to_string();
        let store = Arc::clone(&self.store);
        let aid = agent_id.to_string();
        let iid = instrument_id.to_string();
        let sid = short_id.clone();
        let key = format!("agent:{agent_id}");

        let short_doc = self
            .resolver
            .run(&key, move || {
                let store = Arc::clone(&store);
                let aid = aid.clone();
                let iid = iid.clone();
                let sid = sid.clone();
                async move {
                    let keys = vec![
                        DocKey::new(collections::AGENTS, &aid),
                        DocKey::new(collections::INSTRUMENTS, &iid),
                    ];
                    store
                        .transact(
                            &keys,
                            Box::new(move |snap| {
                                let mut agent: Agent = from_doc(
                                    snap.get(collections::AGENTS, &aid)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::AGENTS, &aid)
                                        })?,
                                )?;
                                let instrument: Instrument = from_doc(
                                    snap.get(collections::INSTRUMENTS, &iid)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::INSTRUMENTS, &iid)
                                        })?,
                                )?;
                                if stake > agent.balance {
                                    return Err(StoreError::Aborted(format!(
                                        "insufficient balance: need ${stake:.2}, have ${:.2}",
                                        agent.balance
                                    )));
                                }

                                let start_price = instrument.price;
                                let target_price =
                                    price::round2(start_price * (1.0 - target_drop_pct / 100.0));
                                let multiplier = risk::multiplier(target_drop_pct, window_hours);
                                let short = ShortPosition {
                                    id: sid.clone(),
                                    owner_id: aid.clone(),
                                    instrument_id: iid.clone(),
                                    stake,
                                    start_price,
                                    target_price,
                                    target_drop_pct,
                                    multiplier,
                                    potential_payout: risk::payout(
                                        stake,
                                        target_drop_pct,
                                        window_hours,
                                    ),
                                    status: SettlementStatus::Active,
                                    created_at: now,
                                    expires_at: now
                                        + chrono::Duration::seconds(
                                            (window_hours * 3600.0) as i64,
                                        ),
                                    settled_at: None,
                                };

                                agent.balance = price::round2(agent.balance - stake);
                                agent.last_active = now;

                                let txn = Transaction::new(
                                    TransactionKind::ShortOpen,
                                    aid.clone(),
                                    Some(iid.clone()),
                                    0,
                                    -stake,
                                    start_price,
                                    now,
                                );

                                TxnOutput::with_result(
                                    vec![
                                        WriteOp::set(collections::AGENTS, &aid, to_doc(&agent)?),
                                        WriteOp::set(collections::SHORTS, &sid, to_doc(&short)?),
                                        WriteOp::set(
                                            collections::TRANSACTIONS,
                                            &txn.id,
                                            to_doc(&txn)?,
                                        ),
                                    ],
                                    &short,
                                )
                            }),
                        )
                        .await
                }
            })
            .await?;

        let short: ShortPosition = from_doc(short_doc)?;
        info!(
            agent = agent_id,
            instrument = instrument_id,
            stake = format!("${stake:.2}"),
            target = format!("${:.2}", short.target_price),
            multiplier = short.multiplier,
            "short opened"
        );
        self.store
            .append_log(json!({
                "event": "short_open",
                "actor_id": agent_id,
                "instrument_id": instrument_id,
                "amount": -stake,
                "timestamp": now.to_rfc3339(),
            }))
            .await;
        Ok(short)
    }

    /// Stake on another participant's holdings value moving by
    /// `target_pct` in `direction` within `window_hours`.
    pub async fn open_bet(
        &self,
        bettor_id: &str,
        target_id: &str,
        direction: BetDirection,
        target_pct: f64,
        window_hours: f64,
        stake: f64,
    ) -> Result<PortfolioBet, TradeError> {
        if bettor_id == target_id {
            return Err(TradeError::SelfBet);
        }
        if !(target_pct > 0.0 && target_pct <= MAX_DROP_PCT) {
            return Err(TradeError::InvalidPercent {
                min: 0.0,
                max: MAX_DROP_PCT,
            });
        }
        if !(MIN_WINDOW_HOURS..=MAX_WINDOW_HOURS).contains(&window_hours) {
            return Err(TradeError::InvalidWindow {
                min_hours: MIN_WINDOW_HOURS as i64,
                max_hours: MAX_WINDOW_HOURS as i64,
            });
        }
        let now = self.clock.now();

        let bettor: Agent = match self.store.get(collections::AGENTS, bettor_id).await? {
            Some(doc) => from_doc(doc)?,
            None => return Err(TradeError::UnknownAgent),
        };
        if stake <= 0.0 || stake > bettor.balance {
            return Err(TradeError::InsufficientBalance {
                needed: stake,
                available: bettor.balance,
            });
        }
        if self.store.get(collections::AGENTS, target_id).await?.is_none() {
            return Err(TradeError::UnknownAgent);
        }

        // Frozen at placement; settlement compares against this value.
        let initial_value = portfolio_value(self.store.as_ref(), target_id).await?;

        let bet_id = Uuid::new_v4().to_string();
        let store = Arc::clone(&self.store);
        let bid = bettor_id.to_string();
        let tid = target_id.to_string();
        let bet_key = bet_id.clone();
        let key = format!("agent:{bettor_id}");

        let bet_doc = self
            .resolver
            .run(&key, move || {
                let store = Arc::clone(&store);
                let bid = bid.clone();
                let tid = tid.clone();
                let bet_key = bet_key.clone();
                async move {
                    let keys = vec![DocKey::new(collections::AGENTS, &bid)];
                    store
                        .transact(
                            &keys,
                            Box::new(move |snap| {
                                let mut bettor: Agent = from_doc(
                                    snap.get(collections::AGENTS, &bid)
                                        .cloned()
                                        .ok_or_else(|| {
                                            StoreError::not_found(collections::AGENTS, &bid)
                                        })?,
                                )?;
                                if stake > bettor.balance {
                                    return Err(StoreError::Aborted(format!(
                                        "insufficient balance: need ${stake:.2}, have ${:.2}",
                                        bettor.balance
                                    )));
                                }

                                let multiplier = risk::multiplier(target_pct, window_hours);
                                let bet = PortfolioBet {
                                    id: bet_key.clone(),
                                    bettor_id: bid.clone(),
                                    target_id: tid.clone(),
                                    direction,
                                    target_pct,
                                    window_hours,
                                    stake,
                                    multiplier,
                                    potential_payout: risk::payout(
                                        stake,
                                        target_pct,
                                        window_hours,
                                    ),
                                    initial_value,
                                    status: SettlementStatus::Active,
                                    created_at: now,
                                    expires_at: now
                                        + chrono::Duration::seconds(
                                            (window_hours * 3600.0) as i64,
                                        ),
                                    settled_at: None,
                                };

                                bettor.balance = price::round2(bettor.balance - stake);
                                bettor.last_active = now;

                                let txn = Transaction::new(
                                    TransactionKind::BetOpen,
                                    bid.clone(),
                                    None,
                                    0,
                                    -stake,
                                    0.0,
                                    now,
                                );

                                TxnOutput::with_result(
                                    vec![
                                        WriteOp::set(collections::AGENTS, &bid, to_doc(&bettor)?),
                                        WriteOp::set(collections::BETS, &bet_key, to_doc(&bet)?),
                                        WriteOp::set(
                                            collections::TRANSACTIONS,
                                            &txn.id,
                                            to_doc(&txn)?,
                                        ),
                                    ],
                                    &bet,
                                )
                            }),
                        )
                        .await
                }
            })
            .await?;

        let bet: PortfolioBet = from_doc(bet_doc)?;
        info!(
            bettor = bettor_id,
            target = target_id,
            direction = %bet.direction,
            pct = target_pct,
            stake = format!("${stake:.2}"),
            "portfolio bet opened"
        );
        self.store
            .append_log(json!({
                "event": "bet_open",
                "actor_id": bettor_id,
                "target_id": target_id,
                "amount": -stake,
                "timestamp": now.to_rfc3339(),
            }))
            .await;
        Ok(bet)
    }

    // -----------------------------------------------------------------------
    // Sweeping
    // -----------------------------------------------------------------------

    /// Evaluate every active short and bet. Individual failures are
    /// logged and skipped so one bad record never stalls the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        let active = QueryFilter::default().field_eq("status", json!("active"));
        let shorts = self
            .store
            .query(collections::SHORTS, &active, None, None)
            .await?;
        for doc in shorts {
            let short: ShortPosition = match from_doc(doc) {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "skipping malformed short record");
                    continue;
                }
            };
            match self.settle_short(&short, now).await {
                Ok(Some(SettlementStatus::Won)) => report.shorts_won += 1,
                Ok(Some(SettlementStatus::Expired)) => report.shorts_expired += 1,
                Ok(_) => {}
                Err(err) => warn!(short = %short.id, error = %err, "short settlement failed"),
            }
        }

        let bets = self
            .store
            .query(collections::BETS, &active, None, None)
            .await?;
        for doc in bets {
            let bet: PortfolioBet = match from_doc(doc) {
                Ok(b) => b,
                Err(err) => {
                    warn!(error = %err, "skipping malformed bet record");
                    continue;
                }
            };
            match self.settle_bet(&bet, now).await {
                Ok(Some(SettlementStatus::Won)) => report.bets_won += 1,
                Ok(Some(SettlementStatus::Lost)) => report.bets_lost += 1,
                Ok(Some(SettlementStatus::Expired)) => report.bets_expired += 1,
                Ok(_) => {}
                Err(err) => warn!(bet = %bet.id, error = %err, "bet settlement failed"),
            }
        }

        if report.settled() > 0 {
            info!(
                shorts_won = report.shorts_won,
                shorts_expired = report.shorts_expired,
                bets_won = report.bets_won,
                bets_lost = report.bets_lost,
                bets_expired = report.bets_expired,
                "settlement sweep"
            );
        }
        Ok(report)
    }

    /// Decide one short's fate at `now`. Returns the terminal status it
    /// moved to, or `None` if it stays active.
    async fn settle_short(
        &self,
        short: &ShortPosition,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<SettlementStatus>, StoreError> {
        let instrument = match self
            .store
            .get(collections::INSTRUMENTS, &short.instrument_id)
            .await?
        {
            Some(doc) => Some(from_doc::<Instrument>(doc)?),
            None => None,
        };

        let outcome = match &instrument {
            Some(inst) if inst.price <= short.target_price && now < short.expires_at => {
                SettlementStatus::Won
            }
            _ if now >= short.expires_at => SettlementStatus::Expired,
            _ => return Ok(None),
        };

        let payout = if outcome == SettlementStatus::Won {
            short.potential_payout
        } else {
            0.0
        };
        let settled = self
            .finalize(
                collections::SHORTS,
                &short.id,
                &short.owner_id,
                outcome,
                payout,
                Some(short.instrument_id.clone()),
                now,
            )
            .await?;
        Ok(settled.then_some(outcome))
    }

    /// Decide one bet's fate at `now`. Bets only resolve at window end.
    async fn settle_bet(
        &self,
        bet: &PortfolioBet,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<SettlementStatus>, StoreError> {
        if now < bet.expires_at {
            return Ok(None);
        }

        let outcome = if self
            .store
            .get(collections::AGENTS, &bet.target_id)
            .await?
            .is_none()
        {
            SettlementStatus::Expired
        } else {
            let current = portfolio_value(self.store.as_ref(), &bet.target_id).await?;
            let change_pct = if bet.initial_value.abs() < f64::EPSILON {
                // Nothing held at placement: any holdings now count as
                // an unbounded increase, none as no movement.
                if current > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            } else {
                (current - bet.initial_value) / bet.initial_value * 100.0
            };
            let hit = match bet.direction {
                BetDirection::Increase => change_pct >= bet.target_pct,
                BetDirection::Decrease => -change_pct >= bet.target_pct,
            };
            if hit {
                SettlementStatus::Won
            } else {
                SettlementStatus::Lost
            }
        };

        let payout = if outcome == SettlementStatus::Won {
            bet.potential_payout
        } else {
            0.0
        };
        let settled = self
            .finalize(collections::BETS, &bet.id, &bet.bettor_id, outcome, payout, None, now)
            .await?;
        Ok(settled.then_some(outcome))
    }

    /// Move a record to a terminal status and credit any payout, in one
    /// transaction. Returns false if another sweep settled it first.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        collection: &'static str,
        record_id: &str,
        beneficiary_id: &str,
        outcome: SettlementStatus,
        payout: f64,
        instrument_id: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, StoreError> {
        let store = Arc::clone(&self.store);
        let rid = record_id.to_string();
        let owner = beneficiary_id.to_string();
        let key = format!("settle:{record_id}");

        let result = self
            .resolver
            .run(&key, move || {
                let store = Arc::clone(&store);
                let rid = rid.clone();
                let owner = owner.clone();
                let instrument_id = instrument_id.clone();
                async move {
                    let keys = vec![
                        DocKey::new(collection, &rid),
                        DocKey::new(collections::AGENTS, &owner),
                    ];
                    store
                        .transact(
                            &keys,
                            Box::new(move |snap| {
                                let mut record = snap
                                    .get(collection, &rid)
                                    .cloned()
                                    .ok_or_else(|| StoreError::not_found(collection, &rid))?;
                                let status = record
                                    .get("status")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                if status != "active" {
                                    // Lost the race; keep the existing outcome.
                                    return TxnOutput::with_result(Vec::new(), &false);
                                }

                                if let Some(obj) = record.as_object_mut() {
                                    obj.insert("status".into(), to_doc(&outcome)?);
                                    obj.insert("settled_at".into(), json!(now.to_rfc3339()));
                                }
                                let mut writes =
                                    vec![WriteOp::set(collection, &rid, record)];

                                if payout > 0.0 {
                                    let mut agent: Agent = from_doc(
                                        snap.get(collections::AGENTS, &owner)
                                            .cloned()
                                            .ok_or_else(|| {
                                                StoreError::not_found(collections::AGENTS, &owner)
                                            })?,
                                    )?;
                                    agent.balance = price::round2(agent.balance + payout);
                                    agent.realize(payout);
                                    writes.push(WriteOp::set(
                                        collections::AGENTS,
                                        &owner,
                                        to_doc(&agent)?,
                                    ));
                                    let txn = Transaction::new(
                                        TransactionKind::Settlement,
                                        owner.clone(),
                                        instrument_id.clone(),
                                        0,
                                        payout,
                                        0.0,
                                        now,
                                    );
                                    writes.push(WriteOp::set(
                                        collections::TRANSACTIONS,
                                        &txn.id,
                                        to_doc(&txn)?,
                                    ));
                                }
                                TxnOutput::with_result(writes, &true)
                            }),
                        )
                        .await
                }
            })
            .await?;

        let settled: bool = from_doc(result)?;
        if settled {
            self.store
                .append_log(json!({
                    "event": "settlement",
                    "record_id": record_id,
                    "actor_id": beneficiary_id,
                    "outcome": outcome.to_string(),
                    "amount": payout,
                    "timestamp": now.to_rfc3339(),
                }))
                .await;
        }
        Ok(settled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, ResolverConfig};
    use crate::types::RiskProfile;
    use chrono::{Duration, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        settlement: PositionSettlement,
        clock: Arc<ManualClock>,
        instrument_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();

        for (id, name) in [("a1", "Ada"), ("a2", "Bo")] {
            let agent = Agent::new_bot(id, name, 1000.0, RiskProfile::Aggressive, now);
            store
                .set(collections::AGENTS, id, to_doc(&agent).unwrap(), false)
                .await
                .unwrap();
        }
        let instrument = Instrument::new("Remote work is here to stay", 10.0, now);
        let instrument_id = instrument.id.clone();
        store
            .set(
                collections::INSTRUMENTS,
                &instrument_id,
                to_doc(&instrument).unwrap(),
                false,
            )
            .await
            .unwrap();

        let resolver = Arc::new(ConflictResolver::new(ResolverConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter_ms: 0,
            ..Default::default()
        }));
        let settlement = PositionSettlement::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            resolver,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Fixture {
            store,
            settlement,
            clock,
            instrument_id,
        }
    }

    async fn agent(store: &MemoryStore, id: &str) -> Agent {
        from_doc(store.get(collections::AGENTS, id).await.unwrap().unwrap()).unwrap()
    }

    async fn set_price(store: &MemoryStore, instrument_id: &str, new_price: f64) {
        let mut inst: Instrument = from_doc(
            store
                .get(collections::INSTRUMENTS, instrument_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        inst.price = new_price;
        store
            .set(collections::INSTRUMENTS, instrument_id, to_doc(&inst).unwrap(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_short_debits_stake_and_prices_target() {
        let fx = fixture().await;
        let short = fx
            .settlement
            .open_short("a1", &fx.instrument_id, 100.0, 20.0, 24.0)
            .await
            .unwrap();

        assert_eq!(short.start_price, 10.0);
        assert_eq!(short.target_price, 8.0);
        assert_eq!(short.status, SettlementStatus::Active);
        // 1.0 + 20/20 + (168-24)/168 = 2.857...
        assert!((short.multiplier - (2.0 + 144.0 / 168.0)).abs() < 1e-9);

        let a = agent(&fx.store, "a1").await;
        assert_eq!(a.balance, 900.0);
        assert_eq!(fx.store.count(collections::TRANSACTIONS).await, 1);
    }

    #[tokio::test]
    async fn test_open_short_validations() {
        let fx = fixture().await;
        let s = &fx.settlement;
        let iid = &fx.instrument_id;

        assert!(matches!(
            s.open_short("a1", iid, 100.0, 0.0, 24.0).await.unwrap_err(),
            TradeError::InvalidPercent { .. }
        ));
        assert!(matches!(
            s.open_short("a1", iid, 100.0, 120.0, 24.0).await.unwrap_err(),
            TradeError::InvalidPercent { .. }
        ));
        assert!(matches!(
            s.open_short("a1", iid, 100.0, 20.0, 0.5).await.unwrap_err(),
            TradeError::InvalidWindow { .. }
        ));
        assert!(matches!(
            s.open_short("a1", iid, 100.0, 20.0, 200.0).await.unwrap_err(),
            TradeError::InvalidWindow { .. }
        ));
        assert!(matches!(
            s.open_short("a1", iid, 5000.0, 20.0, 24.0).await.unwrap_err(),
            TradeError::InsufficientBalance { .. }
        ));
        assert!(matches!(
            s.open_short("ghost", iid, 100.0, 20.0, 24.0).await.unwrap_err(),
            TradeError::UnknownAgent
        ));
    }

    #[tokio::test]
    async fn test_open_short_rejected_while_holding_long() {
        let fx = fixture().await;
        let pos = Position::open("a1", fx.instrument_id.clone(), 2, 10.0, fx.clock.now());
        fx.store
            .set(
                collections::POSITIONS,
                &Position::id_for("a1", &fx.instrument_id),
                to_doc(&pos).unwrap(),
                false,
            )
            .await
            .unwrap();

        let err = fx
            .settlement
            .open_short("a1", &fx.instrument_id, 100.0, 20.0, 24.0)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::AlreadyHoldingLong));
    }

    #[tokio::test]
    async fn test_short_wins_when_target_hit_before_deadline() {
        let fx = fixture().await;
        let short = fx
            .settlement
            .open_short("a1", &fx.instrument_id, 100.0, 20.0, 24.0)
            .await
            .unwrap();

        set_price(&fx.store, &fx.instrument_id, 7.9).await;
        fx.clock.advance(Duration::hours(1));
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.shorts_won, 1);

        let settled: ShortPosition =
            from_doc(fx.store.get(collections::SHORTS, &short.id).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(settled.status, SettlementStatus::Won);
        assert!(settled.settled_at.is_some());

        let a = agent(&fx.store, "a1").await;
        assert!((a.balance - (900.0 + short.potential_payout)).abs() < 1e-6);
        assert!((a.total_earnings - short.potential_payout).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_short_expires_after_deadline() {
        let fx = fixture().await;
        let short = fx
            .settlement
            .open_short("a1", &fx.instrument_id, 100.0, 20.0, 2.0)
            .await
            .unwrap();

        // Price never reached the target; deadline passes.
        fx.clock.advance(Duration::hours(3));
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.shorts_expired, 1);

        let settled: ShortPosition =
            from_doc(fx.store.get(collections::SHORTS, &short.id).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(settled.status, SettlementStatus::Expired);

        // Stake forfeited, nothing credited back.
        let a = agent(&fx.store, "a1").await;
        assert_eq!(a.balance, 900.0);
    }

    #[tokio::test]
    async fn test_terminal_short_is_never_resettled() {
        let fx = fixture().await;
        fx.settlement
            .open_short("a1", &fx.instrument_id, 100.0, 20.0, 24.0)
            .await
            .unwrap();

        set_price(&fx.store, &fx.instrument_id, 7.0).await;
        fx.clock.advance(Duration::hours(1));
        assert_eq!(fx.settlement.sweep().await.unwrap().shorts_won, 1);

        // Still below target, still before the deadline; second sweep
        // must not pay out again.
        let balance_after_first = agent(&fx.store, "a1").await.balance;
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.settled(), 0);
        assert_eq!(agent(&fx.store, "a1").await.balance, balance_after_first);
    }

    #[tokio::test]
    async fn test_open_bet_freezes_initial_value() {
        let fx = fixture().await;
        let pos = Position::open("a2", fx.instrument_id.clone(), 3, 10.0, fx.clock.now());
        fx.store
            .set(
                collections::POSITIONS,
                &Position::id_for("a2", &fx.instrument_id),
                to_doc(&pos).unwrap(),
                false,
            )
            .await
            .unwrap();

        let bet = fx
            .settlement
            .open_bet("a1", "a2", BetDirection::Increase, 10.0, 24.0, 50.0)
            .await
            .unwrap();
        assert_eq!(bet.initial_value, 30.0);
        assert_eq!(agent(&fx.store, "a1").await.balance, 950.0);
    }

    #[tokio::test]
    async fn test_bet_validations() {
        let fx = fixture().await;
        let s = &fx.settlement;
        assert!(matches!(
            s.open_bet("a1", "a1", BetDirection::Increase, 10.0, 24.0, 50.0)
                .await
                .unwrap_err(),
            TradeError::SelfBet
        ));
        assert!(matches!(
            s.open_bet("a1", "ghost", BetDirection::Increase, 10.0, 24.0, 50.0)
                .await
                .unwrap_err(),
            TradeError::UnknownAgent
        ));
    }

    #[tokio::test]
    async fn test_bet_settles_only_at_window_end() {
        let fx = fixture().await;
        let pos = Position::open("a2", fx.instrument_id.clone(), 3, 10.0, fx.clock.now());
        fx.store
            .set(
                collections::POSITIONS,
                &Position::id_for("a2", &fx.instrument_id),
                to_doc(&pos).unwrap(),
                false,
            )
            .await
            .unwrap();
        let bet = fx
            .settlement
            .open_bet("a1", "a2", BetDirection::Increase, 10.0, 24.0, 50.0)
            .await
            .unwrap();

        // Holdings are already up 20%, but the window is still open.
        set_price(&fx.store, &fx.instrument_id, 12.0).await;
        fx.clock.advance(Duration::hours(1));
        assert_eq!(fx.settlement.sweep().await.unwrap().settled(), 0);

        fx.clock.advance(Duration::hours(24));
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.bets_won, 1);

        let settled: PortfolioBet =
            from_doc(fx.store.get(collections::BETS, &bet.id).await.unwrap().unwrap()).unwrap();
        assert_eq!(settled.status, SettlementStatus::Won);
        let balance = agent(&fx.store, "a1").await.balance;
        assert!((balance - (950.0 + bet.potential_payout)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_bet_loses_when_move_misses_target() {
        let fx = fixture().await;
        let pos = Position::open("a2", fx.instrument_id.clone(), 3, 10.0, fx.clock.now());
        fx.store
            .set(
                collections::POSITIONS,
                &Position::id_for("a2", &fx.instrument_id),
                to_doc(&pos).unwrap(),
                false,
            )
            .await
            .unwrap();
        fx.settlement
            .open_bet("a1", "a2", BetDirection::Decrease, 50.0, 2.0, 50.0)
            .await
            .unwrap();

        // Holdings dropped 10%, target was 50%.
        set_price(&fx.store, &fx.instrument_id, 9.0).await;
        fx.clock.advance(Duration::hours(3));
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.bets_lost, 1);
        assert_eq!(agent(&fx.store, "a1").await.balance, 950.0);
    }

    #[tokio::test]
    async fn test_bet_expires_when_target_participant_vanishes() {
        let fx = fixture().await;
        fx.settlement
            .open_bet("a1", "a2", BetDirection::Increase, 10.0, 2.0, 50.0)
            .await
            .unwrap();

        // Simulate the target participant being removed mid-window.
        fx.store
            .batch_write(vec![WriteOp::delete(collections::AGENTS, "a2")])
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(3));
        let report = fx.settlement.sweep().await.unwrap();
        assert_eq!(report.bets_expired, 1);
    }
}

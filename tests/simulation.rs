//! End-to-end market flow on an in-memory store with a manual clock.

use std::sync::Arc;

use chrono::{Duration, Utc};

use agora::clock::{Clock, ManualClock};
use agora::config::MarketConfig;
use agora::engine::ledger::PortfolioLedger;
use agora::engine::settlement::PositionSettlement;
use agora::engine::{portfolio_value, TradeError};
use agora::store::{
    collections, from_doc, to_doc, ConflictResolver, DocumentStore, MemoryStore, QueryFilter,
    ResolverConfig,
};
use agora::types::{
    Agent, BetDirection, Instrument, Position, RiskProfile, SettlementStatus, ShortPosition,
};

struct Market {
    store: Arc<dyn DocumentStore>,
    clock: Arc<ManualClock>,
    ledger: PortfolioLedger,
    settlement: PositionSettlement,
    instrument_id: String,
}

async fn market(agents: &[&str]) -> Market {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let now = clock.now();

    for id in agents {
        let agent = Agent::new_bot(*id, *id, 1000.0, RiskProfile::Moderate, now);
        store
            .set(
                collections::AGENTS,
                id,
                to_doc(&agent).unwrap(),
                false,
            )
            .await
            .unwrap();
    }
    let instrument = Instrument::new("Pineapple belongs on pizza", 10.0, now);
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
    let ledger = PortfolioLedger::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::clone(&clock) as Arc<dyn Clock>,
        MarketConfig::default(),
    );
    let settlement = PositionSettlement::new(
        Arc::clone(&store),
        resolver,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Market {
        store,
        clock,
        ledger,
        settlement,
        instrument_id,
    }
}

async fn agent(store: &Arc<dyn DocumentStore>, id: &str) -> Agent {
    from_doc(store.get(collections::AGENTS, id).await.unwrap().unwrap()).unwrap()
}

async fn instrument(store: &Arc<dyn DocumentStore>, id: &str) -> Instrument {
    from_doc(store.get(collections::INSTRUMENTS, id).await.unwrap().unwrap()).unwrap()
}

#[tokio::test]
async fn test_buy_until_limited_then_liquidate() {
    let m = market(&["trader"]).await;

    // Four buys at a climbing price: 10.00, 10.01, 10.02, 10.03.
    let mut total_cost = 0.0;
    for expected in [10.00, 10.01, 10.02, 10.03] {
        let receipt = m.ledger.buy("trader", &m.instrument_id, 1).await.unwrap();
        assert!((receipt.unit_price - expected).abs() < 1e-9);
        total_cost += receipt.total;
    }
    assert!((total_cost - 40.06).abs() < 1e-9);

    let t = agent(&m.store, "trader").await;
    assert!((t.balance - 959.94).abs() < 1e-9);

    let inst = instrument(&m.store, &m.instrument_id).await;
    assert_eq!(inst.purchases, 4);
    assert!((inst.price - 10.04).abs() < 1e-9);

    // The fifth buy inside the window hits the limiter.
    let err = m.ledger.buy("trader", &m.instrument_id, 1).await.unwrap_err();
    assert!(matches!(err, TradeError::RateLimited { .. }));

    // Selling everything applies the spread and realizes the loss.
    let receipt = m.ledger.sell("trader", &m.instrument_id, 4).await.unwrap();
    assert!((receipt.unit_price - 9.54).abs() < 1e-9);
    assert!((receipt.total - 38.16).abs() < 1e-9);
    assert!((receipt.realized_pnl.unwrap() - (-1.90)).abs() < 1e-9);

    let t = agent(&m.store, "trader").await;
    assert!((t.balance - 998.10).abs() < 1e-9);
    assert!((t.total_losses - 1.90).abs() < 1e-9);

    // Counters balance out, price returns to base, position is gone.
    let inst = instrument(&m.store, &m.instrument_id).await;
    assert_eq!(inst.sales, 4);
    assert!((inst.price - 10.00).abs() < 1e-9);
    let pos_id = Position::id_for("trader", &m.instrument_id);
    assert!(m
        .store
        .get(collections::POSITIONS, &pos_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_limiter_window_slides_and_survives_restart() {
    let m = market(&["trader"]).await;
    for _ in 0..4 {
        m.ledger.buy("trader", &m.instrument_id, 1).await.unwrap();
    }

    // A fresh ledger over the same store still sees the window, since
    // the limiter counts persisted transactions.
    let resolver = Arc::new(ConflictResolver::new(ResolverConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 4,
        jitter_ms: 0,
        ..Default::default()
    }));
    let rebooted = PortfolioLedger::new(
        Arc::clone(&m.store),
        resolver,
        Arc::clone(&m.clock) as Arc<dyn Clock>,
        MarketConfig::default(),
    );
    let err = rebooted.buy("trader", &m.instrument_id, 1).await.unwrap_err();
    assert!(matches!(err, TradeError::RateLimited { .. }));

    // The oldest buy ages out after the window elapses.
    m.clock.advance(Duration::minutes(11));
    rebooted.buy("trader", &m.instrument_id, 1).await.unwrap();
}

#[tokio::test]
async fn test_short_expires_and_forfeits_stake() {
    let m = market(&["pessimist"]).await;

    let short = m
        .settlement
        .open_short("pessimist", &m.instrument_id, 200.0, 25.0, 2.0)
        .await
        .unwrap();
    assert!((agent(&m.store, "pessimist").await.balance - 800.0).abs() < 1e-9);

    // Price never moves; the deadline passes.
    m.clock.advance(Duration::hours(3));
    let report = m.settlement.sweep().await.unwrap();
    assert_eq!(report.shorts_expired, 1);

    let settled: ShortPosition = from_doc(
        m.store
            .get(collections::SHORTS, &short.id)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(settled.status, SettlementStatus::Expired);
    assert!((agent(&m.store, "pessimist").await.balance - 800.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_portfolio_bet_pays_out_after_liquidation() {
    let m = market(&["holder", "bettor"]).await;

    // The holder builds a position worth about forty dollars.
    for _ in 0..4 {
        m.ledger.buy("holder", &m.instrument_id, 1).await.unwrap();
    }
    let initial = portfolio_value(m.store.as_ref(), "holder").await.unwrap();
    assert!(initial > 40.0);

    let bet = m
        .settlement
        .open_bet(
            "bettor",
            "holder",
            BetDirection::Decrease,
            50.0,
            2.0,
            100.0,
        )
        .await
        .unwrap();
    assert!((bet.initial_value - initial).abs() < 1e-9);
    assert!((agent(&m.store, "bettor").await.balance - 900.0).abs() < 1e-9);

    // Nothing settles while the window is open.
    m.clock.advance(Duration::minutes(30));
    assert_eq!(m.settlement.sweep().await.unwrap().settled(), 0);

    // The holder liquidates; their holdings value drops to zero.
    m.ledger.sell("holder", &m.instrument_id, 4).await.unwrap();

    m.clock.advance(Duration::hours(2));
    let report = m.settlement.sweep().await.unwrap();
    assert_eq!(report.bets_won, 1);

    let b = agent(&m.store, "bettor").await;
    assert!((b.balance - (900.0 + bet.potential_payout)).abs() < 1e-6);
    assert!((b.total_earnings - bet.potential_payout).abs() < 1e-6);

    // A second sweep finds nothing left to settle.
    assert_eq!(m.settlement.sweep().await.unwrap().settled(), 0);
}

#[tokio::test]
async fn test_transaction_feed_records_every_event() {
    let m = market(&["trader"]).await;
    m.ledger.buy("trader", &m.instrument_id, 2).await.unwrap();
    // Liquidate fully: a remaining long holding would block the short.
    m.ledger.sell("trader", &m.instrument_id, 2).await.unwrap();
    m.settlement
        .open_short("trader", &m.instrument_id, 50.0, 20.0, 2.0)
        .await
        .unwrap();
    m.clock.advance(Duration::hours(3));
    m.settlement.sweep().await.unwrap();

    // buy + sell + short_open; the expiry pays nothing so it appends no
    // balance-affecting transaction.
    let txns = m
        .store
        .query(
            collections::TRANSACTIONS,
            &QueryFilter::default(),
            Some("timestamp"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(txns.len(), 3);
}

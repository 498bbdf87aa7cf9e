//! Per-agent activity timers.
//!
//! Every bot gets its own tokio task that sleeps a uniformly-random
//! interval, rolls an activity gate weighted by its risk profile, and
//! then draws one action from the profile's weight table. Handler
//! failures are logged and the timer carries on; a bot that hits the
//! rate limiter or runs out of balance simply skips the tick. One
//! extra low-frequency task runs the settlement sweep.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ledger::PortfolioLedger;
use super::settlement::PositionSettlement;
use super::TradeError;
use crate::config::SchedulerConfig;
use crate::market::price;
use crate::store::{collections, from_doc, DocumentStore, QueryFilter, StoreError};
use crate::types::{Agent, BetDirection, Instrument, Position};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

// ---------------------------------------------------------------------------
// Tick planning
// ---------------------------------------------------------------------------

/// What one tick decided to do. Drawn up front with plain data so the
/// random generator never crosses an await point.
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Idle,
    Buy {
        instrument_id: String,
        quantity: u32,
    },
    Sell {
        instrument_id: String,
        quantity: u32,
    },
    Short {
        instrument_id: String,
        stake: f64,
        drop_pct: f64,
        window_hours: f64,
    },
    Bet {
        target_id: String,
        direction: BetDirection,
        target_pct: f64,
        window_hours: f64,
        stake: f64,
    },
}

/// Draw one action for `agent` given what it can currently see.
fn plan_tick<R: Rng>(
    rng: &mut R,
    agent: &Agent,
    instruments: &[Instrument],
    holdings: &[Position],
    peers: &[String],
    damping: f64,
) -> Plan {
    let p = (agent.risk_profile.activity_probability() * damping).clamp(0.0, 1.0);
    if !rng.gen_bool(p) {
        return Plan::Idle;
    }
    if instruments.is_empty() {
        return Plan::Idle;
    }

    let weights = agent.risk_profile.action_weights();
    let dist = match WeightedIndex::new(weights) {
        Ok(d) => d,
        Err(_) => return Plan::Idle,
    };

    match dist.sample(rng) {
        // Buy a small lot of a random opinion.
        0 => {
            let inst = &instruments[rng.gen_range(0..instruments.len())];
            Plan::Buy {
                instrument_id: inst.id.clone(),
                quantity: rng.gen_range(1..=3),
            }
        }
        // Sell part of an existing holding, if any.
        1 => match holdings.iter().filter(|p| p.quantity > 0).choose(rng) {
            Some(pos) => Plan::Sell {
                instrument_id: pos.instrument_id.clone(),
                quantity: rng.gen_range(1..=pos.quantity),
            },
            None => Plan::Idle,
        },
        // Short an opinion the agent does not hold.
        2 => {
            let held: Vec<&str> = holdings
                .iter()
                .filter(|p| p.quantity > 0)
                .map(|p| p.instrument_id.as_str())
                .collect();
            let candidates: Vec<&Instrument> = instruments
                .iter()
                .filter(|i| !held.contains(&i.id.as_str()))
                .collect();
            match candidates.as_slice() {
                [] => Plan::Idle,
                cs => {
                    let inst = cs[rng.gen_range(0..cs.len())];
                    let stake =
                        price::round2(agent.balance * rng.gen_range(0.05..=0.15));
                    if stake < 1.0 {
                        return Plan::Idle;
                    }
                    Plan::Short {
                        instrument_id: inst.id.clone(),
                        stake,
                        drop_pct: rng.gen_range(10.0..=50.0_f64).round(),
                        window_hours: rng.gen_range(2..=48) as f64,
                    }
                }
            }
        }
        // Bet on a random peer's holdings.
        _ => match peers.iter().filter(|id| **id != agent.id).choose(rng) {
            Some(target) => {
                let stake = price::round2(agent.balance * rng.gen_range(0.05..=0.15));
                if stake < 1.0 {
                    return Plan::Idle;
                }
                Plan::Bet {
                    target_id: target.clone(),
                    direction: if rng.gen_bool(0.5) {
                        BetDirection::Increase
                    } else {
                        BetDirection::Decrease
                    },
                    target_pct: rng.gen_range(5.0..=30.0_f64).round(),
                    window_hours: rng.gen_range(2..=48) as f64,
                    stake,
                }
            }
            None => Plan::Idle,
        },
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct AgentScheduler {
    store: Arc<dyn DocumentStore>,
    ledger: Arc<PortfolioLedger>,
    settlement: Arc<PositionSettlement>,
    config: SchedulerConfig,
    paused: Arc<AtomicBool>,
    state: StdMutex<SchedulerState>,
    tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    sweep_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AgentScheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ledger: Arc<PortfolioLedger>,
        settlement: Arc<PositionSettlement>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            settlement,
            config,
            paused: Arc::new(AtomicBool::new(false)),
            state: StdMutex::new(SchedulerState::Stopped),
            tasks: StdMutex::new(HashMap::new()),
            sweep_task: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Spawn one timer task per active bot plus the settlement sweep.
    /// Idempotent while running; from paused it resumes instead of
    /// spawning a second set of timers. Returns the number of bots
    /// scheduled.
    pub async fn start(&self) -> Result<usize, StoreError> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                SchedulerState::Running => {
                    return Ok(self.tasks.lock().unwrap().len());
                }
                SchedulerState::Paused => {
                    drop(state);
                    self.resume();
                    return Ok(self.tasks.lock().unwrap().len());
                }
                SchedulerState::Stopped => {}
            }
        }

        let filter = QueryFilter::default()
            .field_eq("active", serde_json::json!(true))
            .field_eq("is_bot", serde_json::json!(true));
        let bots = self
            .store
            .query(collections::AGENTS, &filter, Some("name"), None)
            .await?;

        let mut tasks = self.tasks.lock().unwrap();
        for doc in bots {
            let agent: Agent = from_doc(doc)?;
            let handle = tokio::spawn(agent_loop(
                Arc::clone(&self.store),
                Arc::clone(&self.ledger),
                Arc::clone(&self.settlement),
                agent.id.clone(),
                self.config.clone(),
                Arc::clone(&self.paused),
            ));
            tasks.insert(agent.id, handle);
        }

        let sweep = tokio::spawn(sweep_loop(
            Arc::clone(&self.settlement),
            self.config.settlement_sweep_secs,
            Arc::clone(&self.paused),
        ));
        *self.sweep_task.lock().unwrap() = Some(sweep);

        self.paused.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = SchedulerState::Running;
        info!(bots = tasks.len(), "scheduler started");
        Ok(tasks.len())
    }

    /// Suspend activity. The timer tasks are kept alive and keep
    /// firing; each tick checks the pause flag and skips, so resuming
    /// takes effect on the very next tick instead of respawning tasks.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SchedulerState::Running {
            self.paused.store(true, Ordering::SeqCst);
            *state = SchedulerState::Paused;
            info!("scheduler paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SchedulerState::Paused {
            self.paused.store(false, Ordering::SeqCst);
            *state = SchedulerState::Running;
            info!("scheduler resumed");
        }
    }

    /// Abort every timer task. A handler already past its gate may
    /// still land its trade; only the timers die here.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        if let Some(sweep) = self.sweep_task.lock().unwrap().take() {
            sweep.abort();
        }
        *self.state.lock().unwrap() = SchedulerState::Stopped;
        info!("scheduler stopped");
    }
}

impl Drop for AgentScheduler {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
        if let Ok(mut sweep) = self.sweep_task.lock() {
            if let Some(handle) = sweep.take() {
                handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

async fn agent_loop(
    store: Arc<dyn DocumentStore>,
    ledger: Arc<PortfolioLedger>,
    settlement: Arc<PositionSettlement>,
    agent_id: String,
    config: SchedulerConfig,
    paused: Arc<AtomicBool>,
) {
    loop {
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(config.min_interval_secs..=config.max_interval_secs)
        };
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;

        if paused.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(err) = run_tick(
            store.as_ref(),
            &ledger,
            &settlement,
            &agent_id,
            config.activity_damping,
        )
        .await
        {
            match err {
                // Expected rejections are part of normal operation.
                TradeError::RateLimited { .. }
                | TradeError::InsufficientBalance { .. }
                | TradeError::Rejected(_) => {
                    debug!(agent = %agent_id, reason = %err, "tick skipped")
                }
                other => warn!(agent = %agent_id, error = %other, "tick failed"),
            }
        }
    }
}

async fn sweep_loop(settlement: Arc<PositionSettlement>, interval_secs: u64, paused: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(err) = settlement.sweep().await {
            warn!(error = %err, "settlement sweep failed");
        }
    }
}

/// Gather the agent's current view, draw a plan, execute it.
async fn run_tick(
    store: &dyn DocumentStore,
    ledger: &PortfolioLedger,
    settlement: &PositionSettlement,
    agent_id: &str,
    damping: f64,
) -> Result<(), TradeError> {
    let agent: Agent = match store.get(collections::AGENTS, agent_id).await? {
        Some(doc) => from_doc(doc)?,
        None => return Err(TradeError::UnknownAgent),
    };

    let instruments: Vec<Instrument> = store
        .query(collections::INSTRUMENTS, &QueryFilter::default(), None, None)
        .await?
        .into_iter()
        .filter_map(|d| from_doc(d).ok())
        .collect();

    let holdings_filter = QueryFilter::default().field_eq("owner_id", serde_json::json!(agent_id));
    let holdings: Vec<Position> = store
        .query(collections::POSITIONS, &holdings_filter, None, None)
        .await?
        .into_iter()
        .filter_map(|d| from_doc(d).ok())
        .collect();

    let peer_filter = QueryFilter::default().field_eq("active", serde_json::json!(true));
    let peers: Vec<String> = store
        .query(collections::AGENTS, &peer_filter, None, None)
        .await?
        .into_iter()
        .filter_map(|d| from_doc::<Agent>(d).ok())
        .map(|a| a.id)
        .collect();

    let plan = {
        let mut rng = rand::thread_rng();
        plan_tick(&mut rng, &agent, &instruments, &holdings, &peers, damping)
    };

    match plan {
        Plan::Idle => Ok(()),
        Plan::Buy {
            instrument_id,
            quantity,
        } => ledger.buy(agent_id, &instrument_id, quantity).await.map(|_| ()),
        Plan::Sell {
            instrument_id,
            quantity,
        } => ledger.sell(agent_id, &instrument_id, quantity).await.map(|_| ()),
        Plan::Short {
            instrument_id,
            stake,
            drop_pct,
            window_hours,
        } => settlement
            .open_short(agent_id, &instrument_id, stake, drop_pct, window_hours)
            .await
            .map(|_| ()),
        Plan::Bet {
            target_id,
            direction,
            target_pct,
            window_hours,
            stake,
        } => settlement
            .open_bet(agent_id, &target_id, direction, target_pct, window_hours, stake)
            .await
            .map(|_| ()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

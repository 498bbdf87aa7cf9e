//! Shared types for the AGORA engine.
//!
//! These types form the data model used across all modules. Every struct
//! here round-trips through `serde_json::Value` because that is the unit
//! of storage in the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Risk profile
// ---------------------------------------------------------------------------

/// Behavioural profile of a bot agent. Drives its activity probability
/// and the weighting of its action choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    /// All known profiles (useful for round-robin seeding).
    pub const ALL: &'static [RiskProfile] = &[
        RiskProfile::Conservative,
        RiskProfile::Moderate,
        RiskProfile::Aggressive,
    ];

    /// Probability that a tick results in any action at all,
    /// before global damping is applied.
    pub fn activity_probability(&self) -> f64 {
        match self {
            RiskProfile::Conservative => 0.7,
            RiskProfile::Moderate => 0.8,
            RiskProfile::Aggressive => 0.9,
        }
    }

    /// Relative weights for the {buy, sell, short, bet} action draw.
    /// Aggressive profiles favour leveraged side-bets; conservative
    /// profiles mostly buy and sell.
    pub fn action_weights(&self) -> [u32; 4] {
        match self {
            RiskProfile::Conservative => [45, 35, 12, 8],
            RiskProfile::Moderate => [35, 25, 25, 15],
            RiskProfile::Aggressive => [25, 15, 35, 25],
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskProfile::Conservative => write!(f, "conservative"),
            RiskProfile::Moderate => write!(f, "moderate"),
            RiskProfile::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl std::str::FromStr for RiskProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(RiskProfile::Conservative),
            "moderate" => Ok(RiskProfile::Moderate),
            "aggressive" => Ok(RiskProfile::Aggressive),
            _ => Err(anyhow::anyhow!("Unknown risk profile: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A market participant — bot or human. One canonical record per
/// participant; leaderboards and portfolio views are read-side
/// projections, never a second mirrored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub balance: f64,
    pub risk_profile: RiskProfile,
    /// Per-agent scaling of the activity gate (1.0 = profile default).
    pub activity_frequency: f64,
    /// Deactivated agents keep their record but never tick.
    pub active: bool,
    pub is_bot: bool,
    /// Cumulative realized gains.
    pub total_earnings: f64,
    /// Cumulative realized losses (stored positive).
    pub total_losses: f64,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new_bot(
        id: impl Into<String>,
        name: impl Into<String>,
        balance: f64,
        risk_profile: RiskProfile,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            balance,
            risk_profile,
            activity_frequency: 1.0,
            active: true,
            is_bot: true,
            total_earnings: 0.0,
            total_losses: 0.0,
            last_active: now,
            created_at: now,
        }
    }

    /// Net realized result over the agent's lifetime.
    pub fn net_realized(&self) -> f64 {
        self.total_earnings - self.total_losses
    }

    /// Record a realized gain or loss into the cumulative counters.
    pub fn realize(&mut self, pnl: f64) {
        if pnl >= 0.0 {
            self.total_earnings += pnl;
        } else {
            self.total_losses += -pnl;
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ${:.2} [{}{}]",
            self.name,
            self.risk_profile,
            self.balance,
            if self.is_bot { "bot" } else { "human" },
            if self.active { "" } else { ", inactive" },
        )
    }
}

// ---------------------------------------------------------------------------
// Instrument
// ---------------------------------------------------------------------------

/// One entry in an instrument's bounded price history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A tradable opinion with a demand-driven price.
///
/// `price` is always re-derivable from `(purchases, sales, base_price)`
/// via the price engine, so a crashed writer can recompute it
/// idempotently from the persisted counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Deterministic id derived from the opinion text (uuid v5).
    pub id: String,
    pub text: String,
    /// Cumulative number of shares ever purchased.
    pub purchases: u64,
    /// Cumulative number of shares ever sold.
    pub sales: u64,
    pub price: f64,
    pub base_price: f64,
    pub updated_at: DateTime<Utc>,
    /// Recent price history, oldest entries dropped past the cap.
    pub history: Vec<PricePoint>,
}

impl Instrument {
    /// Deterministic instrument id from opinion text.
    pub fn id_for(text: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, text.as_bytes()).to_string()
    }

    pub fn new(text: impl Into<String>, base_price: f64, now: DateTime<Utc>) -> Self {
        let text = text.into();
        Self {
            id: Self::id_for(&text),
            text,
            purchases: 0,
            sales: 0,
            price: base_price,
            base_price,
            updated_at: now,
            history: vec![PricePoint {
                price: base_price,
                timestamp: now,
            }],
        }
    }

    /// Net demand: purchases minus sales.
    pub fn net_demand(&self) -> i64 {
        self.purchases as i64 - self.sales as i64
    }

    /// Append a history entry, dropping the oldest past `max_history`.
    pub fn record_price(&mut self, price: f64, at: DateTime<Utc>, max_history: usize) {
        self.price = price;
        self.updated_at = at;
        self.history.push(PricePoint {
            price,
            timestamp: at,
        });
        if self.history.len() > max_history {
            let excess = self.history.len() - max_history;
            self.history.drain(..excess);
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" ${:.2} (base ${:.2}, {}↑ {}↓)",
            self.text, self.price, self.base_price, self.purchases, self.sales,
        )
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An open long position: (owner, instrument) with a weighted-average
/// cost basis. Removed from the store when quantity reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub owner_id: String,
    pub instrument_id: String,
    pub quantity: u32,
    pub avg_cost: f64,
    pub total_cost: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Composite, deterministic document id for the (owner, instrument) pair.
    pub fn id_for(owner_id: &str, instrument_id: &str) -> String {
        format!("{owner_id}__{instrument_id}")
    }

    pub fn open(
        owner_id: impl Into<String>,
        instrument_id: impl Into<String>,
        quantity: u32,
        price: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let owner_id = owner_id.into();
        let instrument_id = instrument_id.into();
        let total_cost = price * quantity as f64;
        Self {
            id: Self::id_for(&owner_id, &instrument_id),
            owner_id,
            instrument_id,
            quantity,
            avg_cost: price,
            total_cost,
            updated_at: now,
        }
    }

    /// Fold a new purchase into the weighted-average cost basis.
    pub fn add(&mut self, quantity: u32, price: f64, now: DateTime<Utc>) {
        let old_qty = self.quantity as f64;
        let new_qty = quantity as f64;
        self.avg_cost = (self.avg_cost * old_qty + price * new_qty) / (old_qty + new_qty);
        self.quantity += quantity;
        self.total_cost += price * new_qty;
        self.updated_at = now;
    }

    /// Market value at the given unit price.
    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity as f64 * price
    }
}

// ---------------------------------------------------------------------------
// Settlement status
// ---------------------------------------------------------------------------

/// Lifecycle of a short position or portfolio bet. `Won`, `Lost` and
/// `Expired` are all terminal; nothing ever transitions back out.
/// `Lost` and `Expired` are payout-identical (the stake, debited at
/// open, is simply never returned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Active,
    Won,
    Lost,
    Expired,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SettlementStatus::Active)
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStatus::Active => write!(f, "active"),
            SettlementStatus::Won => write!(f, "won"),
            SettlementStatus::Lost => write!(f, "lost"),
            SettlementStatus::Expired => write!(f, "expired"),
        }
    }
}

// ---------------------------------------------------------------------------
// Short position
// ---------------------------------------------------------------------------

/// A leveraged stake that pays out if an instrument's price falls to
/// the target before the window closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortPosition {
    pub id: String,
    pub owner_id: String,
    pub instrument_id: String,
    pub stake: f64,
    pub start_price: f64,
    pub target_price: f64,
    pub target_drop_pct: f64,
    pub multiplier: f64,
    pub potential_payout: f64,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once, when the position reaches a terminal state.
    pub settled_at: Option<DateTime<Utc>>,
}

impl fmt::Display for ShortPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "short {} ${:.2} @ {:.2}→{:.2} ({:.0}% drop, {}x) [{}]",
            self.instrument_id,
            self.stake,
            self.start_price,
            self.target_price,
            self.target_drop_pct,
            self.multiplier,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Portfolio bet
// ---------------------------------------------------------------------------

/// Direction of a portfolio bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetDirection {
    Increase,
    Decrease,
}

impl fmt::Display for BetDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetDirection::Increase => write!(f, "increase"),
            BetDirection::Decrease => write!(f, "decrease"),
        }
    }
}

/// A stake on whether another participant's holdings value moves by a
/// target percentage within a window. The holdings value at placement
/// is frozen into the record so settlement compares against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioBet {
    pub id: String,
    pub bettor_id: String,
    pub target_id: String,
    pub direction: BetDirection,
    pub target_pct: f64,
    pub window_hours: f64,
    pub stake: f64,
    pub multiplier: f64,
    pub potential_payout: f64,
    /// Target participant's holdings value at placement.
    pub initial_value: f64,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl fmt::Display for PortfolioBet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bet on {}: {} {:.0}% in {:.0}h, ${:.2} @ {}x [{}]",
            self.target_id,
            self.direction,
            self.target_pct,
            self.window_hours,
            self.stake,
            self.multiplier,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Kind of balance-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Buy,
    Sell,
    ShortOpen,
    BetOpen,
    Settlement,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Buy => write!(f, "buy"),
            TransactionKind::Sell => write!(f, "sell"),
            TransactionKind::ShortOpen => write!(f, "short_open"),
            TransactionKind::BetOpen => write!(f, "bet_open"),
            TransactionKind::Settlement => write!(f, "settlement"),
        }
    }
}

/// Immutable, append-only record of a balance-affecting event.
/// `amount` is signed from the actor's perspective: debits negative,
/// credits positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub actor_id: String,
    pub instrument_id: Option<String>,
    pub quantity: u32,
    pub amount: f64,
    /// Unit price at execution, where applicable.
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        actor_id: impl Into<String>,
        instrument_id: Option<String>,
        quantity: u32,
        amount: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            actor_id: actor_id.into(),
            instrument_id,
            quantity,
            amount,
            price,
            timestamp,
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} x{} ${:+.2}",
            self.timestamp.format("%H:%M:%S"),
            self.actor_id,
            self.kind,
            self.quantity,
            self.amount,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

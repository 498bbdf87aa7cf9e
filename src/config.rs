//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has sensible defaults so partial files and tests work
//! without a full config.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Seeding parameters: how many bots, what they start with, and which
/// opinions exist at launch.
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    pub bot_count: usize,
    pub starting_balance: f64,
    pub base_price: f64,
    pub seed_opinions: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bot_count: 12,
            starting_balance: 1000.0,
            base_price: 10.0,
            seed_opinions: Vec::new(),
        }
    }
}

/// Per-agent timer and activity tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Tick interval is drawn uniformly from [min, max] per tick, so
    /// agents never synchronize.
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Global scaling of every agent's activity probability, to bound
    /// total write volume.
    pub activity_damping: f64,
    /// How often the settlement sweep runs.
    pub settlement_sweep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 180,
            activity_damping: 1.0,
            settlement_sweep_secs: 120,
        }
    }
}

/// Market mechanics.
#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    pub rate_limit_window_secs: i64,
    pub rate_limit_max_buys: usize,
    /// Fixed spread applied on sale: proceeds = price × (1 − spread).
    pub sell_spread: f64,
    pub max_price_history: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: 600,
            rate_limit_max_buys: 4,
            sell_spread: 0.05,
            max_price_history: 50,
        }
    }
}

/// Conflict-resolver retry tuning (mirrors `ResolverConfig`).
#[derive(Debug, Deserialize, Clone)]
pub struct ResolverSection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 150,
            max_backoff_ms: 3200,
            jitter_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8380,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }
}

impl From<&ResolverSection> for crate::store::ResolverConfig {
    fn from(section: &ResolverSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_backoff_ms: section.base_backoff_ms,
            max_backoff_ms: section.max_backoff_ms,
            jitter_ms: section.jitter_ms,
        }
    }
}

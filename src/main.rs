//! AGORA — Opinion Market Simulation Engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! seeds bots and opinions, starts the per-agent schedulers and the
//! dashboard, then waits for Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use agora::clock::{Clock, SystemClock};
use agora::config;
use agora::dashboard::{self, routes::DashboardState};
use agora::engine::ledger::PortfolioLedger;
use agora::engine::scheduler::AgentScheduler;
use agora::engine::settlement::PositionSettlement;
use agora::seed;
use agora::store::{ConflictResolver, DocumentStore, MemoryStore};

const BANNER: &str = r#"
   _    ____  ___  ____      _
  / \  / ___|/ _ \|  _ \    / \
 / _ \| |  _| | | | |_) |  / _ \
/ ___ \ |_| | |_| |  _ <  / ___ \
_/   \_\____|\___/|_| \_\/_/   \_\

  Opinion Market Simulation Engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        bots = cfg.simulation.bot_count,
        opinions = cfg.simulation.seed_opinions.len(),
        starting_balance = cfg.simulation.starting_balance,
        "AGORA starting up"
    );

    // -- Wire up components ----------------------------------------------

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = Arc::new(ConflictResolver::new((&cfg.resolver).into()));

    let report = seed::run(&store, &clock, &cfg.simulation).await?;
    info!(
        agents = report.agents_created,
        instruments = report.instruments_created,
        "Market seeded"
    );

    let ledger = Arc::new(PortfolioLedger::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::clone(&clock),
        cfg.market.clone(),
    ));
    let settlement = Arc::new(PositionSettlement::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::clone(&clock),
    ));
    let scheduler = AgentScheduler::new(
        Arc::clone(&store),
        ledger,
        settlement,
        cfg.scheduler.clone(),
    );

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(Arc::clone(&store)));
        dashboard::spawn_dashboard(state, cfg.dashboard.port)?;
    }

    // -- Run until interrupted -------------------------------------------

    let scheduled = scheduler.start().await?;
    info!(bots = scheduled, "Simulation running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    scheduler.stop();

    info!("AGORA shut down cleanly.");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agora=info"));

    let json_logging = std::env::var("AGORA_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

//! First-run population of bots and opinions.
//!
//! Seeding is idempotent: documents that already exist are left alone,
//! so a restart never resets balances or trading counters.

use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::config::SimulationConfig;
use crate::store::{collections, to_doc, DocumentStore, StoreError};
use crate::types::{Agent, Instrument, RiskProfile};

/// Stable bot roster; cycled when bot_count exceeds it.
const BOT_NAMES: &[&str] = &[
    "Ada", "Basil", "Clara", "Dmitri", "Esther", "Felix", "Greta", "Hugo", "Iris", "Jonas",
    "Katya", "Lars", "Mina", "Nuru", "Oda", "Piotr",
];

const PROFILE_CYCLE: &[RiskProfile] = &[
    RiskProfile::Conservative,
    RiskProfile::Moderate,
    RiskProfile::Aggressive,
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub agents_created: usize,
    pub instruments_created: usize,
    pub skipped: usize,
}

/// Create the configured bots and opinions, skipping anything present.
pub async fn run(
    store: &Arc<dyn DocumentStore>,
    clock: &Arc<dyn Clock>,
    config: &SimulationConfig,
) -> Result<SeedReport, StoreError> {
    let now = clock.now();
    let mut report = SeedReport::default();

    for i in 0..config.bot_count {
        let name = BOT_NAMES[i % BOT_NAMES.len()];
        let id = if i < BOT_NAMES.len() {
            format!("bot-{}", name.to_lowercase())
        } else {
            format!("bot-{}-{}", name.to_lowercase(), i / BOT_NAMES.len())
        };
        if store.get(collections::AGENTS, &id).await?.is_some() {
            report.skipped += 1;
            continue;
        }
        let profile = PROFILE_CYCLE[i % PROFILE_CYCLE.len()];
        let agent = Agent::new_bot(id.clone(), name, config.starting_balance, profile, now);
        store
            .set(collections::AGENTS, &id, to_doc(&agent)?, false)
            .await?;
        report.agents_created += 1;
    }

    for text in &config.seed_opinions {
        let id = Instrument::id_for(text);
        if store.get(collections::INSTRUMENTS, &id).await?.is_some() {
            report.skipped += 1;
            continue;
        }
        let instrument = Instrument::new(text.clone(), config.base_price, now);
        store
            .set(collections::INSTRUMENTS, &id, to_doc(&instrument)?, false)
            .await?;
        report.instruments_created += 1;
    }

    info!(
        agents = report.agents_created,
        instruments = report.instruments_created,
        skipped = report.skipped,
        "seeding complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{from_doc, MemoryStore};
    use chrono::Utc;

    fn config() -> SimulationConfig {
        SimulationConfig {
            bot_count: 5,
            starting_balance: 500.0,
            base_price: 10.0,
            seed_opinions: vec![
                "Pineapple belongs on pizza".to_string(),
                "The metric system should be universal".to_string(),
            ],
        }
    }

    #[tokio::test]
    async fn test_seed_creates_bots_and_opinions() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));

        let report = run(&store, &clock, &config()).await.unwrap();
        assert_eq!(report.agents_created, 5);
        assert_eq!(report.instruments_created, 2);
        assert_eq!(report.skipped, 0);

        let ada: Agent = from_doc(
            store
                .get(collections::AGENTS, "bot-ada")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ada.balance, 500.0);
        assert_eq!(ada.risk_profile, RiskProfile::Conservative);
        assert!(ada.is_bot);

        let iid = Instrument::id_for("Pineapple belongs on pizza");
        let inst: Instrument = from_doc(
            store
                .get(collections::INSTRUMENTS, &iid)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(inst.price, 10.0);
        assert_eq!(inst.purchases, 0);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let cfg = config();

        run(&store, &clock, &cfg).await.unwrap();

        // Drain a balance, then reseed; the document must survive.
        let mut ada: Agent = from_doc(
            store
                .get(collections::AGENTS, "bot-ada")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        ada.balance = 1.25;
        store
            .set(collections::AGENTS, "bot-ada", to_doc(&ada).unwrap(), false)
            .await
            .unwrap();

        let report = run(&store, &clock, &cfg).await.unwrap();
        assert_eq!(report.agents_created, 0);
        assert_eq!(report.instruments_created, 0);
        assert_eq!(report.skipped, 7);

        let ada: Agent = from_doc(
            store
                .get(collections::AGENTS, "bot-ada")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ada.balance, 1.25);
    }

    #[tokio::test]
    async fn test_profiles_cycle() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        run(&store, &clock, &config()).await.unwrap();

        let profiles: Vec<RiskProfile> = futures::future::join_all(
            ["bot-ada", "bot-basil", "bot-clara", "bot-dmitri"]
                .iter()
                .map(|id| store.get(collections::AGENTS, id)),
        )
        .await
        .into_iter()
        .map(|r| from_doc::<Agent>(r.unwrap().unwrap()).unwrap().risk_profile)
        .collect();
        assert_eq!(
            profiles,
            vec![
                RiskProfile::Conservative,
                RiskProfile::Moderate,
                RiskProfile::Aggressive,
                RiskProfile::Conservative,
            ]
        );
    }
}

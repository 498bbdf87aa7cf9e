//! Anti-arbitrage rate limiter.
//!
//! Counts buy transactions per (agent, instrument) in a trailing
//! window. Buy-only: selling never consumes or resets the counter, so
//! an agent can always liquidate. The count comes from the persisted
//! transaction log rather than an in-memory tally, so a restart doesn't
//! open a loophole.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::store::{collections, DocumentStore, QueryFilter, StoreError};

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterVerdict {
    pub allowed: bool,
    /// How long until the oldest counted buy ages out. Only set on
    /// rejection.
    pub retry_after: Option<Duration>,
}

impl LimiterVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    /// Wait time rounded up to whole minutes, for user-facing messages.
    pub fn wait_minutes(&self) -> i64 {
        match self.retry_after {
            Some(d) => (d.num_seconds() + 59) / 60,
            None => 0,
        }
    }
}

/// Sliding-window buy limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    pub window: Duration,
    pub max_buys: usize,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            window: Duration::minutes(10),
            max_buys: 4,
        }
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_buys: usize) -> Self {
        Self { window, max_buys }
    }

    /// Check whether `agent_id` may buy `instrument_id` at `now`.
    pub async fn check(
        &self,
        store: &dyn DocumentStore,
        agent_id: &str,
        instrument_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LimiterVerdict, StoreError> {
        let filter = QueryFilter::default()
            .field_eq("actor_id", json!(agent_id))
            .field_eq("instrument_id", json!(instrument_id))
            .field_eq("kind", json!("buy"))
            .since("timestamp", now - self.window);

        let recent = store
            .query(collections::TRANSACTIONS, &filter, Some("timestamp"), None)
            .await?;

        if recent.len() < self.max_buys {
            return Ok(LimiterVerdict::allowed());
        }

        // Full window: the caller may retry once the oldest counted buy
        // ages out.
        let oldest = recent
            .first()
            .and_then(|doc| doc.get("timestamp"))
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let retry_after = oldest
            .map(|t| (t + self.window) - now)
            .filter(|d| *d > Duration::zero());

        Ok(LimiterVerdict {
            allowed: false,
            retry_after,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

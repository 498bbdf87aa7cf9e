//! Conflict resolver — the single gate every mutating operation goes
//! through.
//!
//! Three layers: a keyed async mutex so same-process callers targeting
//! one document queue instead of racing, classified retry with
//! exponential backoff and jitter for transient store failures, and a
//! create-or-update fallback so callers never branch on document
//! existence.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::{Document, DocumentStore, StoreError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry/backoff tuning.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Total attempts before the last error surfaces.
    pub max_attempts: u32,
    /// First-retry delay; doubles per retry.
    pub base_backoff_ms: u64,
    /// Backoff cap.
    pub max_backoff_ms: u64,
    /// Uniform random jitter added to every delay.
    pub jitter_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 150,
            max_backoff_ms: 3200,
            jitter_ms: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Keyed mutual exclusion plus retry. One instance per process; the
/// lock map is transient and garbage-collected as keys go idle.
pub struct ConflictResolver {
    config: ResolverConfig,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Number of live lock entries. Test hook for the GC behaviour.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drop the map entry once nobody else holds the lock.
    fn gc(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(arc) = locks.get(key) {
            if Arc::strong_count(arc) == 1 {
                locks.remove(key);
            }
        }
    }

    /// Run `op` under the key's mutex, retrying retryable failures with
    /// exponential backoff. `op` is re-invoked from scratch on every
    /// attempt, so it must re-read any state it depends on — which is
    /// exactly what makes retried mutations converge.
    pub async fn run<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
    {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            self.retry_loop(key, &mut op).await
        };
        drop(lock);
        self.gc(key);
        result
    }

    async fn retry_loop<T, F, Fut>(&self, key: &str, op: &mut F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
    {
        let mut last_error = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let exp = self
                    .config
                    .base_backoff_ms
                    .saturating_mul(1u64 << (attempt - 1))
                    .min(self.config.max_backoff_ms);
                let jitter = if self.config.jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=self.config.jitter_ms)
                } else {
                    0
                };
                debug!(key, attempt, delay_ms = exp + jitter, "retrying mutation");
                tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(key, attempt, error = %e, "retryable store failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(StoreError::DeadlineExceeded))
    }

    /// Update-or-create: try an in-place partial update first; if the
    /// document doesn't exist, fall back to writing `defaults` merged
    /// with the partial. Retry discipline applies to both paths.
    pub async fn upsert(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        id: &str,
        partial: Document,
        defaults: Document,
    ) -> Result<(), StoreError> {
        let key = format!("{collection}/{id}");
        self.run(&key, || {
            let partial = partial.clone();
            let defaults = defaults.clone();
            async move {
                match store.update(collection, id, partial.clone()).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => {
                        let mut fresh = defaults;
                        if let (Some(base), Some(extra)) =
                            (fresh.as_object_mut(), partial.as_object())
                        {
                            for (k, v) in extra {
                                base.insert(k.clone(), v.clone());
                            }
                        }
                        store.set(collection, id, fresh, false).await
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_resolver() -> ConflictResolver {
        ConflictResolver::new(ResolverConfig {
            max_attempts: 5,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter_ms: 0,
        })
    }

    fn conflict() -> StoreError {
        StoreError::VersionConflict {
            collection: "agents".into(),
            id: "a1".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_converges_after_transient_failures() {
        let resolver = fast_resolver();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result = resolver
            .run("k", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(conflict())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_immediately() {
        let resolver = fast_resolver();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result: Result<(), _> = resolver
            .run("k", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::PermissionDenied("nope".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let resolver = fast_resolver();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        let result: Result<(), _> = resolver
            .run("k", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(conflict())
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_same_key_operations_serialize() {
        let resolver = Arc::new(fast_resolver());
        let active = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            handles.push(tokio::spawn(async move {
                resolver
                    .run("instrument:x", move || {
                        let active = Arc::clone(&active);
                        let overlapped = Arc::clone(&overlapped);
                        async move {
                            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlapped.fetch_add(1, Ordering::SeqCst);
                            }
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(
            overlapped.load(Ordering::SeqCst),
            0,
            "same-key bodies must never overlap"
        );
    }

    #[tokio::test]
    async fn test_lock_map_is_garbage_collected() {
        let resolver = fast_resolver();
        resolver.run("a", || async { Ok(()) }).await.unwrap();
        resolver.run("b", || async { Ok(()) }).await.unwrap();
        assert_eq!(resolver.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_upsert_updates_existing() {
        let resolver = fast_resolver();
        let store = MemoryStore::new();
        store
            .set("agents", "a1", json!({"balance": 100.0, "name": "Ada"}), false)
            .await
            .unwrap();

        resolver
            .upsert(
                &store,
                "agents",
                "a1",
                json!({"balance": 80.0}),
                json!({"balance": 0.0, "name": "unknown"}),
            )
            .await
            .unwrap();

        let doc = store.get("agents", "a1").await.unwrap().unwrap();
        assert_eq!(doc["balance"], 80.0);
        assert_eq!(doc["name"], "Ada");
    }

    #[tokio::test]
    async fn test_upsert_creates_with_defaults() {
        let resolver = fast_resolver();
        let store = MemoryStore::new();

        resolver
            .upsert(
                &store,
                "agents",
                "fresh",
                json!({"balance": 80.0}),
                json!({"balance": 0.0, "name": "unknown"}),
            )
            .await
            .unwrap();

        let doc = store.get("agents", "fresh").await.unwrap().unwrap();
        assert_eq!(doc["balance"], 80.0, "partial overrides defaults");
        assert_eq!(doc["name"], "unknown", "defaults fill the gaps");
    }

    #[tokio::test]
    async fn test_retry_end_state_matches_first_try_success() {
        // A mutation that conflicts k times then lands must leave the
        // store exactly as if it had landed immediately.
        let resolver = fast_resolver();
        let store = Arc::new(MemoryStore::new());
        store
            .set("agents", "a1", json!({"balance": 100.0}), false)
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let store2 = Arc::clone(&store);
        let calls2 = Arc::clone(&calls);
        resolver
            .run("agents/a1", move || {
                let store = Arc::clone(&store2);
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(conflict());
                    }
                    let doc = store.get("agents", "a1").await?.unwrap();
                    let balance = doc["balance"].as_f64().unwrap();
                    store
                        .update("agents", "a1", json!({"balance": balance - 10.0}))
                        .await
                }
            })
            .await
            .unwrap();

        let doc = store.get("agents", "a1").await.unwrap().unwrap();
        assert_eq!(doc["balance"], 90.0);
    }
}

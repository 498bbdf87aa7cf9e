//! In-memory document store.
//!
//! Backs the simulation and every test. Each document carries a
//! monotonically increasing version; `transact` snapshots versions
//! outside the write lock and re-checks them at commit, so two tasks
//! racing on the same document produce a real `VersionConflict` for the
//! resolver to absorb.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{
    DocKey, Document, DocumentStore, QueryFilter, StoreError, TransactFn, TxnSnapshot, WriteOp,
    MAX_BATCH_OPS,
};

#[derive(Debug, Clone)]
struct Versioned {
    doc: Document,
    version: u64,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, HashMap<String, Versioned>>,
    activity_log: Vec<Document>,
}

/// Process-local versioned store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the activity feed, oldest first. Test hook.
    pub async fn activity_log(&self) -> Vec<Document> {
        self.inner.read().await.activity_log.clone()
    }

    /// Number of documents in a collection. Test hook.
    pub async fn count(&self, collection: &str) -> usize {
        self.inner
            .read()
            .await
            .collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn shallow_merge(existing: &mut Document, partial: &Document) {
        if let (Some(base), Some(extra)) = (existing.as_object_mut(), partial.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
    }

    fn apply_ops(inner: &mut Inner, ops: &[WriteOp]) -> Result<(), StoreError> {
        // Validate updates up front so the batch stays all-or-nothing.
        for op in ops {
            if let WriteOp::Update { collection, id, .. } = op {
                let exists = inner
                    .collections
                    .get(collection)
                    .and_then(|c| c.get(id))
                    .is_some();
                if !exists {
                    return Err(StoreError::not_found(collection, id));
                }
            }
        }

        for op in ops {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    value,
                    merge,
                } => {
                    let coll = inner.collections.entry(collection.clone()).or_default();
                    match coll.get_mut(id) {
                        Some(entry) if *merge => {
                            Self::shallow_merge(&mut entry.doc, value);
                            entry.version += 1;
                        }
                        Some(entry) => {
                            entry.doc = value.clone();
                            entry.version += 1;
                        }
                        None => {
                            coll.insert(
                                id.clone(),
                                Versioned {
                                    doc: value.clone(),
                                    version: 1,
                                },
                            );
                        }
                    }
                }
                WriteOp::Update {
                    collection,
                    id,
                    partial,
                } => {
                    // Existence checked above.
                    if let Some(entry) = inner
                        .collections
                        .get_mut(collection)
                        .and_then(|c| c.get_mut(id))
                    {
                        Self::shallow_merge(&mut entry.doc, partial);
                        entry.version += 1;
                    }
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(coll) = inner.collections.get_mut(collection) {
                        coll.remove(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn matches(doc: &Document, filter: &QueryFilter) -> bool {
        for (field, expected) in &filter.equals {
            if doc.get(field) != Some(expected) {
                return false;
            }
        }
        if let Some((field, bound)) = &filter.min_timestamp {
            let ts = doc
                .get(field)
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            match ts {
                Some(ts) => {
                    if ts.with_timezone(&chrono::Utc) < *bound {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn compare_field(a: &Document, b: &Document, field: &str) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => {
                if let (Some(xf), Some(yf)) = (x.as_f64(), y.as_f64()) {
                    xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
                } else if let (Some(xs), Some(ys)) = (x.as_str(), y.as_str()) {
                    xs.cmp(ys)
                } else {
                    Ordering::Equal
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|v| v.doc.clone()))
    }

    async fn query(
        &self,
        collection: &str,
        filter: &QueryFilter,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.read().await;
        let mut docs: Vec<Document> = inner
            .collections
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|v| Self::matches(&v.doc, filter))
                    .map(|v| v.doc.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(field) = order_by {
            docs.sort_by(|a, b| Self::compare_field(a, b, field));
        }
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        value: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        Self::apply_ops(
            &mut inner,
            &[WriteOp::Set {
                collection: collection.to_string(),
                id: id.to_string(),
                value,
                merge,
            }],
        )
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Document,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        Self::apply_ops(
            &mut inner,
            &[WriteOp::Update {
                collection: collection.to_string(),
                id: id.to_string(),
                partial,
            }],
        )
    }

    async fn transact(&self, keys: &[DocKey], apply: TransactFn) -> Result<Document, StoreError> {
        // Read phase: snapshot documents and versions under a read lock.
        let (snapshot, versions) = {
            let inner = self.inner.read().await;
            let mut docs = Vec::with_capacity(keys.len());
            let mut versions = Vec::with_capacity(keys.len());
            for key in keys {
                let entry = inner
                    .collections
                    .get(&key.collection)
                    .and_then(|c| c.get(&key.id));
                docs.push((key.clone(), entry.map(|v| v.doc.clone())));
                versions.push(entry.map(|v| v.version).unwrap_or(0));
            }
            (TxnSnapshot::new(docs), versions)
        };

        let output = apply(&snapshot)?;

        // Commit phase: re-check versions under the write lock.
        let mut inner = self.inner.write().await;
        for (key, read_version) in keys.iter().zip(&versions) {
            let current = inner
                .collections
                .get(&key.collection)
                .and_then(|c| c.get(&key.id))
                .map(|v| v.version)
                .unwrap_or(0);
            if current != *read_version {
                trace!(
                    collection = %key.collection,
                    id = %key.id,
                    read_version,
                    current,
                    "transaction version mismatch"
                );
                return Err(StoreError::VersionConflict {
                    collection: key.collection.clone(),
                    id: key.id.clone(),
                });
            }
        }
        Self::apply_ops(&mut inner, &output.writes)?;
        Ok(output.result)
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(ops.len()));
        }
        let mut inner = self.inner.write().await;
        Self::apply_ops(&mut inner, &ops)
    }

    async fn append_log(&self, entry: Document) {
        let mut inner = self.inner.write().await;
        debug!(entry = %entry, "activity feed");
        inner.activity_log.push(entry);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Abstract document store.
//!
//! The engine talks to persistence through the `DocumentStore` trait:
//! versioned documents grouped into collections, an optimistic
//! read-modify-write transaction primitive, bounded atomic batches,
//! and a best-effort activity feed. `MemoryStore` is the in-process
//! implementation; the trait is what every mutation path is written
//! against.

pub mod memory;
pub mod resolver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;
pub use resolver::{ConflictResolver, ResolverConfig};

/// The unit of storage. Model structs round-trip through this.
pub type Document = serde_json::Value;

/// Maximum operations per atomic batch.
pub const MAX_BATCH_OPS: usize = 500;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// Well-known collection names.
pub mod collections {
    pub const AGENTS: &str = "agents";
    pub const INSTRUMENTS: &str = "instruments";
    pub const POSITIONS: &str = "positions";
    pub const SHORTS: &str = "shorts";
    pub const BETS: &str = "bets";
    pub const TRANSACTIONS: &str = "transactions";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store failure taxonomy. `is_retryable` drives the conflict
/// resolver's retry classification: version conflicts, transient
/// unavailability and deadline overruns retry; everything else
/// propagates immediately.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("version conflict on {collection}/{id}")]
    VersionConflict { collection: String, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("batch too large: {0} ops (max {MAX_BATCH_OPS})")]
    BatchTooLarge(usize),

    /// A transaction closure declined to commit. Carries the
    /// user-facing reason; never retried.
    #[error("{0}")]
    Aborted(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. }
                | StoreError::Unavailable(_)
                | StoreError::DeadlineExceeded
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries and writes
// ---------------------------------------------------------------------------

/// Simple conjunctive filter: field equality plus an optional timestamp
/// lower bound. Enough for the rate-limiter window and settlement
/// sweeps.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub equals: Vec<(String, Document)>,
    /// (field, bound): keep documents whose RFC3339 field is >= bound.
    pub min_timestamp: Option<(String, DateTime<Utc>)>,
}

impl QueryFilter {
    pub fn field_eq(mut self, field: &str, value: impl Into<Document>) -> Self {
        self.equals.push((field.to_string(), value.into()));
        self
    }

    pub fn since(mut self, field: &str, bound: DateTime<Utc>) -> Self {
        self.min_timestamp = Some((field.to_string(), bound));
        self
    }
}

/// A single write in a batch or transaction commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        value: Document,
        merge: bool,
    },
    Update {
        collection: String,
        id: String,
        partial: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn set(collection: &str, id: &str, value: Document) -> Self {
        WriteOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            value,
            merge: false,
        }
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// A document addressed for transactional read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Read snapshot handed to a transaction closure.
#[derive(Debug, Clone, Default)]
pub struct TxnSnapshot {
    docs: Vec<(DocKey, Option<Document>)>,
}

impl TxnSnapshot {
    pub fn new(docs: Vec<(DocKey, Option<Document>)>) -> Self {
        Self { docs }
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Document> {
        self.docs
            .iter()
            .find(|(k, _)| k.collection == collection && k.id == id)
            .and_then(|(_, doc)| doc.as_ref())
    }
}

/// What a transaction closure produces: the writes to commit and an
/// optional result document handed back to the caller.
#[derive(Debug, Clone)]
pub struct TxnOutput {
    pub writes: Vec<WriteOp>,
    pub result: Document,
}

impl TxnOutput {
    pub fn writes(writes: Vec<WriteOp>) -> Self {
        Self {
            writes,
            result: Document::Null,
        }
    }

    pub fn with_result<T: Serialize>(writes: Vec<WriteOp>, result: &T) -> Result<Self, StoreError> {
        Ok(Self {
            writes,
            result: to_doc(result)?,
        })
    }
}

/// Transaction body: reads the snapshot, returns writes (or aborts).
pub type TransactFn = Box<dyn FnOnce(&TxnSnapshot) -> Result<TxnOutput, StoreError> + Send>;

// ---------------------------------------------------------------------------
// The store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document, `None` if absent.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Filtered scan, optionally ordered ascending by a field.
    async fn query(
        &self,
        collection: &str,
        filter: &QueryFilter,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Create or replace. With `merge`, shallow-merges top-level fields
    /// into any existing document instead of replacing it.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        value: Document,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// Shallow-merge `partial` into an existing document.
    /// Fails with `NotFound` if the document is absent.
    async fn update(&self, collection: &str, id: &str, partial: Document)
        -> Result<(), StoreError>;

    /// Optimistic read-modify-write: read `keys` with their versions,
    /// run `apply` on the snapshot, commit its writes only if none of
    /// the read documents changed in the meantime. A mismatch fails
    /// with `VersionConflict`; retries are the caller's responsibility
    /// (in practice, the conflict resolver's).
    async fn transact(&self, keys: &[DocKey], apply: TransactFn) -> Result<Document, StoreError>;

    /// Atomic multi-document write, at most `MAX_BATCH_OPS` operations.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Fire-and-forget append to the activity feed. Implementations log
    /// failures and never surface them.
    async fn append_log(&self, entry: Document);
}

// ---------------------------------------------------------------------------
// Document conversion helpers
// ---------------------------------------------------------------------------

pub fn to_doc<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

pub fn from_doc<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::VersionConflict {
            collection: "agents".into(),
            id: "a".into()
        }
        .is_retryable());
        assert!(StoreError::Unavailable("overloaded".into()).is_retryable());
        assert!(StoreError::DeadlineExceeded.is_retryable());

        assert!(!StoreError::not_found("agents", "a").is_retryable());
        assert!(!StoreError::PermissionDenied("nope".into()).is_retryable());
        assert!(!StoreError::InvalidDocument("bad".into()).is_retryable());
        assert!(!StoreError::Aborted("insufficient balance".into()).is_retryable());
    }

    #[test]
    fn test_filter_builder() {
        let filter = QueryFilter::default()
            .field_eq("actor_id", json!("a1"))
            .field_eq("kind", json!("buy"));
        assert_eq!(filter.equals.len(), 2);
        assert!(filter.min_timestamp.is_none());
    }

    #[test]
    fn test_snapshot_lookup() {
        let snap = TxnSnapshot::new(vec![
            (DocKey::new("agents", "a1"), Some(json!({"balance": 10}))),
            (DocKey::new("agents", "a2"), None),
        ]);
        assert!(snap.get("agents", "a1").is_some());
        assert!(snap.get("agents", "a2").is_none());
        assert!(snap.get("agents", "a3").is_none());
    }

    #[test]
    fn test_doc_roundtrip() {
        use crate::types::{Agent, RiskProfile};
        let agent = Agent::new_bot("b1", "Ada", 100.0, RiskProfile::Moderate, chrono::Utc::now());
        let doc = to_doc(&agent).unwrap();
        let back: Agent = from_doc(doc).unwrap();
        assert_eq!(back.id, "b1");
        assert_eq!(back.risk_profile, RiskProfile::Moderate);
    }
}

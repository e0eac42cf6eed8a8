//! Document store contract consumed by the registration engine.
//!
//! The engine never talks to a concrete database. It holds an
//! `Arc<dyn DocumentStore>` and relies on exactly the capabilities a hosted
//! document database offers:
//!
//! - per-document get / create / set / field-level update / delete
//! - equality and membership queries over top-level fields
//! - multi-document atomic batches (writes only)
//! - atomic read-modify-write transactions over a declared read set
//! - live subscriptions on a filtered collection
//!
//! # Transactions
//!
//! A transaction is described as a pure body: the store reads every key in
//! the read set, hands the snapshot to the body, and commits the writes the
//! body returns. The body can abort with a typed [`TransactionAbort`], in which
//! case nothing is written. Bodies are `Fn` because a store is allowed to
//! re-execute them when it detects a conflict.
//!
//! # Implementations
//!
//! - `InMemoryDocumentStore` (in `placement-testing`): single-lock, deterministic
//! - `PostgresDocumentStore` (in `placement-postgres`): JSONB rows, advisory-lock transactions
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures instead of using `async fn` so the trait can be
//! used as `Arc<dyn DocumentStore>`.

use crate::status::{ApprovalStatus, TrackStatus};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Boxed, sendable future returned by store methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Writes produced by a transaction body. Most bodies write at most four documents.
pub type TransactionWrites = SmallVec<[WriteOp; 4]>;

/// Pure transaction body: snapshot of the read set in, writes (or an abort) out.
pub type TransactionBody =
    Box<dyn Fn(&TransactionReads) -> Result<TransactionWrites, TransactionAbort> + Send + Sync>;

/// Live stream of committed changes matching a subscription filter.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<DocumentChange, StoreError>> + Send>>;

// ============================================================================
// Keys and operations
// ============================================================================

/// Address of a single document: `collection/id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    collection: String,
    id: String,
}

impl DocumentKey {
    /// Create a key for `id` inside `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Document id within the collection.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Slash-separated path used in diagnostics, e.g. `defenseRegistrations/abc`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Kind of store operation, as reported in failure diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOperation {
    /// Single document read
    Get,
    /// Collection query or subscription
    List,
    /// Document creation
    Create,
    /// Field-level update
    Update,
    /// Document deletion
    Delete,
    /// Batch, transaction or create-or-replace write
    Write,
}

impl StoreOperation {
    /// Lowercase name used in logs and telemetry.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a [`DocumentStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Target document does not exist (field-level update on a missing document).
    #[error("Document not found: {0}")]
    NotFound(DocumentKey),

    /// The store refused the operation for the caller.
    #[error("Permission denied: {operation} on {path}")]
    PermissionDenied {
        /// Path the operation targeted
        path: String,
        /// Operation that was refused
        operation: StoreOperation,
    },

    /// Store could not be reached or timed out.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be decoded into the expected shape.
    #[error("Malformed document at {path}: {reason}")]
    Malformed {
        /// Path of the offending document
        path: String,
        /// Decoder message
        reason: String,
    },

    /// Concurrent modification detected; the caller may re-run the operation.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Any other backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether re-running the same operation could succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// ============================================================================
// Field-level patches
// ============================================================================

/// New value for a single top-level field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Overwrite the field with this value
    Set(Value),
    /// Remove the field
    Delete,
}

/// Field-level update. Applying it is last-write-wins per field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldPatch {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldPatch {
    /// Empty patch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style `Set`.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), FieldValue::Set(value.into()));
        self
    }

    /// Builder-style `Delete`.
    #[must_use]
    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldValue::Delete);
        self
    }

    /// Top-level difference turning `before` into `after`.
    ///
    /// Fields present only in `before` become deletes; fields whose value
    /// changed (or that are new) become sets. Unchanged fields are omitted so
    /// concurrent writers touching other fields are not clobbered.
    #[must_use]
    pub fn diff(before: &Document, after: &Document) -> Self {
        let mut fields = BTreeMap::new();
        for (name, value) in after {
            if before.get(name) != Some(value) {
                fields.insert(name.clone(), FieldValue::Set(value.clone()));
            }
        }
        for name in before.keys() {
            if !after.contains_key(name) {
                fields.insert(name.clone(), FieldValue::Delete);
            }
        }
        Self { fields }
    }

    /// Apply the patch to a document in place.
    pub fn apply_to(&self, document: &mut Document) {
        for (name, value) in &self.fields {
            match value {
                FieldValue::Set(v) => {
                    document.insert(name.clone(), v.clone());
                }
                FieldValue::Delete => {
                    document.remove(name);
                }
            }
        }
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of touched fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Look up the change for one field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterate over `(field, change)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// JSON rendering for diagnostics; deletes appear as `null`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (name, value) in &self.fields {
            let rendered = match value {
                FieldValue::Set(v) => v.clone(),
                FieldValue::Delete => Value::Null,
            };
            out.insert(name.clone(), rendered);
        }
        Value::Object(out)
    }
}

/// One write inside a batch or transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Create or replace the whole document
    Set {
        /// Target document
        key: DocumentKey,
        /// New contents
        document: Document,
    },
    /// Field-level update of an existing document
    Update {
        /// Target document (must exist)
        key: DocumentKey,
        /// Fields to change
        patch: FieldPatch,
    },
    /// Remove the document (no-op if missing)
    Delete {
        /// Target document
        key: DocumentKey,
    },
}

impl WriteOp {
    /// Target document of this write.
    #[must_use]
    pub const fn key(&self) -> &DocumentKey {
        match self {
            Self::Set { key, .. } | Self::Update { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Operation kind for diagnostics.
    #[must_use]
    pub const fn operation(&self) -> StoreOperation {
        match self {
            Self::Set { .. } => StoreOperation::Write,
            Self::Update { .. } => StoreOperation::Update,
            Self::Delete { .. } => StoreOperation::Delete,
        }
    }

    /// Payload the write attempted, for diagnostics.
    #[must_use]
    pub fn attempted_data(&self) -> Value {
        match self {
            Self::Set { document, .. } => Value::Object(document.clone()),
            Self::Update { patch, .. } => patch.to_json(),
            Self::Delete { .. } => Value::Null,
        }
    }

    /// Resulting document when applied on top of `before`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an update of a missing document.
    pub fn resolve(&self, before: Option<&Document>) -> Result<Option<Document>, StoreError> {
        match self {
            Self::Set { document, .. } => Ok(Some(document.clone())),
            Self::Update { key, patch } => {
                let mut document = before
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(key.clone()))?;
                patch.apply_to(&mut document);
                Ok(Some(document))
            }
            Self::Delete { .. } => Ok(None),
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// One predicate over a top-level field.
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// `field == value`
    Eq {
        /// Field name
        field: String,
        /// Expected value
        value: Value,
    },
    /// `field ∈ values`
    In {
        /// Field name
        field: String,
        /// Accepted values
        values: Vec<Value>,
    },
}

/// Conjunction of clauses. The empty filter matches every document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// Filter matching every document.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Add an equality clause.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Add a membership clause.
    #[must_use]
    pub fn one_of<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Clauses in insertion order.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate the filter against a document.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq { field, value } => document.get(field) == Some(value),
            Clause::In { field, values } => document
                .get(field)
                .is_some_and(|actual| values.contains(actual)),
        })
    }

    /// Change notification a subscriber on this filter should see for a commit.
    ///
    /// A document that stops matching is reported as removed (`document: None`).
    /// Returns `None` when the commit is invisible to the subscriber.
    #[must_use]
    pub fn change_for(
        &self,
        key: &DocumentKey,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Option<DocumentChange> {
        match after {
            Some(doc) if self.matches(doc) => Some(DocumentChange {
                key: key.clone(),
                document: Some(doc.clone()),
            }),
            _ if before.is_some_and(|doc| self.matches(doc)) => Some(DocumentChange {
                key: key.clone(),
                document: None,
            }),
            _ => None,
        }
    }
}

/// Change delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    /// Document that changed
    pub key: DocumentKey,
    /// New contents, or `None` when deleted or no longer matching the filter
    pub document: Option<Document>,
}

// ============================================================================
// Transactions
// ============================================================================

/// Snapshot of a transaction's read set.
#[derive(Clone, Debug, Default)]
pub struct TransactionReads {
    documents: HashMap<DocumentKey, Option<Document>>,
}

impl TransactionReads {
    /// Empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value read for `key` (`None` when the document is missing).
    pub fn insert(&mut self, key: DocumentKey, document: Option<Document>) {
        self.documents.insert(key, document);
    }

    /// Document read for `key`, if it exists.
    #[must_use]
    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.documents.get(key).and_then(Option::as_ref)
    }

    /// Decode the document read for `key`.
    ///
    /// # Errors
    ///
    /// [`TransactionAbort::Missing`] if the document does not exist,
    /// [`TransactionAbort::Malformed`] if it does not decode.
    pub fn decode<T: DeserializeOwned>(&self, key: &DocumentKey) -> Result<T, TransactionAbort> {
        let document = self
            .get(key)
            .ok_or_else(|| TransactionAbort::Missing(key.clone()))?;
        from_document(key, document).map_err(|error| TransactionAbort::Malformed {
            key: key.clone(),
            reason: error.to_string(),
        })
    }

    /// Whether `key` was part of the read set.
    #[must_use]
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }
}

/// Reason a transaction body declined to commit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionAbort {
    /// Ledger entry already holds `quantity` reservations.
    #[error("Capacity exhausted at {key}: {count} of {quantity} reserved")]
    CapacityExhausted {
        /// Ledger document
        key: DocumentKey,
        /// Occupants at read time
        count: u32,
        /// Declared capacity
        quantity: u32,
    },

    /// Registration placement fields are locked by its approval status.
    #[error("Registration is locked while {status}")]
    Locked {
        /// Approval status holding the lock
        status: ApprovalStatus,
    },

    /// The internship track reached a terminal status.
    #[error("Internship track is {status}")]
    TrackClosed {
        /// Terminal track status
        status: TrackStatus,
    },

    /// A document required by the body does not exist.
    #[error("Document not found: {0}")]
    Missing(DocumentKey),

    /// A document in the read set no longer matches what the caller planned against.
    #[error("Stale read: {0}")]
    Stale(String),

    /// A document in the read set could not be decoded.
    #[error("Malformed document at {key}: {reason}")]
    Malformed {
        /// Offending document
        key: DocumentKey,
        /// Decoder message
        reason: String,
    },
}

/// Outcome of [`DocumentStore::transact`] when nothing was committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The body aborted; no writes occurred.
    #[error("Transaction aborted: {0}")]
    Aborted(#[from] TransactionAbort),

    /// The store failed to read or commit.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Store trait
// ============================================================================

/// Transactional document store.
///
/// Implementations must be `Send + Sync`; the engine shares one instance
/// across tasks behind an `Arc`.
pub trait DocumentStore: Send + Sync {
    /// Read one document.
    fn get(&self, key: &DocumentKey) -> BoxFuture<'_, Result<Option<Document>, StoreError>>;

    /// All documents of `collection` matching `filter`, ordered by id.
    fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<Vec<(DocumentKey, Document)>, StoreError>>;

    /// Insert a document under a store-assigned id.
    fn create(
        &self,
        collection: &str,
        document: Document,
    ) -> BoxFuture<'_, Result<DocumentKey, StoreError>>;

    /// Create or replace a document at a known id.
    fn set(&self, key: &DocumentKey, document: Document) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Field-level update; fails with [`StoreError::NotFound`] if the document is missing.
    fn update(&self, key: &DocumentKey, patch: FieldPatch)
    -> BoxFuture<'_, Result<(), StoreError>>;

    /// Delete a document; deleting a missing document succeeds.
    fn delete(&self, key: &DocumentKey) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Commit all writes or none.
    fn batch(&self, writes: Vec<WriteOp>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Atomic read-modify-write over `reads`, serialized against other
    /// transactions and writes touching the same documents.
    fn transact(
        &self,
        reads: Vec<DocumentKey>,
        body: TransactionBody,
    ) -> BoxFuture<'_, Result<(), TransactionError>>;

    /// Live changes committed after the call for documents matching `filter`.
    fn subscribe(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<DocumentStream, StoreError>>;
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Encode a value as a document.
///
/// # Errors
///
/// [`StoreError::Malformed`] if the value does not serialize to a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Malformed {
            path: String::from("<encode>"),
            reason: format!("expected object, got {other}"),
        }),
        Err(error) => Err(StoreError::Malformed {
            path: String::from("<encode>"),
            reason: error.to_string(),
        }),
    }
}

/// Decode a stored document.
///
/// # Errors
///
/// [`StoreError::Malformed`] if the document does not match `T`.
pub fn from_document<T: DeserializeOwned>(
    key: &DocumentKey,
    document: &Document,
) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(document.clone())).map_err(|error| StoreError::Malformed {
        path: key.path(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn diff_emits_sets_and_deletes_only_for_changed_fields() {
        let before = doc(json!({"a": 1, "b": "x", "c": true}));
        let after = doc(json!({"a": 1, "b": "y", "d": 4}));

        let patch = FieldPatch::diff(&before, &after);

        assert_eq!(patch.len(), 3);
        assert_eq!(patch.field("a"), None);
        assert_eq!(patch.field("b"), Some(&FieldValue::Set(json!("y"))));
        assert_eq!(patch.field("c"), Some(&FieldValue::Delete));
        assert_eq!(patch.field("d"), Some(&FieldValue::Set(json!(4))));

        let mut applied = before.clone();
        patch.apply_to(&mut applied);
        assert_eq!(applied, after);
    }

    #[test]
    fn filter_supports_equality_and_membership() {
        let filter = Filter::all()
            .eq("sessionId", "s1")
            .one_of("graduationStatus", ["reporting", "completed"]);

        assert!(filter.matches(&doc(json!({"sessionId": "s1", "graduationStatus": "completed"}))));
        assert!(!filter.matches(&doc(json!({"sessionId": "s2", "graduationStatus": "completed"}))));
        assert!(!filter.matches(&doc(json!({"sessionId": "s1"}))));
        assert!(Filter::all().matches(&Document::new()));
    }

    #[test]
    fn change_for_reports_documents_leaving_the_filter_as_removed() {
        let filter = Filter::all().eq("sessionId", "s1");
        let key = DocumentKey::new("defenseRegistrations", "r1");
        let before = doc(json!({"sessionId": "s1"}));
        let after = doc(json!({"sessionId": "s2"}));

        let change = filter.change_for(&key, Some(&before), Some(&after));
        assert_eq!(
            change,
            Some(DocumentChange {
                key: key.clone(),
                document: None
            })
        );

        assert_eq!(filter.change_for(&key, Some(&after), Some(&after)), None);
    }

    #[test]
    fn update_of_missing_document_is_not_found() {
        let key = DocumentKey::new("c", "missing");
        let op = WriteOp::Update {
            key: key.clone(),
            patch: FieldPatch::new().set("x", 1),
        };
        assert_eq!(op.resolve(None), Err(StoreError::NotFound(key)));
    }

    #[test]
    fn reads_decode_reports_missing_and_malformed() {
        let key = DocumentKey::new("positionOccupancy", "s1_p1");
        let mut reads = TransactionReads::new();
        reads.insert(key.clone(), None);
        assert!(reads.contains(&key));
        assert_eq!(
            reads.decode::<Document>(&key),
            Err(TransactionAbort::Missing(key.clone()))
        );

        reads.insert(key.clone(), Some(doc(json!({"count": "many"}))));
        #[derive(Debug, serde::Deserialize)]
        struct Counter {
            #[allow(dead_code)]
            count: u32,
        }
        assert!(matches!(
            reads.decode::<Counter>(&key),
            Err(TransactionAbort::Malformed { .. })
        ));
    }

    #[test]
    fn key_path_and_display_agree() {
        let key = DocumentKey::new("internshipCompanies", "acme");
        assert_eq!(key.path(), "internshipCompanies/acme");
        assert_eq!(key.to_string(), key.path());
    }
}

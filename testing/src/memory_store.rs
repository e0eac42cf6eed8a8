//! In-memory document store for fast, deterministic tests.
//!
//! A single lock guards every collection, so batches and transactions are
//! trivially atomic and serializable. Committed changes are fanned out to
//! subscribers over a `tokio::sync::broadcast` channel.
//!
//! Failure injection hooks let tests exercise the engine's error paths:
//! - [`InMemoryDocumentStore::deny_writes`] / [`InMemoryDocumentStore::deny_reads`]:
//!   permission denial per collection
//! - [`InMemoryDocumentStore::fail_next_commits`]: backend conflicts
//! - [`InMemoryDocumentStore::interleave_before_next_transaction`]: a concurrent
//!   writer landing between the engine's planning read and its transaction
//! - [`InMemoryDocumentStore::rerun_next_transaction_after`]: a concurrent
//!   writer landing while the body runs, so the store re-runs the body

use placement_core::document_store::{
    BoxFuture, Document, DocumentChange, DocumentKey, DocumentStore, DocumentStream, FieldPatch,
    Filter, StoreError, StoreOperation, TransactionBody, TransactionError, TransactionReads,
    WriteOp,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// One committed document change, before and after.
#[derive(Clone, Debug)]
struct Committed {
    key: DocumentKey,
    before: Option<Document>,
    after: Option<Document>,
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<DocumentKey, Document>,
    next_id: u64,
    denied_writes: HashSet<String>,
    denied_reads: HashSet<String>,
    pending_conflicts: usize,
    interleaved: Vec<WriteOp>,
    rerun_after: Vec<WriteOp>,
    transactions: usize,
    commits: usize,
}

/// In-memory [`DocumentStore`].
///
/// # Example
///
/// ```
/// use placement_testing::InMemoryDocumentStore;
/// use placement_core::document_store::{DocumentKey, DocumentStore};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryDocumentStore::new();
/// let key = DocumentKey::new("internshipCompanies", "acme");
/// store.seed(&key, json!({"name": "Acme"}));
///
/// let doc = store.get(&key).await?;
/// assert!(doc.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDocumentStore {
    state: Arc<RwLock<State>>,
    changes: broadcast::Sender<Committed>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a document directly, bypassing failure injection and subscribers.
    ///
    /// Non-object values are ignored.
    pub fn seed(&self, key: &DocumentKey, value: serde_json::Value) {
        if let serde_json::Value::Object(document) = value {
            self.write().documents.insert(key.clone(), document);
        }
    }

    /// Current contents of one document.
    #[must_use]
    pub fn snapshot(&self, key: &DocumentKey) -> Option<Document> {
        self.read().documents.get(key).cloned()
    }

    /// All documents of a collection, ordered by id.
    #[must_use]
    pub fn collection(&self, collection: &str) -> Vec<(DocumentKey, Document)> {
        self.read()
            .documents
            .iter()
            .filter(|(key, _)| key.collection() == collection)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.read()
            .documents
            .keys()
            .filter(|key| key.collection() == collection)
            .count()
    }

    /// Refuse every write touching `collection` with `PermissionDenied`.
    pub fn deny_writes(&self, collection: &str) {
        self.write().denied_writes.insert(collection.to_string());
    }

    /// Refuse every read of `collection` with `PermissionDenied`.
    pub fn deny_reads(&self, collection: &str) {
        self.write().denied_reads.insert(collection.to_string());
    }

    /// Lift all permission denials.
    pub fn allow_all(&self) {
        let mut state = self.write();
        state.denied_writes.clear();
        state.denied_reads.clear();
    }

    /// Fail the next `count` commits (batches or transactions) with `Conflict`.
    pub fn fail_next_commits(&self, count: usize) {
        self.write().pending_conflicts = count;
    }

    /// Apply `write` right before the next transaction reads its read set.
    pub fn interleave_before_next_transaction(&self, write: WriteOp) {
        self.write().interleaved.push(write);
    }

    /// Make the next transaction's body lose a race after it runs: its writes
    /// are discarded, `write` commits, and the body runs again on a fresh read.
    ///
    /// Queue several writes to force several re-runs; the last queued lands first.
    pub fn rerun_next_transaction_after(&self, write: WriteOp) {
        self.write().rerun_after.push(write);
    }

    /// Transactions attempted so far, including aborted ones.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.read().transactions
    }

    /// Batches and transactions that committed.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.read().commits
    }

    fn check_read(state: &State, key: &DocumentKey, operation: StoreOperation) -> Result<(), StoreError> {
        if state.denied_reads.contains(key.collection()) {
            return Err(StoreError::PermissionDenied {
                path: key.path(),
                operation,
            });
        }
        Ok(())
    }

    fn check_writes(state: &mut State, writes: &[WriteOp]) -> Result<(), StoreError> {
        if let Some(write) = writes
            .iter()
            .find(|w| state.denied_writes.contains(w.key().collection()))
        {
            return Err(StoreError::PermissionDenied {
                path: write.key().path(),
                operation: write.operation(),
            });
        }
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StoreError::Conflict(String::from("injected conflict")));
        }
        Ok(())
    }

    /// Resolve every write against current contents, then apply all of them.
    fn apply(state: &mut State, writes: &[WriteOp]) -> Result<Vec<Committed>, StoreError> {
        let mut staged: BTreeMap<DocumentKey, Option<Document>> = BTreeMap::new();
        for write in writes {
            let key = write.key();
            let current = match staged.get(key) {
                Some(doc) => doc.clone(),
                None => state.documents.get(key).cloned(),
            };
            staged.insert(key.clone(), write.resolve(current.as_ref())?);
        }

        let mut committed = Vec::with_capacity(staged.len());
        for (key, after) in staged {
            let before = match &after {
                Some(doc) => state.documents.insert(key.clone(), doc.clone()),
                None => state.documents.remove(&key),
            };
            committed.push(Committed { key, before, after });
        }
        state.commits += 1;
        Ok(committed)
    }

    fn commit(&self, writes: &[WriteOp]) -> Result<(), StoreError> {
        let committed = {
            let mut state = self.write();
            Self::check_writes(&mut state, writes)?;
            Self::apply(&mut state, writes)?
        };
        self.publish(committed);
        Ok(())
    }

    fn publish(&self, committed: Vec<Committed>) {
        for change in committed {
            // No receivers is fine.
            let _ = self.changes.send(change);
        }
    }

    fn run_transaction(
        &self,
        reads: &[DocumentKey],
        body: &TransactionBody,
    ) -> Result<(), TransactionError> {
        let committed = {
            let mut state = self.write();
            state.transactions += 1;

            let interleaved = std::mem::take(&mut state.interleaved);
            let mut side_effects = if interleaved.is_empty() {
                Vec::new()
            } else {
                Self::apply(&mut state, &interleaved)?
            };

            loop {
                let mut snapshot = TransactionReads::new();
                for key in reads {
                    Self::check_read(&state, key, StoreOperation::Get)?;
                    snapshot.insert(key.clone(), state.documents.get(key).cloned());
                }

                match body(&snapshot) {
                    Ok(writes) => {
                        // Lost the race: drop this run and read again after the rival write.
                        if let Some(rival) = state.rerun_after.pop() {
                            let mut landed = Self::apply(&mut state, std::slice::from_ref(&rival))?;
                            side_effects.append(&mut landed);
                            continue;
                        }
                        if let Err(error) = Self::check_writes(&mut state, &writes) {
                            drop(state);
                            self.publish(side_effects);
                            return Err(error.into());
                        }
                        let mut committed = Self::apply(&mut state, &writes)?;
                        side_effects.append(&mut committed);
                        break side_effects;
                    }
                    Err(abort) => {
                        drop(state);
                        self.publish(side_effects);
                        return Err(abort.into());
                    }
                }
            }
        };
        self.publish(committed);
        Ok(())
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: &DocumentKey) -> BoxFuture<'_, Result<Option<Document>, StoreError>> {
        let key = key.clone();
        Box::pin(async move {
            let state = self.read();
            Self::check_read(&state, &key, StoreOperation::Get)?;
            Ok(state.documents.get(&key).cloned())
        })
    }

    fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<Vec<(DocumentKey, Document)>, StoreError>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            let state = self.read();
            if state.denied_reads.contains(&collection) {
                return Err(StoreError::PermissionDenied {
                    path: collection,
                    operation: StoreOperation::List,
                });
            }
            Ok(state
                .documents
                .iter()
                .filter(|(key, doc)| key.collection() == collection && filter.matches(doc))
                .map(|(key, doc)| (key.clone(), doc.clone()))
                .collect())
        })
    }

    fn create(
        &self,
        collection: &str,
        document: Document,
    ) -> BoxFuture<'_, Result<DocumentKey, StoreError>> {
        let collection = collection.to_string();
        Box::pin(async move {
            let key = {
                let mut state = self.write();
                state.next_id += 1;
                DocumentKey::new(&collection, format!("{collection}-{:06}", state.next_id))
            };
            let write = WriteOp::Set {
                key: key.clone(),
                document,
            };
            self.commit(std::slice::from_ref(&write)).map_err(|error| match error {
                StoreError::PermissionDenied { path, .. } => StoreError::PermissionDenied {
                    path,
                    operation: StoreOperation::Create,
                },
                other => other,
            })?;
            Ok(key)
        })
    }

    fn set(&self, key: &DocumentKey, document: Document) -> BoxFuture<'_, Result<(), StoreError>> {
        let write = WriteOp::Set {
            key: key.clone(),
            document,
        };
        Box::pin(async move { self.commit(&[write]) })
    }

    fn update(
        &self,
        key: &DocumentKey,
        patch: FieldPatch,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let write = WriteOp::Update {
            key: key.clone(),
            patch,
        };
        Box::pin(async move { self.commit(&[write]) })
    }

    fn delete(&self, key: &DocumentKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let write = WriteOp::Delete { key: key.clone() };
        Box::pin(async move { self.commit(&[write]) })
    }

    fn batch(&self, writes: Vec<WriteOp>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.commit(&writes) })
    }

    fn transact(
        &self,
        reads: Vec<DocumentKey>,
        body: TransactionBody,
    ) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(async move {
            // Yield so concurrent callers actually interleave on a multi-threaded runtime.
            tokio::task::yield_now().await;
            self.run_transaction(&reads, &body)
        })
    }

    fn subscribe(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<DocumentStream, StoreError>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            if self.read().denied_reads.contains(&collection) {
                return Err(StoreError::PermissionDenied {
                    path: collection,
                    operation: StoreOperation::List,
                });
            }
            let mut receiver = self.changes.subscribe();
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(change) => {
                            if change.key.collection() != collection {
                                continue;
                            }
                            if let Some(visible) = filter.change_for(
                                &change.key,
                                change.before.as_ref(),
                                change.after.as_ref(),
                            ) {
                                yield Ok::<DocumentChange, StoreError>(visible);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(StoreError::Unavailable(format!(
                                "subscriber lagged, {skipped} changes dropped"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as DocumentStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use placement_core::document_store::TransactionAbort;
    use serde_json::json;
    use smallvec::smallvec;

    fn key(id: &str) -> DocumentKey {
        DocumentKey::new("things", id)
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = InMemoryDocumentStore::new();
        store.seed(&key("a"), json!({"n": 1}));

        let result = store
            .batch(vec![
                WriteOp::Update {
                    key: key("a"),
                    patch: FieldPatch::new().set("n", 2),
                },
                WriteOp::Update {
                    key: key("missing"),
                    patch: FieldPatch::new().set("n", 2),
                },
            ])
            .await;

        assert_eq!(result, Err(StoreError::NotFound(key("missing"))));
        assert_eq!(store.snapshot(&key("a")).and_then(|d| d.get("n").cloned()), Some(json!(1)));
    }

    #[tokio::test]
    async fn aborted_transaction_writes_nothing() {
        let store = InMemoryDocumentStore::new();
        let result = store
            .transact(
                vec![key("a")],
                Box::new(|_| Err(TransactionAbort::Stale(String::from("changed")))),
            )
            .await;

        assert!(matches!(result, Err(TransactionError::Aborted(_))));
        assert_eq!(store.count("things"), 0);
        assert_eq!(store.commit_count(), 0);
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn interleaved_write_is_visible_to_the_body() {
        let store = InMemoryDocumentStore::new();
        store.interleave_before_next_transaction(WriteOp::Set {
            key: key("a"),
            document: Document::new(),
        });

        let result = store
            .transact(
                vec![key("a")],
                Box::new(|reads| {
                    if reads.get(&key("a")).is_some() {
                        Ok(smallvec![])
                    } else {
                        Err(TransactionAbort::Missing(key("a")))
                    }
                }),
            )
            .await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn losing_run_is_discarded_and_body_runs_again() {
        let store = InMemoryDocumentStore::new();
        store.seed(&key("counter"), json!({"n": 1}));
        store.rerun_next_transaction_after(WriteOp::Set {
            key: key("counter"),
            document: json_doc(json!({"n": 10})),
        });
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&runs);

        let result = store
            .transact(
                vec![key("counter")],
                Box::new(move |reads| {
                    counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let n = reads
                        .get(&key("counter"))
                        .and_then(|d| d.get("n"))
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0);
                    Ok(smallvec![WriteOp::Set {
                        key: key("counter"),
                        document: json_doc(json!({"n": n + 1})),
                    }])
                }),
            )
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(
            store.snapshot(&key("counter")).and_then(|d| d.get("n").cloned()),
            Some(json!(11))
        );
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn denied_collection_reports_permission_denied() {
        let store = InMemoryDocumentStore::new();
        store.deny_writes("things");

        let result = store.set(&key("a"), Document::new()).await;
        assert_eq!(
            result,
            Err(StoreError::PermissionDenied {
                path: String::from("things/a"),
                operation: StoreOperation::Write,
            })
        );
    }

    #[tokio::test]
    async fn subscription_sees_matching_changes_only() {
        let store = InMemoryDocumentStore::new();
        let mut stream = store
            .subscribe("things", &Filter::all().eq("kind", "x"))
            .await
            .unwrap();

        store.set(&key("skip"), json_doc(json!({"kind": "y"}))).await.ok();
        store.set(&key("a"), json_doc(json!({"kind": "x"}))).await.ok();
        store.delete(&key("a")).await.ok();

        let first = stream.next().await;
        assert!(matches!(first, Some(Ok(DocumentChange { ref key, document: Some(_) })) if key.id() == "a"));
        let second = stream.next().await;
        assert!(matches!(second, Some(Ok(DocumentChange { document: None, .. }))));
    }

    fn json_doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Document::new(),
        }
    }
}

//! `PostgreSQL` implementation of [`DocumentStore`].
//!
//! Every document is one row of the `documents` table, keyed by
//! `(collection, id)` with the body in a JSONB column.
//!
//! # Concurrency
//!
//! Every write path (single writes, batches and transactions) runs in a
//! database transaction that first takes a transaction-scoped advisory lock
//! per touched document, in key order. A transaction reads its read set only
//! after holding those locks, so two transactions touching the same ledger
//! entry are serialized and the second one sees the first one's count.
//! Locks on documents that do not exist yet work the same way, which a row
//! lock could not offer.
//!
//! # Subscriptions
//!
//! Each committed change issues `pg_notify` on the configured channel with
//! the document key. Subscribers `LISTEN` on that channel, re-read the
//! document and compare it against their filter.

use crate::config::{PostgresConfig, PostgresConfigError};
use crate::error::on;
use placement_core::document_store::{
    BoxFuture, Clause, Document, DocumentChange, DocumentKey, DocumentStore, DocumentStream,
    FieldPatch, Filter, StoreError, StoreOperation, TransactionBody, TransactionError,
    TransactionReads, WriteOp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::postgres::{PgConnection, PgListener, PgPool};
use sqlx::{PgExecutor, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

const TABLE: &str = "documents";

/// Payload of a change notification.
#[derive(Debug, Serialize, Deserialize)]
struct ChangeNotice {
    collection: String,
    id: String,
}

/// PostgreSQL-backed document store.
///
/// # Example
///
/// ```ignore
/// use placement_postgres::{PostgresConfig, PostgresDocumentStore};
///
/// let store = PostgresDocumentStore::connect(&PostgresConfig::from_env()?).await?;
/// store.migrate().await?;
/// let engine = RegistrationEngine::new(EngineEnvironment::new(Arc::new(store)));
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    channel: String,
}

impl PostgresDocumentStore {
    /// Store over an existing pool, notifying on the default channel.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, PostgresConfig::DEFAULT_CHANNEL)
    }

    /// Store over an existing pool with a custom notification channel.
    #[must_use]
    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Connect using `config`.
    ///
    /// # Errors
    ///
    /// [`PostgresConfigError::Connect`] if the database cannot be reached.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PostgresConfigError> {
        let pool = config.connect().await?;
        Ok(Self::with_channel(pool, config.notify_channel.clone()))
    }

    /// Create the `documents` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns the migrator's error if a migration fails.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        crate::run_migrations(&self.pool).await
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `writes` in one database transaction.
    async fn commit(&self, writes: &[WriteOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(on(TABLE, StoreOperation::Write))?;
        apply_writes(&mut tx, writes, &self.channel).await?;
        tx.commit().await.map_err(on(TABLE, StoreOperation::Write))?;
        Ok(())
    }

    async fn run_transaction(
        &self,
        reads: Vec<DocumentKey>,
        body: TransactionBody,
    ) -> Result<(), TransactionError> {
        let mut tx = self.pool.begin().await.map_err(on(TABLE, StoreOperation::Write))?;

        let mut keys = reads;
        keys.sort();
        keys.dedup();
        for key in &keys {
            lock(&mut tx, key).await?;
        }
        let mut snapshot = TransactionReads::new();
        for key in &keys {
            let document = fetch(&mut *tx, key).await?;
            snapshot.insert(key.clone(), document);
        }

        let writes = match body(&snapshot) {
            Ok(writes) => writes,
            Err(abort) => {
                tx.rollback().await.map_err(on(TABLE, StoreOperation::Write))?;
                metrics::counter!("placement.postgres.transactions", "outcome" => "aborted")
                    .increment(1);
                return Err(abort.into());
            }
        };

        apply_writes(&mut tx, &writes, &self.channel).await?;
        tx.commit().await.map_err(on(TABLE, StoreOperation::Write))?;
        metrics::counter!("placement.postgres.transactions", "outcome" => "committed").increment(1);
        Ok(())
    }

    async fn open_subscription(
        &self,
        collection: String,
        filter: Filter,
    ) -> Result<DocumentStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(on(&collection, StoreOperation::List))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(on(&collection, StoreOperation::List))?;

        // Listening before the initial query means no commit falls in between.
        let mut matching: HashSet<String> = self
            .select(&collection, &filter)
            .await?
            .into_iter()
            .map(|(key, _)| key.id().to_string())
            .collect();
        let pool = self.pool.clone();

        let stream = async_stream::stream! {
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(error) => {
                        yield Err(StoreError::Unavailable(error.to_string()));
                        break;
                    }
                };
                let notice: ChangeNotice = match serde_json::from_str(notification.payload()) {
                    Ok(notice) => notice,
                    Err(error) => {
                        tracing::warn!(error = %error, "Ignoring malformed change notification");
                        continue;
                    }
                };
                if notice.collection != collection {
                    continue;
                }
                let key = DocumentKey::new(notice.collection, notice.id);
                match fetch(&pool, &key).await {
                    Ok(Some(document)) if filter.matches(&document) => {
                        matching.insert(key.id().to_string());
                        yield Ok(DocumentChange { key, document: Some(document) });
                    }
                    Ok(_) => {
                        if matching.remove(key.id()) {
                            yield Ok(DocumentChange { key, document: None });
                        }
                    }
                    Err(error) => yield Err(error),
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn select(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(DocumentKey, Document)>, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT id, data FROM documents WHERE collection = ");
        builder.push_bind(collection.to_string());
        for clause in filter.clauses() {
            match clause {
                Clause::Eq { field, value } => {
                    builder.push(" AND data @> ");
                    builder.push_bind(json!({ field.as_str(): value }));
                }
                Clause::In { values, .. } if values.is_empty() => {
                    builder.push(" AND FALSE");
                }
                Clause::In { field, values } => {
                    builder.push(" AND (");
                    let mut alternatives = builder.separated(" OR ");
                    for value in values {
                        alternatives.push("data @> ");
                        alternatives.push_bind_unseparated(json!({ field.as_str(): value }));
                    }
                    builder.push(")");
                }
            }
        }
        builder.push(" ORDER BY id");

        let rows: Vec<(String, Value)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(on(collection, StoreOperation::List))?;
        rows.into_iter()
            .map(|(id, data)| {
                let key = DocumentKey::new(collection, id);
                let document = into_document(&key, data)?;
                Ok((key, document))
            })
            .collect()
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn get(&self, key: &DocumentKey) -> BoxFuture<'_, Result<Option<Document>, StoreError>> {
        let key = key.clone();
        Box::pin(async move { fetch(&self.pool, &key).await })
    }

    fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<Vec<(DocumentKey, Document)>, StoreError>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        Box::pin(async move { self.select(&collection, &filter).await })
    }

    fn create(
        &self,
        collection: &str,
        document: Document,
    ) -> BoxFuture<'_, Result<DocumentKey, StoreError>> {
        let key = DocumentKey::new(collection, Uuid::new_v4().to_string());
        Box::pin(async move {
            let write = WriteOp::Set {
                key: key.clone(),
                document,
            };
            self.commit(std::slice::from_ref(&write))
                .await
                .map_err(|error| match error {
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
        Box::pin(async move { self.commit(&[write]).await })
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
        Box::pin(async move { self.commit(&[write]).await })
    }

    fn delete(&self, key: &DocumentKey) -> BoxFuture<'_, Result<(), StoreError>> {
        let write = WriteOp::Delete { key: key.clone() };
        Box::pin(async move { self.commit(&[write]).await })
    }

    fn batch(&self, writes: Vec<WriteOp>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.commit(&writes).await })
    }

    fn transact(
        &self,
        reads: Vec<DocumentKey>,
        body: TransactionBody,
    ) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(self.run_transaction(reads, body))
    }

    fn subscribe(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> BoxFuture<'_, Result<DocumentStream, StoreError>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        Box::pin(self.open_subscription(collection, filter))
    }
}

// ============================================================================
// Row helpers
// ============================================================================

async fn lock(conn: &mut PgConnection, key: &DocumentKey) -> Result<(), StoreError> {
    let path = key.path();
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&path)
        .execute(conn)
        .await
        .map_err(on(&path, StoreOperation::Write))?;
    Ok(())
}

async fn fetch<'e, E>(executor: E, key: &DocumentKey) -> Result<Option<Document>, StoreError>
where
    E: PgExecutor<'e>,
{
    let path = key.path();
    let data: Option<Value> =
        sqlx::query_scalar("SELECT data FROM documents WHERE collection = $1 AND id = $2")
            .bind(key.collection())
            .bind(key.id())
            .fetch_optional(executor)
            .await
            .map_err(on(&path, StoreOperation::Get))?;
    data.map(|data| into_document(key, data)).transpose()
}

fn into_document(key: &DocumentKey, data: Value) -> Result<Document, StoreError> {
    match data {
        Value::Object(document) => Ok(document),
        other => Err(StoreError::Malformed {
            path: key.path(),
            reason: format!("expected a JSON object, found {other}"),
        }),
    }
}

/// Lock, resolve and persist `writes`, notifying subscribers on commit.
async fn apply_writes(
    conn: &mut PgConnection,
    writes: &[WriteOp],
    channel: &str,
) -> Result<(), StoreError> {
    let mut keys: Vec<&DocumentKey> = writes.iter().map(WriteOp::key).collect();
    keys.sort();
    keys.dedup();
    for key in &keys {
        lock(conn, key).await?;
    }

    let mut staged: BTreeMap<DocumentKey, Option<Document>> = BTreeMap::new();
    for write in writes {
        let key = write.key();
        let current = match staged.get(key) {
            Some(document) => document.clone(),
            None => fetch(&mut *conn, key).await?,
        };
        staged.insert(key.clone(), write.resolve(current.as_ref())?);
    }

    for (key, document) in staged {
        let path = key.path();
        match document {
            Some(document) => {
                sqlx::query(
                    r"
                    INSERT INTO documents (collection, id, data)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (collection, id) DO UPDATE
                    SET data = EXCLUDED.data, updated_at = now()
                    ",
                )
                .bind(key.collection())
                .bind(key.id())
                .bind(Value::Object(document))
                .execute(&mut *conn)
                .await
                .map_err(on(&path, StoreOperation::Write))?;
            }
            None => {
                sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                    .bind(key.collection())
                    .bind(key.id())
                    .execute(&mut *conn)
                    .await
                    .map_err(on(&path, StoreOperation::Delete))?;
            }
        }

        // Delivered only if the surrounding transaction commits.
        let notice = serde_json::to_string(&ChangeNotice {
            collection: key.collection().to_string(),
            id: key.id().to_string(),
        })
        .map_err(|error| StoreError::Backend(error.to_string()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(notice)
            .execute(&mut *conn)
            .await
            .map_err(on(&path, StoreOperation::Write))?;
    }
    Ok(())
}

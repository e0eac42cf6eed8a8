//! `PostgreSQL` document store for the placement registration engine.
//!
//! Implements [`DocumentStore`](placement_core::DocumentStore) over a single
//! JSONB `documents` table:
//!
//! - Transactions serialized per document with advisory locks
//! - Atomic batch writes
//! - Change subscriptions over `LISTEN`/`NOTIFY`
//! - Embedded schema migrations
//!
//! # Example
//!
//! ```ignore
//! use placement_postgres::{PostgresConfig, PostgresDocumentStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDocumentStore::connect(&PostgresConfig::from_env()?).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod error;
pub mod store;

pub use config::{PostgresConfig, PostgresConfigError};
pub use store::PostgresDocumentStore;

/// Apply the embedded migrations to `pool`.
///
/// # Errors
///
/// Returns the migrator's error if a migration fails or the recorded
/// history diverges from the embedded one.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Document store migrations applied");
    Ok(())
}

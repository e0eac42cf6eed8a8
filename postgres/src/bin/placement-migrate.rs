//! Applies the document store schema to `DATABASE_URL`.
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/placement cargo run --bin placement-migrate
//! ```

use anyhow::Context;
use placement_postgres::{PostgresConfig, PostgresDocumentStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PostgresConfig::from_env().context("Invalid database configuration")?;
    let store = PostgresDocumentStore::connect(&config)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Migration failed")?;

    tracing::info!("Database is up to date");
    Ok(())
}

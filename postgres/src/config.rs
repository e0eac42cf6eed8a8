//! Connection pool configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while configuring or connecting.
#[derive(Error, Debug)]
pub enum PostgresConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// `DATABASE_URL` is not set.
    #[error("DATABASE_URL is not set")]
    MissingUrl,

    /// The pool could not connect.
    #[error("Failed to connect: {0}")]
    Connect(#[from] sqlx::Error),
}

/// `PostgreSQL` document store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection string
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,
    /// `LISTEN`/`NOTIFY` channel carrying committed changes
    pub notify_channel: String,
}

impl PostgresConfig {
    /// Default notification channel.
    pub const DEFAULT_CHANNEL: &'static str = "placement_documents";

    /// Configuration for `database_url` with default pool settings.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout_secs: 5,
            notify_channel: String::from(Self::DEFAULT_CHANNEL),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | required |
    /// | `PLACEMENT_PG_MAX_CONNECTIONS` | 10 |
    /// | `PLACEMENT_PG_ACQUIRE_TIMEOUT_SECS` | 5 |
    /// | `PLACEMENT_PG_NOTIFY_CHANNEL` | `placement_documents` |
    ///
    /// # Errors
    ///
    /// [`PostgresConfigError::MissingUrl`] without `DATABASE_URL`,
    /// [`PostgresConfigError::Invalid`] for an unparsable number.
    pub fn from_env() -> Result<Self, PostgresConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| PostgresConfigError::MissingUrl)?;
        let defaults = Self::new(database_url);
        Ok(Self {
            max_connections: parse_var("PLACEMENT_PG_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout_secs: parse_var(
                "PLACEMENT_PG_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout_secs,
            )?,
            notify_channel: env::var("PLACEMENT_PG_NOTIFY_CHANNEL")
                .unwrap_or_else(|_| defaults.notify_channel.clone()),
            ..defaults
        })
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// [`PostgresConfigError::Connect`] if the database cannot be reached.
    pub async fn connect(&self) -> Result<PgPool, PostgresConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .connect(&self.database_url)
            .await?;
        tracing::info!(max_connections = self.max_connections, "Connected to PostgreSQL");
        Ok(pool)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, PostgresConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| PostgresConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_pool_defaults() {
        let config = PostgresConfig::new("postgres://localhost/placement");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 5);
        assert_eq!(config.notify_channel, "placement_documents");
    }

    #[test]
    fn unset_variable_falls_back() {
        assert!(matches!(
            parse_var("PLACEMENT_PG_TEST_UNSET", 3u32),
            Ok(3)
        ));
    }
}

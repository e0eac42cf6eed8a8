//! Mapping `sqlx` failures onto [`StoreError`].

use placement_core::document_store::{StoreError, StoreOperation};

/// SQLSTATE codes the store distinguishes.
mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
}

/// Classify a `sqlx` error for the operation on `path`.
///
/// Serialization failures and deadlocks become [`StoreError::Conflict`] so
/// the engine re-plans; privilege errors become
/// [`StoreError::PermissionDenied`]; pool and I/O trouble is
/// [`StoreError::Unavailable`].
pub(crate) fn store_error(error: &sqlx::Error, path: &str, operation: StoreOperation) -> StoreError {
    match error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(
                sqlstate::SERIALIZATION_FAILURE
                | sqlstate::DEADLOCK_DETECTED
                | sqlstate::LOCK_NOT_AVAILABLE,
            ) => StoreError::Conflict(db.message().to_string()),
            Some(sqlstate::INSUFFICIENT_PRIVILEGE) => StoreError::PermissionDenied {
                path: path.to_string(),
                operation,
            },
            _ => StoreError::Backend(db.message().to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Malformed {
            path: path.to_string(),
            reason: error.to_string(),
        },
        _ => StoreError::Backend(error.to_string()),
    }
}

/// Shorthand for `map_err` closures.
pub(crate) fn on<'a>(
    path: &'a str,
    operation: StoreOperation,
) -> impl Fn(sqlx::Error) -> StoreError + 'a {
    move |error| {
        let mapped = store_error(&error, path, operation);
        metrics::counter!("placement.postgres.errors", "operation" => operation.as_str())
            .increment(1);
        tracing::debug!(path, %operation, error = %error, "PostgreSQL operation failed");
        mapped
    }
}

//! Out-of-band diagnostics for store failures.
//!
//! Every store failure the engine hits (never a capacity-full outcome) is
//! reported as a [`StoreFailureEvent`] carrying the path, the operation and
//! the payload that was being written. Permission-denial telemetry hangs off
//! this channel.

use crate::document_store::{StoreError, StoreOperation};
use serde::Serialize;
use serde_json::Value;

/// Structured description of a failed store operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFailureEvent {
    /// Document or collection path
    pub path: String,
    /// Operation that failed
    pub operation: StoreOperation,
    /// Payload the operation tried to write
    pub attempted_data: Option<Value>,
    /// Error text
    pub error: String,
    /// Whether the store refused the operation for lack of permission
    pub permission_denied: bool,
}

impl StoreFailureEvent {
    /// Build an event from a store error.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        operation: StoreOperation,
        attempted_data: Option<Value>,
        error: &StoreError,
    ) -> Self {
        Self {
            path: path.into(),
            operation,
            attempted_data,
            error: error.to_string(),
            permission_denied: matches!(error, StoreError::PermissionDenied { .. }),
        }
    }
}

/// Receiver of store failure events.
pub trait DiagnosticSink: Send + Sync {
    /// Record one failure. Must not block.
    fn emit(&self, event: StoreFailureEvent);
}

/// Sink that logs failures through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&self, event: StoreFailureEvent) {
        let attempted = event
            .attempted_data
            .as_ref()
            .map_or_else(String::new, Value::to_string);
        if event.permission_denied {
            tracing::error!(
                path = %event.path,
                operation = %event.operation,
                attempted_data = %attempted,
                error = %event.error,
                "Store permission denied"
            );
        } else {
            tracing::error!(
                path = %event.path,
                operation = %event.operation,
                attempted_data = %attempted,
                error = %event.error,
                "Store operation failed"
            );
        }
    }
}

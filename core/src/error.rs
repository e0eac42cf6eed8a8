//! Errors returned by registration operations.
//!
//! Capacity-full and lock violations are *outcomes* (see
//! [`Submission`](crate::intent::Submission)), not errors. What remains here
//! are hard failures: unresolvable references, invalid requests, refused
//! transitions and store failures.

use crate::document_store::{StoreError, StoreOperation};
use crate::status::TransitionError;
use thiserror::Error;

/// Failure of an engine operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// A referenced registration, company, position or record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is inconsistent with the referenced data.
    #[error("Invalid request: {0}")]
    InvalidIntent(String),

    /// The state machine refused a staff action.
    #[error("Registration {registration_id}: {source}")]
    Transition {
        /// Registration the action targeted
        registration_id: String,
        /// Refusal reason
        #[source]
        source: TransitionError,
    },

    /// The store failed; the attempted payload was sent to diagnostics.
    #[error("Store {operation} failed on {path}: {source}")]
    StoreWriteFailed {
        /// Document or collection path
        path: String,
        /// Operation that failed
        operation: StoreOperation,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// The registration kept changing underneath the operation.
    #[error("Registration {0} changed concurrently too many times")]
    Contended(String),
}

impl RegistrationError {
    /// Message shown to the user. Store failures stay generic; details go to diagnostics.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(what) => format!("{what} no longer exists."),
            Self::InvalidIntent(reason) => reason.clone(),
            Self::Transition { source, .. } => source.to_string(),
            Self::StoreWriteFailed { .. } | Self::Contended(_) => {
                String::from("Could not complete the request, please try again.")
            }
        }
    }
}

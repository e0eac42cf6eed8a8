//! # Placement Core
//!
//! Domain types and contracts for internship placement registration.
//!
//! This crate holds everything that does not perform I/O: the registration
//! document model, the two-track status state machine, the capacity ledger,
//! student intents and their outcomes, and the [`DocumentStore`] contract the
//! runtime engine is written against.
//!
//! ## Core Concepts
//!
//! - **Registration**: one student's record for one session ([`DefenseRegistration`])
//! - **Ledger**: one occupancy counter per `(session, position)` ([`PositionOccupancy`])
//! - **Intent**: what a student submits ([`SubmissionRequest`])
//! - **Submission**: the expected outcome of an intent ([`Submission`])
//! - **Reducer**: pure staff transitions over a registration ([`StatusReducer`])
//! - **Environment**: injected dependencies such as the [`Clock`]
//!
//! ## Architecture Principles
//!
//! - Functional core, imperative shell: reducers and transaction bodies are pure
//! - All persistence goes through an injected `Arc<dyn DocumentStore>`
//! - Capacity-full and lock violations are outcomes, never panics or errors
//!
//! ## Example
//!
//! ```rust
//! use placement_core::{PositionOccupancy, LedgerKey};
//!
//! let key = LedgerKey::new("s1", "p1");
//! let mut entry = PositionOccupancy::empty(&key);
//! assert_eq!(entry.try_reserve(1), Ok(1));
//! assert!(entry.try_reserve(1).is_err());
//! assert_eq!(key.document_id(), "s1_p1");
//! ```

pub mod catalog;
pub mod diagnostics;
pub mod document_store;
pub mod error;
pub mod intent;
pub mod ledger;
pub mod projection;
pub mod registration;
pub mod retry;
pub mod status;

// Re-export commonly used types
pub use catalog::{
    CollectionNames, EarlyInternship, InternshipCompany, InternshipPosition, StudentRef,
    SubCommittee, SupervisorRef,
};
pub use chrono::{DateTime, Utc};
pub use diagnostics::{DiagnosticSink, StoreFailureEvent, TracingDiagnostics};
pub use document_store::{
    Document, DocumentChange, DocumentKey, DocumentStore, FieldPatch, Filter, StoreError,
    StoreOperation, TransactionAbort, TransactionError, WriteOp,
};
pub use error::RegistrationError;
pub use intent::{DocumentLinks, Placement, PlacementSource, Submission, SubmissionRequest};
pub use ledger::{CapacityFull, LedgerKey, PositionOccupancy};
pub use projection::{InternshipStage, RegistrationFilter, StatusSummary, StatusView};
pub use registration::{DefenseRegistration, ExemptionDecision, PlacementSnapshot};
pub use status::{
    ApprovalStatus, ReportType, StaffAction, StatusEnvironment, StatusReducer, TrackStatus,
    TransitionError,
};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → Result`.
/// They validate the action, mutate state in place on success and leave it
/// untouched on failure. Persisting the result is the runtime's job.
pub mod reducer {
    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    /// - `Error`: Why an action was refused
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for StatusReducer {
    ///     type State = DefenseRegistration;
    ///     type Action = StaffAction;
    ///     type Environment = StatusEnvironment;
    ///     type Error = TransitionError;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut DefenseRegistration,
    ///         action: StaffAction,
    ///         env: &StatusEnvironment,
    ///     ) -> Result<(), TransitionError> {
    ///         // Business logic here
    ///         Ok(())
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// The error type for refused actions
        type Error;

        /// Reduce an action into state changes
        ///
        /// # Errors
        ///
        /// Returns `Self::Error` when the action is not permitted from the
        /// current state. Implementations must not have mutated `state` in
        /// that case.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Result<(), Self::Error>;
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use environment::{Clock, SystemClock};
pub use reducer::Reducer;

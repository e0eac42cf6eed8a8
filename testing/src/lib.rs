//! # Placement Testing
//!
//! Testing utilities and helpers for the placement registration engine.
//!
//! This crate provides:
//! - [`InMemoryDocumentStore`]: deterministic store with failure injection
//! - [`RecordingDiagnostics`]: captures store failure events
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - [`ReducerTest`]: Given-When-Then reducer assertions
//! - Fixture builders and proptest strategies for domain types
//!
//! ## Example
//!
//! ```ignore
//! use placement_testing::{InMemoryDocumentStore, test_clock};
//!
//! #[tokio::test]
//! async fn test_submission() {
//!     let store = Arc::new(InMemoryDocumentStore::new());
//!     let engine = RegistrationEngine::new(EngineEnvironment::new(store.clone())
//!         .with_clock(Arc::new(test_clock())));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use placement_core::environment::Clock;

pub mod fixtures;
pub mod memory_store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use placement_core::diagnostics::{DiagnosticSink, StoreFailureEvent};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use placement_testing::mocks::FixedClock;
    /// use placement_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Diagnostic sink that keeps every event for later assertions.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDiagnostics {
        events: Arc<Mutex<Vec<StoreFailureEvent>>>,
    }

    impl RecordingDiagnostics {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Events recorded so far
        #[must_use]
        pub fn events(&self) -> Vec<StoreFailureEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of events recorded
        #[must_use]
        pub fn len(&self) -> usize {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Whether nothing was recorded
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl DiagnosticSink for RecordingDiagnostics {
        fn emit(&self, event: StoreFailureEvent) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honors `RUST_LOG`; safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use placement_core::status::{ApprovalStatus, ReportType, StaffAction, TrackStatus};
    use proptest::prelude::*;

    /// Any track status.
    pub fn track_status() -> impl Strategy<Value = TrackStatus> {
        prop_oneof![
            Just(TrackStatus::Reporting),
            Just(TrackStatus::Exempted),
            Just(TrackStatus::NotYetReporting),
            Just(TrackStatus::NotReporting),
            Just(TrackStatus::Completed),
        ]
    }

    /// Any approval status, including unsubmitted.
    pub fn approval_status() -> impl Strategy<Value = Option<ApprovalStatus>> {
        prop_oneof![
            Just(None),
            Just(Some(ApprovalStatus::Pending)),
            Just(Some(ApprovalStatus::Approved)),
            Just(Some(ApprovalStatus::Rejected)),
        ]
    }

    /// Either track.
    pub fn report_type() -> impl Strategy<Value = ReportType> {
        prop_oneof![Just(ReportType::Graduation), Just(ReportType::Internship)]
    }

    /// Staff actions that only move track or approval state.
    pub fn staff_action() -> impl Strategy<Value = StaffAction> {
        prop_oneof![
            Just(StaffAction::ApproveInternship),
            Just(StaffAction::RejectInternship { reason: None }),
            report_type().prop_map(StaffAction::MarkReporting),
            report_type().prop_map(StaffAction::MarkNotYetReporting),
            report_type().prop_map(StaffAction::MarkCompleted),
            report_type().prop_map(StaffAction::OptOut),
            report_type().prop_map(StaffAction::RevertToReporting),
        ]
    }
}

// Re-export commonly used items
pub use memory_store::InMemoryDocumentStore;
pub use mocks::{FixedClock, RecordingDiagnostics, test_clock};
pub use reducer_test::ReducerTest;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}

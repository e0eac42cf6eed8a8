//! # Placement Runtime
//!
//! The registration engine: everything that writes registrations or the
//! capacity ledger.
//!
//! ## Core Components
//!
//! - **[`RegistrationEngine`]**: submission with atomic capacity reservation,
//!   staff transitions, release on clear/delete/move, enrollment and
//!   sub-committee assignment
//! - **[`EngineEnvironment`]**: injected store, clock and diagnostics sink
//! - **[`EngineConfig`]**: collection names, conflict budget and enrollment defaults
//! - **[`metrics`]**: Prometheus counters for submissions, ledger movements and staff actions
//!
//! ## Example
//!
//! ```ignore
//! use placement_runtime::{EngineEnvironment, RegistrationEngine};
//! use placement_core::intent::{Placement, SubmissionRequest};
//!
//! let engine = RegistrationEngine::new(EngineEnvironment::new(store));
//!
//! let outcome = engine
//!     .submit_internship_registration(
//!         "reg-1",
//!         SubmissionRequest::placement(Placement::FromCatalog {
//!             company_id: "acme".into(),
//!             position_id: Some("backend".into()),
//!         }),
//!     )
//!     .await?;
//!
//! println!("{}", outcome.user_message());
//! ```

/// Round-robin sub-committee assignment
pub mod assignment;

/// Engine configuration from the environment
pub mod config;

/// Registration engine and its environment
pub mod engine;

/// Enrolling students into sessions
pub mod enrollment;

/// Prometheus metrics for observability
pub mod metrics;

mod reservation;

pub use assignment::assign_round_robin;
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineEnvironment, RegistrationEngine, SessionStream, SessionUpdate};
pub use enrollment::{EnrollmentDefaults, EnrollmentReport};

//! Engine configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::enrollment::EnrollmentDefaults;
use placement_core::catalog::CollectionNames;
use placement_core::retry::RetryPolicy;
use placement_core::status::TrackStatus;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// Registration engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Collection names
    pub collections: CollectionNames,
    /// Re-plan budget for transactions that lose a race
    pub conflict_max_attempts: usize,
    /// First re-plan delay in milliseconds
    pub conflict_base_delay_ms: u64,
    /// Cap on a single re-plan delay in milliseconds
    pub conflict_max_delay_ms: u64,
    /// Initial statuses for newly enrolled students
    pub enrollment: EnrollmentDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collections: CollectionNames::default(),
            conflict_max_attempts: 5,
            conflict_base_delay_ms: 10,
            conflict_max_delay_ms: 500,
            enrollment: EnrollmentDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PLACEMENT_REGISTRATIONS_COLLECTION` | `defenseRegistrations` |
    /// | `PLACEMENT_COMPANIES_COLLECTION` | `internshipCompanies` |
    /// | `PLACEMENT_OCCUPANCY_COLLECTION` | `positionOccupancy` |
    /// | `PLACEMENT_EARLY_INTERNSHIPS_COLLECTION` | `earlyInternships` |
    /// | `PLACEMENT_SUB_COMMITTEES_COLLECTION` | `defenseSubCommittees` |
    /// | `PLACEMENT_CONFLICT_MAX_ATTEMPTS` | 5 |
    /// | `PLACEMENT_CONFLICT_BASE_DELAY_MS` | 10 |
    /// | `PLACEMENT_CONFLICT_MAX_DELAY_MS` | 500 |
    /// | `PLACEMENT_DEFAULT_GRADUATION_STATUS` | `reporting` |
    /// | `PLACEMENT_DEFAULT_INTERNSHIP_STATUS` | `reporting` |
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let names = defaults.collections;
        Ok(Self {
            collections: CollectionNames {
                registrations: env::var("PLACEMENT_REGISTRATIONS_COLLECTION")
                    .unwrap_or(names.registrations),
                companies: env::var("PLACEMENT_COMPANIES_COLLECTION").unwrap_or(names.companies),
                occupancy: env::var("PLACEMENT_OCCUPANCY_COLLECTION").unwrap_or(names.occupancy),
                early_internships: env::var("PLACEMENT_EARLY_INTERNSHIPS_COLLECTION")
                    .unwrap_or(names.early_internships),
                sub_committees: env::var("PLACEMENT_SUB_COMMITTEES_COLLECTION")
                    .unwrap_or(names.sub_committees),
            },
            conflict_max_attempts: parse_var(
                "PLACEMENT_CONFLICT_MAX_ATTEMPTS",
                defaults.conflict_max_attempts,
            )?,
            conflict_base_delay_ms: parse_var(
                "PLACEMENT_CONFLICT_BASE_DELAY_MS",
                defaults.conflict_base_delay_ms,
            )?,
            conflict_max_delay_ms: parse_var(
                "PLACEMENT_CONFLICT_MAX_DELAY_MS",
                defaults.conflict_max_delay_ms,
            )?,
            enrollment: EnrollmentDefaults {
                graduation_status: status_var(
                    "PLACEMENT_DEFAULT_GRADUATION_STATUS",
                    defaults.enrollment.graduation_status,
                )?,
                internship_status: status_var(
                    "PLACEMENT_DEFAULT_INTERNSHIP_STATUS",
                    defaults.enrollment.internship_status,
                )?,
            },
        })
    }

    /// Re-plan policy derived from the conflict settings.
    #[must_use]
    pub fn conflict_retry(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.conflict_max_attempts)
            .base_delay(Duration::from_millis(self.conflict_base_delay_ms))
            .max_delay(Duration::from_millis(self.conflict_max_delay_ms))
            .build()
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn status_var(var: &'static str, default: TrackStatus) -> Result<TrackStatus, ConfigError> {
    match env::var(var) {
        Ok(value) => serde_json::from_value(serde_json::Value::String(value.trim().to_string()))
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

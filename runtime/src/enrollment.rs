//! Adding students to a session.

use crate::engine::{RegistrationEngine, describe_writes};
use placement_core::catalog::StudentRef;
use placement_core::document_store::{Filter, StoreOperation, WriteOp, to_document};
use placement_core::error::RegistrationError;
use placement_core::registration::DefenseRegistration;
use placement_core::status::TrackStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Initial track statuses of newly enrolled students.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentDefaults {
    /// Initial graduation status
    pub graduation_status: TrackStatus,
    /// Initial internship status
    pub internship_status: TrackStatus,
}

impl Default for EnrollmentDefaults {
    fn default() -> Self {
        Self {
            graduation_status: TrackStatus::Reporting,
            internship_status: TrackStatus::Reporting,
        }
    }
}

/// Result of [`RegistrationEngine::enroll_students`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnrollmentReport {
    /// Ids of the registrations created, in input order
    pub created: Vec<String>,
    /// Students already in the session (or listed twice)
    pub skipped: Vec<StudentRef>,
}

impl RegistrationEngine {
    /// Create one registration per student not yet enrolled in the session.
    ///
    /// All new registrations are written in one batch.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::InvalidIntent`] for a blank session id, or a store failure.
    #[tracing::instrument(skip(self, students), fields(students = students.len()), name = "enroll_students")]
    pub async fn enroll_students(
        &self,
        session_id: &str,
        students: &[StudentRef],
    ) -> Result<EnrollmentReport, RegistrationError> {
        if session_id.trim().is_empty() {
            return Err(RegistrationError::InvalidIntent(String::from(
                "A session is required.",
            )));
        }

        let mut enrolled: HashSet<String> = self
            .query_registrations(&Filter::all().eq("sessionId", session_id))
            .await?
            .into_iter()
            .map(|registration| registration.student_doc_id)
            .collect();

        let defaults = self.config.enrollment;
        let now = self.env.clock.now();
        let mut report = EnrollmentReport::default();
        let mut writes = Vec::new();

        for student in students {
            if !enrolled.insert(student.doc_id.clone()) {
                report.skipped.push(student.clone());
                continue;
            }
            let id = Uuid::new_v4().to_string();
            let registration = DefenseRegistration {
                id: id.clone(),
                session_id: session_id.to_string(),
                student_doc_id: student.doc_id.clone(),
                student_id: student.student_id.clone(),
                student_name: student.name.clone(),
                class_name: student.class_name.clone(),
                created_at: Some(now),
                graduation_status: Some(defaults.graduation_status),
                internship_status: Some(defaults.internship_status),
                ..DefenseRegistration::default()
            };
            let key = self.registration_key(&id);
            let document = to_document(&registration).map_err(|source| {
                self.store_failure(key.path(), StoreOperation::Create, None, source)
            })?;
            writes.push(WriteOp::Set { key, document });
            report.created.push(id);
        }

        if !writes.is_empty() {
            let attempted = describe_writes(&writes);
            self.env.store.batch(writes).await.map_err(|source| {
                self.store_failure(
                    self.config.collections.registrations.clone(),
                    StoreOperation::Write,
                    Some(attempted),
                    source,
                )
            })?;
        }

        tracing::info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            "Students enrolled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_both_tracks_reporting() {
        let defaults = EnrollmentDefaults::default();
        assert_eq!(defaults.graduation_status, TrackStatus::Reporting);
        assert_eq!(defaults.internship_status, TrackStatus::Reporting);
    }

    #[test]
    fn defaults_deserialize_from_stored_names() {
        let defaults: EnrollmentDefaults = serde_json::from_value(serde_json::json!({
            "graduation_status": "not_reporting",
            "internship_status": "reporting",
        }))
        .unwrap_or_default();
        assert_eq!(defaults.graduation_status, TrackStatus::NotReporting);
    }
}

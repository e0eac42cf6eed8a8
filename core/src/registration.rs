//! `DefenseRegistration`: one student's participation record for one session.
//!
//! Field names follow the stored document layout (`camelCase`, with the
//! company/position snapshot under `internship_*` keys). Snapshot fields are a
//! one-way copy taken at submission time; they are not refreshed when the
//! catalog changes afterwards.

use crate::catalog::SupervisorRef;
use crate::intent::{DocumentLinks, Placement, PlacementSource};
use crate::ledger::LedgerKey;
use crate::status::{ApprovalStatus, ReportType, TrackStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Staff exemption decision for one track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExemptionDecision {
    /// Official decision number
    pub decision_number: String,
    /// Date the decision was issued
    pub decision_date: Option<DateTime<Utc>>,
    /// Free-text note
    pub note: Option<String>,
}

impl ExemptionDecision {
    /// Decision with only a number.
    #[must_use]
    pub fn numbered(decision_number: impl Into<String>) -> Self {
        Self {
            decision_number: decision_number.into(),
            decision_date: None,
            note: None,
        }
    }
}

/// Company/position/supervisor snapshot written by a successful submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementSnapshot {
    /// Catalog company id (catalog placements only)
    pub company_id: Option<String>,
    /// Company name
    pub company_name: String,
    /// Company address
    pub company_address: Option<String>,
    /// Contact person
    pub contact_name: Option<String>,
    /// Contact phone
    pub contact_phone: Option<String>,
    /// Reserved position id (capacity-limited placements only)
    pub position_id: Option<String>,
    /// Reserved position title
    pub position_title: Option<String>,
    /// Auto-assigned internship supervisor
    pub supervisor: Option<SupervisorRef>,
    /// Path the placement came through
    pub source: Option<PlacementSource>,
    /// Source record for early-internship placements
    pub early_internship_id: Option<String>,
}

/// Stored registration document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefenseRegistration {
    /// Document id (not stored in the document body)
    #[serde(skip)]
    pub id: String,
    /// Session the registration belongs to
    pub session_id: String,
    /// Student document id
    pub student_doc_id: String,
    /// Human-readable student code
    pub student_id: String,
    /// Student full name
    pub student_name: String,
    /// Student class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    // ---- graduation track ----
    /// Graduation track status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graduation_status: Option<TrackStatus>,
    /// Thesis supervisor id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    /// Thesis supervisor name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
    /// Thesis title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_title: Option<String>,
    /// Graduation exemption decision number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemption_decision_number: Option<String>,
    /// Graduation exemption decision date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemption_decision_date: Option<DateTime<Utc>>,
    /// Graduation exemption note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exemption_note: Option<String>,
    /// Assigned grading sub-committee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_committee_id: Option<String>,

    // ---- internship track ----
    /// Internship track status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_status: Option<TrackStatus>,
    /// Approval gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_registration_status: Option<ApprovalStatus>,
    /// Catalog company id snapshot
    #[serde(rename = "internship_companyId", default, skip_serializing_if = "Option::is_none")]
    pub internship_company_id: Option<String>,
    /// Company name snapshot
    #[serde(rename = "internship_companyName", default, skip_serializing_if = "Option::is_none")]
    pub internship_company_name: Option<String>,
    /// Company address snapshot
    #[serde(
        rename = "internship_companyAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internship_company_address: Option<String>,
    /// Contact person snapshot
    #[serde(rename = "internship_contactName", default, skip_serializing_if = "Option::is_none")]
    pub internship_contact_name: Option<String>,
    /// Contact phone snapshot
    #[serde(rename = "internship_contactPhone", default, skip_serializing_if = "Option::is_none")]
    pub internship_contact_phone: Option<String>,
    /// Reserved position id; non-empty only while a ledger unit is held
    #[serde(rename = "internship_positionId", default, skip_serializing_if = "Option::is_none")]
    pub internship_position_id: Option<String>,
    /// Reserved position title snapshot
    #[serde(
        rename = "internship_positionTitle",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internship_position_title: Option<String>,
    /// Placement path
    #[serde(
        rename = "internship_placementSource",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internship_placement_source: Option<PlacementSource>,
    /// Early internship the placement was copied from
    #[serde(
        rename = "internship_earlyInternshipId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internship_early_internship_id: Option<String>,
    /// Internship supervisor id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_supervisor_id: Option<String>,
    /// Internship supervisor name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_supervisor_name: Option<String>,
    /// Staff rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_rejection_reason: Option<String>,
    /// Last student submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_submitted_at: Option<DateTime<Utc>>,
    /// Last staff approval decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_reviewed_at: Option<DateTime<Utc>>,
    /// Internship exemption decision number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_exemption_decision_number: Option<String>,
    /// Internship exemption decision date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_exemption_decision_date: Option<DateTime<Utc>>,
    /// Internship exemption note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_exemption_note: Option<String>,
    /// Signed registration form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_registration_form_link: Option<String>,
    /// Company acceptance letter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_acceptance_letter_link: Option<String>,
    /// Student commitment form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_commitment_form_link: Option<String>,
    /// Final internship report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internship_report_link: Option<String>,
}

impl DefenseRegistration {
    /// Whether placement fields are frozen (`pending` or `approved`).
    #[must_use]
    pub fn internship_locked(&self) -> bool {
        self.internship_registration_status
            .is_some_and(|status| status.locks_placement())
    }

    /// Ledger entry this registration holds a unit of, if any.
    #[must_use]
    pub fn held_reservation(&self) -> Option<LedgerKey> {
        self.internship_position_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|position_id| LedgerKey::new(self.session_id.clone(), position_id))
    }

    /// Status of a track; an unset track reads as `not_reporting`.
    #[must_use]
    pub fn track_status(&self, track: ReportType) -> TrackStatus {
        let status = match track {
            ReportType::Graduation => self.graduation_status,
            ReportType::Internship => self.internship_status,
        };
        status.unwrap_or(TrackStatus::NotReporting)
    }

    /// Overwrite a track status.
    pub const fn set_track_status(&mut self, track: ReportType, status: TrackStatus) {
        match track {
            ReportType::Graduation => self.graduation_status = Some(status),
            ReportType::Internship => self.internship_status = Some(status),
        }
    }

    /// Exemption decision recorded on a track.
    #[must_use]
    pub fn exemption(&self, track: ReportType) -> Option<ExemptionDecision> {
        let (number, date, note) = match track {
            ReportType::Graduation => (
                &self.exemption_decision_number,
                self.exemption_decision_date,
                &self.exemption_note,
            ),
            ReportType::Internship => (
                &self.internship_exemption_decision_number,
                self.internship_exemption_decision_date,
                &self.internship_exemption_note,
            ),
        };
        number.as_ref().map(|decision_number| ExemptionDecision {
            decision_number: decision_number.clone(),
            decision_date: date,
            note: note.clone(),
        })
    }

    /// Record or clear the exemption decision on a track.
    pub fn set_exemption(&mut self, track: ReportType, decision: Option<ExemptionDecision>) {
        let (number, date, note) = match decision {
            Some(d) => (Some(d.decision_number), d.decision_date, d.note),
            None => (None, None, None),
        };
        match track {
            ReportType::Graduation => {
                self.exemption_decision_number = number;
                self.exemption_decision_date = date;
                self.exemption_note = note;
            }
            ReportType::Internship => {
                self.internship_exemption_decision_number = number;
                self.internship_exemption_decision_date = date;
                self.internship_exemption_note = note;
            }
        }
    }

    /// Set or clear the supervisor snapshot of a track.
    pub fn set_supervisor(&mut self, track: ReportType, supervisor: Option<SupervisorRef>) {
        let (id, name) = supervisor.map_or((None, None), |s| (Some(s.id), Some(s.name)));
        match track {
            ReportType::Graduation => {
                self.supervisor_id = id;
                self.supervisor_name = name;
            }
            ReportType::Internship => {
                self.internship_supervisor_id = id;
                self.internship_supervisor_name = name;
            }
        }
    }

    /// Whether `placement` is the one already recorded on this registration.
    #[must_use]
    pub fn holds_placement(&self, placement: &Placement) -> bool {
        match placement {
            Placement::FromCatalog {
                company_id,
                position_id,
            } => {
                self.internship_placement_source == Some(PlacementSource::Catalog)
                    && self.internship_company_id.as_deref() == Some(company_id.as_str())
                    && self.internship_position_id.as_deref().filter(|p| !p.is_empty())
                        == position_id.as_deref()
            }
            Placement::SelfArranged {
                company_name,
                company_address,
                ..
            } => {
                // Stored trimmed, with a blank address stored as absent.
                self.internship_placement_source == Some(PlacementSource::SelfArranged)
                    && self.internship_company_name.as_deref() == Some(company_name.trim())
                    && self.internship_company_address.as_deref().unwrap_or_default()
                        == company_address.trim()
            }
            Placement::FromEarlyInternship {
                early_internship_id,
            } => {
                self.internship_placement_source == Some(PlacementSource::EarlyInternship)
                    && self.internship_early_internship_id.as_deref()
                        == Some(early_internship_id.as_str())
            }
        }
    }

    /// Replace the placement snapshot and move to `pending` / `reporting`.
    pub fn apply_placement(&mut self, snapshot: PlacementSnapshot, submitted_at: DateTime<Utc>) {
        self.internship_company_id = snapshot.company_id;
        self.internship_company_name = Some(snapshot.company_name);
        self.internship_company_address = snapshot.company_address;
        self.internship_contact_name = snapshot.contact_name;
        self.internship_contact_phone = snapshot.contact_phone;
        self.internship_position_id = snapshot.position_id;
        self.internship_position_title = snapshot.position_title;
        self.internship_placement_source = snapshot.source;
        self.internship_early_internship_id = snapshot.early_internship_id;
        self.set_supervisor(ReportType::Internship, snapshot.supervisor);
        self.internship_registration_status = Some(ApprovalStatus::Pending);
        self.internship_status = Some(TrackStatus::Reporting);
        self.internship_rejection_reason = None;
        self.internship_submitted_at = Some(submitted_at);
        self.internship_reviewed_at = None;
    }

    /// Clear every internship placement field, the approval gate and the
    /// document links. The internship track status is left alone.
    pub fn clear_internship_placement(&mut self) {
        self.internship_registration_status = None;
        self.internship_company_id = None;
        self.internship_company_name = None;
        self.internship_company_address = None;
        self.internship_contact_name = None;
        self.internship_contact_phone = None;
        self.internship_position_id = None;
        self.internship_position_title = None;
        self.internship_placement_source = None;
        self.internship_early_internship_id = None;
        self.internship_supervisor_id = None;
        self.internship_supervisor_name = None;
        self.internship_rejection_reason = None;
        self.internship_submitted_at = None;
        self.internship_reviewed_at = None;
        self.internship_registration_form_link = None;
        self.internship_acceptance_letter_link = None;
        self.internship_commitment_form_link = None;
        self.internship_report_link = None;
    }

    /// Currently stored document links.
    #[must_use]
    pub fn links(&self) -> DocumentLinks {
        DocumentLinks {
            registration_form: self.internship_registration_form_link.clone(),
            acceptance_letter: self.internship_acceptance_letter_link.clone(),
            commitment_form: self.internship_commitment_form_link.clone(),
            internship_report: self.internship_report_link.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::to_document;
    use chrono::TimeZone;

    fn registration() -> DefenseRegistration {
        DefenseRegistration {
            id: String::from("r1"),
            session_id: String::from("s1"),
            student_doc_id: String::from("stu-1"),
            student_id: String::from("2011001"),
            student_name: String::from("Nguyen Van A"),
            ..DefenseRegistration::default()
        }
    }

    #[test]
    fn snapshot_fields_use_stored_names() {
        let mut reg = registration();
        reg.internship_company_name = Some(String::from("Acme"));
        reg.internship_position_id = Some(String::from("p1"));
        reg.internship_registration_status = Some(ApprovalStatus::Pending);

        let doc = to_document(&reg).unwrap_or_default();
        assert_eq!(doc.get("internship_companyName"), Some(&serde_json::json!("Acme")));
        assert_eq!(doc.get("internship_positionId"), Some(&serde_json::json!("p1")));
        assert_eq!(
            doc.get("internshipRegistrationStatus"),
            Some(&serde_json::json!("pending"))
        );
        assert_eq!(doc.get("studentDocId"), Some(&serde_json::json!("stu-1")));
        assert!(!doc.contains_key("id"));
        assert!(!doc.contains_key("internship_contactName"));
    }

    #[test]
    fn held_reservation_ignores_empty_position_id() {
        let mut reg = registration();
        assert_eq!(reg.held_reservation(), None);

        reg.internship_position_id = Some(String::new());
        assert_eq!(reg.held_reservation(), None);

        reg.internship_position_id = Some(String::from("p1"));
        assert_eq!(reg.held_reservation(), Some(LedgerKey::new("s1", "p1")));
    }

    #[test]
    fn apply_placement_moves_to_pending_and_reporting() {
        let mut reg = registration();
        reg.internship_registration_status = Some(ApprovalStatus::Rejected);
        reg.internship_rejection_reason = Some(String::from("wrong company"));
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).single().unwrap_or_default();

        reg.apply_placement(
            PlacementSnapshot {
                company_name: String::from("Acme"),
                source: Some(PlacementSource::SelfArranged),
                ..PlacementSnapshot::default()
            },
            at,
        );

        assert_eq!(reg.internship_registration_status, Some(ApprovalStatus::Pending));
        assert_eq!(reg.internship_status, Some(TrackStatus::Reporting));
        assert_eq!(reg.internship_rejection_reason, None);
        assert_eq!(reg.internship_submitted_at, Some(at));
        assert!(reg.internship_locked());
    }

    #[test]
    fn exemption_round_trips_per_track() {
        let mut reg = registration();
        reg.set_exemption(
            ReportType::Graduation,
            Some(ExemptionDecision::numbered("QD-12")),
        );
        assert_eq!(
            reg.exemption(ReportType::Graduation).map(|d| d.decision_number),
            Some(String::from("QD-12"))
        );
        assert_eq!(reg.exemption(ReportType::Internship), None);

        reg.set_exemption(ReportType::Graduation, None);
        assert_eq!(reg.exemption(ReportType::Graduation), None);
    }

    #[test]
    fn holds_placement_compares_catalog_identity() {
        let mut reg = registration();
        reg.internship_placement_source = Some(PlacementSource::Catalog);
        reg.internship_company_id = Some(String::from("c1"));
        reg.internship_position_id = Some(String::from("p1"));

        assert!(reg.holds_placement(&Placement::FromCatalog {
            company_id: String::from("c1"),
            position_id: Some(String::from("p1")),
        }));
        assert!(!reg.holds_placement(&Placement::FromCatalog {
            company_id: String::from("c1"),
            position_id: Some(String::from("p2")),
        }));
        assert!(!reg.holds_placement(&Placement::FromEarlyInternship {
            early_internship_id: String::from("e1"),
        }));
    }

    #[test]
    fn holds_placement_ignores_padding_on_self_arranged_fields() {
        let mut reg = registration();
        reg.internship_placement_source = Some(PlacementSource::SelfArranged);
        reg.internship_company_name = Some(String::from("Acme"));

        let padded = |address: &str| Placement::SelfArranged {
            company_name: String::from("  Acme "),
            company_address: address.to_string(),
            contact_name: String::new(),
            contact_phone: String::new(),
        };
        assert!(reg.holds_placement(&padded("   ")));
        assert!(!reg.holds_placement(&padded("1 Main St")));

        reg.internship_company_address = Some(String::from("1 Main St"));
        assert!(reg.holds_placement(&padded(" 1 Main St ")));
    }
}

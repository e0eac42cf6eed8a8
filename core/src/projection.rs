//! Read-only status projection for staff tables and student dashboards.
//!
//! Maps stored registration fields into display stages, filters and
//! per-status counts. Nothing here writes.

use crate::registration::DefenseRegistration;
use crate::status::{ApprovalStatus, TrackStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a registration stands in the internship approval flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternshipStage {
    /// Nothing submitted yet
    NotRegistered,
    /// Submitted, waiting for staff
    AwaitingApproval,
    /// Refused, may resubmit
    Rejected,
    /// Accepted
    Approved,
}

impl InternshipStage {
    /// Stage derived from the approval gate.
    #[must_use]
    pub const fn from_approval(status: Option<ApprovalStatus>) -> Self {
        match status {
            None => Self::NotRegistered,
            Some(ApprovalStatus::Pending) => Self::AwaitingApproval,
            Some(ApprovalStatus::Rejected) => Self::Rejected,
            Some(ApprovalStatus::Approved) => Self::Approved,
        }
    }
}

/// Projected view of one registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    /// Registration id
    pub registration_id: String,
    /// Student code
    pub student_id: String,
    /// Student name
    pub student_name: String,
    /// Graduation track
    pub graduation: TrackStatus,
    /// Internship track
    pub internship: TrackStatus,
    /// Approval stage
    pub internship_stage: InternshipStage,
    /// Company/position may still be changed by the student
    pub placement_editable: bool,
    /// Supervisor may grade the internship
    pub grading_unlocked: bool,
    /// Company snapshot
    pub company_name: Option<String>,
    /// Position snapshot
    pub position_title: Option<String>,
    /// Assigned sub-committee
    pub sub_committee_id: Option<String>,
}

impl StatusView {
    /// Project a registration.
    #[must_use]
    pub fn from_registration(registration: &DefenseRegistration) -> Self {
        let stage = InternshipStage::from_approval(registration.internship_registration_status);
        Self {
            registration_id: registration.id.clone(),
            student_id: registration.student_id.clone(),
            student_name: registration.student_name.clone(),
            graduation: registration.track_status(crate::status::ReportType::Graduation),
            internship: registration.track_status(crate::status::ReportType::Internship),
            internship_stage: stage,
            placement_editable: !registration.internship_locked(),
            grading_unlocked: stage == InternshipStage::Approved,
            company_name: registration.internship_company_name.clone(),
            position_title: registration.internship_position_title.clone(),
            sub_committee_id: registration.sub_committee_id.clone(),
        }
    }
}

/// Client-side filter used by staff tables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationFilter {
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Graduation status
    pub graduation_status: Option<TrackStatus>,
    /// Internship status
    pub internship_status: Option<TrackStatus>,
    /// Approval stage
    pub internship_stage: Option<InternshipStage>,
    /// Sub-committee
    pub sub_committee_id: Option<String>,
    /// Case-insensitive search over student code, name and company
    pub search: Option<String>,
}

impl RegistrationFilter {
    /// Filter for one session.
    #[must_use]
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Whether a registration passes the filter.
    #[must_use]
    pub fn matches(&self, registration: &DefenseRegistration) -> bool {
        use crate::status::ReportType;

        if self
            .session_id
            .as_ref()
            .is_some_and(|s| *s != registration.session_id)
        {
            return false;
        }
        if self
            .graduation_status
            .is_some_and(|s| s != registration.track_status(ReportType::Graduation))
        {
            return false;
        }
        if self
            .internship_status
            .is_some_and(|s| s != registration.track_status(ReportType::Internship))
        {
            return false;
        }
        if self.internship_stage.is_some_and(|stage| {
            stage != InternshipStage::from_approval(registration.internship_registration_status)
        }) {
            return false;
        }
        if self
            .sub_committee_id
            .as_ref()
            .is_some_and(|c| registration.sub_committee_id.as_ref() != Some(c))
        {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                [
                    Some(registration.student_id.as_str()),
                    Some(registration.student_name.as_str()),
                    registration.internship_company_name.as_deref(),
                ]
                .into_iter()
                .flatten()
                .any(|haystack| haystack.to_lowercase().contains(&needle))
            }
            _ => true,
        }
    }

    /// Registrations passing the filter, ordered by student code.
    #[must_use]
    pub fn apply<'a>(&self, registrations: &'a [DefenseRegistration]) -> Vec<&'a DefenseRegistration> {
        let mut out: Vec<_> = registrations.iter().filter(|r| self.matches(r)).collect();
        out.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        out
    }
}

/// Per-status counts for dashboards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// Registrations counted
    pub total: usize,
    /// Count per graduation status
    pub graduation: BTreeMap<TrackStatus, usize>,
    /// Count per internship status
    pub internship: BTreeMap<TrackStatus, usize>,
    /// Count per approval stage
    pub stages: BTreeMap<InternshipStage, usize>,
}

impl StatusSummary {
    /// Tally a set of registrations.
    #[must_use]
    pub fn from_registrations<'a>(
        registrations: impl IntoIterator<Item = &'a DefenseRegistration>,
    ) -> Self {
        let mut summary = Self::default();
        for registration in registrations {
            let view = StatusView::from_registration(registration);
            summary.total += 1;
            *summary.graduation.entry(view.graduation).or_default() += 1;
            *summary.internship.entry(view.internship).or_default() += 1;
            *summary.stages.entry(view.internship_stage).or_default() += 1;
        }
        summary
    }
}

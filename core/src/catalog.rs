//! Reference entities read by the engine: companies, positions, early
//! internships, students, supervisors and sub-committees.
//!
//! None of these are owned by the registration core. The engine reads them
//! and copies name/id snapshots onto registrations; later catalog edits do
//! not flow back into existing registrations.

use crate::status::ApprovalStatus;
use serde::{Deserialize, Serialize};

/// Placement provider, either an internal department (`isLHU`) or an external company.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternshipCompany {
    /// Document id (not stored in the document body)
    #[serde(skip)]
    pub id: String,
    /// Company name
    pub name: String,
    /// Postal address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Public website
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Rich-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Contact person at the company
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// Contact phone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    /// Contact e-mail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    /// Internal department flag
    #[serde(rename = "isLHU", default)]
    pub is_lhu: bool,
    /// Supervisor who created the company and holds its quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_supervisor_id: Option<String>,
    /// Display name of the owning supervisor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_supervisor_name: Option<String>,
    /// Capacity-limited openings
    #[serde(default)]
    pub positions: Vec<InternshipPosition>,
}

impl InternshipCompany {
    /// Whether registrations must pick a position.
    #[must_use]
    pub fn has_positions(&self) -> bool {
        !self.positions.is_empty()
    }

    /// Position with the given id.
    #[must_use]
    pub fn position(&self, position_id: &str) -> Option<&InternshipPosition> {
        self.positions.iter().find(|p| p.id == position_id)
    }

    /// The company's school-side supervisor, if recorded.
    #[must_use]
    pub fn owner_supervisor(&self) -> Option<SupervisorRef> {
        SupervisorRef::from_parts(
            self.owner_supervisor_id.as_deref(),
            self.owner_supervisor_name.as_deref(),
        )
    }
}

/// Named opening inside a company. `quantity` is the per-session ceiling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternshipPosition {
    /// Position id, unique within the company
    pub id: String,
    /// Title shown to students
    pub title: String,
    /// Maximum concurrent reservations per session
    pub quantity: u32,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Supervisor for internal positions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    /// Display name of the supervisor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
}

impl InternshipPosition {
    /// Supervisor attached to the position, if recorded.
    #[must_use]
    pub fn supervisor(&self) -> Option<SupervisorRef> {
        SupervisorRef::from_parts(self.supervisor_id.as_deref(), self.supervisor_name.as_deref())
    }
}

/// Internship completed before the formal registration window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyInternship {
    /// Document id
    #[serde(skip)]
    pub id: String,
    /// Student the record belongs to
    pub student_doc_id: String,
    /// Host company name
    pub company_name: String,
    /// Host company address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_address: Option<String>,
    /// Supervising staff member id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    /// Supervising staff member name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
    /// Review outcome
    pub status: ApprovalStatus,
}

impl EarlyInternship {
    /// Supervisor recorded on the early internship.
    #[must_use]
    pub fn supervisor(&self) -> Option<SupervisorRef> {
        SupervisorRef::from_parts(self.supervisor_id.as_deref(), self.supervisor_name.as_deref())
    }
}

/// Identity snapshot of a supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupervisorRef {
    /// Supervisor document id
    pub id: String,
    /// Display name
    pub name: String,
}

impl SupervisorRef {
    /// Create a snapshot.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Build from optional stored parts; an id is required.
    #[must_use]
    pub fn from_parts(id: Option<&str>, name: Option<&str>) -> Option<Self> {
        match id {
            Some(id) if !id.is_empty() => Some(Self::new(id, name.unwrap_or_default())),
            _ => None,
        }
    }
}

/// Student being enrolled into a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    /// Student document id
    pub doc_id: String,
    /// Human-readable student code
    pub student_id: String,
    /// Full name
    pub name: String,
    /// Class the student belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl StudentRef {
    /// Create a student reference.
    #[must_use]
    pub fn new(
        doc_id: impl Into<String>,
        student_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            student_id: student_id.into(),
            name: name.into(),
            class_name: None,
        }
    }
}

/// Grading sub-group inside a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCommittee {
    /// Document id
    #[serde(skip)]
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Display name
    pub name: String,
}

/// Collection names used by the engine and the stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionNames {
    /// Student registrations per session
    pub registrations: String,
    /// Company catalog
    pub companies: String,
    /// Capacity ledger
    pub occupancy: String,
    /// Early internship records
    pub early_internships: String,
    /// Session sub-committees
    pub sub_committees: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            registrations: String::from("defenseRegistrations"),
            companies: String::from("internshipCompanies"),
            occupancy: String::from("positionOccupancy"),
            early_internships: String::from("earlyInternships"),
            sub_committees: String::from("defenseSubCommittees"),
        }
    }
}

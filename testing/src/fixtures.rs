//! Builders and seeding helpers for registration scenarios.

use crate::InMemoryDocumentStore;
use placement_core::catalog::{
    CollectionNames, EarlyInternship, InternshipCompany, InternshipPosition, SubCommittee,
};
use placement_core::document_store::{DocumentKey, to_document};
use placement_core::ledger::{LedgerKey, PositionOccupancy};
use placement_core::registration::DefenseRegistration;
use placement_core::status::{ApprovalStatus, TrackStatus};
use serde::Serialize;

/// Builder for [`DefenseRegistration`] fixtures.
///
/// # Example
///
/// ```
/// use placement_testing::fixtures::RegistrationBuilder;
/// use placement_core::status::TrackStatus;
///
/// let reg = RegistrationBuilder::new("r1", "s1", "2011001")
///     .internship(TrackStatus::Reporting)
///     .build();
/// assert_eq!(reg.student_doc_id, "stu-2011001");
/// ```
#[derive(Clone, Debug)]
pub struct RegistrationBuilder {
    registration: DefenseRegistration,
}

impl RegistrationBuilder {
    /// Registration for `student_id` in `session_id`; both tracks start `reporting`.
    #[must_use]
    pub fn new(id: &str, session_id: &str, student_id: &str) -> Self {
        Self {
            registration: DefenseRegistration {
                id: id.to_string(),
                session_id: session_id.to_string(),
                student_doc_id: format!("stu-{student_id}"),
                student_id: student_id.to_string(),
                student_name: format!("Student {student_id}"),
                graduation_status: Some(TrackStatus::Reporting),
                internship_status: Some(TrackStatus::Reporting),
                ..DefenseRegistration::default()
            },
        }
    }

    /// Set the graduation track.
    #[must_use]
    pub fn graduation(mut self, status: TrackStatus) -> Self {
        self.registration.graduation_status = Some(status);
        self
    }

    /// Set the internship track.
    #[must_use]
    pub fn internship(mut self, status: TrackStatus) -> Self {
        self.registration.internship_status = Some(status);
        self
    }

    /// Set the approval gate.
    #[must_use]
    pub fn approval(mut self, status: ApprovalStatus) -> Self {
        self.registration.internship_registration_status = Some(status);
        self
    }

    /// Record a catalog placement holding `position_id` (no ledger write).
    #[must_use]
    pub fn holding(mut self, company_id: &str, position_id: &str) -> Self {
        self.registration.internship_company_id = Some(company_id.to_string());
        self.registration.internship_company_name = Some(format!("Company {company_id}"));
        self.registration.internship_position_id = Some(position_id.to_string());
        self.registration.internship_placement_source =
            Some(placement_core::intent::PlacementSource::Catalog);
        self
    }

    /// Set the sub-committee.
    #[must_use]
    pub fn sub_committee(mut self, sub_committee_id: &str) -> Self {
        self.registration.sub_committee_id = Some(sub_committee_id.to_string());
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> DefenseRegistration {
        self.registration
    }
}

/// Builder for [`InternshipCompany`] fixtures.
#[derive(Clone, Debug)]
pub struct CompanyBuilder {
    company: InternshipCompany,
}

impl CompanyBuilder {
    /// External company without positions.
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            company: InternshipCompany {
                id: id.to_string(),
                name: name.to_string(),
                address: Some(format!("{name} street 1")),
                ..InternshipCompany::default()
            },
        }
    }

    /// Mark as an internal department.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.company.is_lhu = true;
        self
    }

    /// Set the company's owner supervisor.
    #[must_use]
    pub fn owner(mut self, supervisor_id: &str, supervisor_name: &str) -> Self {
        self.company.owner_supervisor_id = Some(supervisor_id.to_string());
        self.company.owner_supervisor_name = Some(supervisor_name.to_string());
        self
    }

    /// Add a position with the given capacity.
    #[must_use]
    pub fn position(mut self, id: &str, title: &str, quantity: u32) -> Self {
        self.company.positions.push(InternshipPosition {
            id: id.to_string(),
            title: title.to_string(),
            quantity,
            description: None,
            supervisor_id: None,
            supervisor_name: None,
        });
        self
    }

    /// Add a position with its own supervisor.
    #[must_use]
    pub fn supervised_position(
        mut self,
        id: &str,
        quantity: u32,
        supervisor_id: &str,
        supervisor_name: &str,
    ) -> Self {
        self.company.positions.push(InternshipPosition {
            id: id.to_string(),
            title: format!("Position {id}"),
            quantity,
            description: None,
            supervisor_id: Some(supervisor_id.to_string()),
            supervisor_name: Some(supervisor_name.to_string()),
        });
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> InternshipCompany {
        self.company
    }
}

fn seed_value<T: Serialize>(store: &InMemoryDocumentStore, key: &DocumentKey, value: &T) {
    if let Ok(document) = to_document(value) {
        store.seed(key, serde_json::Value::Object(document));
    }
}

/// Write a registration fixture under its id.
pub fn seed_registration(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    registration: &DefenseRegistration,
) -> DocumentKey {
    let key = DocumentKey::new(&collections.registrations, &registration.id);
    seed_value(store, &key, registration);
    key
}

/// Write a company fixture under its id.
pub fn seed_company(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    company: &InternshipCompany,
) -> DocumentKey {
    let key = DocumentKey::new(&collections.companies, &company.id);
    seed_value(store, &key, company);
    key
}

/// Write an early internship fixture under its id.
pub fn seed_early_internship(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    record: &EarlyInternship,
) -> DocumentKey {
    let key = DocumentKey::new(&collections.early_internships, &record.id);
    seed_value(store, &key, record);
    key
}

/// Write a sub-committee fixture under its id.
pub fn seed_sub_committee(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    committee: &SubCommittee,
) -> DocumentKey {
    let key = DocumentKey::new(&collections.sub_committees, &committee.id);
    seed_value(store, &key, committee);
    key
}

/// Write a ledger entry with the given count.
pub fn seed_occupancy(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    ledger_key: &LedgerKey,
    count: u32,
) -> DocumentKey {
    let key = ledger_key.document_key(&collections.occupancy);
    let entry = PositionOccupancy {
        count,
        ..PositionOccupancy::empty(ledger_key)
    };
    seed_value(store, &key, &entry);
    key
}

/// Ledger count currently stored for `ledger_key` (0 when absent).
#[must_use]
pub fn occupancy_count(
    store: &InMemoryDocumentStore,
    collections: &CollectionNames,
    ledger_key: &LedgerKey,
) -> u32 {
    let key = ledger_key.document_key(&collections.occupancy);
    store
        .snapshot(&key)
        .and_then(|doc| doc.get("count").and_then(serde_json::Value::as_u64))
        .and_then(|count| u32::try_from(count).ok())
        .unwrap_or(0)
}

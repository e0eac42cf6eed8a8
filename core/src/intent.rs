//! Student registration intents and submission outcomes.

use crate::registration::DefenseRegistration;
use crate::status::{ApprovalStatus, TrackStatus};
use serde::{Deserialize, Serialize};

/// Where an internship placement comes from.
///
/// Closed set: adding a path means adding a variant here and handling it in
/// every `match`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// Company from the catalog, with a position when the company defines any
    FromCatalog {
        /// Catalog company id
        company_id: String,
        /// Position id; required exactly when the company has positions
        position_id: Option<String>,
    },
    /// Company found by the student
    SelfArranged {
        /// Company name
        company_name: String,
        /// Company address
        company_address: String,
        /// Contact person
        contact_name: String,
        /// Contact phone
        contact_phone: String,
    },
    /// Copy of an approved early internship; never capacity-limited
    FromEarlyInternship {
        /// Early internship record id
        early_internship_id: String,
    },
}

impl Placement {
    /// Source tag stored on the registration.
    #[must_use]
    pub const fn source(&self) -> PlacementSource {
        match self {
            Self::FromCatalog { .. } => PlacementSource::Catalog,
            Self::SelfArranged { .. } => PlacementSource::SelfArranged,
            Self::FromEarlyInternship { .. } => PlacementSource::EarlyInternship,
        }
    }
}

/// Stored tag for [`Placement`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementSource {
    /// From the company catalog
    Catalog,
    /// Self-arranged by the student
    SelfArranged,
    /// Copied from an early internship
    EarlyInternship,
}

/// Evidence links attached to a registration. `None` leaves a link untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLinks {
    /// Signed registration form
    pub registration_form: Option<String>,
    /// Company acceptance letter
    pub acceptance_letter: Option<String>,
    /// Commitment form
    pub commitment_form: Option<String>,
    /// Internship report
    pub internship_report: Option<String>,
}

impl DocumentLinks {
    /// Whether no link is supplied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.registration_form.is_none()
            && self.acceptance_letter.is_none()
            && self.commitment_form.is_none()
            && self.internship_report.is_none()
    }

    /// Overwrite the supplied links on `registration`.
    pub fn apply_to(&self, registration: &mut DefenseRegistration) {
        if let Some(link) = &self.registration_form {
            registration.internship_registration_form_link = Some(link.clone());
        }
        if let Some(link) = &self.acceptance_letter {
            registration.internship_acceptance_letter_link = Some(link.clone());
        }
        if let Some(link) = &self.commitment_form {
            registration.internship_commitment_form_link = Some(link.clone());
        }
        if let Some(link) = &self.internship_report {
            registration.internship_report_link = Some(link.clone());
        }
    }
}

/// What a student submits from the registration form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// New placement; `None` for a links-only update
    pub placement: Option<Placement>,
    /// Links to attach
    pub links: DocumentLinks,
}

impl SubmissionRequest {
    /// Request a placement without links.
    #[must_use]
    pub fn placement(placement: Placement) -> Self {
        Self {
            placement: Some(placement),
            links: DocumentLinks::default(),
        }
    }

    /// Request that only attaches links.
    #[must_use]
    pub fn links_only(links: DocumentLinks) -> Self {
        Self {
            placement: None,
            links,
        }
    }

    /// Attach links to the request.
    #[must_use]
    pub fn with_links(mut self, links: DocumentLinks) -> Self {
        self.links = links;
        self
    }
}

/// Expected outcomes of a submission. Store failures are errors, not outcomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Placement recorded; registration is now `pending`
    Accepted(DefenseRegistration),
    /// Only document links changed
    LinksAttached(DefenseRegistration),
    /// Position had no remaining capacity; nothing was written
    Full {
        /// Requested position
        position_id: String,
        /// Its capacity
        quantity: u32,
    },
    /// Placement is frozen by the approval status
    AlreadyLocked {
        /// Status holding the lock
        status: ApprovalStatus,
        /// Whether supplied links were still saved
        links_saved: bool,
    },
    /// Internship track already finished (completed or exempted); nothing to place
    TrackClosed {
        /// Terminal track status
        status: TrackStatus,
        /// Whether supplied links were still saved
        links_saved: bool,
    },
}

impl Submission {
    /// Whether the registration now holds the requested placement.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Registration after the write, when one happened.
    #[must_use]
    pub const fn registration(&self) -> Option<&DefenseRegistration> {
        match self {
            Self::Accepted(reg) | Self::LinksAttached(reg) => Some(reg),
            Self::Full { .. } | Self::AlreadyLocked { .. } | Self::TrackClosed { .. } => None,
        }
    }

    /// Actionable message for the student.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Accepted(_) => String::from("Registration submitted and awaiting approval."),
            Self::LinksAttached(_) => String::from("Documents updated."),
            Self::Full { quantity, .. } => format!(
                "This position is full ({quantity} of {quantity} places taken). Please choose another position or company."
            ),
            Self::AlreadyLocked { status, .. } => format!(
                "Your registration is {status}; company and position can no longer be changed."
            ),
            Self::TrackClosed { status, .. } => format!(
                "Your internship is already {status}; no placement can be registered."
            ),
        }
    }
}

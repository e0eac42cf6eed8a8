//! Round-robin sub-committee assignment.

use crate::engine::{RegistrationEngine, describe_writes};
use placement_core::catalog::SubCommittee;
use placement_core::document_store::{FieldPatch, Filter, StoreOperation, WriteOp};
use placement_core::error::RegistrationError;
use placement_core::registration::DefenseRegistration;
use placement_core::status::{ReportType, TrackStatus};
use std::collections::BTreeMap;

/// Deal registrations over committees in turn.
///
/// Registrations are ordered by student code (then id), committees are used
/// in the order given, and the `i`-th registration goes to committee
/// `i mod committees.len()`. Returns registration id → committee id; empty
/// when there are no committees.
///
/// # Example
///
/// ```
/// use placement_core::catalog::SubCommittee;
/// use placement_core::registration::DefenseRegistration;
/// use placement_runtime::assignment::assign_round_robin;
///
/// let reg = |id: &str, code: &str| DefenseRegistration {
///     id: id.into(),
///     student_id: code.into(),
///     ..DefenseRegistration::default()
/// };
/// let committee = |id: &str| SubCommittee {
///     id: id.into(),
///     session_id: "s1".into(),
///     name: id.to_uppercase(),
/// };
///
/// let mapping = assign_round_robin(
///     &[reg("r3", "003"), reg("r1", "001"), reg("r2", "002")],
///     &[committee("a"), committee("b")],
/// );
/// assert_eq!(mapping["r1"], "a");
/// assert_eq!(mapping["r2"], "b");
/// assert_eq!(mapping["r3"], "a");
/// ```
#[must_use]
pub fn assign_round_robin(
    registrations: &[DefenseRegistration],
    committees: &[SubCommittee],
) -> BTreeMap<String, String> {
    if committees.is_empty() {
        return BTreeMap::new();
    }
    let mut ordered: Vec<&DefenseRegistration> = registrations.iter().collect();
    ordered.sort_by(|a, b| a.student_id.cmp(&b.student_id).then_with(|| a.id.cmp(&b.id)));
    ordered
        .into_iter()
        .zip(committees.iter().cycle())
        .map(|(registration, committee)| (registration.id.clone(), committee.id.clone()))
        .collect()
}

impl RegistrationEngine {
    /// Assign every graduation-`reporting` registration of a session to one
    /// of the session's sub-committees, written as one batch.
    ///
    /// Registrations already on their assigned committee are not rewritten.
    /// Returns the full mapping.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[tracing::instrument(skip(self), name = "assign_sub_committees")]
    pub async fn assign_sub_committees(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, String>, RegistrationError> {
        let committees = self.session_committees(session_id).await?;
        if committees.is_empty() {
            tracing::warn!("Session has no sub-committees; nothing assigned");
            return Ok(BTreeMap::new());
        }

        let reporting: Vec<DefenseRegistration> = self
            .query_registrations(&Filter::all().eq("sessionId", session_id))
            .await?
            .into_iter()
            .filter(|registration| {
                registration.track_status(ReportType::Graduation) == TrackStatus::Reporting
            })
            .collect();
        let mapping = assign_round_robin(&reporting, &committees);

        let writes: Vec<WriteOp> = reporting
            .iter()
            .filter_map(|registration| {
                let committee = mapping.get(&registration.id)?;
                (registration.sub_committee_id.as_ref() != Some(committee)).then(|| {
                    WriteOp::Update {
                        key: self.registration_key(&registration.id),
                        patch: FieldPatch::new().set("subCommitteeId", committee.as_str()),
                    }
                })
            })
            .collect();

        if !writes.is_empty() {
            let attempted = describe_writes(&writes);
            let changed = writes.len();
            self.env.store.batch(writes).await.map_err(|source| {
                self.store_failure(
                    self.config.collections.registrations.clone(),
                    StoreOperation::Write,
                    Some(attempted),
                    source,
                )
            })?;
            tracing::info!(changed, "Sub-committees assigned");
        }
        Ok(mapping)
    }
}

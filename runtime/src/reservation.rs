//! Releasing held reservations.
//!
//! Clearing internship data, deleting a registration and moving it to
//! another session all end the placement. Each runs as one transaction that
//! writes the registration change and decrements the held ledger entry
//! together, so the ledger count always matches the registrations holding
//! the position.

use crate::engine::{
    AttemptError, RegistrationEngine, Stash, describe_writes, malformed, registration_patch,
    should_replan, transaction_failure,
};
use crate::metrics::LedgerMetrics;
use placement_core::document_store::{
    DocumentKey, Filter, StoreError, StoreOperation, TransactionAbort, TransactionReads,
    TransactionWrites, WriteOp,
};
use placement_core::error::RegistrationError;
use placement_core::ledger::{LedgerKey, PositionOccupancy};
use placement_core::registration::DefenseRegistration;
use placement_core::retry::retry_while;
use serde_json::Value;

/// Why a placement is being released.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ReleaseReason {
    Clear,
    Delete,
    MoveTo(String),
}

impl ReleaseReason {
    const fn label(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Delete => "delete",
            Self::MoveTo(_) => "move",
        }
    }

    /// Registration after the release, or `None` when it is deleted.
    fn apply(&self, current: &DefenseRegistration) -> Option<DefenseRegistration> {
        let mut updated = current.clone();
        match self {
            Self::Delete => return None,
            Self::Clear => updated.clear_internship_placement(),
            Self::MoveTo(session_id) => {
                updated.session_id.clone_from(session_id);
                // Capacity and committees are per session.
                updated.clear_internship_placement();
                updated.sub_committee_id = None;
            }
        }
        Some(updated)
    }
}

struct ReleasePlan {
    registration_key: DocumentKey,
    held: Option<(LedgerKey, DocumentKey)>,
    reason: ReleaseReason,
}

struct ReleaseCommit {
    registration: DefenseRegistration,
    writes: Value,
    released: bool,
}

impl ReleasePlan {
    fn read_set(&self) -> Vec<DocumentKey> {
        let mut reads = vec![self.registration_key.clone()];
        reads.extend(self.held.as_ref().map(|(_, doc)| doc.clone()));
        reads
    }

    fn execute(
        &self,
        reads: &TransactionReads,
    ) -> Result<(TransactionWrites, ReleaseCommit), TransactionAbort> {
        let mut current: DefenseRegistration = reads.decode(&self.registration_key)?;
        current.id = self.registration_key.id().to_string();
        let held = self.held.as_ref().map(|(key, _)| key.clone());
        if current.held_reservation() != held {
            return Err(TransactionAbort::Stale(format!(
                "{} changed its reservation since planning",
                self.registration_key
            )));
        }

        let mut writes = TransactionWrites::new();
        let mut released = false;
        if let Some((ledger, ledger_doc)) = &self.held {
            let mut entry = PositionOccupancy::from_stored(ledger, ledger_doc, reads.get(ledger_doc))
                .map_err(malformed(ledger_doc))?;
            // Never below zero; an already-empty entry is left alone.
            if entry.release() {
                writes.push(WriteOp::Set {
                    key: ledger_doc.clone(),
                    document: entry.to_stored().map_err(malformed(ledger_doc))?,
                });
                released = true;
            }
        }

        let registration = match self.reason.apply(&current) {
            Some(updated) => {
                let patch = registration_patch(&current, &updated)
                    .map_err(malformed(&self.registration_key))?;
                if !patch.is_empty() {
                    writes.push(WriteOp::Update {
                        key: self.registration_key.clone(),
                        patch,
                    });
                }
                updated
            }
            None => {
                writes.push(WriteOp::Delete {
                    key: self.registration_key.clone(),
                });
                current
            }
        };

        let commit = ReleaseCommit {
            registration,
            writes: describe_writes(&writes),
            released,
        };
        Ok((writes, commit))
    }
}

impl RegistrationEngine {
    /// Clear every internship placement field and the approval status,
    /// releasing the held position.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`], a store failure, or
    /// [`RegistrationError::Contended`].
    #[tracing::instrument(skip(self), name = "clear_internship_data")]
    pub async fn clear_internship_data(
        &self,
        registration_id: &str,
    ) -> Result<DefenseRegistration, RegistrationError> {
        self.release(registration_id, ReleaseReason::Clear).await
    }

    /// Delete a registration, releasing the held position. Returns the
    /// registration as it was when deleted.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`], a store failure, or
    /// [`RegistrationError::Contended`].
    #[tracing::instrument(skip(self), name = "delete_registration")]
    pub async fn delete_registration(
        &self,
        registration_id: &str,
    ) -> Result<DefenseRegistration, RegistrationError> {
        self.release(registration_id, ReleaseReason::Delete).await
    }

    /// Move a registration to another session. The internship placement and
    /// the sub-committee are cleared and the old-session position released.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::InvalidIntent`] when the target is the current
    /// session or the student is already registered there,
    /// [`RegistrationError::NotFound`], a store failure, or
    /// [`RegistrationError::Contended`].
    #[tracing::instrument(skip(self), name = "move_to_session")]
    pub async fn move_to_session(
        &self,
        registration_id: &str,
        session_id: &str,
    ) -> Result<DefenseRegistration, RegistrationError> {
        self.release(registration_id, ReleaseReason::MoveTo(session_id.to_string()))
            .await
    }

    async fn release(
        &self,
        registration_id: &str,
        reason: ReleaseReason,
    ) -> Result<DefenseRegistration, RegistrationError> {
        let outcome = retry_while(
            &self.config.conflict_retry(),
            || self.release_attempt(registration_id, &reason),
            should_replan,
        )
        .await
        .map_err(|error| self.settle(registration_id, error));

        if let Err(error) = &outcome {
            tracing::warn!(reason = reason.label(), error = %error, "Release failed");
        }
        outcome
    }

    async fn release_attempt(
        &self,
        registration_id: &str,
        reason: &ReleaseReason,
    ) -> Result<DefenseRegistration, AttemptError> {
        let registration = self.load_registration(registration_id).await?;

        if let ReleaseReason::MoveTo(target) = reason {
            if *target == registration.session_id {
                return Err(RegistrationError::InvalidIntent(format!(
                    "Registration is already in session {target}."
                ))
                .into());
            }
            let already_there = self
                .query_registrations(
                    &Filter::all()
                        .eq("sessionId", target.as_str())
                        .eq("studentDocId", registration.student_doc_id.as_str()),
                )
                .await?;
            if !already_there.is_empty() {
                return Err(RegistrationError::InvalidIntent(format!(
                    "Student {} is already registered in session {target}.",
                    registration.student_id
                ))
                .into());
            }
        }

        let registration_key = self.registration_key(registration_id);
        let occupancy = &self.config.collections.occupancy;
        let plan = ReleasePlan {
            registration_key: registration_key.clone(),
            held: registration.held_reservation().map(|key| {
                let doc = key.document_key(occupancy);
                (key, doc)
            }),
            reason: reason.clone(),
        };
        let reads = plan.read_set();

        let stash: Stash<ReleaseCommit> = Stash::new();
        let body_stash = stash.clone();
        let result = self
            .env
            .store
            .transact(
                reads,
                Box::new(
                    move |reads: &TransactionReads| -> Result<TransactionWrites, TransactionAbort> {
                        let (writes, commit) = plan.execute(reads)?;
                        body_stash.put(commit);
                        Ok(writes)
                    },
                ),
            )
            .await;

        match result {
            Ok(()) => {
                let commit = stash.take().ok_or_else(|| {
                    AttemptError::store(
                        registration_key.path(),
                        StoreOperation::Write,
                        None,
                        StoreError::Backend(String::from("transaction committed without a body run")),
                    )
                })?;
                if commit.released {
                    LedgerMetrics::record_released();
                }
                tracing::info!(
                    registration_id,
                    reason = reason.label(),
                    released = commit.released,
                    "Placement released"
                );
                Ok(commit.registration)
            }
            Err(error) => {
                let attempted = stash.take().map(|commit| commit.writes);
                Err(transaction_failure(&registration_key, error, attempted))
            }
        }
    }
}

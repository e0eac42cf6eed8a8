//! Registration engine.
//!
//! The engine owns every write to registrations and to the capacity ledger.
//! It holds the document store behind `Arc<dyn DocumentStore>` and never
//! caches documents between calls.
//!
//! # Submission flow
//!
//! 1. Load the registration and decide between a links-only update, an
//!    `AlreadyLocked` or `TrackClosed` outcome and a placement change.
//! 2. Resolve the placement against the catalog outside the transaction
//!    (company, position, early internship) into a [`PlacementSnapshot`].
//! 3. Run one transaction over the registration, the company, the requested
//!    ledger entry and the currently held ledger entry. The body re-reads the
//!    position quantity, reserves, releases and writes the registration
//!    patch, or aborts.
//! 4. A body that finds the registration changed since step 1 aborts as
//!    stale; the engine then re-plans from step 1 within the configured
//!    conflict budget.

use crate::config::EngineConfig;
use crate::metrics::{LedgerMetrics, StaffActionMetrics, StoreMetrics, SubmissionMetrics};
use futures::{Stream, StreamExt};
use placement_core::catalog::{CollectionNames, EarlyInternship, InternshipCompany, SubCommittee};
use placement_core::diagnostics::{DiagnosticSink, StoreFailureEvent, TracingDiagnostics};
use placement_core::document_store::{
    Document, DocumentChange, DocumentKey, DocumentStore, FieldPatch, Filter, StoreError,
    StoreOperation, TransactionAbort, TransactionError, TransactionReads, TransactionWrites,
    WriteOp, from_document, to_document,
};
use placement_core::error::RegistrationError;
use placement_core::intent::{DocumentLinks, Placement, PlacementSource, Submission, SubmissionRequest};
use placement_core::ledger::{LedgerKey, PositionOccupancy};
use placement_core::projection::{RegistrationFilter, StatusSummary, StatusView};
use placement_core::reducer::Reducer;
use placement_core::registration::{DefenseRegistration, PlacementSnapshot};
use placement_core::retry::retry_while;
use placement_core::status::{
    ApprovalStatus, ReportType, StaffAction, StatusEnvironment, StatusReducer,
};
use placement_core::{Clock, SystemClock};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Live stream of projected registration changes for one session.
pub type SessionStream = Pin<Box<dyn Stream<Item = Result<SessionUpdate, StoreError>> + Send>>;

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineEnvironment {
    /// Transactional document store
    pub store: Arc<dyn DocumentStore>,
    /// Clock for submission and enrollment timestamps
    pub clock: Arc<dyn Clock>,
    /// Receiver of store failure events
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl EngineEnvironment {
    /// Environment with the system clock and `tracing` diagnostics.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the diagnostics sink.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// Change to one registration of a watched session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUpdate {
    /// Registration that changed
    pub registration_id: String,
    /// New projection, or `None` when the registration was deleted or left the session
    pub view: Option<StatusView>,
}

/// Internship registration engine.
///
/// # Example
///
/// ```ignore
/// let engine = RegistrationEngine::new(EngineEnvironment::new(store));
/// let outcome = engine
///     .submit_internship_registration(
///         "reg-1",
///         SubmissionRequest::placement(Placement::FromCatalog {
///             company_id: "acme".into(),
///             position_id: Some("backend".into()),
///         }),
///     )
///     .await?;
/// ```
#[derive(Clone)]
pub struct RegistrationEngine {
    pub(crate) env: EngineEnvironment,
    pub(crate) config: EngineConfig,
    reducer: StatusReducer,
    status_env: StatusEnvironment,
}

impl RegistrationEngine {
    /// Engine with default configuration.
    #[must_use]
    pub fn new(env: EngineEnvironment) -> Self {
        Self::with_config(env, EngineConfig::default())
    }

    /// Engine with explicit configuration.
    #[must_use]
    pub fn with_config(env: EngineEnvironment, config: EngineConfig) -> Self {
        let status_env = StatusEnvironment::new(Arc::clone(&env.clock));
        Self {
            env,
            config,
            reducer: StatusReducer::new(),
            status_env,
        }
    }

    /// Collection names in use.
    #[must_use]
    pub const fn collections(&self) -> &CollectionNames {
        &self.config.collections
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Load one registration.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if it does not exist, or a store failure.
    pub async fn load_registration(
        &self,
        registration_id: &str,
    ) -> Result<DefenseRegistration, RegistrationError> {
        let key = self.registration_key(registration_id);
        let mut registration: DefenseRegistration = self
            .load_document(&key, || format!("Registration {registration_id}"))
            .await?;
        registration.id = registration_id.to_string();
        Ok(registration)
    }

    /// Load one catalog company.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if it does not exist, or a store failure.
    pub async fn load_company(
        &self,
        company_id: &str,
    ) -> Result<InternshipCompany, RegistrationError> {
        let key = DocumentKey::new(&self.config.collections.companies, company_id);
        let mut company: InternshipCompany = self
            .load_document(&key, || format!("Company {company_id}"))
            .await?;
        company.id = company_id.to_string();
        Ok(company)
    }

    /// Registrations matching `filter`, ordered by student code.
    ///
    /// The session restriction is pushed down to the store; the other
    /// criteria are evaluated in memory.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_registrations(
        &self,
        filter: &RegistrationFilter,
    ) -> Result<Vec<DefenseRegistration>, RegistrationError> {
        let store_filter = filter
            .session_id
            .as_deref()
            .map_or_else(Filter::all, |session| Filter::all().eq("sessionId", session));
        let registrations = self.query_registrations(&store_filter).await?;
        Ok(filter.apply(&registrations).into_iter().cloned().collect())
    }

    /// Per-status counts over the registrations matching `filter`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn status_summary(
        &self,
        filter: &RegistrationFilter,
    ) -> Result<StatusSummary, RegistrationError> {
        let registrations = self.list_registrations(filter).await?;
        Ok(StatusSummary::from_registrations(&registrations))
    }

    /// Current ledger entry for a `(session, position)` pair; missing reads as empty.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn ledger_entry(
        &self,
        ledger_key: &LedgerKey,
    ) -> Result<PositionOccupancy, RegistrationError> {
        let key = ledger_key.document_key(&self.config.collections.occupancy);
        let stored = self
            .env
            .store
            .get(&key)
            .await
            .map_err(|source| self.store_failure(key.path(), StoreOperation::Get, None, source))?;
        PositionOccupancy::from_stored(ledger_key, &key, stored.as_ref())
            .map_err(|source| self.store_failure(key.path(), StoreOperation::Get, None, source))
    }

    /// Places still free on a catalog position for a session.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] for an unknown company or position, or a store failure.
    pub async fn remaining_capacity(
        &self,
        session_id: &str,
        company_id: &str,
        position_id: &str,
    ) -> Result<u32, RegistrationError> {
        let company = self.load_company(company_id).await?;
        let quantity = company
            .position(position_id)
            .map(|position| position.quantity)
            .ok_or_else(|| RegistrationError::NotFound(format!("Position {position_id}")))?;
        let entry = self
            .ledger_entry(&LedgerKey::new(session_id, position_id))
            .await?;
        Ok(entry.remaining(quantity))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit a student's internship registration.
    ///
    /// Capacity-full and lock conflicts are returned as [`Submission`]
    /// outcomes. Everything else that goes wrong is an error.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::NotFound`]: registration, company, position or early internship missing
    /// - [`RegistrationError::InvalidIntent`]: placement inconsistent with the catalog
    /// - [`RegistrationError::StoreWriteFailed`]: store failure (reported to diagnostics)
    /// - [`RegistrationError::Contended`]: the registration kept changing during planning
    #[tracing::instrument(skip(self, request), name = "submit_internship_registration")]
    pub async fn submit_internship_registration(
        &self,
        registration_id: &str,
        request: SubmissionRequest,
    ) -> Result<Submission, RegistrationError> {
        let outcome = retry_while(
            &self.config.conflict_retry(),
            || self.submit_attempt(registration_id, &request),
            should_replan,
        )
        .await
        .map_err(|error| self.settle(registration_id, error));

        let label = match &outcome {
            Ok(Submission::Accepted(_)) => "accepted",
            Ok(Submission::LinksAttached(_)) => "links_attached",
            Ok(Submission::Full { .. }) => "full",
            Ok(Submission::AlreadyLocked { .. }) => "already_locked",
            Ok(Submission::TrackClosed { .. }) => "track_closed",
            Err(_) => "error",
        };
        SubmissionMetrics::record(label);
        match &outcome {
            Ok(_) => tracing::info!(outcome = label, "Submission handled"),
            Err(error) => tracing::warn!(error = %error, "Submission failed"),
        }
        outcome
    }

    async fn submit_attempt(
        &self,
        registration_id: &str,
        request: &SubmissionRequest,
    ) -> Result<Submission, AttemptError> {
        let registration = self.load_registration(registration_id).await?;

        let placement = match &request.placement {
            Some(placement)
                if !(registration.internship_locked() && registration.holds_placement(placement)) =>
            {
                placement
            }
            // No placement, or the one already locked in: only links change.
            _ => {
                let updated = self.attach_links(&registration, &request.links).await?;
                return Ok(Submission::LinksAttached(updated));
            }
        };

        if let Some(status) = registration
            .internship_registration_status
            .filter(ApprovalStatus::locks_placement)
        {
            let links_saved = !request.links.is_empty();
            if links_saved {
                self.attach_links(&registration, &request.links).await?;
            }
            tracing::info!(%status, links_saved, "Placement is locked");
            return Ok(Submission::AlreadyLocked {
                status,
                links_saved,
            });
        }

        let track = registration.track_status(ReportType::Internship);
        if track.is_terminal() {
            let links_saved = !request.links.is_empty();
            if links_saved {
                self.attach_links(&registration, &request.links).await?;
            }
            tracing::info!(status = %track, links_saved, "Internship track is closed");
            return Ok(Submission::TrackClosed {
                status: track,
                links_saved,
            });
        }

        let snapshot = self.resolve_placement(&registration, placement).await?;
        self.commit_placement(&registration, snapshot, &request.links)
            .await
    }

    /// Write only the supplied document links.
    async fn attach_links(
        &self,
        registration: &DefenseRegistration,
        links: &DocumentLinks,
    ) -> Result<DefenseRegistration, AttemptError> {
        let mut updated = registration.clone();
        links.apply_to(&mut updated);
        let key = self.registration_key(&registration.id);
        let patch = registration_patch(registration, &updated)
            .map_err(|source| AttemptError::store(key.path(), StoreOperation::Update, None, source))?;
        if patch.is_empty() {
            return Ok(updated);
        }
        let attempted = patch.to_json();
        self.env
            .store
            .update(&key, patch)
            .await
            .map_err(|source| {
                AttemptError::store(key.path(), StoreOperation::Update, Some(attempted), source)
            })?;
        tracing::debug!(registration_id = %registration.id, "Document links saved");
        Ok(updated)
    }

    /// Turn a placement intent into the snapshot to write.
    async fn resolve_placement(
        &self,
        registration: &DefenseRegistration,
        placement: &Placement,
    ) -> Result<PlacementSnapshot, AttemptError> {
        match placement {
            Placement::FromCatalog {
                company_id,
                position_id,
            } => {
                let company = self.load_company(company_id).await?;
                let position_id = position_id.as_deref().filter(|id| !id.is_empty());
                let base = PlacementSnapshot {
                    company_id: Some(company.id.clone()),
                    company_name: company.name.clone(),
                    company_address: company.address.clone(),
                    contact_name: company.contact_name.clone(),
                    contact_phone: company.contact_phone.clone(),
                    source: Some(PlacementSource::Catalog),
                    ..PlacementSnapshot::default()
                };
                match (company.has_positions(), position_id) {
                    (true, Some(position_id)) => {
                        let position = company.position(position_id).ok_or_else(|| {
                            RegistrationError::NotFound(format!("Position {position_id}"))
                        })?;
                        let supervisor = if company.is_lhu {
                            position.supervisor().or_else(|| company.owner_supervisor())
                        } else {
                            company.owner_supervisor()
                        };
                        Ok(PlacementSnapshot {
                            position_id: Some(position.id.clone()),
                            position_title: Some(position.title.clone()),
                            supervisor,
                            ..base
                        })
                    }
                    (true, None) => Err(RegistrationError::InvalidIntent(format!(
                        "{} has open positions; please choose one.",
                        company.name
                    ))
                    .into()),
                    (false, Some(position_id)) => Err(RegistrationError::InvalidIntent(format!(
                        "{} has no position {position_id}.",
                        company.name
                    ))
                    .into()),
                    (false, None) => Ok(PlacementSnapshot {
                        supervisor: company.owner_supervisor(),
                        ..base
                    }),
                }
            }
            Placement::SelfArranged {
                company_name,
                company_address,
                contact_name,
                contact_phone,
            } => {
                let company_name = company_name.trim();
                if company_name.is_empty() {
                    return Err(RegistrationError::InvalidIntent(String::from(
                        "Company name is required.",
                    ))
                    .into());
                }
                Ok(PlacementSnapshot {
                    company_name: company_name.to_string(),
                    company_address: non_empty(company_address),
                    contact_name: non_empty(contact_name),
                    contact_phone: non_empty(contact_phone),
                    source: Some(PlacementSource::SelfArranged),
                    ..PlacementSnapshot::default()
                })
            }
            Placement::FromEarlyInternship {
                early_internship_id,
            } => {
                let key = DocumentKey::new(
                    &self.config.collections.early_internships,
                    early_internship_id,
                );
                let mut record: EarlyInternship = self
                    .load_document(&key, || format!("Early internship {early_internship_id}"))
                    .await?;
                record.id.clone_from(early_internship_id);
                if record.student_doc_id != registration.student_doc_id {
                    return Err(RegistrationError::InvalidIntent(String::from(
                        "This early internship belongs to another student.",
                    ))
                    .into());
                }
                if record.status != ApprovalStatus::Approved {
                    return Err(RegistrationError::InvalidIntent(format!(
                        "Early internship is {}; only approved records can be used.",
                        record.status
                    ))
                    .into());
                }
                Ok(PlacementSnapshot {
                    company_name: record.company_name.clone(),
                    company_address: record.company_address.clone(),
                    supervisor: record.supervisor(),
                    source: Some(PlacementSource::EarlyInternship),
                    early_internship_id: Some(record.id),
                    ..PlacementSnapshot::default()
                })
            }
        }
    }

    /// Reserve (if needed), release the old reservation and write the
    /// registration, all in one transaction.
    async fn commit_placement(
        &self,
        registration: &DefenseRegistration,
        snapshot: PlacementSnapshot,
        links: &DocumentLinks,
    ) -> Result<Submission, AttemptError> {
        let collections = &self.config.collections;
        let registration_key = self.registration_key(&registration.id);
        let held = registration.held_reservation();
        let wanted = snapshot
            .position_id
            .as_ref()
            .map(|position_id| LedgerKey::new(registration.session_id.clone(), position_id));
        let company_key = snapshot
            .company_id
            .as_ref()
            .filter(|_| wanted.is_some())
            .map(|company_id| DocumentKey::new(&collections.companies, company_id));

        let plan = PlacementPlan {
            registration_key: registration_key.clone(),
            session_id: registration.session_id.clone(),
            held: held.map(|key| {
                let doc = key.document_key(&collections.occupancy);
                (key, doc)
            }),
            wanted: wanted.map(|key| {
                let doc = key.document_key(&collections.occupancy);
                (key, doc)
            }),
            company_key,
            snapshot,
            links: links.clone(),
            submitted_at: self.env.clock.now(),
        };
        let reads = plan.read_set();
        let requested_position = plan.wanted.as_ref().map(|(key, _)| key.position_id.clone());

        let stash: Stash<PlacementCommit> = Stash::new();
        let body_stash = stash.clone();
        let result = self
            .env
            .store
            .transact(
                reads,
                Box::new(move |reads: &TransactionReads| -> Result<TransactionWrites, TransactionAbort> {
                    let (writes, commit) = plan.execute(reads)?;
                    body_stash.put(commit);
                    Ok(writes)
                }),
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
                if commit.reserved {
                    LedgerMetrics::record_reserved();
                }
                if commit.released {
                    LedgerMetrics::record_released();
                }
                tracing::info!(
                    registration_id = %registration.id,
                    reserved = commit.reserved,
                    released = commit.released,
                    "Placement recorded"
                );
                Ok(Submission::Accepted(commit.registration))
            }
            Err(TransactionError::Aborted(TransactionAbort::CapacityExhausted {
                key,
                count,
                quantity,
            })) => {
                tracing::info!(ledger = %key, count, quantity, "Position full");
                Ok(Submission::Full {
                    position_id: requested_position.unwrap_or_default(),
                    quantity,
                })
            }
            Err(error) => {
                let attempted = stash.take().map(|commit| commit.writes);
                Err(transaction_failure(&registration_key, error, attempted))
            }
        }
    }

    // ========================================================================
    // Staff transitions
    // ========================================================================

    /// Apply a staff action to one registration.
    ///
    /// Writes only the fields the action changed; an action that changes
    /// nothing performs no write. The ledger is never touched.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Transition`] when the state machine refuses the
    /// action, [`RegistrationError::NotFound`], or a store failure.
    #[tracing::instrument(skip(self, action), fields(action = action.label()), name = "apply_staff_action")]
    pub async fn apply_staff_action(
        &self,
        registration_id: &str,
        action: StaffAction,
    ) -> Result<DefenseRegistration, RegistrationError> {
        let label = action.label();
        let before = self.load_registration(registration_id).await?;
        let (after, patch) = match self.reduce_staff_action(&before, action) {
            Ok(reduced) => reduced,
            Err(error) => {
                StaffActionMetrics::record(label, false);
                tracing::info!(error = %error, "Staff action refused");
                return Err(error);
            }
        };

        if !patch.is_empty() {
            let key = self.registration_key(registration_id);
            let attempted = patch.to_json();
            self.env.store.update(&key, patch).await.map_err(|source| {
                self.store_failure(key.path(), StoreOperation::Update, Some(attempted), source)
            })?;
        }
        StaffActionMetrics::record(label, true);
        Ok(after)
    }

    /// Apply one staff action to many registrations, all or nothing.
    ///
    /// Every registration is loaded and validated before anything is
    /// written; the patches are then committed as a single batch.
    ///
    /// # Errors
    ///
    /// The first refusal or missing registration (nothing written), or a store failure.
    #[tracing::instrument(skip(self, registration_ids, action), fields(action = action.label()), name = "apply_staff_action_batch")]
    pub async fn apply_staff_action_batch<I, S>(
        &self,
        registration_ids: I,
        action: StaffAction,
    ) -> Result<Vec<DefenseRegistration>, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let label = action.label();
        let mut updated = Vec::new();
        let mut writes = Vec::new();
        for registration_id in registration_ids {
            let registration_id = registration_id.as_ref();
            let before = self.load_registration(registration_id).await?;
            let (after, patch) = self
                .reduce_staff_action(&before, action.clone())
                .inspect_err(|_| StaffActionMetrics::record(label, false))?;
            if !patch.is_empty() {
                writes.push(WriteOp::Update {
                    key: self.registration_key(registration_id),
                    patch,
                });
            }
            updated.push(after);
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
        for _ in &updated {
            StaffActionMetrics::record(label, true);
        }
        tracing::info!(count = updated.len(), "Staff batch applied");
        Ok(updated)
    }

    fn reduce_staff_action(
        &self,
        before: &DefenseRegistration,
        action: StaffAction,
    ) -> Result<(DefenseRegistration, FieldPatch), RegistrationError> {
        let mut after = before.clone();
        self.reducer
            .reduce(&mut after, action, &self.status_env)
            .map_err(|source| RegistrationError::Transition {
                registration_id: before.id.clone(),
                source,
            })?;
        let patch = registration_patch(before, &after).map_err(|source| {
            self.store_failure(
                self.registration_key(&before.id).path(),
                StoreOperation::Update,
                None,
                source,
            )
        })?;
        Ok((after, patch))
    }

    // ========================================================================
    // Live projection
    // ========================================================================

    /// Stream of projected changes to the registrations of one session.
    ///
    /// # Errors
    ///
    /// Store failure when the subscription cannot be opened.
    pub async fn watch_session(&self, session_id: &str) -> Result<SessionStream, RegistrationError> {
        let collection = &self.config.collections.registrations;
        let filter = Filter::all().eq("sessionId", session_id);
        let changes = self
            .env
            .store
            .subscribe(collection, &filter)
            .await
            .map_err(|source| {
                self.store_failure(collection.clone(), StoreOperation::List, None, source)
            })?;
        Ok(Box::pin(changes.map(session_update)))
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    pub(crate) fn registration_key(&self, registration_id: &str) -> DocumentKey {
        DocumentKey::new(&self.config.collections.registrations, registration_id)
    }

    pub(crate) async fn load_document<T, F>(
        &self,
        key: &DocumentKey,
        describe: F,
    ) -> Result<T, RegistrationError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> String,
    {
        let document = self
            .env
            .store
            .get(key)
            .await
            .map_err(|source| self.store_failure(key.path(), StoreOperation::Get, None, source))?
            .ok_or_else(|| RegistrationError::NotFound(describe()))?;
        from_document(key, &document)
            .map_err(|source| self.store_failure(key.path(), StoreOperation::Get, None, source))
    }

    /// Registrations matching a store-side filter, in store order.
    pub(crate) async fn query_registrations(
        &self,
        filter: &Filter,
    ) -> Result<Vec<DefenseRegistration>, RegistrationError> {
        let collection = &self.config.collections.registrations;
        let rows = self.env.store.query(collection, filter).await.map_err(|source| {
            self.store_failure(collection.clone(), StoreOperation::List, None, source)
        })?;
        rows.iter()
            .map(|(key, document)| -> Result<DefenseRegistration, RegistrationError> {
                let mut registration: DefenseRegistration = from_document(key, document)
                    .map_err(|source| {
                        self.store_failure(key.path(), StoreOperation::List, None, source)
                    })?;
                registration.id = key.id().to_string();
                Ok(registration)
            })
            .collect()
    }

    /// Sub-committees of a session, in store order.
    pub(crate) async fn session_committees(
        &self,
        session_id: &str,
    ) -> Result<Vec<SubCommittee>, RegistrationError> {
        let collection = &self.config.collections.sub_committees;
        let rows = self
            .env
            .store
            .query(collection, &Filter::all().eq("sessionId", session_id))
            .await
            .map_err(|source| {
                self.store_failure(collection.clone(), StoreOperation::List, None, source)
            })?;
        rows.iter()
            .map(|(key, document)| -> Result<SubCommittee, RegistrationError> {
                let mut committee: SubCommittee = from_document(key, document).map_err(|source| {
                    self.store_failure(key.path(), StoreOperation::List, None, source)
                })?;
                committee.id = key.id().to_string();
                Ok(committee)
            })
            .collect()
    }

    /// Report a store failure to diagnostics and wrap it.
    pub(crate) fn store_failure(
        &self,
        path: String,
        operation: StoreOperation,
        attempted_data: Option<Value>,
        source: StoreError,
    ) -> RegistrationError {
        StoreMetrics::record_failure(operation.as_str());
        tracing::warn!(%path, %operation, error = %source, "Store operation failed");
        self.env.diagnostics.emit(StoreFailureEvent::new(
            path.clone(),
            operation,
            attempted_data,
            &source,
        ));
        RegistrationError::StoreWriteFailed {
            path,
            operation,
            source,
        }
    }

    /// Final error once re-planning stops.
    pub(crate) fn settle(&self, registration_id: &str, error: AttemptError) -> RegistrationError {
        match error {
            AttemptError::Stale(reason) => {
                tracing::warn!(registration_id, %reason, "Gave up re-planning");
                RegistrationError::Contended(registration_id.to_string())
            }
            AttemptError::Store {
                path,
                operation,
                attempted,
                source,
            } => self.store_failure(path, operation, attempted, source),
            AttemptError::Final(error) => error,
        }
    }
}

// ============================================================================
// Placement transaction
// ============================================================================

/// Everything the placement transaction body needs, owned so the body is `'static`.
struct PlacementPlan {
    registration_key: DocumentKey,
    session_id: String,
    held: Option<(LedgerKey, DocumentKey)>,
    wanted: Option<(LedgerKey, DocumentKey)>,
    company_key: Option<DocumentKey>,
    snapshot: PlacementSnapshot,
    links: DocumentLinks,
    submitted_at: chrono::DateTime<chrono::Utc>,
}

/// What a successful placement body produced.
struct PlacementCommit {
    registration: DefenseRegistration,
    writes: Value,
    reserved: bool,
    released: bool,
}

impl PlacementPlan {
    fn read_set(&self) -> Vec<DocumentKey> {
        let mut reads = vec![self.registration_key.clone()];
        reads.extend(self.company_key.clone());
        reads.extend(self.wanted.as_ref().map(|(_, doc)| doc.clone()));
        if let Some((_, held_doc)) = &self.held {
            if !reads.contains(held_doc) {
                reads.push(held_doc.clone());
            }
        }
        reads
    }

    fn execute(
        &self,
        reads: &TransactionReads,
    ) -> Result<(TransactionWrites, PlacementCommit), TransactionAbort> {
        let mut current: DefenseRegistration = reads.decode(&self.registration_key)?;
        current.id = self.registration_key.id().to_string();

        if let Some(status) = current
            .internship_registration_status
            .filter(ApprovalStatus::locks_placement)
        {
            return Err(TransactionAbort::Locked { status });
        }
        let track = current.track_status(ReportType::Internship);
        if track.is_terminal() {
            return Err(TransactionAbort::TrackClosed { status: track });
        }
        let held = self.held.as_ref().map(|(key, _)| key.clone());
        if current.session_id != self.session_id || current.held_reservation() != held {
            return Err(TransactionAbort::Stale(format!(
                "{} changed since planning",
                self.registration_key
            )));
        }

        let mut writes = TransactionWrites::new();
        let mut reserved = false;
        let mut released = false;

        if let Some((ledger, ledger_doc)) = &self.wanted {
            // Re-submitting the held position reuses the unit already taken.
            if held.as_ref() != Some(ledger) {
                let quantity = self.position_quantity(reads, &ledger.position_id)?;
                let mut entry = PositionOccupancy::from_stored(ledger, ledger_doc, reads.get(ledger_doc))
                    .map_err(malformed(ledger_doc))?;
                entry
                    .try_reserve(quantity)
                    .map_err(|full| TransactionAbort::CapacityExhausted {
                        key: ledger_doc.clone(),
                        count: full.count,
                        quantity: full.quantity,
                    })?;
                writes.push(WriteOp::Set {
                    key: ledger_doc.clone(),
                    document: entry.to_stored().map_err(malformed(ledger_doc))?,
                });
                reserved = true;
            }
        }

        if let Some((old, old_doc)) = &self.held {
            if self.wanted.as_ref().map(|(key, _)| key) != Some(old) {
                let mut entry = PositionOccupancy::from_stored(old, old_doc, reads.get(old_doc))
                    .map_err(malformed(old_doc))?;
                if entry.release() {
                    writes.push(WriteOp::Set {
                        key: old_doc.clone(),
                        document: entry.to_stored().map_err(malformed(old_doc))?,
                    });
                    released = true;
                }
            }
        }

        let mut updated = current.clone();
        updated.apply_placement(self.snapshot.clone(), self.submitted_at);
        self.links.apply_to(&mut updated);
        let patch = registration_patch(&current, &updated).map_err(malformed(&self.registration_key))?;
        writes.push(WriteOp::Update {
            key: self.registration_key.clone(),
            patch,
        });

        let commit = PlacementCommit {
            registration: updated,
            writes: describe_writes(&writes),
            reserved,
            released,
        };
        Ok((writes, commit))
    }

    fn position_quantity(
        &self,
        reads: &TransactionReads,
        position_id: &str,
    ) -> Result<u32, TransactionAbort> {
        let company_key = self
            .company_key
            .as_ref()
            .ok_or_else(|| TransactionAbort::Stale(String::from("company missing from read set")))?;
        let company: InternshipCompany = reads.decode(company_key)?;
        company
            .position(position_id)
            .map(|position| position.quantity)
            .ok_or_else(|| TransactionAbort::Missing(company_key.clone()))
    }
}

// ============================================================================
// Attempt errors
// ============================================================================

/// Failure of one planning attempt.
#[derive(Error, Debug)]
pub(crate) enum AttemptError {
    /// The read set changed after planning; re-plan.
    #[error("Stale read: {0}")]
    Stale(String),

    /// Store failure, re-planned when it is a conflict.
    #[error("Store {operation} failed on {path}: {source}")]
    Store {
        path: String,
        operation: StoreOperation,
        attempted: Option<Value>,
        #[source]
        source: StoreError,
    },

    /// Final; returned as is.
    #[error(transparent)]
    Final(#[from] RegistrationError),
}

impl AttemptError {
    pub(crate) fn store(
        path: String,
        operation: StoreOperation,
        attempted: Option<Value>,
        source: StoreError,
    ) -> Self {
        Self::Store {
            path,
            operation,
            attempted,
            source,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Self::Stale(_) => true,
            Self::Store { source, .. } => source.is_conflict(),
            Self::Final(_) => false,
        }
    }
}

pub(crate) fn should_replan(error: &AttemptError) -> bool {
    let replan = error.is_retryable();
    if replan {
        StoreMetrics::record_conflict_retry();
    }
    replan
}

/// Map a failed transaction onto an attempt error.
pub(crate) fn transaction_failure(
    key: &DocumentKey,
    error: TransactionError,
    attempted: Option<Value>,
) -> AttemptError {
    match error {
        TransactionError::Aborted(TransactionAbort::Stale(reason)) => AttemptError::Stale(reason),
        TransactionError::Aborted(TransactionAbort::Locked { status }) => {
            AttemptError::Stale(format!("{key} became {status}"))
        }
        TransactionError::Aborted(TransactionAbort::TrackClosed { status }) => {
            AttemptError::Stale(format!("{key} internship track became {status}"))
        }
        TransactionError::Aborted(TransactionAbort::Missing(missing)) => {
            AttemptError::Final(RegistrationError::NotFound(missing.path()))
        }
        TransactionError::Aborted(TransactionAbort::Malformed { key, reason }) => {
            AttemptError::store(
                key.path(),
                StoreOperation::Get,
                None,
                StoreError::Malformed {
                    path: key.path(),
                    reason,
                },
            )
        }
        TransactionError::Aborted(TransactionAbort::CapacityExhausted { key, .. }) => {
            AttemptError::Final(RegistrationError::InvalidIntent(format!("{key} is full")))
        }
        TransactionError::Store(source) => {
            AttemptError::store(key.path(), StoreOperation::Write, attempted, source)
        }
    }
}

/// Slot a transaction body fills with its result.
///
/// Bodies may run more than once; the last run is the one that committed.
pub(crate) struct Stash<T>(Arc<Mutex<Option<T>>>);

impl<T> Stash<T> {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub(crate) fn put(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<T> Clone for Stash<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Field-level difference between two versions of a registration.
pub(crate) fn registration_patch(
    before: &DefenseRegistration,
    after: &DefenseRegistration,
) -> Result<FieldPatch, StoreError> {
    Ok(FieldPatch::diff(&to_document(before)?, &to_document(after)?))
}

pub(crate) fn malformed(key: &DocumentKey) -> impl Fn(StoreError) -> TransactionAbort + '_ {
    move |error| TransactionAbort::Malformed {
        key: key.clone(),
        reason: error.to_string(),
    }
}

/// JSON rendering of a write set for diagnostics.
pub(crate) fn describe_writes(writes: &[WriteOp]) -> Value {
    Value::Array(
        writes
            .iter()
            .map(|write| {
                json!({
                    "path": write.key().path(),
                    "operation": write.operation().as_str(),
                    "data": write.attempted_data(),
                })
            })
            .collect(),
    )
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn session_update(change: Result<DocumentChange, StoreError>) -> Result<SessionUpdate, StoreError> {
    let change = change?;
    let view = match &change.document {
        Some(document) => Some(project(&change.key, document)?),
        None => None,
    };
    Ok(SessionUpdate {
        registration_id: change.key.id().to_string(),
        view,
    })
}

fn project(key: &DocumentKey, document: &Document) -> Result<StatusView, StoreError> {
    let mut registration: DefenseRegistration = from_document(key, document)?;
    registration.id = key.id().to_string();
    Ok(StatusView::from_registration(&registration))
}

//! Integration tests for student submissions
//!
//! Covers the three placement paths, the approval lock, document links,
//! diagnostics on store failures and re-planning after concurrent writes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use placement_core::catalog::{CollectionNames, EarlyInternship};
use placement_core::document_store::{DocumentKey, FieldPatch, StoreError, StoreOperation, WriteOp};
use placement_core::error::RegistrationError;
use placement_core::intent::{DocumentLinks, Placement, PlacementSource, Submission, SubmissionRequest};
use placement_core::ledger::LedgerKey;
use placement_core::status::{ApprovalStatus, StaffAction, TrackStatus};
use placement_runtime::{EngineConfig, EngineEnvironment, RegistrationEngine};
use placement_testing::fixtures::{
    CompanyBuilder, RegistrationBuilder, occupancy_count, seed_company, seed_early_internship,
    seed_occupancy, seed_registration,
};
use placement_testing::helpers::init_tracing;
use placement_testing::{InMemoryDocumentStore, RecordingDiagnostics, test_clock};
use std::sync::Arc;
use tokio_test::assert_ok;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: Arc<InMemoryDocumentStore>,
    diagnostics: RecordingDiagnostics,
    engine: RegistrationEngine,
    collections: CollectionNames,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryDocumentStore::new());
        let diagnostics = RecordingDiagnostics::new();
        let collections = config.collections.clone();

        seed_company(
            &store,
            &collections,
            &CompanyBuilder::new("acme", "Acme")
                .owner("own-1", "Owner One")
                .position("backend", "Backend", 2)
                .build(),
        );
        seed_company(
            &store,
            &collections,
            &CompanyBuilder::new("lab", "University Lab")
                .internal()
                .owner("own-2", "Lab Owner")
                .supervised_position("research", 3, "sup-9", "Dr. Nine")
                .position("support", "Support", 3)
                .build(),
        );
        seed_company(
            &store,
            &collections,
            &CompanyBuilder::new("bakery", "Corner Bakery")
                .owner("own-3", "Baker")
                .build(),
        );
        seed_registration(
            &store,
            &collections,
            &RegistrationBuilder::new("r1", "s1", "2011001").build(),
        );

        let engine = RegistrationEngine::with_config(
            EngineEnvironment::new(store.clone())
                .with_clock(Arc::new(test_clock()))
                .with_diagnostics(Arc::new(diagnostics.clone())),
            config,
        );
        Self {
            store,
            diagnostics,
            engine,
            collections,
        }
    }

    fn registration_key(&self, id: &str) -> DocumentKey {
        DocumentKey::new(&self.collections.registrations, id)
    }

    fn count(&self, position_id: &str) -> u32 {
        occupancy_count(&self.store, &self.collections, &LedgerKey::new("s1", position_id))
    }

    async fn submit(&self, request: SubmissionRequest) -> Result<Submission, RegistrationError> {
        self.engine.submit_internship_registration("r1", request).await
    }
}

fn catalog(company_id: &str, position_id: Option<&str>) -> SubmissionRequest {
    SubmissionRequest::placement(Placement::FromCatalog {
        company_id: company_id.to_string(),
        position_id: position_id.map(String::from),
    })
}

fn self_arranged(name: &str) -> SubmissionRequest {
    SubmissionRequest::placement(Placement::SelfArranged {
        company_name: name.to_string(),
        company_address: String::from("1 Main St"),
        contact_name: String::from("Jane"),
        contact_phone: String::from("555-0100"),
    })
}

fn early(id: &str) -> SubmissionRequest {
    SubmissionRequest::placement(Placement::FromEarlyInternship {
        early_internship_id: id.to_string(),
    })
}

fn form_link() -> DocumentLinks {
    DocumentLinks {
        registration_form: Some(String::from("https://files.example/form.pdf")),
        ..DocumentLinks::default()
    }
}

// ============================================================================
// Placement paths
// ============================================================================

#[tokio::test]
async fn catalog_submission_reserves_and_snapshots() {
    let h = Harness::new();

    let outcome = assert_ok!(h.submit(catalog("acme", Some("backend"))).await);

    let Submission::Accepted(registration) = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert_eq!(registration.internship_company_name.as_deref(), Some("Acme"));
    assert_eq!(registration.internship_position_title.as_deref(), Some("Backend"));
    assert_eq!(registration.internship_supervisor_id.as_deref(), Some("own-1"));
    assert_eq!(
        registration.internship_registration_status,
        Some(ApprovalStatus::Pending)
    );
    assert_eq!(registration.internship_status, Some(TrackStatus::Reporting));
    assert_eq!(
        registration.internship_placement_source,
        Some(PlacementSource::Catalog)
    );
    assert_eq!(h.count("backend"), 1);

    // What the caller sees is what was stored.
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored, registration);
}

#[tokio::test]
async fn internal_department_prefers_position_supervisor() {
    let h = Harness::new();

    let research = h.submit(catalog("lab", Some("research"))).await.unwrap();
    assert_eq!(
        research.registration().unwrap().internship_supervisor_id.as_deref(),
        Some("sup-9")
    );

    h.engine
        .apply_staff_action("r1", StaffAction::RejectInternship { reason: None })
        .await
        .unwrap();
    let support = h.submit(catalog("lab", Some("support"))).await.unwrap();
    assert_eq!(
        support.registration().unwrap().internship_supervisor_name.as_deref(),
        Some("Lab Owner")
    );
}

#[tokio::test]
async fn company_without_positions_takes_no_unit() {
    let h = Harness::new();

    let outcome = h.submit(catalog("bakery", None)).await.unwrap();

    let registration = outcome.registration().unwrap();
    assert_eq!(registration.internship_position_id, None);
    assert_eq!(registration.internship_supervisor_id.as_deref(), Some("own-3"));
    assert!(h.store.collection(&h.collections.occupancy).is_empty());
}

#[tokio::test]
async fn position_choice_must_match_the_catalog() {
    let h = Harness::new();

    let missing_choice = h.submit(catalog("acme", None)).await.unwrap_err();
    assert!(matches!(missing_choice, RegistrationError::InvalidIntent(_)));

    let unexpected = h.submit(catalog("bakery", Some("backend"))).await.unwrap_err();
    assert!(matches!(unexpected, RegistrationError::InvalidIntent(_)));

    let unknown = h.submit(catalog("acme", Some("frontend"))).await.unwrap_err();
    assert!(matches!(unknown, RegistrationError::NotFound(_)));

    let no_company = h.submit(catalog("ghost", Some("backend"))).await.unwrap_err();
    assert!(matches!(no_company, RegistrationError::NotFound(_)));

    assert!(h.store.collection(&h.collections.occupancy).is_empty());
    assert!(h.diagnostics.is_empty());
}

#[tokio::test]
async fn self_arranged_placement_is_unlimited() {
    let h = Harness::new();

    let outcome = h.submit(self_arranged("Acme")).await.unwrap();

    let registration = outcome.registration().unwrap();
    assert_eq!(
        registration.internship_placement_source,
        Some(PlacementSource::SelfArranged)
    );
    assert_eq!(registration.internship_company_id, None);
    assert_eq!(registration.internship_position_id, None);
    assert_eq!(registration.internship_contact_phone.as_deref(), Some("555-0100"));
    // Same name as a catalog company, still no ledger entry.
    assert!(h.store.collection(&h.collections.occupancy).is_empty());
}

#[tokio::test]
async fn self_arranged_requires_a_company_name() {
    let h = Harness::new();

    let error = h.submit(self_arranged("   ")).await.unwrap_err();

    assert!(matches!(error, RegistrationError::InvalidIntent(_)));
}

#[tokio::test]
async fn approved_early_internship_is_copied() {
    let h = Harness::new();
    seed_early_internship(
        &h.store,
        &h.collections,
        &EarlyInternship {
            id: String::from("e1"),
            student_doc_id: String::from("stu-2011001"),
            company_name: String::from("Startup"),
            company_address: Some(String::from("2 Side St")),
            supervisor_id: Some(String::from("sup-4")),
            supervisor_name: Some(String::from("Dr. Four")),
            status: ApprovalStatus::Approved,
        },
    );

    let outcome = h.submit(early("e1")).await.unwrap();

    let registration = outcome.registration().unwrap();
    assert_eq!(registration.internship_company_name.as_deref(), Some("Startup"));
    assert_eq!(registration.internship_early_internship_id.as_deref(), Some("e1"));
    assert_eq!(registration.internship_supervisor_id.as_deref(), Some("sup-4"));
    assert!(h.store.collection(&h.collections.occupancy).is_empty());
}

#[tokio::test]
async fn early_internship_must_be_own_and_approved() {
    let h = Harness::new();
    let record = |id: &str, student: &str, status| EarlyInternship {
        id: id.to_string(),
        student_doc_id: student.to_string(),
        company_name: String::from("Startup"),
        company_address: None,
        supervisor_id: None,
        supervisor_name: None,
        status,
    };
    seed_early_internship(&h.store, &h.collections, &record("other", "stu-9", ApprovalStatus::Approved));
    seed_early_internship(&h.store, &h.collections, &record("waiting", "stu-2011001", ApprovalStatus::Pending));

    assert!(matches!(
        h.submit(early("other")).await,
        Err(RegistrationError::InvalidIntent(_))
    ));
    assert!(matches!(
        h.submit(early("waiting")).await,
        Err(RegistrationError::InvalidIntent(_))
    ));
    assert!(matches!(
        h.submit(early("missing")).await,
        Err(RegistrationError::NotFound(_))
    ));
    let untouched = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(untouched.internship_registration_status, None);
}

#[tokio::test]
async fn unknown_registration_is_not_found() {
    let h = Harness::new();

    let error = h
        .engine
        .submit_internship_registration("nobody", catalog("acme", Some("backend")))
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::NotFound(_)));
}

// ============================================================================
// Approval lock and links
// ============================================================================

#[tokio::test]
async fn pending_registration_refuses_a_new_placement() {
    let h = Harness::new();
    h.submit(catalog("acme", Some("backend"))).await.unwrap();

    let outcome = h.submit(self_arranged("Elsewhere")).await.unwrap();

    assert_eq!(
        outcome,
        Submission::AlreadyLocked {
            status: ApprovalStatus::Pending,
            links_saved: false
        }
    );
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored.internship_company_name.as_deref(), Some("Acme"));
    assert_eq!(h.count("backend"), 1);
}

#[tokio::test]
async fn locked_registration_still_saves_links() {
    let h = Harness::new();
    h.submit(catalog("acme", Some("backend"))).await.unwrap();
    h.engine
        .apply_staff_action("r1", StaffAction::ApproveInternship)
        .await
        .unwrap();

    let outcome = h
        .submit(self_arranged("Elsewhere").with_links(form_link()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Submission::AlreadyLocked {
            status: ApprovalStatus::Approved,
            links_saved: true
        }
    );
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored.internship_company_name.as_deref(), Some("Acme"));
    assert_eq!(
        stored.internship_registration_form_link.as_deref(),
        Some("https://files.example/form.pdf")
    );
}

#[tokio::test]
async fn resubmitting_the_locked_placement_only_updates_links() {
    let h = Harness::new();
    h.submit(catalog("acme", Some("backend"))).await.unwrap();

    let outcome = h
        .submit(catalog("acme", Some("backend")).with_links(form_link()))
        .await
        .unwrap();

    assert!(matches!(outcome, Submission::LinksAttached(_)));
    assert_eq!(h.count("backend"), 1);
}

#[tokio::test]
async fn links_only_request_never_touches_the_ledger() {
    let h = Harness::new();

    let outcome = h
        .submit(SubmissionRequest::links_only(DocumentLinks {
            internship_report: Some(String::from("https://files.example/report.pdf")),
            ..DocumentLinks::default()
        }))
        .await
        .unwrap();

    let registration = outcome.registration().unwrap();
    assert_eq!(
        registration.internship_report_link.as_deref(),
        Some("https://files.example/report.pdf")
    );
    assert_eq!(registration.internship_registration_status, None);
    assert_eq!(h.store.transaction_count(), 0);
}

#[tokio::test]
async fn resubmitting_padded_self_arranged_placement_only_updates_links() {
    let h = Harness::new();
    let padded = SubmissionRequest::placement(Placement::SelfArranged {
        company_name: String::from("  Acme "),
        company_address: String::from(" 1 Main St "),
        contact_name: String::from("Jane"),
        contact_phone: String::from("555-0100"),
    });
    h.submit(padded.clone()).await.unwrap();

    let outcome = h.submit(padded.with_links(form_link())).await.unwrap();

    let registration = match outcome {
        Submission::LinksAttached(registration) => registration,
        other => panic!("expected links-only update, got {other:?}"),
    };
    assert_eq!(registration.internship_company_name.as_deref(), Some("Acme"));
    assert_eq!(registration.internship_company_address.as_deref(), Some("1 Main St"));
    assert_eq!(
        registration.internship_registration_form_link.as_deref(),
        Some("https://files.example/form.pdf")
    );
}

// ============================================================================
// Finished internship track
// ============================================================================

#[tokio::test]
async fn finished_track_refuses_a_placement() {
    for status in [TrackStatus::Exempted, TrackStatus::Completed] {
        let h = Harness::new();
        seed_registration(
            &h.store,
            &h.collections,
            &RegistrationBuilder::new("r1", "s1", "2011001")
                .internship(status)
                .build(),
        );

        let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

        assert_eq!(
            outcome,
            Submission::TrackClosed {
                status,
                links_saved: false
            }
        );
        let stored = h.engine.load_registration("r1").await.unwrap();
        assert_eq!(stored.internship_status, Some(status));
        assert_eq!(stored.internship_registration_status, None);
        assert_eq!(stored.internship_company_name, None);
        assert_eq!(h.count("backend"), 0);
        assert_eq!(h.store.transaction_count(), 0);
    }
}

#[tokio::test]
async fn finished_track_still_saves_links() {
    let h = Harness::new();
    seed_registration(
        &h.store,
        &h.collections,
        &RegistrationBuilder::new("r1", "s1", "2011001")
            .internship(TrackStatus::Completed)
            .build(),
    );

    let outcome = h
        .submit(self_arranged("Elsewhere").with_links(form_link()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Submission::TrackClosed {
            status: TrackStatus::Completed,
            links_saved: true
        }
    );
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored.internship_company_name, None);
    assert_eq!(
        stored.internship_registration_form_link.as_deref(),
        Some("https://files.example/form.pdf")
    );
}

// ============================================================================
// Store failures and diagnostics
// ============================================================================

#[tokio::test]
async fn permission_denied_is_reported_with_attempted_data() {
    let h = Harness::new();
    h.store.deny_writes(&h.collections.registrations);

    let error = h.submit(catalog("acme", Some("backend"))).await.unwrap_err();

    assert!(matches!(
        error,
        RegistrationError::StoreWriteFailed {
            source: StoreError::PermissionDenied { .. },
            ..
        }
    ));
    assert_eq!(
        error.user_message(),
        "Could not complete the request, please try again."
    );
    // Atomic: the unit was not taken either.
    assert_eq!(h.count("backend"), 0);

    let events = h.diagnostics.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.permission_denied);
    assert_eq!(event.path, "defenseRegistrations/r1");
    assert_eq!(event.operation, StoreOperation::Write);
    let attempted = event.attempted_data.as_ref().expect("attempted data recorded");
    assert!(attempted.to_string().contains("Acme"));
}

#[tokio::test]
async fn denied_ledger_read_is_reported() {
    let h = Harness::new();
    h.store.deny_reads(&h.collections.occupancy);

    let error = h
        .engine
        .remaining_capacity("s1", "acme", "backend")
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::StoreWriteFailed { .. }));
    let events = h.diagnostics.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].permission_denied);
    assert_eq!(events[0].operation, StoreOperation::Get);
}

#[tokio::test]
async fn conflicts_are_retried() {
    let h = Harness::new();
    h.store.fail_next_commits(2);

    let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

    assert!(outcome.is_accepted());
    assert_eq!(h.store.transaction_count(), 3);
    assert_eq!(h.count("backend"), 1);
    assert!(h.diagnostics.is_empty());
}

#[tokio::test]
async fn persistent_conflicts_give_up() {
    let h = Harness::with_config(EngineConfig {
        conflict_max_attempts: 3,
        conflict_base_delay_ms: 1,
        conflict_max_delay_ms: 2,
        ..EngineConfig::default()
    });
    h.store.fail_next_commits(10);

    let error = h.submit(catalog("acme", Some("backend"))).await.unwrap_err();

    assert!(matches!(
        error,
        RegistrationError::StoreWriteFailed {
            source: StoreError::Conflict(_),
            ..
        }
    ));
    assert_eq!(h.store.transaction_count(), 3);
    assert_eq!(h.diagnostics.len(), 1);
    assert_eq!(h.count("backend"), 0);
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[tokio::test]
async fn concurrent_lock_is_seen_inside_the_transaction() {
    let h = Harness::new();
    // Another tab submits between our planning read and our transaction.
    h.store.interleave_before_next_transaction(WriteOp::Update {
        key: h.registration_key("r1"),
        patch: FieldPatch::new()
            .set("internshipRegistrationStatus", "pending")
            .set("internship_companyName", "Other Tab Inc"),
    });

    let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

    assert_eq!(
        outcome,
        Submission::AlreadyLocked {
            status: ApprovalStatus::Pending,
            links_saved: false
        }
    );
    assert_eq!(h.store.transaction_count(), 1);
    assert_eq!(h.count("backend"), 0);
}

#[tokio::test]
async fn last_place_taken_concurrently_reports_full() {
    let h = Harness::new();
    let ledger = LedgerKey::new("s1", "backend");
    seed_occupancy(&h.store, &h.collections, &ledger, 1);
    h.store.interleave_before_next_transaction(WriteOp::Update {
        key: ledger.document_key(&h.collections.occupancy),
        patch: FieldPatch::new().set("count", 2),
    });

    let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

    assert_eq!(
        outcome,
        Submission::Full {
            position_id: String::from("backend"),
            quantity: 2
        }
    );
    assert_eq!(h.count("backend"), 2);
}

#[tokio::test]
async fn changed_reservation_triggers_a_replan() {
    let h = Harness::new();
    seed_registration(
        &h.store,
        &h.collections,
        &RegistrationBuilder::new("r1", "s1", "2011001")
            .holding("acme", "backend")
            .approval(ApprovalStatus::Rejected)
            .build(),
    );
    seed_occupancy(&h.store, &h.collections, &LedgerKey::new("s1", "backend"), 1);
    // Staff cleared the placement after we planned to release it.
    h.store.interleave_before_next_transaction(WriteOp::Update {
        key: h.registration_key("r1"),
        patch: FieldPatch::new().delete("internship_positionId"),
    });
    h.store.interleave_before_next_transaction(WriteOp::Update {
        key: LedgerKey::new("s1", "backend").document_key(&h.collections.occupancy),
        patch: FieldPatch::new().set("count", 0),
    });

    let outcome = h.submit(catalog("lab", Some("research"))).await.unwrap();

    assert!(outcome.is_accepted());
    assert_eq!(h.store.transaction_count(), 2);
    assert_eq!(h.count("backend"), 0);
    assert_eq!(h.count("research"), 1);
}

#[tokio::test]
async fn concurrent_exemption_is_seen_inside_the_transaction() {
    let h = Harness::new();
    // Staff grants an exemption between our planning read and our transaction.
    h.store.interleave_before_next_transaction(WriteOp::Update {
        key: h.registration_key("r1"),
        patch: FieldPatch::new().set("internshipStatus", "exempted"),
    });

    let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

    assert_eq!(
        outcome,
        Submission::TrackClosed {
            status: TrackStatus::Exempted,
            links_saved: false
        }
    );
    assert_eq!(h.store.transaction_count(), 1);
    assert_eq!(h.count("backend"), 0);
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored.internship_status, Some(TrackStatus::Exempted));
}

#[tokio::test]
async fn rerun_transaction_returns_the_registration_it_committed() {
    let h = Harness::new();
    // The student's other tab saves a letter while our transaction body runs.
    h.store.rerun_next_transaction_after(WriteOp::Update {
        key: h.registration_key("r1"),
        patch: FieldPatch::new().set("internshipAcceptanceLetterLink", "https://docs/letter"),
    });

    let outcome = h.submit(catalog("acme", Some("backend"))).await.unwrap();

    let Submission::Accepted(returned) = outcome else {
        panic!("expected Accepted, got {outcome:?}");
    };
    assert_eq!(
        returned.internship_acceptance_letter_link.as_deref(),
        Some("https://docs/letter")
    );
    assert_eq!(h.store.transaction_count(), 1);
    assert_eq!(h.count("backend"), 1);
    let stored = h.engine.load_registration("r1").await.unwrap();
    assert_eq!(stored.internship_acceptance_letter_link, returned.internship_acceptance_letter_link);
    assert_eq!(stored.internship_company_id.as_deref(), Some("acme"));
}

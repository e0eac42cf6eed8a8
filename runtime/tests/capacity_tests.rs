//! Integration tests for capacity reservation
//!
//! Concurrent submissions against one position must never take more places
//! than the position offers, and the ledger count must always equal the
//! number of registrations holding the position.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use placement_core::catalog::CollectionNames;
use placement_core::document_store::DocumentKey;
use placement_core::intent::{Placement, Submission, SubmissionRequest};
use placement_core::ledger::LedgerKey;
use placement_core::status::ApprovalStatus;
use placement_runtime::{EngineEnvironment, RegistrationEngine};
use placement_testing::fixtures::{
    CompanyBuilder, RegistrationBuilder, occupancy_count, seed_company, seed_registration,
};
use placement_testing::{InMemoryDocumentStore, test_clock};
use proptest::prelude::*;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn setup(students: usize, quantity: u32) -> (Arc<InMemoryDocumentStore>, Arc<RegistrationEngine>) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let collections = CollectionNames::default();
    seed_company(
        &store,
        &collections,
        &CompanyBuilder::new("acme", "Acme")
            .owner("sup-1", "Dr. Owner")
            .position("p1", "Backend", quantity)
            .position("p2", "Frontend", quantity)
            .build(),
    );
    for i in 0..students {
        seed_registration(
            &store,
            &collections,
            &RegistrationBuilder::new(&format!("r{i}"), "s1", &format!("{i:05}")).build(),
        );
    }
    let engine = RegistrationEngine::new(
        EngineEnvironment::new(store.clone()).with_clock(Arc::new(test_clock())),
    );
    (store, Arc::new(engine))
}

fn catalog(position_id: &str) -> SubmissionRequest {
    SubmissionRequest::placement(Placement::FromCatalog {
        company_id: String::from("acme"),
        position_id: Some(position_id.to_string()),
    })
}

async fn submit_all(engine: &Arc<RegistrationEngine>, students: usize) -> Vec<Submission> {
    let handles: Vec<_> = (0..students)
        .map(|i| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move {
                engine
                    .submit_internship_registration(&format!("r{i}"), catalog("p1"))
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(students);
    for handle in handles {
        outcomes.push(handle.await.expect("task panicked").expect("submission failed"));
    }
    outcomes
}

fn registration_key(id: &str) -> DocumentKey {
    DocumentKey::new(CollectionNames::default().registrations, id)
}

fn holders(store: &InMemoryDocumentStore, position_id: &str) -> usize {
    store
        .collection(&CollectionNames::default().registrations)
        .into_iter()
        .filter(|(_, doc)| {
            doc.get("internship_positionId").and_then(serde_json::Value::as_str) == Some(position_id)
        })
        .count()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_students_two_places() {
    let (store, engine) = setup(3, 2);

    let outcomes = submit_all(&engine, 3).await;

    let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
    let full: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, Submission::Full { .. }))
        .collect();
    assert_eq!(accepted, 2);
    assert_eq!(full.len(), 1);
    assert_eq!(
        *full[0],
        Submission::Full {
            position_id: String::from("p1"),
            quantity: 2
        }
    );
    assert_eq!(
        occupancy_count(&store, engine.collections(), &LedgerKey::new("s1", "p1")),
        2
    );
    assert_eq!(holders(&store, "p1"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_students_never_overbook() {
    let (store, engine) = setup(100, 10);

    let outcomes = submit_all(&engine, 100).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 10);
    assert_eq!(
        occupancy_count(&store, engine.collections(), &LedgerKey::new("s1", "p1")),
        10
    );
    assert_eq!(holders(&store, "p1"), 10);
    assert_eq!(
        engine.remaining_capacity("s1", "acme", "p1").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn full_position_writes_nothing() {
    let (store, engine) = setup(2, 1);
    let before_commits = store.commit_count();

    let first = engine
        .submit_internship_registration("r0", catalog("p1"))
        .await
        .unwrap();
    assert!(first.is_accepted());

    let untouched = store.snapshot(&registration_key("r1"));
    let second = engine
        .submit_internship_registration("r1", catalog("p1"))
        .await
        .unwrap();

    assert!(matches!(second, Submission::Full { quantity: 1, .. }));
    assert_eq!(store.commit_count(), before_commits + 1);
    assert_eq!(store.snapshot(&registration_key("r1")), untouched);
    assert_eq!(
        occupancy_count(&store, engine.collections(), &LedgerKey::new("s1", "p1")),
        1
    );
}

#[tokio::test]
async fn capacity_is_per_session() {
    let (store, engine) = setup(0, 1);
    let collections = CollectionNames::default();
    seed_registration(&store, &collections, &RegistrationBuilder::new("a", "s1", "001").build());
    seed_registration(&store, &collections, &RegistrationBuilder::new("b", "s2", "002").build());

    let first = engine.submit_internship_registration("a", catalog("p1")).await.unwrap();
    let second = engine.submit_internship_registration("b", catalog("p1")).await.unwrap();

    assert!(first.is_accepted());
    assert!(second.is_accepted());
    assert_eq!(occupancy_count(&store, &collections, &LedgerKey::new("s1", "p1")), 1);
    assert_eq!(occupancy_count(&store, &collections, &LedgerKey::new("s2", "p1")), 1);
}

#[tokio::test]
async fn switching_position_moves_the_unit() {
    let (store, engine) = setup(1, 1);
    let collections = CollectionNames::default();

    let first = engine.submit_internship_registration("r0", catalog("p1")).await.unwrap();
    assert!(first.is_accepted());
    engine
        .apply_staff_action(
            "r0",
            placement_core::status::StaffAction::RejectInternship {
                reason: Some(String::from("wrong position")),
            },
        )
        .await
        .unwrap();

    let second = engine.submit_internship_registration("r0", catalog("p2")).await.unwrap();

    let registration = second.registration().cloned().unwrap();
    assert_eq!(registration.internship_position_id.as_deref(), Some("p2"));
    assert_eq!(
        registration.internship_registration_status,
        Some(ApprovalStatus::Pending)
    );
    assert_eq!(registration.internship_rejection_reason, None);
    assert_eq!(occupancy_count(&store, &collections, &LedgerKey::new("s1", "p1")), 0);
    assert_eq!(occupancy_count(&store, &collections, &LedgerKey::new("s1", "p2")), 1);
}

#[tokio::test]
async fn resubmitting_held_position_reuses_the_unit() {
    let (store, engine) = setup(2, 1);
    let collections = CollectionNames::default();

    engine.submit_internship_registration("r0", catalog("p1")).await.unwrap();
    engine
        .apply_staff_action(
            "r0",
            placement_core::status::StaffAction::RejectInternship { reason: None },
        )
        .await
        .unwrap();

    // The only place is still held by r0, so r1 cannot take it.
    let other = engine.submit_internship_registration("r1", catalog("p1")).await.unwrap();
    assert!(matches!(other, Submission::Full { .. }));

    let again = engine.submit_internship_registration("r0", catalog("p1")).await.unwrap();
    assert!(again.is_accepted());
    assert_eq!(occupancy_count(&store, &collections, &LedgerKey::new("s1", "p1")), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_releases_and_submissions_keep_ledger_exact() {
    let (store, engine) = setup(20, 5);
    let collections = CollectionNames::default();

    let placed: Vec<String> = submit_all(&engine, 20)
        .await
        .iter()
        .filter_map(|outcome| outcome.registration().map(|r| r.id.clone()))
        .collect();
    assert_eq!(placed.len(), 5);
    // Rejected students may pick another position.
    engine
        .apply_staff_action_batch(
            &placed,
            placement_core::status::StaffAction::RejectInternship { reason: None },
        )
        .await
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let id = format!("r{i}");
                if i % 2 == 0 {
                    engine.clear_internship_data(&id).await.map(|_| ())
                } else {
                    engine
                        .submit_internship_registration(&id, catalog("p2"))
                        .await
                        .map(|_| ())
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.await.expect("task panicked");
    }

    for position in ["p1", "p2"] {
        let count = occupancy_count(&store, &collections, &LedgerKey::new("s1", position));
        assert_eq!(count as usize, holders(&store, position), "ledger drift on {position}");
        assert!(count <= 5);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn accepted_never_exceeds_quantity(students in 1usize..30, quantity in 0u32..8) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("Failed to build runtime");

        let (accepted, count, held) = runtime.block_on(async {
            let (store, engine) = setup(students, quantity);
            let outcomes = submit_all(&engine, students).await;
            let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
            let count = occupancy_count(&store, engine.collections(), &LedgerKey::new("s1", "p1"));
            (accepted, count, holders(&store, "p1"))
        });

        prop_assert_eq!(accepted, students.min(quantity as usize));
        prop_assert_eq!(count as usize, accepted);
        prop_assert_eq!(held, accepted);
    }
}

//! Trait contract tests for InstructionStore, FeedbackStore, TestCaseStore
//! and EvolutionStore.
//!
//! Each contract is written once against the trait and run against both the
//! in-memory fakes and the SurrealDB in-memory engine.

use chrono::{Duration, Utc};
use evolve_state::fakes::{
    MemoryEvolutionStore, MemoryFeedbackStore, MemoryInstructionStore, MemoryTestCaseStore,
};
use evolve_state::storage_traits::*;
use evolve_state::{
    CandidateStatus, ChangeMetadata, CycleStatus, DimensionScores, EvolutionConfig,
    EvolutionCycle, FeedbackRecord, InstructionSet, PromptCandidate, StorageError,
    SurrealEvolutionStore, TestCase,
};

async fn surreal() -> SurrealEvolutionStore {
    SurrealEvolutionStore::in_memory()
        .await
        .expect("surreal in-memory store")
}

fn set(text: &str) -> InstructionSet {
    InstructionSet::new(text).with_template("main", "Write about {{topic}} as {\"title\": ...}")
}

// ===========================================================================
// InstructionStore
// ===========================================================================

async fn instructions_append_and_load<S: InstructionStore>(store: &S) {
    assert!(store.load_current("writer").await.unwrap().is_none());

    let v1 = store
        .write_with_history("writer", None, set("first"), ChangeMetadata::new("seed"))
        .await
        .unwrap();
    assert_eq!(v1.sequence, 1);
    assert!(v1.previous_version_id.is_none());

    let v2 = store
        .write_with_history(
            "writer",
            Some(&v1.version_id),
            set("second"),
            ChangeMetadata::new("alice").with_notes("tighten tone"),
        )
        .await
        .unwrap();
    assert_eq!(v2.sequence, 2);
    assert_eq!(v2.previous_version_id.as_deref(), Some(v1.version_id.as_str()));

    let current = store.load_current("writer").await.unwrap().unwrap();
    assert_eq!(current.version_id, v2.version_id);
    assert_eq!(current.instruction_set.system_text, "second");
    assert_eq!(current.change.notes.as_deref(), Some("tighten tone"));

    let history = store.history("writer").await.unwrap();
    let ids: Vec<&str> = history.iter().map(|v| v.version_id.as_str()).collect();
    assert_eq!(ids, vec![v2.version_id.as_str(), v1.version_id.as_str()]);
}

async fn instructions_stale_write_conflicts<S: InstructionStore>(store: &S) {
    let v1 = store
        .write_with_history("writer", None, set("first"), ChangeMetadata::new("seed"))
        .await
        .unwrap();
    store
        .write_with_history(
            "writer",
            Some(&v1.version_id),
            set("second"),
            ChangeMetadata::new("a"),
        )
        .await
        .unwrap();

    let err = store
        .write_with_history(
            "writer",
            Some(&v1.version_id),
            set("lost update"),
            ChangeMetadata::new("b"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));

    let err = store
        .write_with_history("writer", None, set("also stale"), ChangeMetadata::new("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));

    assert_eq!(store.history("writer").await.unwrap().len(), 2);
    assert_eq!(
        store
            .load_current("writer")
            .await
            .unwrap()
            .unwrap()
            .instruction_set
            .system_text,
        "second"
    );
}

async fn instructions_subjects_are_isolated<S: InstructionStore>(store: &S) {
    store
        .write_with_history("a", None, set("for a"), ChangeMetadata::new("seed"))
        .await
        .unwrap();
    assert!(store.load_current("b").await.unwrap().is_none());
    assert!(store.history("b").await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_instruction_contracts() {
    instructions_append_and_load(&MemoryInstructionStore::new()).await;
    instructions_stale_write_conflicts(&MemoryInstructionStore::new()).await;
    instructions_subjects_are_isolated(&MemoryInstructionStore::new()).await;
}

#[tokio::test]
async fn surreal_instruction_contracts() {
    instructions_append_and_load(&surreal().await).await;
    instructions_stale_write_conflicts(&surreal().await).await;
    instructions_subjects_are_isolated(&surreal().await).await;
}

// ===========================================================================
// FeedbackStore
// ===========================================================================

async fn feedback_window_and_order<S: FeedbackStore>(store: &S) {
    let now = Utc::now();
    let scores = DimensionScores::new(4.0, 4.0, 4.0, 4.0);
    for days_ago in [1, 5, 40] {
        store
            .record(FeedbackRecord::new("writer", scores).at(now - Duration::days(days_ago)))
            .await
            .unwrap();
    }
    store
        .record(FeedbackRecord::new("other", scores).at(now))
        .await
        .unwrap();

    let since = now - Duration::days(30);
    assert_eq!(store.count("writer", since).await.unwrap(), 2);

    let records = store.query("writer", since).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].created_at > records[1].created_at);
    assert!(records.iter().all(|r| r.subject_id == "writer"));
}

#[tokio::test]
async fn memory_feedback_contracts() {
    feedback_window_and_order(&MemoryFeedbackStore::new()).await;
}

#[tokio::test]
async fn surreal_feedback_contracts() {
    feedback_window_and_order(&surreal().await).await;
}

// ===========================================================================
// TestCaseStore
// ===========================================================================

async fn test_cases_active_by_priority<S: TestCaseStore>(store: &S) {
    let low = TestCase::new("writer", "low", serde_json::json!({"topic": "a"})).with_priority(1);
    let high = TestCase::new("writer", "high", serde_json::json!({"topic": "b"})).with_priority(9);
    let off = TestCase::new("writer", "off", serde_json::json!({"topic": "c"}))
        .with_priority(20)
        .inactive();
    for case in [low.clone(), high, off] {
        store.upsert(case).await.unwrap();
    }

    let names: Vec<String> = store
        .list_active("writer")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["high", "low"]);

    // Upsert replaces by id.
    store.upsert(low.inactive()).await.unwrap();
    assert_eq!(store.list_active("writer").await.unwrap().len(), 1);
}

#[tokio::test]
async fn memory_test_case_contracts() {
    test_cases_active_by_priority(&MemoryTestCaseStore::new()).await;
}

#[tokio::test]
async fn surreal_test_case_contracts() {
    test_cases_active_by_priority(&surreal().await).await;
}

// ===========================================================================
// EvolutionStore
// ===========================================================================

async fn configs_upsert_by_subject<S: EvolutionStore>(store: &S) {
    assert!(store.get_config("writer").await.unwrap().is_none());

    let mut config = EvolutionConfig::with_defaults("writer");
    store.save_config(&config).await.unwrap();
    config.enabled = false;
    store.save_config(&config).await.unwrap();
    store
        .save_config(&EvolutionConfig::with_defaults("artist"))
        .await
        .unwrap();

    let loaded = store.get_config("writer").await.unwrap().unwrap();
    assert!(!loaded.enabled);

    let subjects: Vec<String> = store
        .list_configs()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.subject_id)
        .collect();
    assert_eq!(subjects, vec!["artist", "writer"]);
}

async fn terminal_cycles_are_immutable<S: EvolutionStore>(store: &S) {
    let config = EvolutionConfig::with_defaults("writer");
    let mut cycle = EvolutionCycle::start(&config, false);
    store.create_cycle(&cycle).await.unwrap();

    let dup = store.create_cycle(&cycle).await.unwrap_err();
    assert!(matches!(dup, StorageError::Duplicate { .. }));

    cycle.status = CycleStatus::Completed;
    store.update_cycle(&cycle).await.unwrap();

    cycle.status = CycleStatus::Failed;
    let err = store.update_cycle(&cycle).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidCycleState { .. }));

    let stored = store.get_cycle(&cycle.cycle_id).await.unwrap();
    assert_eq!(stored.status, CycleStatus::Completed);

    let missing = store.get_cycle("nope").await.unwrap_err();
    assert!(matches!(missing, StorageError::CycleNotFound { .. }));
}

async fn candidates_cascade_with_cycle<S: EvolutionStore>(store: &S) {
    let config = EvolutionConfig::with_defaults("writer");
    let keep = EvolutionCycle::start(&config, false);
    let doomed = EvolutionCycle::start(&config, false);
    store.create_cycle(&keep).await.unwrap();
    store.create_cycle(&doomed).await.unwrap();

    let survivor = PromptCandidate::new(&keep, set("keep me"), "rationale long enough", vec![]);
    store.insert_candidate(&survivor).await.unwrap();
    for i in 0..2 {
        let mut c = PromptCandidate::new(&doomed, set(&format!("c{i}")), "r", vec![]);
        c.status = CandidateStatus::PendingReview;
        store.insert_candidate(&c).await.unwrap();
    }

    assert_eq!(store.list_candidates(&doomed.cycle_id).await.unwrap().len(), 2);
    assert_eq!(
        store
            .list_candidates_by_status(Some("writer"), CandidateStatus::PendingReview)
            .await
            .unwrap()
            .len(),
        2
    );

    let removed = store.delete_cycle(&doomed.cycle_id).await.unwrap();
    assert_eq!(removed, 2);
    assert!(store.list_candidates(&doomed.cycle_id).await.unwrap().is_empty());
    assert!(matches!(
        store.get_cycle(&doomed.cycle_id).await.unwrap_err(),
        StorageError::CycleNotFound { .. }
    ));

    let still_there = store.get_candidate(&survivor.candidate_id).await.unwrap();
    assert_eq!(still_there.instruction_set.system_text, "keep me");
}

async fn candidate_updates_round_trip<S: EvolutionStore>(store: &S) {
    let config = EvolutionConfig::with_defaults("writer");
    let cycle = EvolutionCycle::start(&config, false);
    store.create_cycle(&cycle).await.unwrap();

    let mut candidate = PromptCandidate::new(&cycle, set("v"), "r", vec!["warn".into()]);
    store.insert_candidate(&candidate).await.unwrap();

    candidate.status = CandidateStatus::Failed;
    candidate.improvement = Some(-0.4);
    store.update_candidate(&candidate).await.unwrap();

    let loaded = store.get_candidate(&candidate.candidate_id).await.unwrap();
    assert_eq!(loaded.status, CandidateStatus::Failed);
    assert_eq!(loaded.improvement, Some(-0.4));
    assert_eq!(loaded.warnings, vec!["warn".to_string()]);

    let ghost = PromptCandidate::new(&cycle, set("ghost"), "r", vec![]);
    let err = store.update_candidate(&ghost).await.unwrap_err();
    assert!(matches!(err, StorageError::CandidateNotFound { .. }));
}

async fn cycles_listed_newest_first<S: EvolutionStore>(store: &S) {
    let writer = EvolutionConfig::with_defaults("writer");
    let artist = EvolutionConfig::with_defaults("artist");
    let mut ids = Vec::new();
    for _ in 0..3 {
        let cycle = EvolutionCycle::start(&writer, false);
        store.create_cycle(&cycle).await.unwrap();
        ids.push(cycle.cycle_id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    store
        .create_cycle(&EvolutionCycle::start(&artist, false))
        .await
        .unwrap();

    let listed: Vec<String> = store
        .list_cycles(Some("writer"), 2)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.cycle_id)
        .collect();
    assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
    assert_eq!(store.list_cycles(None, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn memory_evolution_contracts() {
    configs_upsert_by_subject(&MemoryEvolutionStore::new()).await;
    terminal_cycles_are_immutable(&MemoryEvolutionStore::new()).await;
    candidates_cascade_with_cycle(&MemoryEvolutionStore::new()).await;
    candidate_updates_round_trip(&MemoryEvolutionStore::new()).await;
    cycles_listed_newest_first(&MemoryEvolutionStore::new()).await;
}

#[tokio::test]
async fn surreal_evolution_contracts() {
    configs_upsert_by_subject(&surreal().await).await;
    terminal_cycles_are_immutable(&surreal().await).await;
    candidates_cascade_with_cycle(&surreal().await).await;
    candidate_updates_round_trip(&surreal().await).await;
    cycles_listed_newest_first(&surreal().await).await;
}

//! Branch isolation journeys
//!
//! Changes made inside a branch survive a merge and vanish on discard,
//! including the writes of a scheduled dream cycle that fails validation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reverie_core::{
    BackupSnapshotHook, BranchError, BranchManager, CycleOutcome, CycleStatus, InsightConfig,
    SchedulerConfig, TriggerPriority, ValidationThresholds,
};
use reverie_e2e_tests::harness::{TestDatabase, noiseless};
use reverie_e2e_tests::mocks::ConceptFixtures;

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        schedule_interval_ms: 0,
        cooldown_ms: 0,
        shutdown_timeout_ms: 5_000,
        ..Default::default()
    }
}

// ============================================================================
// MANUAL BRANCHES
// ============================================================================

#[test]
fn test_discard_restores_pre_branch_state() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.9);
    let nodes_before = db.node_count();
    let edges_before = db.edge_count();
    let branches = BranchManager::new(Arc::clone(&db.store));

    branches.create_branch("experiment").unwrap();
    db.store
        .add_concept(ConceptFixtures::pattern("weak", "use mocks for Z", 0.2))
        .unwrap();
    assert_eq!(db.node_count(), nodes_before + 1);

    let discarded = branches.discard_branch("experiment", Some("not useful")).unwrap();

    assert_eq!(discarded.name, "experiment");
    assert_eq!(db.node_count(), nodes_before);
    assert_eq!(db.edge_count(), edges_before);
    assert!(db.store.get_concept("weak").unwrap().is_none());
    assert!(branches.active_branches().unwrap().is_empty());
    assert!(matches!(
        branches.discard_branch("experiment", None),
        Err(BranchError::NotActive(_))
    ));
}

#[test]
fn test_merge_keeps_branch_writes() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.9);
    let branches = BranchManager::new(Arc::clone(&db.store));

    branches.create_branch("keep-me").unwrap();
    db.store
        .add_concept(ConceptFixtures::pattern("strong", "cache warmup before deploy", 0.95))
        .unwrap();

    let validation = branches.validate_branch("keep-me", None).unwrap();
    assert!(validation.passed, "unexpected failure: {:?}", validation.reason);
    branches.merge_branch("keep-me").unwrap();

    assert!(db.store.get_concept("strong").unwrap().is_some());
    assert!(!db.store.in_transaction().unwrap());

    // The merged write survives a reopen
    drop(branches);
    let reopened = reverie_core::ConceptStore::new(Some(db.path().clone())).unwrap();
    assert!(reopened.get_concept("strong").unwrap().is_some());
}

#[test]
fn test_validation_flags_confidence_regression() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.9);
    let branches = BranchManager::with_thresholds(Arc::clone(&db.store), ValidationThresholds::default());

    branches.create_branch("regress").unwrap();
    db.store
        .add_concept(ConceptFixtures::pattern("shaky", "guess the timeout", 0.1))
        .unwrap();
    let validation = branches.validate_branch("regress", None).unwrap();

    assert!(!validation.passed);
    let reason = validation.reason.clone().unwrap_or_default();
    assert!(reason.contains("Average confidence dropped"), "reason: {reason}");
    branches.discard_branch("regress", validation.reason.as_deref()).ok();
    assert_eq!(db.store.quality_metrics().unwrap().pattern_count, 3);
}

#[test]
fn test_snapshot_hook_writes_backup_before_branch() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.9);
    let snapshots = db.dir().join("snapshots");
    std::fs::create_dir_all(&snapshots).unwrap();
    let branches =
        BranchManager::new(Arc::clone(&db.store)).with_snapshot_hook(BackupSnapshotHook::new(&snapshots));

    branches.create_branch("with/backup").unwrap();
    branches.discard_branch("with/backup", None).unwrap();

    let files: Vec<_> = std::fs::read_dir(&snapshots)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);
    let backup = reverie_core::ConceptStore::new(Some(files[0].path())).unwrap();
    assert_eq!(backup.get_stats().unwrap().total_nodes, 3);
}

// ============================================================================
// SCHEDULED CYCLES
// ============================================================================

#[tokio::test]
async fn test_regressing_cycle_is_discarded_and_recorded() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.95);
    let baseline = db.store.quality_metrics().unwrap();
    let engine = db.dream_engine(
        1500,
        noiseless(),
        InsightConfig {
            materialize_patterns: true,
            ..Default::default()
        },
    );
    let scheduler = db.scheduler(Arc::clone(&engine), ValidationThresholds::default(), scheduler_config());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.events().on_event(move |event| {
        sink.lock().unwrap().push(event.name());
        Ok(())
    });

    let result = scheduler.request_dream("e2e", TriggerPriority::Normal, false);
    assert!(result.scheduled, "not scheduled: {}", result.reason);
    assert!(scheduler.wait_for_idle(Duration::from_secs(10)).await);

    let summary = scheduler.history(1).pop().unwrap();
    assert_eq!(summary.outcome, CycleOutcome::Discarded);
    let validation = summary.validation.clone().unwrap();
    assert!(!validation.passed);
    assert!(
        validation
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("Average confidence dropped")
    );

    // Everything the cycle wrote is gone
    assert_eq!(db.store.quality_metrics().unwrap(), baseline);
    assert!(db.store.get_pending_insights(10).unwrap().is_empty());
    assert!(!db.store.in_transaction().unwrap());

    // ...except the cycle row, re-recorded after the rollback
    let cycle_id = summary.cycle_id.unwrap();
    let record = db.store.get_cycle(&cycle_id).unwrap().unwrap();
    assert_eq!(record.status, CycleStatus::Discarded);
    assert!(record.error.is_some());

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "cycle:scheduled",
            "branch_created",
            "dream:start",
            "dream:complete",
            "branch_discarded",
        ]
    );
    assert_eq!(scheduler.stats().cycles_discarded, 1);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_passing_cycle_is_merged() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.6);
    let engine = db.dream_engine(1000, noiseless(), InsightConfig::default());
    let scheduler = db.scheduler(Arc::clone(&engine), ValidationThresholds::default(), scheduler_config());

    assert!(scheduler.request_dream("e2e", TriggerPriority::Normal, false).scheduled);
    assert!(scheduler.wait_for_idle(Duration::from_secs(10)).await);

    let summary = scheduler.history(1).pop().unwrap();
    assert_eq!(summary.outcome, CycleOutcome::Merged);
    assert!(summary.validation.is_none());
    let record = db.store.get_cycle(summary.cycle_id.as_deref().unwrap()).unwrap().unwrap();
    assert_eq!(record.status, CycleStatus::Completed);
    assert_eq!(
        db.store.get_pending_insights(100).unwrap().len(),
        summary.insights
    );
    assert_eq!(scheduler.stats().cycles_merged, 1);
    scheduler.shutdown().await.unwrap();
}

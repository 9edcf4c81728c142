//! Scheduler gating journeys
//!
//! Cooldown, queue bounds, rate limits and the interval trigger, driven
//! against a real store.

use std::sync::Arc;
use std::time::Duration;

use reverie_core::scheduler::SCHEDULER_STATS_KEY;
use reverie_core::{
    CycleScheduler, DreamTrigger, InsightConfig, SchedulerConfig, SchedulerError, SchedulerState,
    SchedulerStats, TriggerPriority, TriggerType, ValidationThresholds,
};
use reverie_e2e_tests::harness::{TestDatabase, noiseless};
use reverie_e2e_tests::mocks::ConceptFixtures;

fn scheduler(db: &TestDatabase, cycle_ms: u64, config: SchedulerConfig) -> Arc<CycleScheduler> {
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.6);
    let engine = db.dream_engine(cycle_ms, noiseless(), InsightConfig::default());
    db.scheduler(engine, ValidationThresholds::default(), config)
}

async fn wait_for_history(scheduler: &CycleScheduler, count: usize, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while scheduler.history(usize::MAX).len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_cooldown_rejects_until_forced() {
    let db = TestDatabase::new_temp();
    let scheduler = scheduler(
        &db,
        100,
        SchedulerConfig {
            schedule_interval_ms: 0,
            cooldown_ms: 60_000,
            ..Default::default()
        },
    );

    assert!(scheduler.request_dream("first", TriggerPriority::Normal, false).scheduled);
    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);
    assert_eq!(scheduler.state(), SchedulerState::CoolingDown);
    assert!(scheduler.status().cooldown_remaining_ms > 0);

    let rejected = scheduler.request_dream("too soon", TriggerPriority::High, false);
    assert!(!rejected.scheduled && !rejected.queued);
    assert!(rejected.reason.starts_with("cooldown active"), "reason: {}", rejected.reason);

    // Interval and experience triggers are held too
    assert!(!scheduler.submit(DreamTrigger::time_based()).scheduled);

    let forced = scheduler.request_dream("now", TriggerPriority::Normal, true);
    assert!(forced.scheduled, "reason: {}", forced.reason);
    assert!(wait_for_history(&scheduler, 2, Duration::from_secs(5)).await);

    let stats = scheduler.stats();
    assert_eq!(stats.triggers_scheduled, 2);
    assert_eq!(stats.triggers_rejected, 2);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quality_gate_failure_bypasses_cooldown_once() {
    let db = TestDatabase::new_temp();
    let scheduler = scheduler(
        &db,
        100,
        SchedulerConfig {
            schedule_interval_ms: 0,
            cooldown_ms: 60_000,
            ..Default::default()
        },
    );

    assert!(scheduler.request_dream("first", TriggerPriority::Normal, false).scheduled);
    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);

    assert!(scheduler.quality_gate_failed("accuracy regressed").scheduled);
    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);
    assert_eq!(scheduler.history(usize::MAX).len(), 2);
    assert_eq!(
        scheduler.history(1)[0].trigger.trigger_type,
        TriggerType::QualityGateFailure
    );

    let limited = scheduler.quality_gate_failed("accuracy regressed again");
    assert!(!limited.scheduled);
    assert!(limited.reason.contains("rate limited"), "reason: {}", limited.reason);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_is_bounded_while_dreaming() {
    let db = TestDatabase::new_temp();
    let scheduler = scheduler(
        &db,
        1_000,
        SchedulerConfig {
            schedule_interval_ms: 0,
            cooldown_ms: 0,
            max_pending_dreams: 1,
            ..Default::default()
        },
    );

    assert!(scheduler.request_dream("running", TriggerPriority::Normal, false).scheduled);
    assert_eq!(scheduler.state(), SchedulerState::Dreaming);

    let queued = scheduler.request_dream("next", TriggerPriority::Low, false);
    assert!(queued.queued);
    let full = scheduler.request_dream("overflow", TriggerPriority::High, false);
    assert!(!full.scheduled && !full.queued);
    assert_eq!(full.reason, "queue_full");
    assert_eq!(scheduler.status().pending, 1);

    // The queued trigger runs once the first cycle ends
    assert!(wait_for_history(&scheduler, 2, Duration::from_secs(10)).await);
    let history = scheduler.history(2);
    assert_eq!(history[0].trigger.reason, "next");
    assert_eq!(history[1].trigger.reason, "running");
    assert_eq!(scheduler.status().pending, 0);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_experience_threshold_triggers_a_cycle() {
    let db = TestDatabase::new_temp();
    let scheduler = scheduler(
        &db,
        100,
        SchedulerConfig {
            schedule_interval_ms: 0,
            cooldown_ms: 0,
            experience_threshold: 3,
            ..Default::default()
        },
    );

    assert!(scheduler.record_experience(0.1).is_none());
    assert!(scheduler.record_experience(0.9).is_none());
    assert!(scheduler.record_experience(0.8).is_none());
    assert_eq!(scheduler.status().experiences_in_window, 2);

    let result = scheduler.record_experience(0.7).expect("threshold reached");
    assert!(result.scheduled);
    assert_eq!(scheduler.status().experiences_in_window, 0);

    assert!(wait_for_history(&scheduler, 1, Duration::from_secs(5)).await);
    assert_eq!(
        scheduler.history(1)[0].trigger.trigger_type,
        TriggerType::ExperienceThreshold
    );
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interval_trigger_fires_and_shutdown_persists_stats() {
    let db = TestDatabase::new_temp();
    let scheduler = scheduler(
        &db,
        100,
        SchedulerConfig {
            schedule_interval_ms: 300,
            cooldown_ms: 0,
            ..Default::default()
        },
    );

    scheduler.start();
    assert!(wait_for_history(&scheduler, 1, Duration::from_secs(5)).await);
    assert_eq!(scheduler.history(1)[0].trigger.trigger_type, TriggerType::TimeBased);

    let stats = scheduler.shutdown().await.unwrap();
    assert!(stats.triggers_scheduled >= 1);
    assert!(matches!(scheduler.shutdown().await, Err(SchedulerError::ShuttingDown)));

    let after = scheduler.request_dream("late", TriggerPriority::High, true);
    assert!(!after.scheduled);
    assert_eq!(after.reason, "shutting_down");

    let persisted: SchedulerStats = serde_json::from_value(
        db.store
            .load_engine_state(SCHEDULER_STATS_KEY)
            .unwrap()
            .expect("persisted stats"),
    )
    .unwrap();
    assert_eq!(persisted.triggers_scheduled, stats.triggers_scheduled);
    assert_eq!(persisted.cycles_merged, stats.cycles_merged);
}

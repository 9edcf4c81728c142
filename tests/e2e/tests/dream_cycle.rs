//! Dream cycle journeys
//!
//! Load concepts, dream, inspect and apply the resulting insights.

use std::sync::Arc;

use reverie_core::{ConceptLoader, CycleStatus, InsightConfig, InsightType};
use reverie_e2e_tests::harness::{TestDatabase, noiseless};
use reverie_e2e_tests::mocks::{ConceptFixtures, ExperienceRow};
use serde_json::json;

#[tokio::test]
async fn test_overlapping_patterns_produce_merge_insight() {
    let db = TestDatabase::new_temp();
    let scenario = ConceptFixtures::seed_overlap_scenario(&db.store, 0.7);
    let engine = db.dream_engine(2000, noiseless(), InsightConfig::default());

    let result = engine.dream().await.unwrap();

    assert_eq!(result.status, CycleStatus::Completed);
    assert!(!result.aborted);
    assert!(result.duration_ms >= 1500, "cycle ended early: {}ms", result.duration_ms);

    let merges: Vec<_> = result
        .insights
        .iter()
        .filter(|i| i.insight_type == InsightType::PatternMerge)
        .collect();
    assert!(!merges.is_empty(), "expected a merge insight, got {:?}", result.insights);
    assert!(
        merges
            .iter()
            .any(|i| i.involves(&scenario.mocks_x) && i.involves(&scenario.mocks_y))
    );
    assert!(
        result.insights.iter().all(|i| !i.involves(&scenario.retry)),
        "unrelated pattern showed up in an insight"
    );
}

#[tokio::test]
async fn test_cycle_is_persisted_with_its_insights() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.7);
    let engine = db.dream_engine(500, noiseless(), InsightConfig::default());

    let result = engine.dream().await.unwrap();

    let record = db.store.get_cycle(&result.cycle_id).unwrap().unwrap();
    assert_eq!(record.status, CycleStatus::Completed);
    assert_eq!(record.insights_generated as usize, result.insights.len());
    assert!(record.end_time.is_some());
    assert_eq!(record.concepts_processed, result.concepts_processed as i64);

    let stored = db.store.get_insights_for_cycle(&result.cycle_id).unwrap();
    assert_eq!(stored.len(), result.insights.len());

    let history = db.store.get_cycles(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, result.cycle_id);
}

#[tokio::test]
async fn test_apply_insight_materializes_pattern() {
    let db = TestDatabase::new_temp();
    ConceptFixtures::seed_overlap_scenario(&db.store, 0.7);
    let engine = db.dream_engine(1500, noiseless(), InsightConfig::default());
    engine.dream().await.unwrap();

    let pending = engine.get_pending_insights(10).unwrap();
    let target = pending
        .iter()
        .find(|i| i.actionable)
        .cloned()
        .expect("an actionable insight");
    let patterns_before = db.store.quality_metrics().unwrap().pattern_count;

    let applied = engine.apply_insight(&target.id, Some("worked")).unwrap();

    assert!(applied.applied);
    assert_eq!(applied.feedback.as_deref(), Some("worked"));
    let pattern_id = applied.pattern_id.clone().expect("materialized pattern id");
    assert!(db.store.get_concept(&pattern_id).unwrap().is_some());
    assert_eq!(db.store.quality_metrics().unwrap().pattern_count, patterns_before + 1);

    assert!(
        engine
            .get_pending_insights(10)
            .unwrap()
            .iter()
            .all(|i| i.id != target.id)
    );

    // Applying twice keeps the same pattern
    let again = engine.apply_insight(&target.id, None).unwrap();
    assert_eq!(again.pattern_id, Some(pattern_id));
    assert_eq!(db.store.quality_metrics().unwrap().pattern_count, patterns_before + 1);
}

#[tokio::test]
async fn test_apply_unknown_insight_fails() {
    let db = TestDatabase::new_temp();
    let engine = db.dream_engine(100, noiseless(), InsightConfig::default());

    assert!(engine.apply_insight("no-such-insight", None).is_err());
}

#[tokio::test]
async fn test_empty_graph_completes_without_insights() {
    let db = TestDatabase::new_temp();
    let engine = db.dream_engine(200, noiseless(), InsightConfig::default());

    let result = engine.dream().await.unwrap();

    assert_eq!(result.status, CycleStatus::Completed);
    assert!(result.insights.is_empty());
    assert_eq!(result.concepts_processed, 0);
}

#[tokio::test]
async fn test_loaded_upstream_rows_feed_a_cycle() {
    let db = TestDatabase::new_temp();
    {
        let conn = db.raw_connection();
        ConceptFixtures::insert_pattern(&conn, "p1", "cache responses for the payment client", 0.8);
        ConceptFixtures::insert_synthesized(&conn, "s1", "technique", "cache responses for the billing client");
        ConceptFixtures::insert_experience(
            &conn,
            &ExperienceRow::new(
                "e1",
                json!({
                    "patternsUsed": ["p1"],
                    "decisionsMade": ["warm the cache at startup"],
                    "errorsEncountered": ["cache stampede on deploy"]
                }),
            ),
        );
        // Old and already processed: skipped
        ConceptFixtures::insert_experience(&conn, &ExperienceRow::new("e-old", json!({})).processed(30));
    }

    let report = ConceptLoader::new(Arc::clone(&db.store)).load_all().unwrap();
    assert_eq!(report.patterns, 1);
    assert_eq!(report.synthesized, 1);
    assert_eq!(report.experiences, 1);
    assert_eq!(report.decisions, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.total_nodes() as i64, db.node_count());
    assert!(db.store.get_concept("exp-e-old").unwrap().is_none());

    // Reloading is idempotent
    let edges = db.edge_count();
    let uses = db.store.get_edge("exp-e1", "pattern-p1").unwrap().unwrap();
    let stampede = db.store.get_edge("exp-e1", "error-cache-stampede-on-deploy").unwrap().unwrap();
    for _ in 0..2 {
        let again = ConceptLoader::new(Arc::clone(&db.store)).load_all().unwrap();
        assert_eq!(again.edges, 0);
    }
    assert_eq!(db.edge_count(), edges);
    for before in [uses, stampede] {
        let after = db.store.get_edge(&before.source, &before.target).unwrap().unwrap();
        assert_eq!(after.weight, before.weight);
        assert_eq!(after.evidence, before.evidence);
    }

    let engine = db.dream_engine(500, noiseless(), InsightConfig::default());
    let result = engine.dream().await.unwrap();
    assert_eq!(result.status, CycleStatus::Completed);
    assert!(result.concepts_processed as i64 <= db.node_count());
}

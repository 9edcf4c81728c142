//! Concept Fixtures
//!
//! Pre-built concept graphs and upstream rows:
//! - Single pattern concepts with a chosen confidence
//! - The overlap scenario (two similar patterns plus an unrelated one)
//! - Rows for the `patterns`, `synthesized_patterns` and
//!   `captured_experiences` tables the loader reads

use chrono::{Duration, Utc};
use reverie_core::{ConceptMetadata, ConceptNode, ConceptStore, ConceptType};
use rusqlite::{Connection, params};

/// Ids of the overlap scenario's concepts
#[derive(Debug, Clone)]
pub struct OverlapScenario {
    pub mocks_x: String,
    pub mocks_y: String,
    pub retry: String,
}

/// A `captured_experiences` row
#[derive(Debug, Clone)]
pub struct ExperienceRow {
    pub id: String,
    pub agent_id: String,
    pub task_type: String,
    pub success: bool,
    pub quality_score: f64,
    pub context: serde_json::Value,
    pub processed: bool,
    /// Age of the row in days
    pub age_days: i64,
}

impl ExperienceRow {
    pub fn new(id: &str, context: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            task_type: "testing".to_string(),
            success: true,
            quality_score: 0.8,
            context,
            processed: false,
            age_days: 0,
        }
    }

    pub fn processed(mut self, age_days: i64) -> Self {
        self.processed = true;
        self.age_days = age_days;
        self
    }
}

/// Factory for concept graphs and upstream rows
pub struct ConceptFixtures;

impl ConceptFixtures {
    // ========================================================================
    // CONCEPTS
    // ========================================================================

    /// A pattern concept carrying a confidence
    pub fn pattern(id: &str, content: &str, confidence: f64) -> ConceptNode {
        ConceptNode::new(id, ConceptType::Pattern, content).with_metadata(ConceptMetadata {
            confidence: Some(confidence),
            ..Default::default()
        })
    }

    /// Two near-duplicate mock patterns and one unrelated retry pattern
    pub fn seed_overlap_scenario(store: &ConceptStore, confidence: f64) -> OverlapScenario {
        let scenario = OverlapScenario {
            mocks_x: "mocks-x".to_string(),
            mocks_y: "mocks-y".to_string(),
            retry: "retry".to_string(),
        };
        for (id, content) in [
            (&scenario.mocks_x, "use mocks for X"),
            (&scenario.mocks_y, "use mocks for Y"),
            (&scenario.retry, "retry on timeout"),
        ] {
            store
                .add_concept(Self::pattern(id, content, confidence))
                .expect("Failed to add concept");
        }
        scenario
    }

    // ========================================================================
    // UPSTREAM ROWS
    // ========================================================================

    pub fn insert_pattern(conn: &Connection, id: &str, content: &str, confidence: f64) {
        conn.execute(
            "INSERT INTO patterns (id, pattern_type, content, confidence, success_rate, usage_count, domain)
             VALUES (?1, 'pattern', ?2, ?3, 0.9, 4, 'testing')",
            params![id, content, confidence],
        )
        .expect("Failed to insert pattern");
    }

    pub fn insert_synthesized(conn: &Connection, id: &str, kind: &str, description: &str) {
        conn.execute(
            "INSERT INTO synthesized_patterns (id, type, description, confidence, agent_types, task_types)
             VALUES (?1, ?2, ?3, 0.7, '[\"tester\"]', '[\"testing\"]')",
            params![id, kind, description],
        )
        .expect("Failed to insert synthesized pattern");
    }

    pub fn insert_experience(conn: &Connection, row: &ExperienceRow) {
        let created_at = (Utc::now() - Duration::days(row.age_days))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        conn.execute(
            "INSERT INTO captured_experiences
                (id, agent_id, agent_type, task_type, success, duration_ms, context, quality_score, processed, created_at)
             VALUES (?1, ?2, 'tester', ?3, ?4, 1200, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.agent_id,
                row.task_type,
                row.success,
                row.context.to_string(),
                row.quality_score,
                row.processed,
                created_at,
            ],
        )
        .expect("Failed to insert experience");
    }
}

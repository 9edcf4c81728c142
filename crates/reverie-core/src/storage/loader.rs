//! Upstream Concept Loader
//!
//! Reads the tables owned by the pattern-synthesis and experience-capture
//! stages and upserts them into the concept graph:
//!
//! - `patterns` → `pattern` nodes (`pattern-<id>`)
//! - `synthesized_patterns` → `pattern` / `technique` / `outcome` nodes (`synth-<id>`)
//! - `captured_experiences` → `outcome` nodes (`exp-<id>`) plus `technique`
//!   nodes for decisions and `error` nodes for errors, linked by
//!   `uses_pattern` / `made_decision` / `encountered_error` edges
//!
//! The upstream tables are never written.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ConceptStore, Result};
use crate::concept::{ConceptEdge, ConceptMetadata, ConceptNode, ConceptType, EdgeType};

/// Experiences newer than this are loaded even when already processed
pub const DEFAULT_RECENT_DAYS: i64 = 7;

/// Counts of what one load pass produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub patterns: usize,
    pub synthesized: usize,
    pub experiences: usize,
    pub decisions: usize,
    pub errors: usize,
    pub edges: usize,
    /// Rows whose context could not be parsed
    pub skipped_contexts: usize,
}

impl LoadReport {
    /// Total concept nodes upserted
    pub fn total_nodes(&self) -> usize {
        self.patterns + self.synthesized + self.experiences + self.decisions + self.errors
    }
}

/// Structured part of a captured experience
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExperienceContext {
    #[serde(alias = "patterns_used")]
    patterns_used: Vec<String>,
    #[serde(alias = "decisions_made")]
    decisions_made: Vec<String>,
    #[serde(alias = "errors_encountered")]
    errors_encountered: Vec<String>,
}

struct PatternRow {
    id: String,
    pattern_type: String,
    content: String,
    confidence: Option<f64>,
    success_rate: Option<f64>,
    usage_count: Option<i64>,
    domain: Option<String>,
}

struct SynthesizedRow {
    id: String,
    kind: String,
    description: String,
    confidence: Option<f64>,
    agent_types: String,
    task_types: String,
}

struct ExperienceRow {
    id: String,
    agent_id: String,
    agent_type: Option<String>,
    task_type: Option<String>,
    success: bool,
    duration_ms: Option<i64>,
    context: String,
    quality_score: Option<f64>,
    processed: bool,
    created_at: String,
}

/// Loads upstream producer tables into the concept store
pub struct ConceptLoader {
    store: Arc<ConceptStore>,
    recent_window: Duration,
}

impl ConceptLoader {
    pub fn new(store: Arc<ConceptStore>) -> Self {
        Self {
            store,
            recent_window: Duration::days(DEFAULT_RECENT_DAYS),
        }
    }

    /// Override how far back processed experiences are still loaded
    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }

    /// Load every upstream source
    pub fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        self.load_patterns(&mut report)?;
        self.load_synthesized_patterns(&mut report)?;
        self.load_experiences(&mut report)?;

        tracing::info!(
            patterns = report.patterns,
            synthesized = report.synthesized,
            experiences = report.experiences,
            edges = report.edges,
            "Loaded upstream concepts"
        );
        Ok(report)
    }

    /// `patterns` → `pattern` nodes
    pub fn load_patterns(&self, report: &mut LoadReport) -> Result<()> {
        let rows = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pattern_type, content, confidence, success_rate, usage_count, domain
                 FROM patterns ORDER BY created_at, id",
            )?;
            stmt.query_map([], |row| {
                Ok(PatternRow {
                    id: row.get(0)?,
                    pattern_type: row.get(1)?,
                    content: row.get(2)?,
                    confidence: row.get(3)?,
                    success_rate: row.get(4)?,
                    usage_count: row.get(5)?,
                    domain: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for row in rows {
            let mut metadata = ConceptMetadata {
                confidence: row.confidence,
                success_rate: row.success_rate,
                usage_count: row.usage_count.map(|c| c.max(0) as u64),
                domain: row.domain,
                source: Some("patterns".to_string()),
                ..Default::default()
            };
            metadata
                .extra
                .insert("patternType".into(), serde_json::Value::String(row.pattern_type));

            let node = ConceptNode::new(format!("pattern-{}", row.id), ConceptType::Pattern, row.content)
                .with_metadata(metadata);
            self.store.add_concept(node)?;
            report.patterns += 1;
        }
        Ok(())
    }

    /// `synthesized_patterns` → nodes typed by their declared kind
    pub fn load_synthesized_patterns(&self, report: &mut LoadReport) -> Result<()> {
        let rows = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, description, confidence, agent_types, task_types
                 FROM synthesized_patterns ORDER BY created_at, id",
            )?;
            stmt.query_map([], |row| {
                Ok(SynthesizedRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    description: row.get(2)?,
                    confidence: row.get(3)?,
                    agent_types: row.get(4)?,
                    task_types: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for row in rows {
            let concept_type = match ConceptType::parse_name(&row.kind) {
                ConceptType::Technique => ConceptType::Technique,
                ConceptType::Outcome => ConceptType::Outcome,
                _ => ConceptType::Pattern,
            };
            let agent_types: Vec<String> = serde_json::from_str(&row.agent_types).unwrap_or_default();
            let task_types: Vec<String> = serde_json::from_str(&row.task_types).unwrap_or_default();

            let mut metadata = ConceptMetadata {
                confidence: row.confidence,
                agent_type: agent_types.first().cloned(),
                task_type: task_types.first().cloned(),
                source: Some("synthesized_patterns".to_string()),
                ..Default::default()
            };
            metadata.extra.insert("agentTypes".into(), serde_json::json!(agent_types));
            metadata.extra.insert("taskTypes".into(), serde_json::json!(task_types));

            let node = ConceptNode::new(format!("synth-{}", row.id), concept_type, row.description)
                .with_metadata(metadata);
            self.store.add_concept(node)?;
            report.synthesized += 1;
        }
        Ok(())
    }

    /// Unprocessed or recent `captured_experiences` → outcome/error/technique nodes and edges
    pub fn load_experiences(&self, report: &mut LoadReport) -> Result<()> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.recent_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, agent_type, task_type, success, duration_ms, context,
                        quality_score, processed, created_at
                 FROM captured_experiences ORDER BY created_at, id",
            )?;
            stmt.query_map([], |row| {
                Ok(ExperienceRow {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    agent_type: row.get(2)?,
                    task_type: row.get(3)?,
                    success: row.get(4)?,
                    duration_ms: row.get(5)?,
                    context: row.get(6)?,
                    quality_score: row.get(7)?,
                    processed: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for row in rows {
            let recent = parse_upstream_timestamp(&row.created_at).is_some_and(|t| t >= cutoff);
            if row.processed && !recent {
                continue;
            }
            self.load_experience(row, report)?;
        }
        Ok(())
    }

    fn load_experience(&self, row: ExperienceRow, report: &mut LoadReport) -> Result<()> {
        let agent_type = row.agent_type.clone().unwrap_or_else(|| "agent".to_string());
        let task_type = row.task_type.clone().unwrap_or_else(|| "task".to_string());
        let verdict = if row.success { "succeeded" } else { "failed" };

        let mut metadata = ConceptMetadata {
            confidence: row.quality_score,
            success_rate: Some(if row.success { 1.0 } else { 0.0 }),
            execution_count: Some(1),
            agent_type: row.agent_type.clone(),
            task_type: row.task_type.clone(),
            source: Some("captured_experiences".to_string()),
            ..Default::default()
        };
        metadata.extra.insert("agentId".into(), serde_json::Value::String(row.agent_id.clone()));
        if let Some(ms) = row.duration_ms {
            metadata.extra.insert("durationMs".into(), serde_json::json!(ms));
        }

        let outcome_id = format!("exp-{}", row.id);
        let outcome = ConceptNode::new(
            outcome_id.clone(),
            ConceptType::Outcome,
            format!("{} {} {}", agent_type, task_type, verdict),
        )
        .with_metadata(metadata);
        self.store.add_concept(outcome)?;
        report.experiences += 1;

        let context: ExperienceContext = match serde_json::from_str(&row.context) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(experience = %row.id, "Skipping malformed experience context: {}", e);
                report.skipped_contexts += 1;
                return Ok(());
            }
        };

        for pattern_ref in &context.patterns_used {
            let Some(target) = self.resolve_pattern(pattern_ref)? else {
                continue;
            };
            let weight = if row.success { 0.7 } else { 0.3 };
            self.link(&outcome_id, &target, weight, EdgeType::UsesPattern, report)?;
        }

        for decision in &context.decisions_made {
            let id = format!("decision-{}", slug(decision));
            if self.store.get_concept(&id)?.is_none() {
                let node = ConceptNode::new(id.clone(), ConceptType::Technique, decision.clone())
                    .with_metadata(ConceptMetadata {
                        agent_type: row.agent_type.clone(),
                        task_type: row.task_type.clone(),
                        source: Some("captured_experiences".to_string()),
                        ..Default::default()
                    });
                self.store.add_concept(node)?;
                report.decisions += 1;
            }
            self.link(&outcome_id, &id, 0.5, EdgeType::MadeDecision, report)?;
        }

        for error in &context.errors_encountered {
            let id = format!("error-{}", slug(error));
            if self.store.get_concept(&id)?.is_none() {
                let node = ConceptNode::new(id.clone(), ConceptType::Error, error.clone())
                    .with_metadata(ConceptMetadata {
                        task_type: row.task_type.clone(),
                        source: Some("captured_experiences".to_string()),
                        ..Default::default()
                    });
                self.store.add_concept(node)?;
                report.errors += 1;
            }
            self.link(&outcome_id, &id, 0.6, EdgeType::EncounteredError, report)?;
        }

        Ok(())
    }

    /// Add an experience edge once; `add_edge` would strengthen a repeat
    fn link(
        &self,
        source: &str,
        target: &str,
        weight: f64,
        edge_type: EdgeType,
        report: &mut LoadReport,
    ) -> Result<()> {
        if self.store.get_edge(source, target)?.is_some() {
            return Ok(());
        }
        self.store.add_edge(ConceptEdge::new(source, target, weight, edge_type))?;
        report.edges += 1;
        Ok(())
    }

    /// Map an upstream pattern reference onto an existing node id
    fn resolve_pattern(&self, reference: &str) -> Result<Option<String>> {
        for candidate in [
            format!("pattern-{}", reference),
            format!("synth-{}", reference),
            reference.to_string(),
        ] {
            if self.store.get_concept(&candidate)?.is_some() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// Lowercase, dash-separated identifier fragment
fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(64));
    let mut last_dash = true;
    for c in text.chars() {
        if out.len() >= 64 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Upstream writers use either RFC3339 or SQLite's `datetime('now')` format
fn parse_upstream_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

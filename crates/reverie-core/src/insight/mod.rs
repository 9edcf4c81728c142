//! Insight Module
//!
//! Scored conclusions drawn from one dream cycle's activation result:
//! - Pattern merge (two strongly overlapping actionable concepts)
//! - Novel association (co-activated pair with no strong edge)
//! - Optimization (an actionable concept that underperforms)
//! - Gap detection (errors without a known resolution, outcomes without technique)

mod generator;
mod template;

pub use generator::{InsightConfig, InsightGenerator};
pub use template::PatternTemplate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of insight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    PatternMerge,
    NovelAssociation,
    Optimization,
    GapDetection,
}

impl InsightType {
    pub const ALL: [InsightType; 4] = [
        InsightType::PatternMerge,
        InsightType::NovelAssociation,
        InsightType::Optimization,
        InsightType::GapDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::PatternMerge => "pattern_merge",
            InsightType::NovelAssociation => "novel_association",
            InsightType::Optimization => "optimization",
            InsightType::GapDetection => "gap_detection",
        }
    }

    /// Parse from string name, falling back to `NovelAssociation`
    pub fn parse_name(s: &str) -> Self {
        match s {
            "pattern_merge" => InsightType::PatternMerge,
            "optimization" => InsightType::Optimization,
            "gap_detection" => InsightType::GapDetection,
            _ => InsightType::NovelAssociation,
        }
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InsightType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown insight type: {}", s))
    }
}

/// An insight produced by a dream cycle
///
/// Immutable after creation except for the `applied` flag and the feedback,
/// timestamp, and pattern id recorded alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamInsight {
    pub id: String,
    /// Cycle that produced the insight
    pub cycle_id: String,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    /// Concept ids the insight is about
    pub source_concepts: Vec<String>,
    pub description: String,
    /// How new the insight is (0.0 - 1.0)
    pub novelty_score: f64,
    /// How much it can be trusted (0.0 - 1.0)
    pub confidence_score: f64,
    /// confidence >= the generator's minimum confidence
    pub actionable: bool,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    /// Materialized pattern concept, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DreamInsight {
    /// Whether the insight mentions a concept
    pub fn involves(&self, concept_id: &str) -> bool {
        self.source_concepts.iter().any(|c| c == concept_id)
    }
}

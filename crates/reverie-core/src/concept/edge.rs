//! Concept Edges - weighted, typed associations between concepts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of relationship between concept nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Discovered from content/embedding similarity
    #[default]
    Similarity,
    /// A caused B
    Causation,
    /// Observed together
    CoOccurrence,
    /// A followed by B
    Sequence,
    /// Outcome used a pattern
    UsesPattern,
    /// Outcome involved a decision
    MadeDecision,
    /// Outcome hit an error
    EncounteredError,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Similarity => "similarity",
            EdgeType::Causation => "causation",
            EdgeType::CoOccurrence => "co_occurrence",
            EdgeType::Sequence => "sequence",
            EdgeType::UsesPattern => "uses_pattern",
            EdgeType::MadeDecision => "made_decision",
            EdgeType::EncounteredError => "encountered_error",
        }
    }

    /// Parse from string name, falling back to `Similarity`
    pub fn parse_name(s: &str) -> Self {
        match s {
            "causation" => EdgeType::Causation,
            "co_occurrence" => EdgeType::CoOccurrence,
            "sequence" => EdgeType::Sequence,
            "uses_pattern" => EdgeType::UsesPattern,
            "made_decision" => EdgeType::MadeDecision,
            "encountered_error" => EdgeType::EncounteredError,
            _ => EdgeType::Similarity,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed, weighted edge between two concepts
///
/// At most one edge exists per ordered (source, target) pair; re-adding
/// strengthens the existing record instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Association strength (0.0 - 1.0)
    pub weight: f64,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    /// Number of observations backing this edge (never decreases)
    pub evidence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConceptEdge {
    /// Create a new edge with a single observation
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        weight: f64,
        edge_type: EdgeType,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        let now = Utc::now();
        Self {
            id: edge_id(&source, &target),
            source,
            target,
            weight: weight.clamp(0.0, 1.0),
            edge_type,
            evidence: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic id for the ordered pair
pub fn edge_id(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}

//! Concept Node - The unit of distilled knowledge
//!
//! Each node represents one learned concept with:
//! - A type (pattern, technique, domain, outcome, error)
//! - Free-text content used for similarity scoring
//! - An optional opaque embedding
//! - A transient activation level in [0, 1]
//! - Typed metadata with a side-table for unrecognised keys

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONCEPT TYPES
// ============================================================================

/// Types of concept nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConceptType {
    /// A reusable learned pattern
    #[default]
    Pattern,
    /// A concrete technique or decision an agent applied
    Technique,
    /// A problem domain
    Domain,
    /// The outcome of an executed task
    Outcome,
    /// An error encountered during execution
    Error,
}

impl ConceptType {
    /// All concept types, in storage order
    pub const ALL: [ConceptType; 5] = [
        ConceptType::Pattern,
        ConceptType::Technique,
        ConceptType::Domain,
        ConceptType::Outcome,
        ConceptType::Error,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Pattern => "pattern",
            ConceptType::Technique => "technique",
            ConceptType::Domain => "domain",
            ConceptType::Outcome => "outcome",
            ConceptType::Error => "error",
        }
    }

    /// Parse from string name, falling back to `Pattern`
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "technique" => ConceptType::Technique,
            "domain" => ConceptType::Domain,
            "outcome" => ConceptType::Outcome,
            "error" => ConceptType::Error,
            _ => ConceptType::Pattern,
        }
    }

    /// Patterns and techniques are the "actionable" concept kinds
    pub fn is_actionable_kind(&self) -> bool {
        matches!(self, ConceptType::Pattern | ConceptType::Technique)
    }
}

impl std::fmt::Display for ConceptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConceptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pattern" => Ok(ConceptType::Pattern),
            "technique" => Ok(ConceptType::Technique),
            "domain" => Ok(ConceptType::Domain),
            "outcome" => Ok(ConceptType::Outcome),
            "error" => Ok(ConceptType::Error),
            _ => Err(format!("Unknown concept type: {}", s)),
        }
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Number of known metadata fields, used by [`ConceptMetadata::richness`]
const KNOWN_METADATA_FIELDS: f64 = 8.0;

/// Concept metadata
///
/// Upstream loaders write loosely structured metadata. The fields every
/// consumer understands are typed; anything else lands in `extra` so schema
/// drift never fails a load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMetadata {
    /// Confidence assigned by whoever produced the concept (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Observed success rate when the concept was applied (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// Number of times the concept was executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    /// Number of times the concept was referenced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<u64>,
    /// Problem domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Agent type the concept applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Task type the concept applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Provenance (loader table, insight id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Unrecognised keys, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConceptMetadata {
    /// How much is known about the concept (0.0 - 1.0)
    ///
    /// Share of known fields populated, plus 0.05 per extra key, capped at 1.
    pub fn richness(&self) -> f64 {
        let populated = [
            self.confidence.is_some(),
            self.success_rate.is_some(),
            self.execution_count.is_some(),
            self.usage_count.is_some(),
            self.domain.is_some(),
            self.agent_type.is_some(),
            self.task_type.is_some(),
            self.source.is_some(),
        ]
        .iter()
        .filter(|&&present| present)
        .count() as f64;

        (populated / KNOWN_METADATA_FIELDS + self.extra.len() as f64 * 0.05).min(1.0)
    }

    /// Parse metadata from its stored JSON form
    ///
    /// A known field holding the wrong type is moved into `extra` and the
    /// rest of the object is kept. Anything that is not a JSON object yields
    /// empty metadata.
    pub fn from_json(json: &str) -> Self {
        let err = match serde_json::from_str(json) {
            Ok(metadata) => return metadata,
            Err(e) => e,
        };
        let Ok(serde_json::Value::Object(mut fields)) = serde_json::from_str(json) else {
            tracing::warn!("Discarding unparsable concept metadata: {}", err);
            return Self::default();
        };
        tracing::warn!("Concept metadata has mistyped fields, keeping the rest: {}", err);

        let mut mistyped = serde_json::Map::new();
        let mut metadata = Self {
            confidence: take_field(&mut fields, &mut mistyped, "confidence"),
            success_rate: take_field(&mut fields, &mut mistyped, "successRate"),
            execution_count: take_field(&mut fields, &mut mistyped, "executionCount"),
            usage_count: take_field(&mut fields, &mut mistyped, "usageCount"),
            domain: take_field(&mut fields, &mut mistyped, "domain"),
            agent_type: take_field(&mut fields, &mut mistyped, "agentType"),
            task_type: take_field(&mut fields, &mut mistyped, "taskType"),
            source: take_field(&mut fields, &mut mistyped, "source"),
            extra: fields,
        };
        metadata.extra.extend(mistyped);
        metadata
    }
}

/// Remove `key` and decode it, parking a mistyped value in `mistyped`
fn take_field<T: DeserializeOwned>(
    fields: &mut serde_json::Map<String, serde_json::Value>,
    mistyped: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<T> {
    let value = fields.remove(key)?;
    match serde_json::from_value::<Option<T>>(value.clone()) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!(field = key, "Mistyped metadata field: {}", e);
            mistyped.insert(key.to_string(), value);
            None
        }
    }
}

// ============================================================================
// CONCEPT NODE
// ============================================================================

/// A concept node in the consolidation graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptNode {
    /// Stable identifier
    pub id: String,
    /// Kind of concept
    #[serde(rename = "type")]
    pub concept_type: ConceptType,
    /// Free-text description
    pub content: String,
    /// Optional fixed-length embedding (opaque to this crate)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Current activation (always clamped to [0, 1])
    pub activation_level: f64,
    /// When activation was last set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated: Option<DateTime<Utc>>,
    /// Typed metadata
    #[serde(default)]
    pub metadata: ConceptMetadata,
    /// When the node was first stored
    pub created_at: DateTime<Utc>,
}

impl ConceptNode {
    /// Create a new node with zero activation
    pub fn new(id: impl Into<String>, concept_type: ConceptType, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            concept_type,
            content: content.into(),
            embedding: None,
            activation_level: 0.0,
            last_activated: None,
            metadata: ConceptMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Builder: attach metadata
    pub fn with_metadata(mut self, metadata: ConceptMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder: attach an embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Clamp an activation value into [0, 1], mapping NaN to 0
pub fn clamp_activation(level: f64) -> f64 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

/// Encode an embedding as little-endian f32 bytes
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode an embedding from little-endian f32 bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

//! Concept module - Core graph types
//!
//! - Concept nodes with typed metadata and clamped activation
//! - Directed weighted edges with evidence counts
//! - Similarity scoring for edge auto-discovery

mod edge;
mod node;
pub mod similarity;

pub use edge::{ConceptEdge, EdgeType, edge_id};
pub use node::{
    ConceptMetadata, ConceptNode, ConceptType, clamp_activation, embedding_from_bytes,
    embedding_to_bytes,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Concept graph statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptStats {
    /// Total concept nodes
    pub total_nodes: i64,
    /// Total edges
    pub total_edges: i64,
    /// Node count keyed by concept type name
    pub nodes_by_type: HashMap<String, i64>,
    /// Edge count keyed by edge type name
    pub edges_by_type: HashMap<String, i64>,
    /// Average outgoing edges per node
    pub avg_edges_per_node: f64,
    /// Average activation across all nodes
    pub avg_activation: f64,
}

/// Quality snapshot of the learned-pattern population
///
/// Captured before a dream cycle and compared afterwards to decide whether
/// the cycle's changes may be kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityBaseline {
    /// Number of `pattern` concepts
    pub pattern_count: i64,
    /// Average `metadata.confidence` over patterns that carry one
    pub avg_confidence: f64,
    /// Patterns with confidence >= 0.8
    pub high_confidence_count: i64,
}

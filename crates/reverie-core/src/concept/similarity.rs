//! Concept similarity scoring
//!
//! Used for edge auto-discovery when a concept is added, and for content
//! overlap during insight scoring.

use std::collections::HashSet;

use super::ConceptNode;

/// Weight of a type match in the combined score
const TYPE_MATCH_WEIGHT: f64 = 0.3;

/// Weight of content Jaccard similarity
const CONTENT_WEIGHT: f64 = 0.4;

/// Weight of embedding cosine similarity
const EMBEDDING_WEIGHT: f64 = 0.3;

/// Flat credit when either side lacks an embedding
const MISSING_EMBEDDING_CREDIT: f64 = 0.15;

/// Combined similarity between two concepts (0.0 - 1.0)
///
/// +0.3 for matching types, +0.4 x content Jaccard, +0.3 x embedding cosine
/// when both embeddings are present (0.15 flat otherwise).
pub fn concept_similarity(a: &ConceptNode, b: &ConceptNode) -> f64 {
    let mut score = 0.0;

    if a.concept_type == b.concept_type {
        score += TYPE_MATCH_WEIGHT;
    }

    score += CONTENT_WEIGHT * jaccard_similarity(&a.content, &b.content);

    score += match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => EMBEDDING_WEIGHT * cosine_similarity(ea, eb).max(0.0),
        _ => MISSING_EMBEDDING_CREDIT,
    };

    score.min(1.0)
}

/// Jaccard similarity of lowercased whitespace tokens
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let tokens_b: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();

    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    tokens_a.intersection(&tokens_b).count() as f64 / union as f64
}

/// Cosine similarity between two vectors; 0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    (dot / (mag_a * mag_b)) as f64
}

//! Insight generation from an activation result

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{DreamInsight, InsightType};
use crate::activation::{ActivatedNode, ActivationResult, NovelAssociation};
use crate::concept::similarity::jaccard_similarity;
use crate::concept::{ConceptEdge, ConceptNode, ConceptType, EdgeType};
use crate::storage::{ConceptStore, Result};

/// Merge score a pair must exceed
const MERGE_SCORE_THRESHOLD: f64 = 0.5;

/// Novel associations over an edge stronger than this are already known
const KNOWN_EDGE_WEIGHT: f64 = 0.5;

/// Success rate below which a concept is flagged for optimization
const LOW_SUCCESS_RATE: f64 = 0.7;

/// Executions after which low confidence is considered meaningful
const MIN_EXECUTIONS_FOR_CONFIDENCE: u64 = 10;

/// Confidence below which a well-exercised concept is flagged
const LOW_CONFIDENCE: f64 = 0.6;

/// Actionable nodes compared pairwise for merges
const MAX_MERGE_CANDIDATES: usize = 50;

/// Insight generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InsightConfig {
    /// Upper bound on insights per cycle
    pub max_insights_per_cycle: usize,
    /// Insights below this novelty are dropped
    pub min_novelty_score: f64,
    /// Confidence required for `actionable`
    pub min_confidence: f64,
    /// Materialize actionable insights into pattern concepts as they are generated
    pub materialize_patterns: bool,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            max_insights_per_cycle: 10,
            min_novelty_score: 0.3,
            min_confidence: 0.5,
            materialize_patterns: false,
        }
    }
}

/// Converts activation results into scored insights
pub struct InsightGenerator {
    store: Arc<ConceptStore>,
    config: InsightConfig,
}

impl InsightGenerator {
    pub fn new(store: Arc<ConceptStore>) -> Self {
        Self::with_config(store, InsightConfig::default())
    }

    pub fn with_config(store: Arc<ConceptStore>, config: InsightConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// Score every template against `result` and keep the best
    ///
    /// Returns at most `max_insights_per_cycle` insights with novelty at or
    /// above `min_novelty_score`, most confident first. Nothing is persisted
    /// here except materialized patterns when enabled.
    pub fn generate_from_activation(
        &self,
        cycle_id: &str,
        result: &ActivationResult,
    ) -> Result<Vec<DreamInsight>> {
        let mut nodes: HashMap<String, ConceptNode> = HashMap::new();
        for activated in &result.activated_nodes {
            if let Some(node) = self.store.get_concept(&activated.id)? {
                nodes.insert(node.id.clone(), node);
            }
        }
        for assoc in &result.novel_associations {
            for id in [&assoc.source, &assoc.target] {
                if !nodes.contains_key(id) {
                    if let Some(node) = self.store.get_concept(id)? {
                        nodes.insert(node.id.clone(), node);
                    }
                }
            }
        }

        let mut candidates = Vec::new();
        candidates.extend(self.pattern_merges(cycle_id, &result.activated_nodes, &nodes)?);
        candidates.extend(self.novel_associations(cycle_id, &result.novel_associations, &nodes));
        candidates.extend(self.optimizations(cycle_id, &result.activated_nodes, &nodes));
        candidates.extend(self.gaps(cycle_id, &result.activated_nodes, &nodes)?);

        let considered = candidates.len();
        let mut insights: Vec<DreamInsight> = candidates
            .into_iter()
            .filter(|i| i.novelty_score >= self.config.min_novelty_score)
            .collect();
        insights.sort_by(|a, b| {
            b.confidence_score
                .total_cmp(&a.confidence_score)
                .then_with(|| b.novelty_score.total_cmp(&a.novelty_score))
        });
        insights.truncate(self.config.max_insights_per_cycle);

        if self.config.materialize_patterns {
            for insight in insights.iter_mut() {
                self.materialize(insight)?;
            }
        }

        tracing::debug!(
            cycle_id,
            considered,
            kept = insights.len(),
            "Generated insights"
        );
        Ok(insights)
    }

    /// Store an actionable insight's pattern template as a `pattern` concept
    ///
    /// Links the new concept to each source concept and records `pattern_id`
    /// on the insight. Returns the pattern id, or `None` if not actionable.
    pub fn materialize(&self, insight: &mut DreamInsight) -> Result<Option<String>> {
        if let Some(existing) = &insight.pattern_id {
            return Ok(Some(existing.clone()));
        }
        let Some(template) = insight.to_pattern_template() else {
            return Ok(None);
        };

        let node = self.store.add_concept(template.to_concept())?;
        for source in &insight.source_concepts {
            if self.store.get_concept(source)?.is_some() {
                self.store.add_edge(ConceptEdge::new(
                    node.id.as_str(),
                    source.as_str(),
                    insight.confidence_score,
                    EdgeType::CoOccurrence,
                ))?;
            }
        }

        tracing::info!(insight = %insight.id, pattern = %node.id, "Materialized insight pattern");
        insight.pattern_id = Some(node.id.clone());
        Ok(Some(node.id))
    }

    #[allow(clippy::too_many_arguments)]
    fn new_insight(
        &self,
        cycle_id: &str,
        insight_type: InsightType,
        source_concepts: Vec<String>,
        description: String,
        novelty: f64,
        confidence: f64,
        suggested_action: Option<String>,
    ) -> DreamInsight {
        let confidence = confidence.clamp(0.0, 1.0);
        DreamInsight {
            id: Uuid::new_v4().to_string(),
            cycle_id: cycle_id.to_string(),
            insight_type,
            source_concepts,
            description,
            novelty_score: novelty.clamp(0.0, 1.0),
            confidence_score: confidence,
            actionable: confidence >= self.config.min_confidence,
            applied: false,
            suggested_action,
            pattern_id: None,
            feedback: None,
            applied_at: None,
            created_at: Utc::now(),
        }
    }

    // ========================================================================
    // TEMPLATES
    // ========================================================================

    /// Pairs of active pattern/technique nodes that overlap strongly
    fn pattern_merges(
        &self,
        cycle_id: &str,
        activated: &[ActivatedNode],
        nodes: &HashMap<String, ConceptNode>,
    ) -> Result<Vec<DreamInsight>> {
        let actionable: Vec<(&ActivatedNode, &ConceptNode)> = activated
            .iter()
            .filter(|a| a.concept_type.is_actionable_kind())
            .filter_map(|a| nodes.get(&a.id).map(|n| (a, n)))
            .take(MAX_MERGE_CANDIDATES)
            .collect();

        let mut insights = Vec::new();
        for (i, (act_a, node_a)) in actionable.iter().enumerate() {
            for (act_b, node_b) in &actionable[i + 1..] {
                let edge_weight = self
                    .store
                    .edge_weight_between(&node_a.id, &node_b.id)?
                    .unwrap_or(0.0);
                let content_similarity = jaccard_similarity(&node_a.content, &node_b.content);
                let co_activation = (act_a.activation * act_b.activation).sqrt();

                let score = 0.4 * edge_weight + 0.3 * content_similarity + 0.3 * co_activation;
                if score <= MERGE_SCORE_THRESHOLD {
                    continue;
                }

                let richness = (node_a.metadata.richness() + node_b.metadata.richness()) / 2.0;
                let novelty = 0.5 * (1.0 - edge_weight) + 0.3 * (1.0 - content_similarity) + 0.2;
                let confidence = 0.6 * score + 0.2 * co_activation + 0.2 * richness;

                insights.push(self.new_insight(
                    cycle_id,
                    InsightType::PatternMerge,
                    vec![node_a.id.clone(), node_b.id.clone()],
                    format!(
                        "'{}' and '{}' overlap strongly (merge score {:.2})",
                        excerpt(&node_a.content),
                        excerpt(&node_b.content),
                        score
                    ),
                    novelty,
                    confidence,
                    Some(format!(
                        "Merge {} and {} into a single pattern",
                        node_a.id, node_b.id
                    )),
                ));
            }
        }
        Ok(insights)
    }

    /// Co-activated pairs the graph does not already link strongly
    fn novel_associations(
        &self,
        cycle_id: &str,
        associations: &[NovelAssociation],
        nodes: &HashMap<String, ConceptNode>,
    ) -> Vec<DreamInsight> {
        let mut insights = Vec::new();
        for assoc in associations {
            let edge_weight = assoc.edge_weight.unwrap_or(0.0);
            if edge_weight > KNOWN_EDGE_WEIGHT {
                continue;
            }
            let (Some(a), Some(b)) = (nodes.get(&assoc.source), nodes.get(&assoc.target)) else {
                continue;
            };

            let cross_type = a.concept_type != b.concept_type;
            let content_similarity = jaccard_similarity(&a.content, &b.content);
            let richness = (a.metadata.richness() + b.metadata.richness()) / 2.0;

            let novelty = 0.5 * (1.0 - edge_weight)
                + if assoc.novel { 0.2 } else { 0.0 }
                + if cross_type { 0.3 } else { 0.1 };
            let confidence =
                0.6 * assoc.co_activation + 0.25 * content_similarity + 0.15 * richness;

            insights.push(self.new_insight(
                cycle_id,
                InsightType::NovelAssociation,
                vec![a.id.clone(), b.id.clone()],
                format!(
                    "{} '{}' and {} '{}' activate together (co-activation {:.2})",
                    a.concept_type,
                    excerpt(&a.content),
                    b.concept_type,
                    excerpt(&b.content),
                    assoc.co_activation
                ),
                novelty,
                confidence,
                Some(format!("Link {} and {}", a.id, b.id)),
            ));
        }
        insights
    }

    /// Active pattern/technique nodes whose track record is weak
    fn optimizations(
        &self,
        cycle_id: &str,
        activated: &[ActivatedNode],
        nodes: &HashMap<String, ConceptNode>,
    ) -> Vec<DreamInsight> {
        let mut insights = Vec::new();
        for act in activated.iter().filter(|a| a.concept_type.is_actionable_kind()) {
            let Some(node) = nodes.get(&act.id) else {
                continue;
            };
            let meta = &node.metadata;
            let executions = meta.execution_count.unwrap_or(0);
            let low_success = meta.success_rate.is_some_and(|r| r < LOW_SUCCESS_RATE);
            let low_confidence = executions > MIN_EXECUTIONS_FOR_CONFIDENCE
                && meta.confidence.is_some_and(|c| c < LOW_CONFIDENCE);
            if !low_success && !low_confidence {
                continue;
            }

            let observed = meta.success_rate.or(meta.confidence).unwrap_or(0.5);
            let novelty = 0.3 + 0.4 * (1.0 - observed);
            let confidence = 0.3
                + 0.3 * (executions as f64 / 20.0).min(1.0)
                + 0.2 * act.activation
                + 0.2 * meta.richness();

            let reason = match meta.success_rate {
                Some(rate) if low_success => format!("success rate {:.0}%", rate * 100.0),
                _ => format!(
                    "confidence {:.2} after {} executions",
                    meta.confidence.unwrap_or(0.0),
                    executions
                ),
            };

            insights.push(self.new_insight(
                cycle_id,
                InsightType::Optimization,
                vec![node.id.clone()],
                format!("'{}' underperforms ({})", excerpt(&node.content), reason),
                novelty,
                confidence,
                Some(format!("Review and refine {}", node.id)),
            ));
        }
        insights
    }

    /// Errors without a resolution and outcomes without a technique
    fn gaps(
        &self,
        cycle_id: &str,
        activated: &[ActivatedNode],
        nodes: &HashMap<String, ConceptNode>,
    ) -> Result<Vec<DreamInsight>> {
        let technique_active = activated
            .iter()
            .any(|a| a.concept_type == ConceptType::Technique);

        let mut insights = Vec::new();
        for act in activated {
            let Some(node) = nodes.get(&act.id) else {
                continue;
            };
            let richness = node.metadata.richness();

            match node.concept_type {
                ConceptType::Error => {
                    if self.links_to(&node.id, false, |t| t.is_actionable_kind())? {
                        continue;
                    }
                    insights.push(self.new_insight(
                        cycle_id,
                        InsightType::GapDetection,
                        vec![node.id.clone()],
                        format!("No known resolution for error '{}'", excerpt(&node.content)),
                        0.7,
                        0.4 + 0.3 * act.activation + 0.2 * richness,
                        Some(format!("Capture a pattern that resolves {}", node.id)),
                    ));
                }
                ConceptType::Outcome if !technique_active => {
                    if self.links_to(&node.id, true, |t| t == ConceptType::Technique)? {
                        continue;
                    }
                    insights.push(self.new_insight(
                        cycle_id,
                        InsightType::GapDetection,
                        vec![node.id.clone()],
                        format!("Outcome '{}' has no associated technique", excerpt(&node.content)),
                        0.6,
                        0.35 + 0.3 * act.activation + 0.2 * richness,
                        Some(format!("Record the technique behind {}", node.id)),
                    ));
                }
                _ => {}
            }
        }
        Ok(insights)
    }

    /// Whether `id` has an edge to a node whose type satisfies `accept`
    fn links_to(
        &self,
        id: &str,
        both_directions: bool,
        accept: impl Fn(ConceptType) -> bool,
    ) -> Result<bool> {
        let mut neighbors: Vec<String> = self
            .store
            .get_edges_from(id)?
            .into_iter()
            .map(|e| e.target)
            .collect();
        if both_directions {
            neighbors.extend(self.store.get_edges_to(id)?.into_iter().map(|e| e.source));
        }
        for neighbor in neighbors {
            if let Some(node) = self.store.get_concept(&neighbor)? {
                if accept(node.concept_type) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// First 60 characters of concept content for descriptions
fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(60).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

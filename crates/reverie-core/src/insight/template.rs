//! Pattern templates - actionable insights reshaped into a reusable pattern

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{DreamInsight, InsightType};
use crate::concept::{ConceptMetadata, ConceptNode, ConceptType};

/// A pattern proposal derived from an actionable insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternTemplate {
    pub name: String,
    pub description: String,
    /// merged / association / optimization / gap-resolution
    pub pattern_type: String,
    /// Structured payload for the consuming agents
    pub template: serde_json::Value,
    pub source_insight_id: String,
    pub confidence: f64,
}

impl DreamInsight {
    /// Reshape into a pattern template; `None` unless actionable
    pub fn to_pattern_template(&self) -> Option<PatternTemplate> {
        if !self.actionable {
            return None;
        }

        let short_id: String = self.id.chars().take(8).collect();
        let (name, pattern_type, template) = match self.insight_type {
            InsightType::PatternMerge => (
                format!("merged-{}", short_id),
                "merged",
                json!({
                    "kind": "merge",
                    "sources": self.source_concepts,
                    "strategy": "combine-shared-steps",
                }),
            ),
            InsightType::NovelAssociation => (
                format!("association-{}", short_id),
                "association",
                json!({
                    "kind": "association",
                    "link": self.source_concepts,
                    "applyTogether": true,
                }),
            ),
            InsightType::Optimization => (
                format!("optimize-{}", short_id),
                "optimization",
                json!({
                    "kind": "optimization",
                    "targets": self.source_concepts,
                    "action": self.suggested_action,
                }),
            ),
            InsightType::GapDetection => (
                format!("gap-{}", short_id),
                "gap-resolution",
                json!({
                    "kind": "gap",
                    "unresolved": self.source_concepts,
                    "action": self.suggested_action,
                }),
            ),
        };

        Some(PatternTemplate {
            name,
            description: self.description.clone(),
            pattern_type: pattern_type.to_string(),
            template,
            source_insight_id: self.id.clone(),
            confidence: self.confidence_score,
        })
    }
}

impl PatternTemplate {
    /// Id of the concept node this template materializes into
    pub fn concept_id(&self) -> String {
        format!("insight-{}", self.source_insight_id)
    }

    /// The `pattern` concept node for this template
    pub fn to_concept(&self) -> ConceptNode {
        let mut metadata = ConceptMetadata {
            confidence: Some(self.confidence),
            source: Some("dream_insight".to_string()),
            ..Default::default()
        };
        metadata.extra.insert("name".into(), json!(self.name));
        metadata.extra.insert("patternType".into(), json!(self.pattern_type));
        metadata.extra.insert("template".into(), self.template.clone());

        ConceptNode::new(self.concept_id(), ConceptType::Pattern, self.description.clone())
            .with_metadata(metadata)
    }
}

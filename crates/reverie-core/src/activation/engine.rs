//! Spreading activation over the concept graph
//!
//! `spread` pushes activation from seed nodes along weighted edges with
//! global decay and symmetric noise. `dream` repeats that from random seeds
//! until a wall-clock deadline and collects co-activated pairs that the graph
//! does not already link strongly.
//!
//! The loops are cooperative: the deadline and the cancellation token are
//! only checked between iterations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::history::ActivationHistory;
use crate::concept::{ConceptType, clamp_activation};
use crate::storage::{ConceptStore, Result};

/// Consecutive quiet iterations that count as converged
const CONVERGENCE_ITERATIONS: usize = 3;

/// Most active nodes considered for pairwise novelty detection
const MAX_NOVELTY_CANDIDATES: usize = 200;

/// Co-activation a pair must exceed to be reported
const MIN_CO_ACTIVATION: f64 = 0.3;

/// Existing edges weaker than this do not count as a known association
const NOVEL_EDGE_WEIGHT: f64 = 0.3;

/// Associations returned per spread
const MAX_NOVEL_ASSOCIATIONS: usize = 10;

/// Associations returned per dream
const MAX_DREAM_ASSOCIATIONS: usize = 20;

/// Fixed boost added to each random dream seed
const DREAM_SEED_BOOST: f64 = 0.3;

/// Pause between random dream seeds, in milliseconds
const DREAM_PAUSE_MS: (u64, u64) = (50, 100);

/// Values closer than this are treated as unchanged
const UPDATE_EPSILON: f64 = 1e-9;

// ============================================================================
// CONFIG & RESULTS
// ============================================================================

/// Activation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActivationConfig {
    /// Minimum activation for a node to count as active and spread
    pub threshold: f64,
    /// Share of `activation x weight` pushed to each neighbor
    pub spread_factor: f64,
    /// Fraction of activation lost per iteration
    pub decay_rate: f64,
    /// Amplitude of the symmetric noise added per iteration
    pub noise_level: f64,
    /// Upper bound on iterations per spread
    pub max_iterations: usize,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            spread_factor: 0.5,
            decay_rate: 0.1,
            noise_level: 0.05,
            max_iterations: 20,
        }
    }
}

/// A node that ended a spread above threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedNode {
    pub id: String,
    pub concept_type: ConceptType,
    pub activation: f64,
}

/// A pair of nodes that were active at the same time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NovelAssociation {
    pub source: String,
    pub target: String,
    /// sqrt(activation_source x activation_target)
    pub co_activation: f64,
    /// Strongest existing edge between the two, either direction
    pub edge_weight: Option<f64>,
    /// No edge, or only a weak one
    pub novel: bool,
}

/// Outcome of a spread or a dream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResult {
    /// Propagation iterations run (summed over seeds for a dream)
    pub iterations: usize,
    /// Random seeds picked (0 for a direct spread)
    pub seeds_used: usize,
    /// Highest activation observed on any node
    pub peak_activation: f64,
    /// Active nodes, most active first
    pub activated_nodes: Vec<ActivatedNode>,
    /// Co-activated pairs, novel first
    pub novel_associations: Vec<NovelAssociation>,
    /// Stopped because nothing was changing any more
    pub converged: bool,
    /// Stopped early by deadline or cancellation
    pub interrupted: bool,
}

impl ActivationResult {
    pub fn nodes_activated(&self) -> usize {
        self.activated_nodes.len()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Spreading-activation engine
///
/// Holds only transient state (history maps, RNG, cancellation token); every
/// activation change goes through the store.
pub struct ActivationEngine {
    store: Arc<ConceptStore>,
    config: ActivationConfig,
    history: ActivationHistory,
    rng: StdRng,
    cancel: CancellationToken,
}

impl ActivationEngine {
    pub fn new(store: Arc<ConceptStore>) -> Self {
        Self::with_config(store, ActivationConfig::default())
    }

    pub fn with_config(store: Arc<ConceptStore>, config: ActivationConfig) -> Self {
        Self {
            store,
            config,
            history: ActivationHistory::new(),
            rng: StdRng::from_entropy(),
            cancel: CancellationToken::new(),
        }
    }

    /// Deterministic engine for tests and benchmarks
    pub fn with_seed(store: Arc<ConceptStore>, config: ActivationConfig, seed: u64) -> Self {
        let mut engine = Self::with_config(store, config);
        engine.rng = StdRng::seed_from_u64(seed);
        engine
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    pub fn history(&self) -> &ActivationHistory {
        &self.history
    }

    /// Token observed between iterations; cancelling it stops the current run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a cancelled token so the engine can run again
    pub fn reset_cancellation(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        self.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Spread activation from `seeds`
    ///
    /// Unknown seed ids are ignored; with no valid seed nothing is mutated and
    /// an empty result is returned.
    pub fn spread(
        &mut self,
        seeds: &[String],
        seed_activation: f64,
        deadline: Option<Instant>,
    ) -> Result<ActivationResult> {
        let levels = self.store.activation_levels()?;
        let valid: Vec<(String, f64)> = seeds
            .iter()
            .filter(|id| levels.contains_key(id.as_str()))
            .map(|id| (id.clone(), clamp_activation(seed_activation)))
            .collect();
        if valid.is_empty() {
            return Ok(ActivationResult::default());
        }

        self.store.set_activations(&valid)?;
        for (id, level) in &valid {
            self.history.record_activation(id, *level);
        }

        let mut result = ActivationResult {
            peak_activation: clamp_activation(seed_activation),
            ..Default::default()
        };
        let mut quiet_iterations = 0usize;
        let mut previous_active: Option<usize> = None;

        for _ in 0..self.config.max_iterations {
            if self.should_stop(deadline) {
                result.interrupted = true;
                break;
            }
            result.iterations += 1;

            let levels = self.store.activation_levels()?;
            let active: Vec<(&String, f64)> = levels
                .iter()
                .filter(|(_, a)| **a >= self.config.threshold)
                .map(|(id, a)| (id, *a))
                .collect();

            // Push from the snapshot; pushes within one iteration accumulate
            let mut updated: HashMap<String, f64> = HashMap::new();
            for (id, activation) in &active {
                for edge in self.store.get_edges_from(id)? {
                    let current = updated
                        .get(&edge.target)
                        .copied()
                        .or_else(|| levels.get(&edge.target).copied())
                        .unwrap_or(0.0);
                    let pushed = activation * edge.weight * self.config.spread_factor;
                    let next = (current + pushed).min(1.0);
                    if next > current + UPDATE_EPSILON {
                        updated.insert(edge.target.clone(), next);
                    }
                }
            }

            if !updated.is_empty() {
                let batch: Vec<(String, f64)> = updated.iter().map(|(k, v)| (k.clone(), *v)).collect();
                self.store.set_activations(&batch)?;
                for (id, level) in &batch {
                    self.history.record_activation(id, *level);
                }
            }

            self.store.decay_activations(1.0 - self.config.decay_rate)?;
            let after = self.apply_noise()?;

            let active_count = after
                .values()
                .filter(|a| **a >= self.config.threshold)
                .count();
            if let Some(peak) = after.values().copied().reduce(f64::max) {
                result.peak_activation = result.peak_activation.max(peak);
            }

            if updated.is_empty() && previous_active == Some(active_count) {
                quiet_iterations += 1;
            } else {
                quiet_iterations = 0;
            }
            previous_active = Some(active_count);

            if quiet_iterations >= CONVERGENCE_ITERATIONS {
                result.converged = true;
                break;
            }
        }

        result.activated_nodes = self
            .store
            .get_active_nodes(self.config.threshold)?
            .into_iter()
            .map(|n| ActivatedNode {
                id: n.id,
                concept_type: n.concept_type,
                activation: n.activation_level,
            })
            .collect();
        result.novel_associations = self.find_novel_associations(&result.activated_nodes)?;

        Ok(result)
    }

    /// Add symmetric noise to every nonzero node; returns the resulting levels
    fn apply_noise(&mut self) -> Result<HashMap<String, f64>> {
        let mut levels = self.store.activation_levels()?;
        let noise = self.config.noise_level;
        if noise <= 0.0 {
            return Ok(levels);
        }

        let mut batch = Vec::new();
        for (id, level) in levels.iter_mut() {
            if *level > 0.0 {
                *level = clamp_activation(*level + self.rng.gen_range(-noise..=noise));
                batch.push((id.clone(), *level));
            }
        }
        self.store.set_activations(&batch)?;
        Ok(levels)
    }

    /// Co-activated pairs among the most active nodes
    ///
    /// Pairs must exceed 0.3 co-activation; a pair is novel when no edge, or
    /// only one weaker than 0.3, links it. Novel pairs sort first, then by
    /// co-activation; at most 10 are returned.
    pub fn find_novel_associations(
        &mut self,
        nodes: &[ActivatedNode],
    ) -> Result<Vec<NovelAssociation>> {
        let mut candidates: Vec<&ActivatedNode> = nodes
            .iter()
            .filter(|n| n.activation >= self.config.threshold)
            .collect();
        candidates.sort_by(|a, b| b.activation.total_cmp(&a.activation));
        candidates.truncate(MAX_NOVELTY_CANDIDATES);

        let mut weights: HashMap<(String, String), f64> = HashMap::new();
        for node in &candidates {
            for edge in self.store.get_edges_from(&node.id)? {
                let key = unordered(&edge.source, &edge.target);
                let entry = weights.entry(key).or_insert(edge.weight);
                *entry = entry.max(edge.weight);
            }
        }

        let mut found = Vec::new();
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                self.history.record_co_activation(&a.id, &b.id);

                let co_activation = (a.activation * b.activation).sqrt();
                if co_activation <= MIN_CO_ACTIVATION {
                    continue;
                }
                let edge_weight = weights.get(&unordered(&a.id, &b.id)).copied();
                found.push(NovelAssociation {
                    source: a.id.clone(),
                    target: b.id.clone(),
                    co_activation,
                    edge_weight,
                    novel: edge_weight.is_none_or(|w| w < NOVEL_EDGE_WEIGHT),
                });
            }
        }

        sort_associations(&mut found);
        found.truncate(MAX_NOVEL_ASSOCIATIONS);
        Ok(found)
    }

    /// Dream for `duration`: random seeds, spread, collect associations
    pub async fn dream(&mut self, duration: Duration) -> Result<ActivationResult> {
        let start = Instant::now();
        let deadline = start + duration;
        let ids = self.store.concept_ids()?;
        let mut result = ActivationResult::default();
        if ids.is_empty() {
            return Ok(result);
        }

        let mut strongest: HashMap<String, ActivatedNode> = HashMap::new();
        let mut associations: HashMap<(String, String), NovelAssociation> = HashMap::new();
        let noise = self.config.noise_level;

        while !self.should_stop(Some(deadline)) {
            let seed = ids[self.rng.gen_range(0..ids.len())].clone();
            let current = self
                .store
                .get_concept(&seed)?
                .map(|n| n.activation_level)
                .unwrap_or(0.0);
            let extra = if noise > 0.0 {
                self.rng.gen_range(noise..=3.0 * noise)
            } else {
                0.0
            } + DREAM_SEED_BOOST;

            let spread = self.spread(
                std::slice::from_ref(&seed),
                (current + extra).min(1.0),
                Some(deadline),
            )?;
            result.seeds_used += 1;
            result.iterations += spread.iterations;
            result.peak_activation = result.peak_activation.max(spread.peak_activation);
            result.converged = spread.converged;

            for node in spread.activated_nodes {
                match strongest.get(&node.id) {
                    Some(existing) if existing.activation >= node.activation => {}
                    _ => {
                        strongest.insert(node.id.clone(), node);
                    }
                }
            }
            for assoc in spread.novel_associations {
                let key = unordered(&assoc.source, &assoc.target);
                match associations.get(&key) {
                    Some(existing) if existing.co_activation >= assoc.co_activation => {}
                    _ => {
                        associations.insert(key, assoc);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let pause = Duration::from_millis(self.rng.gen_range(DREAM_PAUSE_MS.0..=DREAM_PAUSE_MS.1))
                .min(remaining);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        result.interrupted = self.cancel.is_cancelled();

        let mut nodes: Vec<ActivatedNode> = strongest.into_values().collect();
        nodes.sort_by(|a, b| b.activation.total_cmp(&a.activation).then_with(|| a.id.cmp(&b.id)));
        result.activated_nodes = nodes;

        let mut found: Vec<NovelAssociation> = associations.into_values().collect();
        sort_associations(&mut found);
        found.truncate(MAX_DREAM_ASSOCIATIONS);
        result.novel_associations = found;

        tracing::debug!(
            seeds = result.seeds_used,
            iterations = result.iterations,
            associations = result.novel_associations.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dream traversal finished"
        );
        Ok(result)
    }
}

fn unordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn sort_associations(associations: &mut [NovelAssociation]) {
    associations.sort_by(|a, b| {
        b.novel
            .cmp(&a.novel)
            .then_with(|| b.co_activation.total_cmp(&a.co_activation))
    });
}

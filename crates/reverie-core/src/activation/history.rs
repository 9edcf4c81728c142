//! Bounded activation history
//!
//! Two maps grow while the graph is dreamt over: recent activation samples per
//! node, and how often each unordered pair was examined together. Both are
//! trimmed to 80% of their cap when they overflow, using linear-time
//! selection to find the eviction threshold.

use std::collections::{HashMap, VecDeque};

/// Samples kept per node
pub const MAX_SAMPLES_PER_NODE: usize = 50;

/// Node-history cap before trimming
pub const MAX_HISTORY_NODES: usize = 10_000;

/// Co-activation pair cap before trimming
pub const MAX_CO_ACTIVATION_PAIRS: usize = 50_000;

/// Share of the cap kept after a trim
const TRIM_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Default)]
struct NodeHistory {
    samples: VecDeque<f64>,
    last_tick: u64,
}

/// Bounded per-node activation history and pair co-activation counts
#[derive(Debug, Clone)]
pub struct ActivationHistory {
    nodes: HashMap<String, NodeHistory>,
    pairs: HashMap<(String, String), u64>,
    tick: u64,
    max_nodes: usize,
    max_pairs: usize,
    pairs_examined: u64,
    trims: u64,
}

impl Default for ActivationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationHistory {
    pub fn new() -> Self {
        Self::with_limits(MAX_HISTORY_NODES, MAX_CO_ACTIVATION_PAIRS)
    }

    /// Custom caps (both at least 1)
    pub fn with_limits(max_nodes: usize, max_pairs: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            pairs: HashMap::new(),
            tick: 0,
            max_nodes: max_nodes.max(1),
            max_pairs: max_pairs.max(1),
            pairs_examined: 0,
            trims: 0,
        }
    }

    /// Append a sample for `id`; returns true if this insert triggered a trim
    pub fn record_activation(&mut self, id: &str, level: f64) -> bool {
        self.tick += 1;
        let entry = self.nodes.entry(id.to_string()).or_default();
        entry.samples.push_back(level);
        while entry.samples.len() > MAX_SAMPLES_PER_NODE {
            entry.samples.pop_front();
        }
        entry.last_tick = self.tick;

        if self.nodes.len() > self.max_nodes {
            self.trim_nodes();
            true
        } else {
            false
        }
    }

    /// Count one examination of the unordered pair (a, b)
    pub fn record_co_activation(&mut self, a: &str, b: &str) -> bool {
        self.pairs_examined += 1;
        *self.pairs.entry(pair_key(a, b)).or_insert(0) += 1;

        if self.pairs.len() > self.max_pairs {
            self.trim_pairs();
            true
        } else {
            false
        }
    }

    /// Drop the least recently touched nodes, keeping exactly `floor(cap * 0.8)`
    fn trim_nodes(&mut self) {
        let target = (self.max_nodes as f64 * TRIM_RATIO).floor() as usize;
        let remove = self.nodes.len().saturating_sub(target);
        if remove == 0 {
            return;
        }

        // Ticks are unique, so the threshold evicts exactly `remove` entries
        let mut ticks: Vec<u64> = self.nodes.values().map(|h| h.last_tick).collect();
        let (_, threshold, _) = ticks.select_nth_unstable(remove - 1);
        let threshold = *threshold;
        self.nodes.retain(|_, h| h.last_tick > threshold);
        self.trims += 1;

        tracing::debug!(kept = self.nodes.len(), "Trimmed activation history");
    }

    /// Drop the rarest pairs; ties at the threshold go too
    fn trim_pairs(&mut self) {
        let target = (self.max_pairs as f64 * TRIM_RATIO).floor() as usize;
        let remove = self.pairs.len().saturating_sub(target);
        if remove == 0 {
            return;
        }

        let mut counts: Vec<u64> = self.pairs.values().copied().collect();
        let (_, threshold, _) = counts.select_nth_unstable(remove - 1);
        let threshold = *threshold;
        self.pairs.retain(|_, count| *count > threshold);
        self.trims += 1;

        tracing::debug!(kept = self.pairs.len(), "Trimmed co-activation counts");
    }

    /// Recent samples for a node, oldest first
    pub fn recent_levels(&self, id: &str) -> Vec<f64> {
        self.nodes
            .get(id)
            .map(|h| h.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How often a pair has been examined together
    pub fn co_activation_count(&self, a: &str, b: &str) -> u64 {
        self.pairs.get(&pair_key(a, b)).copied().unwrap_or(0)
    }

    /// Nodes with recorded history
    pub fn activation_history_size(&self) -> usize {
        self.nodes.len()
    }

    /// Distinct pairs with a co-activation count
    pub fn co_activation_size(&self) -> usize {
        self.pairs.len()
    }

    /// Pairs examined since creation (not reduced by trimming)
    pub fn pairs_examined(&self) -> u64 {
        self.pairs_examined
    }

    /// Trim passes run so far
    pub fn trims(&self) -> u64 {
        self.trims
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.pairs.clear();
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

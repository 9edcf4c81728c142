//! Runtime configuration
//!
//! Every component keeps its own `*Config` with defaults; `ReverieConfig`
//! bundles them and overlays `REVERIE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::activation::ActivationConfig;
use crate::branch::{BranchManager, ValidationThresholds};
use crate::dream::{DreamConfig, DreamEngine};
use crate::events::EventListeners;
use crate::insight::InsightConfig;
use crate::scheduler::{CycleScheduler, SchedulerConfig};
use crate::storage::{ConceptStore, Result, StoreConfig};

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReverieConfig {
    /// Database file; the platform data directory when unset
    pub db_path: Option<PathBuf>,
    pub store: StoreConfig,
    pub activation: ActivationConfig,
    pub insight: InsightConfig,
    pub dream: DreamConfig,
    pub validation: ValidationThresholds,
    pub scheduler: SchedulerConfig,
}

impl ReverieConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("REVERIE_DB_PATH").filter(|p| !p.trim().is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        overlay(&lookup, "REVERIE_CYCLE_DURATION_MS", &mut config.dream.cycle_duration_ms);
        overlay(&lookup, "REVERIE_SCHEDULE_INTERVAL_MS", &mut config.scheduler.schedule_interval_ms);
        overlay(&lookup, "REVERIE_COOLDOWN_MS", &mut config.scheduler.cooldown_ms);
        overlay(&lookup, "REVERIE_EXPERIENCE_THRESHOLD", &mut config.scheduler.experience_threshold);
        overlay(&lookup, "REVERIE_MAX_PENDING_DREAMS", &mut config.scheduler.max_pending_dreams);
        overlay(&lookup, "REVERIE_NOISE_LEVEL", &mut config.activation.noise_level);
        overlay(&lookup, "REVERIE_SPREAD_FACTOR", &mut config.activation.spread_factor);
        overlay(&lookup, "REVERIE_DECAY_RATE", &mut config.activation.decay_rate);
        overlay(&lookup, "REVERIE_MAX_ITERATIONS", &mut config.activation.max_iterations);
        overlay(&lookup, "REVERIE_MIN_NOVELTY", &mut config.insight.min_novelty_score);
        overlay(&lookup, "REVERIE_MIN_CONFIDENCE", &mut config.insight.min_confidence);

        let mut seed = 0u64;
        if overlay(&lookup, "REVERIE_RNG_SEED", &mut seed) {
            config.dream.rng_seed = Some(seed);
        }

        config
    }

    /// Open the concept store this configuration points at
    pub fn open_store(&self) -> Result<ConceptStore> {
        ConceptStore::with_config(self.db_path.clone(), self.store.clone())
    }

    /// Wire an engine, branch manager, and scheduler over `store`
    ///
    /// All three share one event registry.
    pub fn build_scheduler(&self, store: Arc<ConceptStore>) -> Arc<CycleScheduler> {
        let events = EventListeners::new();
        let engine = Arc::new(
            DreamEngine::with_config(
                Arc::clone(&store),
                self.dream.clone(),
                self.activation.clone(),
                self.insight.clone(),
            )
            .with_events(events.clone()),
        );
        let branches = Arc::new(BranchManager::with_thresholds(store, self.validation).with_events(events));
        Arc::new(CycleScheduler::new(engine, branches, self.scheduler.clone()))
    }
}

/// Parse `key` into `target` when present; true if a value was applied
fn overlay<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            *target = value;
            true
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            false
        }
    }
}

//! # Dream Engine
//!
//! Orchestrates one dream cycle:
//!
//! 1. Record the cycle start (`dream_cycles`, status `running`)
//! 2. Dream over the concept graph for `cycle_duration_ms`
//! 3. Turn the resulting associations into insights
//! 4. Persist insights and the finished cycle row
//! 5. Update running aggregates and emit lifecycle events
//!
//! Only one cycle runs at a time. A failure inside the cycle is recorded as a
//! `failed` cycle and returned as a result, not an error; the engine stays
//! re-enterable either way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activation::{ActivationConfig, ActivationEngine, ActivationResult};
use crate::events::{EventListeners, ReverieEvent};
use crate::insight::{DreamInsight, InsightConfig, InsightGenerator, InsightType};
use crate::storage::{ConceptStore, CycleStatus, DreamCycleRecord, StorageError};

/// `engine_state` key for persisted aggregates
pub const DREAM_STATS_KEY: &str = "dream_stats";

// ============================================================================
// TYPES
// ============================================================================

/// Dream engine errors
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DreamError {
    /// A cycle is already in flight
    #[error("A dream cycle is already running")]
    AlreadyRunning,
    /// Storage failure outside the cycle boundary
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Dream engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DreamConfig {
    /// Wall-clock budget for the traversal
    pub cycle_duration_ms: u64,
    /// Fixed RNG seed for reproducible runs
    pub rng_seed: Option<u64>,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            cycle_duration_ms: 30_000,
            rng_seed: None,
        }
    }
}

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DreamState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Running aggregates across cycles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DreamStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub total_insights: u64,
    pub avg_insights_per_cycle: f64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Outcome of one `dream()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamCycleResult {
    pub cycle_id: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub concepts_processed: usize,
    pub associations_found: usize,
    pub insights: Vec<DreamInsight>,
    /// Traversal cut short by `abort()`
    pub aborted: bool,
    pub error: Option<String>,
}

impl DreamCycleResult {
    /// The cycle row matching this result
    pub fn to_record(&self) -> DreamCycleRecord {
        DreamCycleRecord {
            id: self.cycle_id.clone(),
            start_time: self.started_at,
            end_time: Some(self.finished_at),
            duration_ms: Some(self.duration_ms as i64),
            concepts_processed: self.concepts_processed as i64,
            associations_found: self.associations_found as i64,
            insights_generated: self.insights.len() as i64,
            status: self.status,
            error: self.error.clone(),
            created_at: self.started_at,
        }
    }
}

/// Clears the single-flight flag however the cycle ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Dream cycle orchestrator
pub struct DreamEngine {
    store: Arc<ConceptStore>,
    activation: tokio::sync::Mutex<ActivationEngine>,
    generator: InsightGenerator,
    config: DreamConfig,
    running: AtomicBool,
    state: Mutex<DreamState>,
    stats: Mutex<DreamStats>,
    cancel: Mutex<Option<CancellationToken>>,
    events: EventListeners,
}

impl DreamEngine {
    /// Engine with default configuration
    pub fn new(store: Arc<ConceptStore>) -> Self {
        Self::with_config(
            store,
            DreamConfig::default(),
            ActivationConfig::default(),
            InsightConfig::default(),
        )
    }

    pub fn with_config(
        store: Arc<ConceptStore>,
        config: DreamConfig,
        activation: ActivationConfig,
        insight: InsightConfig,
    ) -> Self {
        let activation = match config.rng_seed {
            Some(seed) => ActivationEngine::with_seed(Arc::clone(&store), activation, seed),
            None => ActivationEngine::with_config(Arc::clone(&store), activation),
        };

        let stats = match store.load_engine_state(DREAM_STATS_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => DreamStats::default(),
            Err(e) => {
                tracing::warn!("Could not load dream stats: {}", e);
                DreamStats::default()
            }
        };

        Self {
            generator: InsightGenerator::with_config(Arc::clone(&store), insight),
            store,
            activation: tokio::sync::Mutex::new(activation),
            config,
            running: AtomicBool::new(false),
            state: Mutex::new(DreamState::Idle),
            stats: Mutex::new(stats),
            cancel: Mutex::new(None),
            events: EventListeners::new(),
        }
    }

    /// Share an existing listener registry
    pub fn with_events(mut self, events: EventListeners) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventListeners {
        &self.events
    }

    pub fn store(&self) -> &Arc<ConceptStore> {
        &self.store
    }

    pub fn config(&self) -> &DreamConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DreamState {
        self.state.lock().map(|s| *s).unwrap_or(DreamState::Idle)
    }

    pub fn stats(&self) -> DreamStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_state(&self, state: DreamState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Ask the in-flight traversal to stop at its next iteration boundary
    ///
    /// Returns false when nothing is running.
    pub fn abort(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.cancel.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(token) => {
                    token.cancel();
                    tracing::info!("Dream cycle abort requested");
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Run one cycle with the configured duration
    pub async fn dream(&self) -> Result<DreamCycleResult, DreamError> {
        self.dream_for(Duration::from_millis(self.config.cycle_duration_ms))
            .await
    }

    /// Run one cycle with an explicit duration
    pub async fn dream_for(&self, duration: Duration) -> Result<DreamCycleResult, DreamError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DreamError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        self.store.record_cycle_start(&cycle_id, started_at)?;
        self.set_state(DreamState::Running);
        self.events.emit(ReverieEvent::DreamStarted {
            cycle_id: cycle_id.clone(),
            started_at,
        });
        tracing::info!(cycle_id = %cycle_id, duration_ms = duration.as_millis() as u64, "Dream cycle started");

        let mut activation = self.activation.lock().await;
        let token = activation.reset_cancellation();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(token.clone());
        }

        let outcome = self.run_cycle(&mut activation, &cycle_id, duration).await;
        drop(activation);
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = None;
        }

        let finished_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok((traversal, insights)) => DreamCycleResult {
                cycle_id: cycle_id.clone(),
                status: CycleStatus::Completed,
                started_at,
                finished_at,
                duration_ms,
                concepts_processed: traversal.activated_nodes.len(),
                associations_found: traversal.novel_associations.len(),
                insights,
                aborted: traversal.interrupted && token.is_cancelled(),
                error: None,
            },
            Err(e) => DreamCycleResult {
                cycle_id: cycle_id.clone(),
                status: CycleStatus::Failed,
                started_at,
                finished_at,
                duration_ms,
                concepts_processed: 0,
                associations_found: 0,
                insights: Vec::new(),
                aborted: token.is_cancelled(),
                error: Some(e.to_string()),
            },
        };

        if let Err(e) = self.store.finish_cycle(&result.to_record()) {
            tracing::warn!(cycle_id = %cycle_id, "Could not record cycle outcome: {}", e);
        }
        self.update_stats(&result);

        match result.status {
            CycleStatus::Failed => {
                self.set_state(DreamState::Failed);
                let error = result.error.clone().unwrap_or_default();
                tracing::error!(cycle_id = %cycle_id, "Dream cycle failed: {}", error);
                self.events.emit(ReverieEvent::DreamFailed {
                    cycle_id: cycle_id.clone(),
                    error,
                });
            }
            _ => {
                self.set_state(DreamState::Completed);
                tracing::info!(
                    cycle_id = %cycle_id,
                    insights = result.insights.len(),
                    associations = result.associations_found,
                    duration_ms,
                    aborted = result.aborted,
                    "Dream cycle completed"
                );
                self.events.emit(ReverieEvent::DreamCompleted {
                    cycle_id: cycle_id.clone(),
                    insights: result.insights.len(),
                    associations: result.associations_found,
                    duration_ms,
                });
            }
        }

        Ok(result)
    }

    async fn run_cycle(
        &self,
        activation: &mut ActivationEngine,
        cycle_id: &str,
        duration: Duration,
    ) -> Result<(ActivationResult, Vec<DreamInsight>), StorageError> {
        let traversal = activation.dream(duration).await?;
        let insights = self.generator.generate_from_activation(cycle_id, &traversal)?;
        for insight in &insights {
            self.store.save_insight(insight)?;
        }
        Ok((traversal, insights))
    }

    fn update_stats(&self, result: &DreamCycleResult) {
        let snapshot = {
            let Ok(mut stats) = self.stats.lock() else {
                return;
            };
            match result.status {
                CycleStatus::Failed => stats.cycles_failed += 1,
                _ => {
                    stats.cycles_completed += 1;
                    stats.total_insights += result.insights.len() as u64;
                }
            }
            stats.avg_insights_per_cycle = if stats.cycles_completed > 0 {
                stats.total_insights as f64 / stats.cycles_completed as f64
            } else {
                0.0
            };
            stats.last_cycle_at = Some(result.finished_at);
            stats.clone()
        };

        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                if let Err(e) = self.store.save_engine_state(DREAM_STATS_KEY, &value) {
                    tracing::warn!("Could not persist dream stats: {}", e);
                }
            }
            Err(e) => tracing::warn!("Could not serialize dream stats: {}", e),
        }
    }

    // ========================================================================
    // INSIGHT QUERIES
    // ========================================================================

    /// Unapplied insights, most confident first
    pub fn get_pending_insights(&self, limit: usize) -> Result<Vec<DreamInsight>, DreamError> {
        Ok(self.store.get_pending_insights(limit)?)
    }

    pub fn get_insights_by_type(
        &self,
        insight_type: InsightType,
        limit: usize,
    ) -> Result<Vec<DreamInsight>, DreamError> {
        Ok(self.store.get_insights_by_type(insight_type, limit)?)
    }

    /// Mark an insight applied, materializing its pattern when actionable
    pub fn apply_insight(
        &self,
        id: &str,
        feedback: Option<&str>,
    ) -> Result<DreamInsight, DreamError> {
        let mut insight = self
            .store
            .get_insight(id)?
            .ok_or_else(|| StorageError::NotFound(format!("insight {}", id)))?;

        let pattern_id = self.generator.materialize(&mut insight)?;
        self.store
            .mark_insight_applied(id, feedback, pattern_id.as_deref())?;
        tracing::info!(insight = %id, pattern = ?pattern_id, "Insight applied");

        self.store
            .get_insight(id)?
            .ok_or_else(|| DreamError::Storage(StorageError::NotFound(format!("insight {}", id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{ConceptNode, ConceptType};
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};

    fn create_engine(duration_ms: u64) -> (Arc<DreamEngine>, TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ConceptStore::new(Some(dir.path().join("dream.db"))).unwrap());
        store
            .add_concept(ConceptNode::new("x", ConceptType::Pattern, "use mocks for X"))
            .unwrap();
        store
            .add_concept(ConceptNode::new("y", ConceptType::Pattern, "use mocks for Y"))
            .unwrap();
        let engine = DreamEngine::with_config(
            store,
            DreamConfig {
                cycle_duration_ms: duration_ms,
                rng_seed: Some(3),
            },
            ActivationConfig {
                noise_level: 0.0,
                ..Default::default()
            },
            InsightConfig::default(),
        );
        (Arc::new(engine), dir)
    }

    #[tokio::test]
    async fn test_dream_completes_and_persists() {
        let (engine, _dir) = create_engine(300);
        let completed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completed);
        engine.events().on_event(move |event| {
            if matches!(event, ReverieEvent::DreamCompleted { .. }) {
                c.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        let result = engine.dream().await.unwrap();
        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(engine.state(), DreamState::Completed);
        assert!(!engine.is_running());
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let record = engine.store().get_cycle(&result.cycle_id).unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Completed);
        assert_eq!(record.insights_generated as usize, result.insights.len());

        let stats = engine.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert!(engine.store().load_engine_state(DREAM_STATS_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dream_is_single_flight() {
        let (engine, _dir) = create_engine(400);
        let background = Arc::clone(&engine);
        let handle = tokio::spawn(async move { background.dream().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(engine.dream().await, Err(DreamError::AlreadyRunning)));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, CycleStatus::Completed);
        // Re-enterable afterwards
        assert!(engine.dream_for(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_stops_traversal() {
        let (engine, _dir) = create_engine(10_000);
        let background = Arc::clone(&engine);
        let handle = tokio::spawn(async move { background.dream().await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.abort());

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.aborted);
        assert!(result.duration_ms < 10_000);
        assert!(!engine.abort());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let (engine, _dir) = create_engine(200);
        engine
            .store()
            .read(|conn| conn.execute_batch("DROP TABLE concept_edges"))
            .unwrap();

        let result = engine.dream().await.unwrap();
        assert_eq!(result.status, CycleStatus::Failed);
        assert!(result.error.is_some());
        assert_eq!(engine.state(), DreamState::Failed);
        assert_eq!(engine.stats().cycles_failed, 1);

        let record = engine.store().get_cycle(&result.cycle_id).unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Failed);
    }

    #[tokio::test]
    async fn test_apply_insight_materializes_pattern() {
        let (engine, _dir) = create_engine(300);
        let result = engine.dream().await.unwrap();
        let merge = result
            .insights
            .iter()
            .find(|i| i.insight_type == InsightType::PatternMerge && i.actionable)
            .expect("mock patterns should merge");

        let pending = engine.get_pending_insights(10).unwrap();
        assert!(pending.iter().any(|i| i.id == merge.id));

        let applied = engine.apply_insight(&merge.id, Some("looks right")).unwrap();
        assert!(applied.applied);
        assert_eq!(applied.feedback.as_deref(), Some("looks right"));
        let pattern_id = applied.pattern_id.unwrap();
        assert!(engine.store().get_concept(&pattern_id).unwrap().is_some());

        assert!(engine.get_pending_insights(10).unwrap().iter().all(|i| i.id != merge.id));
        assert!(matches!(
            engine.apply_insight("missing", None),
            Err(DreamError::Storage(StorageError::NotFound(_)))
        ));
    }
}

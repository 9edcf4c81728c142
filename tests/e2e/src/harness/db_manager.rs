//! Test Database Manager
//!
//! Provides isolated database instances for testing:
//! - Temporary databases that are automatically cleaned up
//! - A raw second connection for seeding upstream producer tables
//! - Engine, branch manager, and scheduler wiring over the same store

use std::path::PathBuf;
use std::sync::Arc;

use reverie_core::{
    ActivationConfig, BranchManager, ConceptStore, CycleScheduler, DreamConfig, DreamEngine,
    EventListeners, InsightConfig, SchedulerConfig, StoreConfig, ValidationThresholds,
};
use tempfile::TempDir;

/// Manager for test databases
///
/// Each test gets its own database file, deleted when the manager drops.
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabase::new_temp();
/// ConceptFixtures::seed_overlap_scenario(&db.store);
/// let engine = db.dream_engine(2000, ActivationConfig::default(), InsightConfig::default());
/// ```
pub struct TestDatabase {
    /// The shared store
    pub store: Arc<ConceptStore>,
    /// Temporary directory (kept alive to prevent premature deletion)
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestDatabase {
    /// Create a new test database in a temporary directory
    pub fn new_temp() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test_reverie.db");
        let store = ConceptStore::with_config(Some(db_path.clone()), config)
            .expect("Failed to create test store");

        Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
            db_path,
        }
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Directory the database lives in
    pub fn dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> i64 {
        self.store.get_stats().map(|s| s.total_nodes).unwrap_or(0)
    }

    pub fn edge_count(&self) -> i64 {
        self.store.get_stats().map(|s| s.total_edges).unwrap_or(0)
    }

    /// Second connection to the same file, for writing upstream tables
    pub fn raw_connection(&self) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(&self.db_path).expect("Failed to open raw connection");
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .expect("Failed to set busy timeout");
        conn
    }

    // ========================================================================
    // ENGINE WIRING
    // ========================================================================

    /// Deterministic dream engine over this store
    pub fn dream_engine(
        &self,
        cycle_duration_ms: u64,
        activation: ActivationConfig,
        insight: InsightConfig,
    ) -> Arc<DreamEngine> {
        Arc::new(DreamEngine::with_config(
            Arc::clone(&self.store),
            DreamConfig {
                cycle_duration_ms,
                rng_seed: Some(17),
            },
            activation,
            insight,
        ))
    }

    /// Scheduler sharing one event registry with its engine and branches
    pub fn scheduler(
        &self,
        engine: Arc<DreamEngine>,
        thresholds: ValidationThresholds,
        config: SchedulerConfig,
    ) -> Arc<CycleScheduler> {
        let events: EventListeners = engine.events().clone();
        let branches = Arc::new(
            BranchManager::with_thresholds(Arc::clone(&self.store), thresholds).with_events(events),
        );
        Arc::new(CycleScheduler::new(engine, branches, config))
    }
}

/// Activation settings with noise disabled
pub fn noiseless() -> ActivationConfig {
    ActivationConfig {
        noise_level: 0.0,
        spread_factor: 0.5,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_database_creation() {
        let db = TestDatabase::new_temp();
        assert_eq!(db.node_count(), 0);
        assert!(db.path().exists());
    }

    #[test]
    fn test_raw_connection_sees_schema() {
        let db = TestDatabase::new_temp();
        let conn = db.raw_connection();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM captured_experiences", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

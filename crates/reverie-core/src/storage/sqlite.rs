//! SQLite Concept Store
//!
//! Durable graph storage for concept nodes and weighted edges, plus the
//! dream-cycle, insight, and engine-state records that hang off the graph.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::concept::similarity::concept_similarity;
use crate::concept::{
    ConceptEdge, ConceptMetadata, ConceptNode, ConceptStats, ConceptType, EdgeType,
    QualityBaseline, clamp_activation, edge_id, embedding_from_bytes, embedding_to_bytes,
};
use crate::insight::{DreamInsight, InsightType};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Invalid timestamp
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Concept store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Minimum similarity for an auto-discovered edge (exclusive)
    pub similarity_threshold: f64,
    /// Maximum outgoing edges per node before weakest-link eviction
    pub max_edges_per_node: usize,
    /// Weight added when an existing edge is observed again
    pub edge_strengthen_delta: f64,
    /// Discover similarity edges when a concept is added
    pub auto_discover_edges: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            max_edges_per_node: 50,
            edge_strengthen_delta: 0.1,
            auto_discover_edges: true,
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Status of a persisted dream cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Running,
    Completed,
    Failed,
    /// Completed, but its branch was rolled back
    Discarded,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
            CycleStatus::Discarded => "discarded",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "completed" => CycleStatus::Completed,
            "failed" => CycleStatus::Failed,
            "discarded" => CycleStatus::Discarded,
            _ => CycleStatus::Running,
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of `dream_cycles`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamCycleRecord {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub concepts_processed: i64,
    pub associations_found: i64,
    pub insights_generated: i64,
    pub status: CycleStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DreamCycleRecord {
    /// A freshly started cycle
    pub fn started(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            start_time,
            end_time: None,
            duration_ms: None,
            concepts_processed: 0,
            associations_found: 0,
            insights_generated: 0,
            status: CycleStatus::Running,
            error: None,
            created_at: start_time,
        }
    }
}

// ============================================================================
// CONCEPT STORE
// ============================================================================

const NODE_COLUMNS: &str =
    "id, type, content, embedding, activation_level, last_activated, metadata, created_at";

const EDGE_COLUMNS: &str =
    "id, source, target, weight, type, evidence, created_at, updated_at";

const INSIGHT_COLUMNS: &str = "id, cycle_id, type, source_concepts, description, novelty_score, \
     confidence_score, actionable, applied, suggested_action, pattern_id, feedback, applied_at, created_at";

const CYCLE_COLUMNS: &str = "id, start_time, end_time, duration, concepts_processed, \
     associations_found, insights_generated, status, error, created_at";

/// SQLite-backed concept graph
///
/// One connection serves reads and writes so that every read issued inside an
/// open branch savepoint sees the branch's uncommitted state. All methods take
/// `&self`; share it as `Arc<ConceptStore>`.
pub struct ConceptStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl ConceptStore {
    /// Apply PRAGMAs and optional encryption to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("REVERIE_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;

        Ok(())
    }

    /// Default database location in the platform data directory
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "reverie", "core").ok_or_else(|| {
            StorageError::Init("Could not determine project directories".to_string())
        })?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(data_dir, perms);
        }
        Ok(data_dir.join("reverie.db"))
    }

    /// Open (or create) the store with default configuration
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        Self::with_config(db_path, StoreConfig::default())
    }

    /// Open (or create) the store
    pub fn with_config(db_path: Option<PathBuf>, config: StoreConfig) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => Self::default_db_path()?,
        };

        let conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&conn)?;
        super::migrations::apply_migrations(&conn)?;

        tracing::debug!(path = %path.display(), "Concept store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// In-memory store (benchmarks, throwaway graphs)
    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        super::migrations::apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Init("Connection lock poisoned".into()))
    }

    /// Run a read-only closure against the connection
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    // ========================================================================
    // CONCEPTS
    // ========================================================================

    /// Upsert a concept by id, auto-discovering similarity edges
    ///
    /// Edges are created in both directions to every other node whose
    /// similarity exceeds `similarity_threshold`, with weight equal to the
    /// similarity. Pairs that already have an edge are left untouched so
    /// reloading the same concepts is idempotent.
    pub fn add_concept(&self, node: ConceptNode) -> Result<ConceptNode> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;

        upsert_node(&sp, &node)?;

        let mut discovered = 0usize;
        if self.config.auto_discover_edges {
            let others: Vec<ConceptNode> = {
                let mut stmt = sp.prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM concept_nodes WHERE id != ?1"
                ))?;
                stmt.query_map(params![node.id], row_to_node)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            for other in &others {
                let similarity = concept_similarity(&node, other);
                if similarity <= self.config.similarity_threshold {
                    continue;
                }
                for (s, t) in [(&node.id, &other.id), (&other.id, &node.id)] {
                    if get_edge_on(&sp, s, t)?.is_none() {
                        let edge = ConceptEdge::new(s.as_str(), t.as_str(), similarity, EdgeType::Similarity);
                        add_edge_on(&sp, &edge, &self.config)?;
                        discovered += 1;
                    }
                }
            }
        }

        let stored = get_node_on(&sp, &node.id)?
            .ok_or_else(|| StorageError::NotFound(node.id.clone()))?;
        sp.commit()?;

        tracing::debug!(id = %stored.id, edges = discovered, "Concept stored");
        Ok(stored)
    }

    /// Get a concept by id
    pub fn get_concept(&self, id: &str) -> Result<Option<ConceptNode>> {
        let conn = self.lock()?;
        get_node_on(&conn, id)
    }

    /// All concepts of one type
    pub fn get_concepts_by_type(&self, concept_type: ConceptType) -> Result<Vec<ConceptNode>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM concept_nodes WHERE type = ?1 ORDER BY created_at, id"
        ))?;
        let nodes = stmt
            .query_map(params![concept_type.as_str()], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// All concepts with activation >= `min_activation`
    pub fn get_all_concepts(&self, min_activation: f64) -> Result<Vec<ConceptNode>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM concept_nodes WHERE activation_level >= ?1 ORDER BY created_at, id"
        ))?;
        let nodes = stmt
            .query_map(params![min_activation], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Concepts with activation >= `threshold`, most active first
    pub fn get_active_nodes(&self, threshold: f64) -> Result<Vec<ConceptNode>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM concept_nodes
             WHERE activation_level >= ?1
             ORDER BY activation_level DESC, id"
        ))?;
        let nodes = stmt
            .query_map(params![threshold], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Every concept id
    pub fn concept_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM concept_nodes ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Delete a concept and every edge touching it
    pub fn remove_concept(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        sp.execute(
            "DELETE FROM concept_edges WHERE source = ?1 OR target = ?1",
            params![id],
        )?;
        let removed = sp.execute("DELETE FROM concept_nodes WHERE id = ?1", params![id])?;
        sp.commit()?;
        Ok(removed > 0)
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Insert an edge, or strengthen the existing one for the same ordered pair
    ///
    /// A new edge on a node already at `max_edges_per_node` first evicts that
    /// node's lowest-weight outgoing edge.
    pub fn add_edge(&self, edge: ConceptEdge) -> Result<ConceptEdge> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let stored = add_edge_on(&sp, &edge, &self.config)?;
        sp.commit()?;
        Ok(stored)
    }

    /// Edge for an ordered pair
    pub fn get_edge(&self, source: &str, target: &str) -> Result<Option<ConceptEdge>> {
        let conn = self.lock()?;
        get_edge_on(&conn, source, target)
    }

    /// Outgoing edges, strongest first
    pub fn get_edges_from(&self, id: &str) -> Result<Vec<ConceptEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM concept_edges WHERE source = ?1 ORDER BY weight DESC"
        ))?;
        let edges = stmt
            .query_map(params![id], row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Incoming edges, strongest first
    pub fn get_edges_to(&self, id: &str) -> Result<Vec<ConceptEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM concept_edges WHERE target = ?1 ORDER BY weight DESC"
        ))?;
        let edges = stmt
            .query_map(params![id], row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Strongest edge weight between two nodes in either direction
    pub fn edge_weight_between(&self, a: &str, b: &str) -> Result<Option<f64>> {
        let conn = self.lock()?;
        let weight: Option<f64> = conn.query_row(
            "SELECT MAX(weight) FROM concept_edges
             WHERE (source = ?1 AND target = ?2) OR (source = ?2 AND target = ?1)",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(weight)
    }

    /// Delete edges weaker than `min_weight`
    pub fn prune_weak_edges(&self, min_weight: f64) -> Result<usize> {
        let conn = self.lock()?;
        let pruned = conn.execute(
            "DELETE FROM concept_edges WHERE weight < ?1",
            params![min_weight],
        )?;
        if pruned > 0 {
            tracing::info!(pruned, min_weight, "Pruned weak edges");
        }
        Ok(pruned)
    }

    // ========================================================================
    // ACTIVATION
    // ========================================================================

    /// Set one node's activation (clamped) and stamp `last_activated`
    pub fn set_activation(&self, id: &str, level: f64) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE concept_nodes SET activation_level = ?1, last_activated = ?2 WHERE id = ?3",
            params![clamp_activation(level), Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    /// Set many activations in one savepoint
    pub fn set_activations(&self, levels: &[(String, f64)]) -> Result<usize> {
        if levels.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let mut updated = 0;
        {
            let mut stmt = sp.prepare(
                "UPDATE concept_nodes SET activation_level = ?1, last_activated = ?2 WHERE id = ?3",
            )?;
            for (id, level) in levels {
                updated += stmt.execute(params![clamp_activation(*level), now, id])?;
            }
        }
        sp.commit()?;
        Ok(updated)
    }

    /// Current activation of every node
    pub fn activation_levels(&self) -> Result<HashMap<String, f64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, activation_level FROM concept_nodes")?;
        let levels = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(levels)
    }

    /// Multiply every activation by `factor` in one statement
    pub fn decay_activations(&self, factor: f64) -> Result<usize> {
        let factor = if factor.is_nan() { 0.0 } else { factor.max(0.0) };
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE concept_nodes
             SET activation_level = MIN(1.0, MAX(0.0, activation_level * ?1))
             WHERE activation_level > 0",
            params![factor],
        )?;
        Ok(updated)
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    /// Graph statistics
    pub fn get_stats(&self) -> Result<ConceptStats> {
        let conn = self.lock()?;

        let total_nodes: i64 =
            conn.query_row("SELECT COUNT(*) FROM concept_nodes", [], |row| row.get(0))?;
        let total_edges: i64 =
            conn.query_row("SELECT COUNT(*) FROM concept_edges", [], |row| row.get(0))?;
        let avg_activation: f64 = conn.query_row(
            "SELECT COALESCE(AVG(activation_level), 0.0) FROM concept_nodes",
            [],
            |row| row.get(0),
        )?;

        let nodes_by_type = count_grouped(&conn, "SELECT type, COUNT(*) FROM concept_nodes GROUP BY type")?;
        let edges_by_type = count_grouped(&conn, "SELECT type, COUNT(*) FROM concept_edges GROUP BY type")?;

        let avg_edges_per_node = if total_nodes > 0 {
            total_edges as f64 / total_nodes as f64
        } else {
            0.0
        };

        Ok(ConceptStats {
            total_nodes,
            total_edges,
            nodes_by_type,
            edges_by_type,
            avg_edges_per_node,
            avg_activation,
        })
    }

    /// Pattern-population quality metrics used for branch validation
    pub fn quality_metrics(&self) -> Result<QualityBaseline> {
        let conn = self.lock()?;
        let baseline = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(AVG(json_extract(metadata, '$.confidence')), 0.0),
                COALESCE(SUM(CASE WHEN json_extract(metadata, '$.confidence') >= 0.8 THEN 1 ELSE 0 END), 0)
             FROM concept_nodes
             WHERE type = 'pattern'",
            [],
            |row| {
                Ok(QualityBaseline {
                    pattern_count: row.get(0)?,
                    avg_confidence: row.get(1)?,
                    high_confidence_count: row.get(2)?,
                })
            },
        )?;
        Ok(baseline)
    }

    // ========================================================================
    // SAVEPOINTS
    // ========================================================================

    /// Open a named savepoint that stays open across calls
    pub fn savepoint(&self, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("SAVEPOINT {}", sanitize_savepoint_name(name)))?;
        Ok(())
    }

    /// Release a named savepoint, making its changes part of the enclosing scope
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("RELEASE SAVEPOINT {}", sanitize_savepoint_name(name)))?;
        Ok(())
    }

    /// Undo everything since the named savepoint (the savepoint stays open)
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {}",
            sanitize_savepoint_name(name)
        ))?;
        Ok(())
    }

    /// Whether any transaction or savepoint is currently open
    pub fn in_transaction(&self) -> Result<bool> {
        let conn = self.lock()?;
        Ok(!conn.is_autocommit())
    }

    /// Copy the database to `path` with `VACUUM INTO`
    ///
    /// SQLite refuses this while a transaction is open.
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| StorageError::Init("Invalid backup path encoding".to_string()))?;
        if path_str.bytes().any(|b| b < 0x20 && b != b'\t') {
            return Err(StorageError::Init(
                "Backup path contains invalid characters".to_string(),
            ));
        }
        let conn = self.lock()?;
        conn.execute_batch(&format!("VACUUM INTO '{}'", path_str.replace('\'', "''")))?;
        Ok(())
    }

    // ========================================================================
    // DREAM CYCLES
    // ========================================================================

    /// Insert a `running` cycle row
    pub fn record_cycle_start(&self, id: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.finish_cycle(&DreamCycleRecord::started(id, start_time))
    }

    /// Write the full cycle row (insert or overwrite)
    pub fn finish_cycle(&self, record: &DreamCycleRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO dream_cycles ({CYCLE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                record.id,
                record.start_time.to_rfc3339(),
                record.end_time.map(|t| t.to_rfc3339()),
                record.duration_ms,
                record.concepts_processed,
                record.associations_found,
                record.insights_generated,
                record.status.as_str(),
                record.error,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent cycles first
    pub fn get_cycles(&self, limit: usize) -> Result<Vec<DreamCycleRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CYCLE_COLUMNS} FROM dream_cycles ORDER BY start_time DESC LIMIT ?1"
        ))?;
        let cycles = stmt
            .query_map(params![limit as i64], row_to_cycle)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cycles)
    }

    /// One cycle by id
    pub fn get_cycle(&self, id: &str) -> Result<Option<DreamCycleRecord>> {
        let conn = self.lock()?;
        let cycle = conn
            .query_row(
                &format!("SELECT {CYCLE_COLUMNS} FROM dream_cycles WHERE id = ?1"),
                params![id],
                row_to_cycle,
            )
            .optional()?;
        Ok(cycle)
    }

    // ========================================================================
    // INSIGHTS
    // ========================================================================

    /// Save (or overwrite) an insight
    pub fn save_insight(&self, insight: &DreamInsight) -> Result<()> {
        let sources = serde_json::to_string(&insight.source_concepts)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO dream_insights ({INSIGHT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                insight.id,
                insight.cycle_id,
                insight.insight_type.as_str(),
                sources,
                insight.description,
                insight.novelty_score,
                insight.confidence_score,
                insight.actionable,
                insight.applied,
                insight.suggested_action,
                insight.pattern_id,
                insight.feedback,
                insight.applied_at.map(|t| t.to_rfc3339()),
                insight.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Unapplied insights, most confident first
    pub fn get_pending_insights(&self, limit: usize) -> Result<Vec<DreamInsight>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM dream_insights
             WHERE applied = 0
             ORDER BY confidence_score DESC, novelty_score DESC
             LIMIT ?1"
        ))?;
        let insights = stmt
            .query_map(params![limit as i64], row_to_insight)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    /// Insights of one type, newest first
    pub fn get_insights_by_type(
        &self,
        insight_type: InsightType,
        limit: usize,
    ) -> Result<Vec<DreamInsight>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM dream_insights
             WHERE type = ?1
             ORDER BY created_at DESC, confidence_score DESC
             LIMIT ?2"
        ))?;
        let insights = stmt
            .query_map(params![insight_type.as_str(), limit as i64], row_to_insight)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    /// Insights generated by one cycle
    pub fn get_insights_for_cycle(&self, cycle_id: &str) -> Result<Vec<DreamInsight>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM dream_insights WHERE cycle_id = ?1
             ORDER BY confidence_score DESC"
        ))?;
        let insights = stmt
            .query_map(params![cycle_id], row_to_insight)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(insights)
    }

    /// One insight by id
    pub fn get_insight(&self, id: &str) -> Result<Option<DreamInsight>> {
        let conn = self.lock()?;
        let insight = conn
            .query_row(
                &format!("SELECT {INSIGHT_COLUMNS} FROM dream_insights WHERE id = ?1"),
                params![id],
                row_to_insight,
            )
            .optional()?;
        Ok(insight)
    }

    /// Mark an insight applied, attaching feedback and the materialized pattern id
    pub fn mark_insight_applied(
        &self,
        id: &str,
        feedback: Option<&str>,
        pattern_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE dream_insights
             SET applied = 1,
                 applied_at = ?1,
                 feedback = COALESCE(?2, feedback),
                 pattern_id = COALESCE(?3, pattern_id)
             WHERE id = ?4",
            params![Utc::now().to_rfc3339(), feedback, pattern_id, id],
        )?;
        Ok(updated > 0)
    }

    // ========================================================================
    // ENGINE STATE
    // ========================================================================

    /// Persist a JSON value under `key`
    pub fn save_engine_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load a JSON value saved under `key`
    pub fn load_engine_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// CONNECTION-LEVEL HELPERS
// ============================================================================

/// Restrict a savepoint name to `[A-Za-z0-9_]`, never starting with a digit
pub fn sanitize_savepoint_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        cleaned.insert_str(0, "sp_");
    }
    cleaned
}

fn upsert_node(conn: &Connection, node: &ConceptNode) -> Result<()> {
    let metadata = serde_json::to_string(&node.metadata)?;
    let embedding = node.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO concept_nodes
            (id, type, content, embedding, activation_level, last_activated, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            content = excluded.content,
            embedding = excluded.embedding,
            activation_level = excluded.activation_level,
            last_activated = excluded.last_activated,
            metadata = excluded.metadata",
        params![
            node.id,
            node.concept_type.as_str(),
            node.content,
            embedding,
            clamp_activation(node.activation_level),
            node.last_activated.map(|t| t.to_rfc3339()),
            metadata,
            node.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn get_node_on(conn: &Connection, id: &str) -> Result<Option<ConceptNode>> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM concept_nodes WHERE id = ?1"),
            params![id],
            row_to_node,
        )
        .optional()?;
    Ok(node)
}

fn get_edge_on(conn: &Connection, source: &str, target: &str) -> Result<Option<ConceptEdge>> {
    let edge = conn
        .query_row(
            &format!("SELECT {EDGE_COLUMNS} FROM concept_edges WHERE source = ?1 AND target = ?2"),
            params![source, target],
            row_to_edge,
        )
        .optional()?;
    Ok(edge)
}

fn add_edge_on(conn: &Connection, edge: &ConceptEdge, config: &StoreConfig) -> Result<ConceptEdge> {
    let now = Utc::now();

    if let Some(mut existing) = get_edge_on(conn, &edge.source, &edge.target)? {
        existing.weight = (existing.weight + config.edge_strengthen_delta).min(1.0);
        existing.evidence += 1;
        existing.updated_at = now;
        conn.execute(
            "UPDATE concept_edges SET weight = ?1, evidence = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                existing.weight,
                existing.evidence,
                existing.updated_at.to_rfc3339(),
                existing.id
            ],
        )?;
        return Ok(existing);
    }

    let out_degree: i64 = conn.query_row(
        "SELECT COUNT(*) FROM concept_edges WHERE source = ?1",
        params![edge.source],
        |row| row.get(0),
    )?;
    if config.max_edges_per_node > 0 && out_degree as usize >= config.max_edges_per_node {
        let evicted = conn.execute(
            "DELETE FROM concept_edges WHERE id = (
                SELECT id FROM concept_edges WHERE source = ?1
                ORDER BY weight ASC, updated_at ASC LIMIT 1
             )",
            params![edge.source],
        )?;
        if evicted > 0 {
            tracing::debug!(source = %edge.source, "Evicted weakest edge");
        }
    }

    let stored = ConceptEdge {
        id: edge_id(&edge.source, &edge.target),
        weight: edge.weight.clamp(0.0, 1.0),
        evidence: edge.evidence.max(1),
        created_at: now,
        updated_at: now,
        ..edge.clone()
    };
    conn.execute(
        &format!(
            "INSERT INTO concept_edges ({EDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            stored.id,
            stored.source,
            stored.target,
            stored.weight,
            stored.edge_type.as_str(),
            stored.evidence,
            stored.created_at.to_rfc3339(),
            stored.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(stored)
}

fn count_grouped(conn: &Connection, sql: &str) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(sql)?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(counts)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<ConceptNode> {
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let metadata: String = row.get("metadata")?;
    let last_activated: Option<String> = row.get("last_activated")?;

    Ok(ConceptNode {
        id: row.get("id")?,
        concept_type: ConceptType::parse_name(&row.get::<_, String>("type")?),
        content: row.get("content")?,
        embedding: embedding.as_deref().and_then(embedding_from_bytes),
        activation_level: clamp_activation(row.get("activation_level")?),
        last_activated: last_activated.as_deref().map(parse_timestamp),
        metadata: ConceptMetadata::from_json(&metadata),
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<ConceptEdge> {
    Ok(ConceptEdge {
        id: row.get("id")?,
        source: row.get("source")?,
        target: row.get("target")?,
        weight: row.get("weight")?,
        edge_type: EdgeType::parse_name(&row.get::<_, String>("type")?),
        evidence: row.get("evidence")?,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?),
        updated_at: parse_timestamp(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_cycle(row: &rusqlite::Row) -> rusqlite::Result<DreamCycleRecord> {
    let end_time: Option<String> = row.get("end_time")?;
    Ok(DreamCycleRecord {
        id: row.get("id")?,
        start_time: parse_timestamp(&row.get::<_, String>("start_time")?),
        end_time: end_time.as_deref().map(parse_timestamp),
        duration_ms: row.get("duration")?,
        concepts_processed: row.get("concepts_processed")?,
        associations_found: row.get("associations_found")?,
        insights_generated: row.get("insights_generated")?,
        status: CycleStatus::parse_name(&row.get::<_, String>("status")?),
        error: row.get("error")?,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_insight(row: &rusqlite::Row) -> rusqlite::Result<DreamInsight> {
    let sources: String = row.get("source_concepts")?;
    let applied_at: Option<String> = row.get("applied_at")?;

    Ok(DreamInsight {
        id: row.get("id")?,
        cycle_id: row.get("cycle_id")?,
        insight_type: InsightType::parse_name(&row.get::<_, String>("type")?),
        source_concepts: serde_json::from_str(&sources).unwrap_or_default(),
        description: row.get("description")?,
        novelty_score: row.get("novelty_score")?,
        confidence_score: row.get("confidence_score")?,
        actionable: row.get("actionable")?,
        applied: row.get("applied")?,
        suggested_action: row.get("suggested_action")?,
        pattern_id: row.get("pattern_id")?,
        feedback: row.get("feedback")?,
        applied_at: applied_at.as_deref().map(parse_timestamp),
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn create_test_store() -> (ConceptStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = ConceptStore::new(Some(dir.path().join("test.db"))).unwrap();
        (store, dir)
    }

    fn pattern(id: &str, content: &str, confidence: f64) -> ConceptNode {
        ConceptNode::new(id, ConceptType::Pattern, content).with_metadata(ConceptMetadata {
            confidence: Some(confidence),
            ..Default::default()
        })
    }

    #[test]
    fn test_store_creation() {
        let (store, _dir) = create_test_store();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_nodes, 0);
        assert_eq!(stats.total_edges, 0);
        assert_eq!(stats.avg_edges_per_node, 0.0);
    }

    #[test]
    fn test_add_concept_discovers_similar_edges() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "use mocks for X", 0.9)).unwrap();
        store.add_concept(pattern("b", "use mocks for Y", 0.9)).unwrap();
        store.add_concept(pattern("c", "retry on timeout", 0.9)).unwrap();

        let ab = store.get_edge("a", "b").unwrap().unwrap();
        assert!((ab.weight - 0.69).abs() < 1e-9);
        assert_eq!(ab.edge_type, EdgeType::Similarity);
        assert!(store.get_edge("b", "a").unwrap().is_some());

        // 0.45 is below the 0.5 threshold
        assert!(store.get_edge("a", "c").unwrap().is_none());
        assert!(store.edge_weight_between("c", "b").unwrap().is_none());

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.total_edges, 2);
        assert_eq!(stats.nodes_by_type.get("pattern"), Some(&3));
    }

    #[test]
    fn test_add_concept_upserts_without_dropping_edges() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "use mocks for X", 0.9)).unwrap();
        store.add_concept(pattern("b", "use mocks for Y", 0.9)).unwrap();

        let updated = store.add_concept(pattern("a", "use mocks for X", 0.5)).unwrap();
        assert_eq!(updated.metadata.confidence, Some(0.5));

        let edge = store.get_edge("a", "b").unwrap().unwrap();
        assert_eq!(edge.evidence, 1);
        assert_eq!(store.get_stats().unwrap().total_nodes, 2);
    }

    #[test]
    fn test_add_edge_twice_strengthens() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "alpha", 0.9)).unwrap();
        store.add_concept(pattern("b", "beta", 0.9)).unwrap();

        let first = store
            .add_edge(ConceptEdge::new("a", "b", 0.95, EdgeType::Causation))
            .unwrap();
        let second = store
            .add_edge(ConceptEdge::new("a", "b", 0.95, EdgeType::Causation))
            .unwrap();

        assert_eq!(second.evidence, first.evidence + 1);
        assert!(second.weight >= first.weight);
        assert_eq!(second.weight, 1.0);
        assert_eq!(store.get_edges_from("a").unwrap().len(), 1);
    }

    #[test]
    fn test_weakest_edge_eviction() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            max_edges_per_node: 2,
            auto_discover_edges: false,
            ..Default::default()
        };
        let store = ConceptStore::with_config(Some(dir.path().join("evict.db")), config).unwrap();
        for id in ["s", "t1", "t2", "t3"] {
            store
                .add_concept(ConceptNode::new(id, ConceptType::Domain, id))
                .unwrap();
        }

        store.add_edge(ConceptEdge::new("s", "t1", 0.2, EdgeType::Sequence)).unwrap();
        store.add_edge(ConceptEdge::new("s", "t2", 0.8, EdgeType::Sequence)).unwrap();
        store.add_edge(ConceptEdge::new("s", "t3", 0.5, EdgeType::Sequence)).unwrap();

        let edges = store.get_edges_from("s").unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.target != "t1"));
    }

    #[test]
    fn test_activation_clamped_and_decay_composes() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "alpha", 0.9)).unwrap();
        store.add_concept(pattern("b", "beta", 0.9)).unwrap();

        assert!(store.set_activation("a", 1.5).unwrap());
        assert!(!store.set_activation("missing", 0.5).unwrap());
        let a = store.get_concept("a").unwrap().unwrap();
        assert_eq!(a.activation_level, 1.0);
        assert!(a.last_activated.is_some());

        store.set_activation("b", -3.0).unwrap();
        assert_eq!(store.get_concept("b").unwrap().unwrap().activation_level, 0.0);

        store.set_activations(&[("a".into(), 0.6), ("b".into(), 0.4)]).unwrap();
        store.decay_activations(0.9).unwrap();
        store.decay_activations(0.9).unwrap();
        let levels = store.activation_levels().unwrap();
        assert!((levels["a"] - 0.6 * 0.81).abs() < 1e-9);
        assert!((levels["b"] - 0.4 * 0.81).abs() < 1e-9);

        let active = store.get_active_nodes(0.3).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, "a");
        assert_eq!(store.get_all_concepts(0.4).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_concept_deletes_edges() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "use mocks for X", 0.9)).unwrap();
        store.add_concept(pattern("b", "use mocks for Y", 0.9)).unwrap();
        assert_eq!(store.get_stats().unwrap().total_edges, 2);

        assert!(store.remove_concept("a").unwrap());
        assert!(store.get_concept("a").unwrap().is_none());
        assert_eq!(store.get_stats().unwrap().total_edges, 0);
        assert!(!store.remove_concept("a").unwrap());
    }

    #[test]
    fn test_quality_metrics() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("p1", "one", 0.9)).unwrap();
        store.add_concept(pattern("p2", "two", 0.7)).unwrap();
        store
            .add_concept(ConceptNode::new("p3", ConceptType::Pattern, "three"))
            .unwrap();
        store
            .add_concept(ConceptNode::new("t1", ConceptType::Technique, "four"))
            .unwrap();

        let q = store.quality_metrics().unwrap();
        assert_eq!(q.pattern_count, 3);
        assert!((q.avg_confidence - 0.8).abs() < 1e-9);
        assert_eq!(q.high_confidence_count, 1);
    }

    #[test]
    fn test_savepoint_rollback_and_release() {
        let (store, _dir) = create_test_store();
        store.add_concept(pattern("a", "alpha", 0.9)).unwrap();

        store.savepoint("dream-1").unwrap();
        assert!(store.in_transaction().unwrap());
        store.set_activation("a", 0.7).unwrap();
        store.add_concept(pattern("b", "beta", 0.9)).unwrap();
        store.rollback_to_savepoint("dream-1").unwrap();
        store.release_savepoint("dream-1").unwrap();

        assert!(!store.in_transaction().unwrap());
        assert_eq!(store.get_concept("a").unwrap().unwrap().activation_level, 0.0);
        assert!(store.get_concept("b").unwrap().is_none());

        store.savepoint("dream-2").unwrap();
        store.set_activation("a", 0.7).unwrap();
        store.release_savepoint("dream-2").unwrap();
        assert_eq!(store.get_concept("a").unwrap().unwrap().activation_level, 0.7);
    }

    #[test]
    fn test_sanitize_savepoint_name() {
        assert_eq!(sanitize_savepoint_name("dream-cycle 1"), "dream_cycle_1");
        assert_eq!(sanitize_savepoint_name("1abc"), "sp_1abc");
        assert_eq!(sanitize_savepoint_name("x'; DROP"), "x___DROP");
        assert_eq!(sanitize_savepoint_name(""), "sp_");
    }

    #[test]
    fn test_cycle_records() {
        let (store, _dir) = create_test_store();
        let start = Utc::now();
        store.record_cycle_start("c1", start).unwrap();
        assert_eq!(
            store.get_cycle("c1").unwrap().unwrap().status,
            CycleStatus::Running
        );

        let mut record = DreamCycleRecord::started("c1", start);
        record.status = CycleStatus::Completed;
        record.insights_generated = 3;
        record.end_time = Some(Utc::now());
        store.finish_cycle(&record).unwrap();

        let cycles = store.get_cycles(10).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, CycleStatus::Completed);
        assert_eq!(cycles[0].insights_generated, 3);
    }

    #[test]
    fn test_engine_state_roundtrip() {
        let (store, _dir) = create_test_store();
        assert!(store.load_engine_state("dream_stats").unwrap().is_none());
        store
            .save_engine_state("dream_stats", &serde_json::json!({"cyclesCompleted": 2}))
            .unwrap();
        store
            .save_engine_state("dream_stats", &serde_json::json!({"cyclesCompleted": 3}))
            .unwrap();
        let value = store.load_engine_state("dream_stats").unwrap().unwrap();
        assert_eq!(value["cyclesCompleted"], 3);
    }

    #[test]
    fn test_backup_to() {
        let (store, dir) = create_test_store();
        store.add_concept(pattern("a", "alpha", 0.9)).unwrap();
        let backup = dir.path().join("backup.db");
        store.backup_to(&backup).unwrap();

        let restored = ConceptStore::new(Some(backup)).unwrap();
        assert!(restored.get_concept("a").unwrap().is_some());
    }
}

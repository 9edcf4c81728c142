//! Database Migrations
//!
//! Schema migration definitions for the concept store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Concept graph and dream cycle history",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Dream insights and persisted engine state",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Upstream producer tables (patterns, synthesized patterns, experiences)",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Concept graph
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS concept_nodes (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL DEFAULT 'pattern',
    content TEXT NOT NULL,
    embedding BLOB,
    activation_level REAL NOT NULL DEFAULT 0.0,
    last_activated TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_concept_nodes_type ON concept_nodes(type);
CREATE INDEX IF NOT EXISTS idx_concept_nodes_activation ON concept_nodes(activation_level);

CREATE TABLE IF NOT EXISTS concept_edges (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL REFERENCES concept_nodes(id) ON DELETE CASCADE,
    target TEXT NOT NULL REFERENCES concept_nodes(id) ON DELETE CASCADE,
    weight REAL NOT NULL DEFAULT 0.5,
    type TEXT NOT NULL DEFAULT 'similarity',
    evidence INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source, target)
);

CREATE INDEX IF NOT EXISTS idx_concept_edges_source ON concept_edges(source, weight);
CREATE INDEX IF NOT EXISTS idx_concept_edges_target ON concept_edges(target);

CREATE TABLE IF NOT EXISTS dream_cycles (
    id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration INTEGER,
    concepts_processed INTEGER NOT NULL DEFAULT 0,
    associations_found INTEGER NOT NULL DEFAULT 0,
    insights_generated INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dream_cycles_start ON dream_cycles(start_time);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Insights and engine state
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS dream_insights (
    id TEXT PRIMARY KEY,
    cycle_id TEXT NOT NULL,
    type TEXT NOT NULL,
    source_concepts TEXT NOT NULL DEFAULT '[]',
    description TEXT NOT NULL,
    novelty_score REAL NOT NULL,
    confidence_score REAL NOT NULL,
    actionable INTEGER NOT NULL DEFAULT 0,
    applied INTEGER NOT NULL DEFAULT 0,
    suggested_action TEXT,
    pattern_id TEXT,
    feedback TEXT,
    applied_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dream_insights_cycle ON dream_insights(cycle_id);
CREATE INDEX IF NOT EXISTS idx_dream_insights_pending ON dream_insights(applied, confidence_score);
CREATE INDEX IF NOT EXISTS idx_dream_insights_type ON dream_insights(type);

-- Aggregate counters that survive restarts (engine stats, scheduler stats)
CREATE TABLE IF NOT EXISTS engine_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Upstream producer tables
///
/// Owned by the pattern-synthesis and experience-capture stages; created here
/// only so a fresh database file is loadable.
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL DEFAULT 'pattern',
    content TEXT NOT NULL,
    confidence REAL,
    success_rate REAL,
    usage_count INTEGER DEFAULT 0,
    domain TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS synthesized_patterns (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL DEFAULT 'pattern',
    description TEXT NOT NULL,
    confidence REAL,
    agent_types TEXT NOT NULL DEFAULT '[]',
    task_types TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS captured_experiences (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    agent_type TEXT,
    task_type TEXT,
    success INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER,
    context TEXT NOT NULL DEFAULT '{}',
    quality_score REAL,
    processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_captured_experiences_recent ON captured_experiences(processed, created_at);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

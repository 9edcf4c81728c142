//! # Reverie Core
//!
//! Offline consolidation engine for agent knowledge. Between tasks, Reverie
//! "dreams" over a graph of concepts learned from agent experience:
//!
//! - **Concept Graph**: Patterns, techniques, domains, outcomes, and errors as
//!   SQLite-backed nodes with weighted, typed edges
//! - **Spreading Activation**: Random seeds spread activation with decay and
//!   noise until convergence or a deadline
//! - **Insight Generation**: Co-activated pairs become scored merge,
//!   association, optimization, and gap insights
//! - **Branch Isolation**: Every scheduled cycle runs inside a savepoint and is
//!   merged only if pattern quality does not regress
//! - **Scheduling**: Time, experience-count, quality-gate, and manual triggers
//!   with cooldown and a bounded queue
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reverie_core::{ConceptLoader, ReverieConfig, TriggerPriority};
//!
//! let config = ReverieConfig::from_env();
//! let store = Arc::new(config.open_store()?);
//! ConceptLoader::new(Arc::clone(&store)).load_all()?;
//!
//! let scheduler = config.build_scheduler(store);
//! scheduler.start();
//! scheduler.request_dream("manual run", TriggerPriority::Normal, true);
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): Compile SQLite in
//! - `encryption`: SQLCipher; set `REVERIE_ENCRYPTION_KEY`

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod activation;
pub mod branch;
pub mod concept;
pub mod config;
pub mod dream;
pub mod events;
pub mod insight;
pub mod scheduler;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Concept graph
pub use concept::{
    ConceptEdge, ConceptMetadata, ConceptNode, ConceptStats, ConceptType, EdgeType,
    QualityBaseline,
};

// Storage layer
pub use storage::{
    ConceptLoader, ConceptStore, CycleStatus, DreamCycleRecord, LoadReport, Result,
    StorageError, StoreConfig,
};

// Spreading activation
pub use activation::{
    ActivatedNode, ActivationConfig, ActivationEngine, ActivationHistory, ActivationResult,
    NovelAssociation,
};

// Insights
pub use insight::{DreamInsight, InsightConfig, InsightGenerator, InsightType, PatternTemplate};

// Dream cycles
pub use dream::{DreamConfig, DreamCycleResult, DreamEngine, DreamError, DreamState, DreamStats};

// Branches
pub use branch::{
    BackupSnapshotHook, Branch, BranchError, BranchManager, BranchStatus, SnapshotHook,
    ValidationResult, ValidationThresholds,
};

// Scheduling
pub use scheduler::{
    CycleOutcome, CycleScheduler, CycleSummary, DreamTrigger, ResourceCheck, ScheduleResult,
    SchedulerConfig, SchedulerError, SchedulerState, SchedulerStats, SchedulerStatus,
    TriggerPriority, TriggerType,
};

// Events and configuration
pub use config::ReverieConfig;
pub use events::{EventListeners, ListenerId, ReverieEvent};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current schema version
pub const SCHEMA_VERSION: u32 = 3;

//! Storage Module
//!
//! SQLite-based storage layer with:
//! - Concept graph (nodes, weighted edges, activation levels)
//! - Named savepoints for branch isolation
//! - Dream cycle, insight, and engine-state records
//! - Loader for upstream producer tables

mod loader;
mod migrations;
mod sqlite;

pub use loader::{ConceptLoader, DEFAULT_RECENT_DAYS, LoadReport};
pub use migrations::MIGRATIONS;
pub use sqlite::{
    ConceptStore, CycleStatus, DreamCycleRecord, Result, StorageError, StoreConfig,
    sanitize_savepoint_name,
};

//! Reversible branches over the concept store
//!
//! A branch is a named SQLite savepoint held open on the store's connection.
//! Everything written while it is open (activation levels, edges, insight
//! rows) becomes permanent on `merge_branch` and disappears on
//! `discard_branch`. The quality baseline is captured before the savepoint
//! opens so validation compares against pre-branch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::concept::QualityBaseline;
use crate::events::{EventListeners, ReverieEvent};
use crate::storage::{ConceptStore, StorageError, sanitize_savepoint_name};

// ============================================================================
// ERRORS
// ============================================================================

/// Branch lifecycle errors
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("Branch already exists: {0}")]
    DuplicateName(String),
    #[error("Branch is not active: {0}")]
    NotActive(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Allowed regressions between baseline and post-dream quality
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationThresholds {
    /// Fraction of the baseline pattern count that may disappear
    pub max_pattern_count_drop: f64,
    /// Absolute drop allowed in average pattern confidence
    pub max_avg_confidence_drop: f64,
    /// Fraction of baseline high-confidence patterns that may be lost
    pub max_high_confidence_loss: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_pattern_count_drop: 0.05,
            max_avg_confidence_drop: 0.02,
            max_high_confidence_loss: 0.05,
        }
    }
}

/// Baseline-relative changes; positive values are losses
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDeltas {
    pub pattern_count_drop: f64,
    pub avg_confidence_drop: f64,
    pub high_confidence_lost: i64,
}

/// Outcome of validating a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub passed: bool,
    /// Every failed check, joined with "; "
    pub reason: Option<String>,
    pub baseline: QualityBaseline,
    pub current: QualityBaseline,
    pub deltas: QualityDeltas,
}

/// Compare post-dream quality against a baseline
pub fn evaluate(
    baseline: QualityBaseline,
    current: QualityBaseline,
    thresholds: &ValidationThresholds,
) -> ValidationResult {
    let pattern_count_drop = if baseline.pattern_count > 0 {
        (baseline.pattern_count - current.pattern_count) as f64 / baseline.pattern_count as f64
    } else {
        0.0
    };
    let avg_confidence_drop = baseline.avg_confidence - current.avg_confidence;
    let high_confidence_lost = (baseline.high_confidence_count - current.high_confidence_count).max(0);

    let mut failures = Vec::new();
    if pattern_count_drop > thresholds.max_pattern_count_drop {
        failures.push(format!(
            "Pattern count dropped {:.1}% ({} -> {})",
            pattern_count_drop * 100.0,
            baseline.pattern_count,
            current.pattern_count
        ));
    }
    if avg_confidence_drop > thresholds.max_avg_confidence_drop + f64::EPSILON {
        failures.push(format!(
            "Average confidence dropped {:.3} ({:.3} -> {:.3})",
            avg_confidence_drop, baseline.avg_confidence, current.avg_confidence
        ));
    }
    if baseline.high_confidence_count > 0
        && high_confidence_lost as f64
            > thresholds.max_high_confidence_loss * baseline.high_confidence_count as f64
    {
        failures.push(format!(
            "Lost {} high-confidence patterns ({} -> {})",
            high_confidence_lost, baseline.high_confidence_count, current.high_confidence_count
        ));
    }

    ValidationResult {
        passed: failures.is_empty(),
        reason: (!failures.is_empty()).then(|| failures.join("; ")),
        baseline,
        current,
        deltas: QualityDeltas {
            pattern_count_drop,
            avg_confidence_drop,
            high_confidence_lost,
        },
    }
}

// ============================================================================
// SNAPSHOT HOOK
// ============================================================================

/// Supplementary copy taken before a branch opens
///
/// Failures are logged by the manager and never block branch creation.
pub trait SnapshotHook: Send + Sync {
    fn snapshot(&self, store: &ConceptStore, branch: &str) -> Result<(), StorageError>;
}

/// Writes a `VACUUM INTO` copy per branch under a directory
#[derive(Debug, Clone)]
pub struct BackupSnapshotHook {
    dir: PathBuf,
}

impl BackupSnapshotHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot file for a branch at a given time
    pub fn snapshot_path(&self, branch: &str, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "reverie-{}-{}.db",
            sanitize_savepoint_name(branch),
            at.format("%Y%m%d-%H%M%S%3f")
        ))
    }
}

impl SnapshotHook for BackupSnapshotHook {
    fn snapshot(&self, store: &ConceptStore, branch: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(branch, Utc::now());
        store.backup_to(&path)?;
        tracing::debug!(branch, path = %path.display(), "Branch snapshot written");
        Ok(())
    }
}

// ============================================================================
// BRANCHES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Merged,
    Discarded,
}

/// A reversible scope over the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    /// Storage-safe savepoint identifier
    pub savepoint: String,
    pub created_at: DateTime<Utc>,
    pub status: BranchStatus,
    /// Quality captured before the savepoint opened
    pub baseline: QualityBaseline,
}

/// Creates, validates, merges, and discards branches
pub struct BranchManager {
    store: Arc<ConceptStore>,
    /// Open branches in creation order, mirroring the savepoint stack
    active: Mutex<Vec<Branch>>,
    thresholds: ValidationThresholds,
    events: EventListeners,
    snapshot: Option<Box<dyn SnapshotHook>>,
}

impl BranchManager {
    pub fn new(store: Arc<ConceptStore>) -> Self {
        Self::with_thresholds(store, ValidationThresholds::default())
    }

    pub fn with_thresholds(store: Arc<ConceptStore>, thresholds: ValidationThresholds) -> Self {
        Self {
            store,
            active: Mutex::new(Vec::new()),
            thresholds,
            events: EventListeners::new(),
            snapshot: None,
        }
    }

    /// Share an existing listener registry
    pub fn with_events(mut self, events: EventListeners) -> Self {
        self.events = events;
        self
    }

    /// Install a best-effort snapshot hook run by `create_branch`
    pub fn with_snapshot_hook(mut self, hook: impl SnapshotHook + 'static) -> Self {
        self.snapshot = Some(Box::new(hook));
        self
    }

    pub fn thresholds(&self) -> &ValidationThresholds {
        &self.thresholds
    }

    pub fn events(&self) -> &EventListeners {
        &self.events
    }

    fn active(&self) -> Result<MutexGuard<'_, Vec<Branch>>, BranchError> {
        self.active
            .lock()
            .map_err(|_| StorageError::Init("Branch registry lock poisoned".into()).into())
    }

    /// Currently open branches, oldest first
    pub fn active_branches(&self) -> Result<Vec<Branch>, BranchError> {
        Ok(self.active()?.clone())
    }

    pub fn get_branch(&self, name: &str) -> Result<Option<Branch>, BranchError> {
        Ok(self.active()?.iter().find(|b| b.name == name).cloned())
    }

    /// Close `name` and every branch opened after it
    ///
    /// Releasing or rolling back a savepoint also pops the savepoints nested
    /// inside it, so those branches leave the registry with the same status.
    fn close(
        &self,
        name: &str,
        status: BranchStatus,
        reason: Option<&str>,
    ) -> Result<Branch, BranchError> {
        let mut active = self.active()?;
        let Some(index) = active.iter().position(|b| b.name == name) else {
            return Err(BranchError::NotActive(name.to_string()));
        };

        let savepoint = active[index].savepoint.clone();
        if status == BranchStatus::Discarded {
            self.store.rollback_to_savepoint(&savepoint)?;
        }
        self.store.release_savepoint(&savepoint)?;

        let nested = active.split_off(index + 1);
        let mut branch = active.remove(index);
        drop(active);

        for inner in nested.iter().rev() {
            tracing::warn!(branch = %inner.name, outer = name, status = ?status, "Nested branch closed with its parent");
            self.emit_closed(&inner.name, status, reason);
        }

        branch.status = status;
        match status {
            BranchStatus::Discarded => tracing::info!(branch = name, reason = ?reason, "Branch discarded"),
            _ => tracing::info!(branch = name, "Branch merged"),
        }
        self.emit_closed(name, status, reason);
        Ok(branch)
    }

    fn emit_closed(&self, name: &str, status: BranchStatus, reason: Option<&str>) {
        let branch = name.to_string();
        self.events.emit(match status {
            BranchStatus::Discarded => ReverieEvent::BranchDiscarded {
                branch,
                reason: reason.map(str::to_string),
            },
            _ => ReverieEvent::BranchMerged { branch },
        });
    }

    /// Open a branch
    ///
    /// Fails with `DuplicateName` if an open branch has the same name or the
    /// same sanitized savepoint identifier.
    pub fn create_branch(&self, name: &str) -> Result<Branch, BranchError> {
        let mut active = self.active()?;
        let savepoint = sanitize_savepoint_name(name);
        if active.iter().any(|b| b.name == name || b.savepoint == savepoint) {
            return Err(BranchError::DuplicateName(name.to_string()));
        }

        let baseline = self.store.quality_metrics()?;

        if let Some(hook) = &self.snapshot {
            if let Err(e) = hook.snapshot(&self.store, name) {
                tracing::warn!(branch = name, "Branch snapshot failed: {}", e);
            }
        }

        self.store.savepoint(&savepoint)?;

        let branch = Branch {
            name: name.to_string(),
            savepoint,
            created_at: Utc::now(),
            status: BranchStatus::Active,
            baseline,
        };
        active.push(branch.clone());
        drop(active);

        tracing::info!(
            branch = name,
            patterns = baseline.pattern_count,
            avg_confidence = baseline.avg_confidence,
            "Branch created"
        );
        self.events.emit(ReverieEvent::BranchCreated {
            branch: name.to_string(),
            baseline,
        });
        Ok(branch)
    }

    /// Check the branch's current quality against a baseline
    ///
    /// Uses the baseline captured at creation unless one is given.
    pub fn validate_branch(
        &self,
        name: &str,
        baseline: Option<QualityBaseline>,
    ) -> Result<ValidationResult, BranchError> {
        let captured = self
            .get_branch(name)?
            .ok_or_else(|| BranchError::NotActive(name.to_string()))?
            .baseline;

        let current = self.store.quality_metrics()?;
        let result = evaluate(baseline.unwrap_or(captured), current, &self.thresholds);
        match &result.reason {
            None => tracing::debug!(branch = name, "Branch validation passed"),
            Some(reason) => tracing::info!(branch = name, reason = %reason, "Branch validation failed"),
        }
        Ok(result)
    }

    /// Release the savepoint, keeping every change
    pub fn merge_branch(&self, name: &str) -> Result<Branch, BranchError> {
        self.close(name, BranchStatus::Merged, None)
    }

    /// Roll back to the savepoint and release it, dropping every change
    pub fn discard_branch(&self, name: &str, reason: Option<&str>) -> Result<Branch, BranchError> {
        self.close(name, BranchStatus::Discarded, reason)
    }
}

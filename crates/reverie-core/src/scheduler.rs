//! # Cycle Scheduler
//!
//! Decides when a dream cycle runs and wraps every cycle in a branch:
//!
//! ```text
//! trigger -> gate -> create branch -> dream -> validate -> merge | discard -> cooldown
//! ```
//!
//! Triggers come from four sources: a periodic timer, an experience counter
//! over a sliding window, quality-gate failures signaled by callers, and
//! manual requests. Only one cycle dreams at a time; triggers arriving while
//! one runs wait in a short queue that drains once the cooldown expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::branch::{BranchManager, ValidationResult};
use crate::dream::DreamEngine;
use crate::events::{EventListeners, ReverieEvent};
use crate::storage::{CycleStatus, DreamCycleRecord, StorageError};

/// Quality-gate failures never trigger cycles closer together than this
pub const MIN_FAILURE_TRIGGER_GAP: Duration = Duration::from_secs(60);

/// Cycle summaries kept in memory
pub const MAX_HISTORY: usize = 100;

/// `engine_state` key for persisted scheduler stats
pub const SCHEDULER_STATS_KEY: &str = "scheduler_stats";

// ============================================================================
// TRIGGERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    TimeBased,
    ExperienceThreshold,
    QualityGateFailure,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriority {
    Low,
    Normal,
    High,
}

/// A request for a dream cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub priority: TriggerPriority,
    pub reason: String,
    /// Bypass the cooldown entirely (manual requests only)
    pub force: bool,
}

impl DreamTrigger {
    pub fn time_based() -> Self {
        Self {
            trigger_type: TriggerType::TimeBased,
            priority: TriggerPriority::Low,
            reason: "scheduled interval elapsed".to_string(),
            force: false,
        }
    }

    pub fn experience_threshold(count: usize) -> Self {
        Self {
            trigger_type: TriggerType::ExperienceThreshold,
            priority: TriggerPriority::Normal,
            reason: format!("{} experiences captured", count),
            force: false,
        }
    }

    pub fn quality_gate_failure(reason: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::QualityGateFailure,
            priority: TriggerPriority::High,
            reason: reason.into(),
            force: false,
        }
    }

    pub fn manual(reason: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            priority: TriggerPriority::Normal,
            reason: reason.into(),
            force: false,
        }
    }

    pub fn with_priority(mut self, priority: TriggerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Bypass the cooldown; only honored for manual triggers
    pub fn forced(mut self) -> Self {
        self.force = self.trigger_type == TriggerType::Manual;
        self
    }
}

/// Outcome of submitting a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResult {
    /// A cycle started for this trigger
    pub scheduled: bool,
    /// Waiting behind the running cycle
    pub queued: bool,
    pub reason: String,
}

impl ScheduleResult {
    fn scheduled(reason: impl Into<String>) -> Self {
        Self {
            scheduled: true,
            queued: false,
            reason: reason.into(),
        }
    }

    fn queued(reason: impl Into<String>) -> Self {
        Self {
            scheduled: false,
            queued: true,
            reason: reason.into(),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            scheduled: false,
            queued: false,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// CONFIGURATION / STATE
// ============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Period of the time-based trigger; 0 disables it
    pub schedule_interval_ms: u64,
    /// Qualifying experiences within the window that trigger a cycle
    pub experience_threshold: usize,
    pub experience_window_ms: u64,
    /// Experiences scoring below this do not count
    pub min_experience_quality: f64,
    /// Quiet period after a cycle ends
    pub cooldown_ms: u64,
    /// Triggers held while a cycle runs
    pub max_pending_dreams: usize,
    /// How long shutdown waits before aborting the running cycle
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 3_600_000,
            experience_threshold: 20,
            experience_window_ms: 86_400_000,
            min_experience_quality: 0.5,
            cooldown_ms: 600_000,
            max_pending_dreams: 3,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    /// Triggers waiting for the cooldown to expire
    Queued,
    Dreaming,
    CoolingDown,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub enabled: bool,
    pub pending: usize,
    pub cooldown_remaining_ms: u64,
    pub experiences_in_window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Merged,
    Discarded,
    Failed,
}

/// What one scheduled cycle did
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    /// None when the cycle never reached the dream engine
    pub cycle_id: Option<String>,
    pub trigger: DreamTrigger,
    pub branch: String,
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub insights: usize,
    pub associations: usize,
    pub aborted: bool,
    pub validation: Option<ValidationResult>,
    pub error: Option<String>,
}

/// Aggregates across the scheduler's lifetime, persisted on shutdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerStats {
    pub triggers_received: u64,
    pub triggers_scheduled: u64,
    pub triggers_queued: u64,
    pub triggers_rejected: u64,
    pub cycles_merged: u64,
    pub cycles_discarded: u64,
    pub cycles_failed: u64,
    pub insights_kept: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Gate consulted before every cycle
pub trait ResourceCheck: Send + Sync {
    fn has_capacity(&self) -> bool;
}

impl<F> ResourceCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_capacity(&self) -> bool {
        self()
    }
}

/// Default gate; always permits
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

impl ResourceCheck for AlwaysAvailable {
    fn has_capacity(&self) -> bool {
        true
    }
}

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

struct SchedulerInner {
    enabled: bool,
    pending: VecDeque<DreamTrigger>,
    experiences: VecDeque<Instant>,
    last_cycle_end: Option<Instant>,
    last_failure_trigger: Option<Instant>,
    history: VecDeque<CycleSummary>,
    stats: SchedulerStats,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Gates triggers and runs branch-isolated dream cycles
pub struct CycleScheduler {
    engine: Arc<DreamEngine>,
    branches: Arc<BranchManager>,
    config: SchedulerConfig,
    events: EventListeners,
    resources: Box<dyn ResourceCheck>,
    inner: Mutex<SchedulerInner>,
    dream_lock: AtomicBool,
    state: watch::Sender<SchedulerState>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    cycle: Mutex<Option<JoinHandle<()>>>,
}

impl CycleScheduler {
    /// Scheduler sharing the dream engine's event listeners
    pub fn new(engine: Arc<DreamEngine>, branches: Arc<BranchManager>, config: SchedulerConfig) -> Self {
        let stats = match engine.store().load_engine_state(SCHEDULER_STATS_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => SchedulerStats::default(),
            Err(e) => {
                tracing::warn!("Could not load scheduler stats: {}", e);
                SchedulerStats::default()
            }
        };
        let (state, _) = watch::channel(SchedulerState::Idle);

        Self {
            events: engine.events().clone(),
            engine,
            branches,
            config,
            resources: Box::new(AlwaysAvailable),
            inner: Mutex::new(SchedulerInner {
                enabled: true,
                pending: VecDeque::new(),
                experiences: VecDeque::new(),
                last_cycle_end: None,
                last_failure_trigger: None,
                history: VecDeque::new(),
                stats,
            }),
            dream_lock: AtomicBool::new(false),
            state,
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            timer: Mutex::new(None),
            cycle: Mutex::new(None),
        }
    }

    pub fn with_resource_check(mut self, check: impl ResourceCheck + 'static) -> Self {
        self.resources = Box::new(check);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DreamEngine> {
        &self.engine
    }

    fn inner(&self) -> MutexGuard<'_, SchedulerInner> {
        // Never held across an await; recover the data if a holder panicked
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn cooldown_remaining(&self, inner: &SchedulerInner) -> Duration {
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        inner
            .last_cycle_end
            .map(|end| cooldown.saturating_sub(end.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Start the time-based trigger
    ///
    /// Does nothing when `schedule_interval_ms` is 0. Must be called from
    /// within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.config.schedule_interval_ms == 0 {
            tracing::info!("Time-based dream trigger disabled");
            return;
        }
        let period = Duration::from_millis(self.config.schedule_interval_ms);
        let scheduler = Arc::clone(self);
        let token = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let result = scheduler.submit(DreamTrigger::time_based());
                        tracing::debug!(scheduled = result.scheduled, reason = %result.reason, "Interval trigger");
                    }
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("Dream interval timer stopped");
        });

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
        tracing::info!(interval_ms = self.config.schedule_interval_ms, "Cycle scheduler started");
    }

    /// Stop triggering, let the running cycle finish, and persist stats
    ///
    /// The running cycle gets `shutdown_timeout_ms` to finish; after that it
    /// is asked to abort and given the same time again before its task is
    /// cancelled outright.
    pub async fn shutdown(&self) -> Result<SchedulerStats, SchedulerError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        self.shutdown.cancel();
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
        self.inner().pending.clear();

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        if !self.wait_until_not_dreaming(timeout).await {
            tracing::warn!("Dream cycle still running at shutdown, aborting");
            self.engine.abort();
            if !self.wait_until_not_dreaming(timeout).await {
                tracing::error!("Dream cycle ignored abort, cancelling its task");
                let handle = self.cycle.lock().ok().and_then(|mut cycle| cycle.take());
                if let Some(handle) = handle {
                    handle.abort();
                    let _ = handle.await;
                }
                self.dream_lock.store(false, Ordering::SeqCst);
            }
        }
        self.discard_open_branches();

        self.events.clear();
        self.set_state(SchedulerState::Idle);

        let stats = self.stats();
        self.engine
            .store()
            .save_engine_state(SCHEDULER_STATS_KEY, &serde_json::to_value(&stats).map_err(StorageError::from)?)?;
        tracing::info!(
            merged = stats.cycles_merged,
            discarded = stats.cycles_discarded,
            failed = stats.cycles_failed,
            "Cycle scheduler shut down"
        );
        Ok(stats)
    }

    /// Roll back branches a cancelled cycle left open so later writes commit
    fn discard_open_branches(&self) {
        let oldest = match self.branches.active_branches() {
            Ok(open) => open.into_iter().next(),
            Err(e) => {
                tracing::warn!("Could not list open branches at shutdown: {}", e);
                None
            }
        };
        if let Some(branch) = oldest {
            tracing::warn!(branch = %branch.name, "Discarding branch left open at shutdown");
            if let Err(e) = self.branches.discard_branch(&branch.name, Some("scheduler shutdown")) {
                tracing::error!(branch = %branch.name, "Failed to discard branch at shutdown: {}", e);
            }
        }
    }

    async fn wait_until_not_dreaming(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s != SchedulerState::Dreaming))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until no cycle is running or queued
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, SchedulerState::Idle | SchedulerState::CoolingDown)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    // ========================================================================
    // TRIGGERS
    // ========================================================================

    /// Gate a trigger and start a cycle for it if it passes
    ///
    /// Checks run in order: shutdown, disabled, resources, failure rate
    /// limit, cooldown, then the dream lock (queue or reject when full).
    /// Must be called from within a Tokio runtime.
    pub fn submit(self: &Arc<Self>, trigger: DreamTrigger) -> ScheduleResult {
        let result = self.gate(&trigger);

        if result.scheduled {
            self.events.emit(ReverieEvent::CycleScheduled {
                trigger: trigger.trigger_type,
                priority: trigger.priority,
                reason: trigger.reason.clone(),
            });
            let scheduler = Arc::clone(self);
            let handle = tokio::spawn(async move { scheduler.run(trigger).await });
            if let Ok(mut cycle) = self.cycle.lock() {
                *cycle = Some(handle);
            }
        } else if !result.queued {
            tracing::debug!(trigger = ?trigger.trigger_type, reason = %result.reason, "Dream trigger rejected");
            self.events.emit(ReverieEvent::CycleRejected {
                trigger: trigger.trigger_type,
                reason: result.reason.clone(),
            });
        }
        result
    }

    fn gate(&self, trigger: &DreamTrigger) -> ScheduleResult {
        let mut inner = self.inner();
        inner.stats.triggers_received += 1;

        let rejection = if self.is_shutting_down() {
            Some("shutting_down".to_string())
        } else if !inner.enabled {
            Some("scheduler disabled".to_string())
        } else if !self.resources.has_capacity() {
            Some("insufficient resources".to_string())
        } else if trigger.trigger_type == TriggerType::QualityGateFailure
            && inner
                .last_failure_trigger
                .is_some_and(|t| t.elapsed() < MIN_FAILURE_TRIGGER_GAP)
        {
            Some("quality gate failure trigger rate limited".to_string())
        } else {
            let remaining = self.cooldown_remaining(&inner);
            let bypasses = trigger.force || trigger.trigger_type == TriggerType::QualityGateFailure;
            if !bypasses && !remaining.is_zero() {
                Some(format!(
                    "cooldown active ({}s remaining)",
                    remaining.as_secs().max(1)
                ))
            } else {
                None
            }
        };
        if let Some(reason) = rejection {
            inner.stats.triggers_rejected += 1;
            return ScheduleResult::rejected(reason);
        }

        if self
            .dream_lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if inner.pending.len() >= self.config.max_pending_dreams {
                inner.stats.triggers_rejected += 1;
                return ScheduleResult::rejected("queue_full");
            }
            inner.pending.push_back(trigger.clone());
            inner.stats.triggers_queued += 1;
            return ScheduleResult::queued(format!("queued at position {}", inner.pending.len()));
        }

        if trigger.trigger_type == TriggerType::QualityGateFailure {
            inner.last_failure_trigger = Some(Instant::now());
        }
        inner.stats.triggers_scheduled += 1;
        drop(inner);

        self.set_state(SchedulerState::Dreaming);
        ScheduleResult::scheduled(trigger.reason.clone())
    }

    /// Manual request
    pub fn request_dream(
        self: &Arc<Self>,
        reason: impl Into<String>,
        priority: TriggerPriority,
        force: bool,
    ) -> ScheduleResult {
        let trigger = DreamTrigger::manual(reason).with_priority(priority);
        self.submit(if force { trigger.forced() } else { trigger })
    }

    /// Signal a failed quality gate upstream
    pub fn quality_gate_failed(self: &Arc<Self>, reason: impl Into<String>) -> ScheduleResult {
        self.submit(DreamTrigger::quality_gate_failure(reason))
    }

    /// Count an experience; submits a trigger once the window reaches the threshold
    ///
    /// Returns `None` when no trigger was submitted. The window is cleared
    /// once a trigger is scheduled or queued.
    pub fn record_experience(self: &Arc<Self>, quality_score: f64) -> Option<ScheduleResult> {
        let count = {
            let mut inner = self.inner();
            if quality_score < self.config.min_experience_quality {
                return None;
            }
            let now = Instant::now();
            let window = Duration::from_millis(self.config.experience_window_ms);
            inner.experiences.push_back(now);
            while inner
                .experiences
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                inner.experiences.pop_front();
            }
            inner.experiences.len()
        };

        if count < self.config.experience_threshold {
            return None;
        }
        let result = self.submit(DreamTrigger::experience_threshold(count));
        if result.scheduled || result.queued {
            self.inner().experiences.clear();
        }
        Some(result)
    }

    // ========================================================================
    // CYCLE EXECUTION
    // ========================================================================

    async fn run(self: Arc<Self>, trigger: DreamTrigger) {
        let summary = self.execute(trigger).await;
        self.finish(summary);
        self.drain_pending().await;
    }

    /// Branch, dream, validate, then merge or discard
    async fn execute(&self, trigger: DreamTrigger) -> CycleSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let branch = format!("dream-{}", Uuid::new_v4().simple());
        let mut summary = CycleSummary {
            cycle_id: None,
            trigger,
            branch: branch.clone(),
            outcome: CycleOutcome::Failed,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            insights: 0,
            associations: 0,
            aborted: false,
            validation: None,
            error: None,
        };

        if let Err(e) = self.branches.create_branch(&branch) {
            summary.error = Some(e.to_string());
            return finished(summary, clock);
        }

        let result = match self.engine.dream().await {
            Ok(result) => result,
            Err(e) => {
                summary.error = Some(e.to_string());
                self.discard(&branch, summary.error.as_deref(), None);
                return finished(summary, clock);
            }
        };
        summary.cycle_id = Some(result.cycle_id.clone());
        summary.insights = result.insights.len();
        summary.associations = result.associations_found;
        summary.aborted = result.aborted;

        if result.status == CycleStatus::Failed {
            summary.error = result.error.clone();
            self.discard(&branch, result.error.as_deref(), Some(result.to_record()));
            return finished(summary, clock);
        }

        match self.branches.validate_branch(&branch, None) {
            Ok(validation) if validation.passed => match self.branches.merge_branch(&branch) {
                Ok(_) => summary.outcome = CycleOutcome::Merged,
                Err(e) => {
                    summary.error = Some(e.to_string());
                    self.discard(&branch, summary.error.as_deref(), None);
                }
            },
            Ok(validation) => {
                let mut record: DreamCycleRecord = result.to_record();
                record.status = CycleStatus::Discarded;
                record.error = validation.reason.clone();
                self.discard(&branch, validation.reason.as_deref(), Some(record));
                summary.outcome = CycleOutcome::Discarded;
                summary.validation = Some(validation);
            }
            Err(e) => {
                summary.error = Some(e.to_string());
                self.discard(&branch, summary.error.as_deref(), Some(result.to_record()));
            }
        }
        finished(summary, clock)
    }

    /// Drop the branch, then re-record the cycle row it rolled back
    fn discard(&self, branch: &str, reason: Option<&str>, record: Option<DreamCycleRecord>) {
        if let Err(e) = self.branches.discard_branch(branch, reason) {
            tracing::warn!(branch, "Could not discard branch: {}", e);
        }
        if let Some(record) = record {
            if let Err(e) = self.engine.store().finish_cycle(&record) {
                tracing::warn!(cycle_id = %record.id, "Could not re-record discarded cycle: {}", e);
            }
        }
    }

    fn finish(&self, summary: CycleSummary) {
        tracing::info!(
            branch = %summary.branch,
            outcome = ?summary.outcome,
            insights = summary.insights,
            duration_ms = summary.duration_ms,
            "Scheduled dream cycle finished"
        );

        let next_state = {
            let mut inner = self.inner();
            match summary.outcome {
                CycleOutcome::Merged => {
                    inner.stats.cycles_merged += 1;
                    inner.stats.insights_kept += summary.insights as u64;
                }
                CycleOutcome::Discarded => inner.stats.cycles_discarded += 1,
                CycleOutcome::Failed => inner.stats.cycles_failed += 1,
            }
            inner.stats.last_cycle_at = Some(summary.finished_at);
            inner.last_cycle_end = Some(Instant::now());

            inner.history.push_back(summary);
            while inner.history.len() > MAX_HISTORY {
                inner.history.pop_front();
            }

            if !inner.pending.is_empty() {
                SchedulerState::Queued
            } else if self.config.cooldown_ms > 0 {
                SchedulerState::CoolingDown
            } else {
                SchedulerState::Idle
            }
        };

        self.dream_lock.store(false, Ordering::SeqCst);
        self.set_state(next_state);
    }

    /// Wait out the cooldown, then re-submit queued triggers
    ///
    /// A forced trigger in the queue is re-submitted without waiting.
    async fn drain_pending(self: &Arc<Self>) {
        let (forced_waiting, remaining) = {
            let inner = self.inner();
            (
                inner.pending.iter().any(|t| t.force),
                self.cooldown_remaining(&inner),
            )
        };

        if !forced_waiting && !remaining.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        if self.is_shutting_down() {
            return;
        }

        while let Some(trigger) = self.take_next_pending(forced_waiting) {
            let result = self.submit(trigger);
            if result.scheduled || result.queued {
                return;
            }
        }

        if !self.dream_lock.load(Ordering::SeqCst) {
            self.state.send_if_modified(|state| {
                if matches!(*state, SchedulerState::CoolingDown | SchedulerState::Queued) {
                    *state = SchedulerState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Highest priority first, oldest first within a priority
    fn take_next_pending(&self, prefer_forced: bool) -> Option<DreamTrigger> {
        let mut inner = self.inner();
        let index = inner
            .pending
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                (prefer_forced && a.force)
                    .cmp(&(prefer_forced && b.force))
                    .then(a.priority.cmp(&b.priority))
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)?;
        inner.pending.remove(index)
    }

    // ========================================================================
    // INTROSPECTION / CONTROL
    // ========================================================================

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.inner();
        SchedulerStatus {
            state: self.state(),
            enabled: inner.enabled,
            pending: inner.pending.len(),
            cooldown_remaining_ms: self.cooldown_remaining(&inner).as_millis() as u64,
            experiences_in_window: inner.experiences.len(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner().stats.clone()
    }

    /// Most recent cycle summaries, newest first
    pub fn history(&self, limit: usize) -> Vec<CycleSummary> {
        self.inner().history.iter().rev().take(limit).cloned().collect()
    }

    /// Disabling rejects every trigger until re-enabled; a running cycle finishes
    pub fn set_enabled(&self, enabled: bool) {
        self.inner().enabled = enabled;
        tracing::info!(enabled, "Cycle scheduler toggled");
    }

    /// Forget the last cycle end so the next trigger is not held by cooldown
    pub fn reset_cooldown(&self) {
        self.inner().last_cycle_end = None;
        self.state.send_if_modified(|state| {
            if *state == SchedulerState::CoolingDown {
                *state = SchedulerState::Idle;
                true
            } else {
                false
            }
        });
    }
}

fn finished(mut summary: CycleSummary, clock: Instant) -> CycleSummary {
    summary.finished_at = Utc::now();
    summary.duration_ms = clock.elapsed().as_millis() as u64;
    summary
}

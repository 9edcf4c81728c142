//! Lifecycle events
//!
//! Synchronous listeners registered with `on_event` run inline on the emitting
//! task; a listener that errors or panics is logged and skipped, never
//! propagated. Async observers can `subscribe()` to a broadcast channel
//! carrying the same events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::concept::QualityBaseline;
use crate::scheduler::{TriggerPriority, TriggerType};

/// Buffered events per broadcast subscriber before the oldest are dropped
const BROADCAST_CAPACITY: usize = 256;

/// Engine lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReverieEvent {
    DreamStarted {
        cycle_id: String,
        started_at: DateTime<Utc>,
    },
    DreamCompleted {
        cycle_id: String,
        insights: usize,
        associations: usize,
        duration_ms: u64,
    },
    DreamFailed {
        cycle_id: String,
        error: String,
    },
    BranchCreated {
        branch: String,
        baseline: QualityBaseline,
    },
    BranchMerged {
        branch: String,
    },
    BranchDiscarded {
        branch: String,
        reason: Option<String>,
    },
    CycleScheduled {
        trigger: TriggerType,
        priority: TriggerPriority,
        reason: String,
    },
    CycleRejected {
        trigger: TriggerType,
        reason: String,
    },
}

impl ReverieEvent {
    /// Event name in `topic:action` form
    pub fn name(&self) -> &'static str {
        match self {
            ReverieEvent::DreamStarted { .. } => "dream:start",
            ReverieEvent::DreamCompleted { .. } => "dream:complete",
            ReverieEvent::DreamFailed { .. } => "dream:error",
            ReverieEvent::BranchCreated { .. } => "branch_created",
            ReverieEvent::BranchMerged { .. } => "branch_merged",
            ReverieEvent::BranchDiscarded { .. } => "branch_discarded",
            ReverieEvent::CycleScheduled { .. } => "cycle:scheduled",
            ReverieEvent::CycleRejected { .. } => "cycle:rejected",
        }
    }
}

/// Error a listener may return
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Handle returned by `on_event`, used to unregister
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ReverieEvent) -> Result<(), ListenerError> + Send + Sync>;

struct Registry {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<ReverieEvent>,
}

/// Shared listener registry; clones share the same listeners
#[derive(Clone)]
pub struct EventListeners {
    inner: Arc<Registry>,
}

impl Default for EventListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventListeners {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        // A panicking listener is caught before it can poison the lock
        match self.inner.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a listener
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReverieEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn off_event(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.listeners().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver for async observers
    pub fn subscribe(&self) -> broadcast::Receiver<ReverieEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver an event to every listener and broadcast subscriber
    pub fn emit(&self, event: ReverieEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = self.listeners().clone();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = id, event = event.name(), "Event listener failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(listener = id, event = event.name(), "Event listener panicked");
                }
            }
        }

        // No receivers is not an error
        let _ = self.inner.sender.send(event);
    }
}

//! Event types and broadcast bus
//!
//! Workers and the flow engine emit [`QaEvent`]s at run/session/stage
//! boundaries. Emission is lossy: if nobody is subscribed the event is
//! dropped, never blocking verification work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::report::{SessionOutcome, StageOutcome};

/// Process-wide control state observed by every worker
///
/// `Running ↔ Paused` transitions are free; any state may transition to
/// `Stopping`, which is terminal for the remainder of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Running,
    Paused,
    Stopping,
}

/// machqa event types
///
/// Events are broadcast via [`EventBus`] and serialize to tagged JSON for
/// logging or external consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QaEvent {
    /// Verification run started
    RunStarted {
        total_targets: usize,
        workers: usize,
        timestamp: DateTime<Utc>,
    },

    /// Control state changed (pause/resume/stop request took effect)
    ControlChanged {
        state: ControlState,
        timestamp: DateTime<Utc>,
    },

    /// A worker acquired the next target from the shared queue
    TargetAcquired {
        worker: String,
        target_code: String,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },

    /// A verification session started for a target
    SessionStarted {
        session_id: Uuid,
        target_code: String,
        worker: String,
        timestamp: DateTime<Utc>,
    },

    /// A stage attempt started
    StageStarted {
        session_id: Uuid,
        target_code: String,
        stage: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A stage finished (all attempts consumed or an attempt passed)
    StageCompleted {
        session_id: Uuid,
        target_code: String,
        stage: String,
        outcome: StageOutcome,
        attempts_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A session finished, completed or aborted
    SessionCompleted {
        session_id: Uuid,
        target_code: String,
        outcome: SessionOutcome,
        failed_stages: usize,
        timestamp: DateTime<Utc>,
    },

    /// A worker observed the empty queue and is exiting its loop
    QueueExhausted {
        worker: String,
        timestamp: DateTime<Utc>,
    },

    /// All workers joined; final tally
    RunCompleted {
        completed: usize,
        aborted: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`QaEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QaEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<QaEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: QaEvent) {
        let _ = self.tx.send(event);
    }
}

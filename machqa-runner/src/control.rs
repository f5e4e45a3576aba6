//! Cooperative pause/stop control plane
//!
//! A single process-wide [`ControlHandle`] is cloned into every worker.
//! Workers observe it at stage boundaries only; an in-flight capture or
//! click sequence is never interrupted, so a pause or stop takes effect
//! after the current attempt finishes.
//!
//! Backed by a `tokio::sync::watch` channel: a paused worker awaits the
//! next state change instead of spinning.

use machqa_common::events::ControlState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared Running/Paused/Stopping state with wait-for-resume support
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<ControlState>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ControlState {
        *self.tx.borrow()
    }

    /// Request a pause; ignored unless currently running
    pub fn request_pause(&self) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Pause requested, workers will hold at the next stage boundary");
        }
    }

    /// Request a resume; ignored unless currently paused
    pub fn request_resume(&self) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == ControlState::Paused {
                *state = ControlState::Running;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Resume requested");
        }
    }

    /// Request a stop; terminal, overrides pause, cannot be undone
    pub fn request_stop(&self) {
        let changed = self.tx.send_if_modified(|state| {
            if *state != ControlState::Stopping {
                *state = ControlState::Stopping;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Stop requested, workers will finish their current stage and exit");
        }
    }

    /// Suspend until the state is `Running` or `Stopping`, returning it
    ///
    /// This is the pause point between stages: it returns immediately when
    /// running, waits indefinitely while paused, and wakes on any change.
    pub async fn wait_until_running(&self) -> ControlState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ControlState::Running | ControlState::Stopping => return state,
                ControlState::Paused => {
                    if rx.changed().await.is_err() {
                        // Sender gone means the process is tearing down
                        return ControlState::Stopping;
                    }
                }
            }
        }
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

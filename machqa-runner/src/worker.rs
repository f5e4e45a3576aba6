//! Worker loop
//!
//! One worker owns one browser session and drains the shared target queue:
//! acquire a code, match its profile, run the flow engine, hand the report
//! to the notification sink, repeat. The loop ends when the queue is empty
//! or a stop request is observed at the loop boundary.
//!
//! Nothing a single target does can take the worker down: internal faults
//! are isolated to the current session, recorded as an aborted report, and
//! the worker moves on to the next acquisition.

use crate::control::ControlHandle;
use crate::driver::UiDriver;
use crate::flow::TestFlowEngine;
use crate::notify::WebhookClient;
use crate::queue::TaskQueue;
use chrono::Utc;
use futures::FutureExt;
use machqa_common::events::{ControlState, EventBus, QaEvent};
use machqa_common::profile::ProfileSet;
use machqa_common::report::{
    SessionOutcome, SessionReport, StageOutcome, StageResult, TargetTask,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One queue-draining verification worker
pub struct Worker {
    id: String,
    queue: Arc<TaskQueue>,
    profiles: Arc<ProfileSet>,
    control: ControlHandle,
    events: EventBus,
    notifier: Option<Arc<WebhookClient>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<TaskQueue>,
        profiles: Arc<ProfileSet>,
        control: ControlHandle,
        events: EventBus,
        notifier: Option<Arc<WebhookClient>>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            profiles,
            control,
            events,
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drain the queue against the given browser session
    pub async fn run<D: UiDriver>(&self, driver: &D) -> Vec<SessionReport> {
        let engine = TestFlowEngine::new(
            driver,
            self.control.clone(),
            self.events.clone(),
            self.id.clone(),
        );
        let mut reports = Vec::new();

        loop {
            // a paused pool holds workers here as well as between stages
            if self.control.wait_until_running().await == ControlState::Stopping {
                info!(worker = %self.id, "Stop requested, exiting worker loop");
                break;
            }

            let Some(task) = self.queue.acquire_next(&self.id) else {
                info!(worker = %self.id, "Target queue exhausted, worker done");
                self.events.emit_lossy(QaEvent::QueueExhausted {
                    worker: self.id.clone(),
                    timestamp: Utc::now(),
                });
                break;
            };
            self.events.emit_lossy(QaEvent::TargetAcquired {
                worker: self.id.clone(),
                target_code: task.code.clone(),
                remaining: self.queue.remaining(),
                timestamp: Utc::now(),
            });

            let report = match self.profiles.match_target(&task.code) {
                Some(profile) => {
                    let session = AssertUnwindSafe(engine.run_session(&task, &profile))
                        .catch_unwind()
                        .await;
                    match session {
                        Ok(report) => report,
                        Err(_) => {
                            error!(
                                worker = %self.id,
                                code = %task.code,
                                "Internal fault during session, recording aborted report"
                            );
                            internal_fault_report(&task, &self.id)
                        }
                    }
                }
                None => {
                    warn!(
                        worker = %self.id,
                        code = %task.code,
                        "No machine profile matched, target marked failed without attempt"
                    );
                    unmatched_profile_report(&task, &self.id)
                }
            };

            if let Some(notifier) = &self.notifier {
                notifier.send_session_report(&report).await;
            }
            reports.push(report);
        }

        reports
    }
}

/// Report for a target whose code matched no profile: failed before any
/// browser attempt was made
fn unmatched_profile_report(task: &TargetTask, worker: &str) -> SessionReport {
    let now = Utc::now();
    SessionReport {
        session_id: Uuid::new_v4(),
        target_code: task.code.clone(),
        worker: worker.to_string(),
        started_at: now,
        finished_at: now,
        stage_results: vec![StageResult {
            stage_name: "profile".to_string(),
            outcome: StageOutcome::Fail,
            attempts_used: 0,
            similarity_scores: Vec::new(),
            detail: format!("no machine profile matched code '{}'", task.code),
        }],
        session_outcome: SessionOutcome::Aborted,
        console_errors: Vec::new(),
    }
}

/// Report standing in for a session that died to an unexpected fault
fn internal_fault_report(task: &TargetTask, worker: &str) -> SessionReport {
    let now = Utc::now();
    SessionReport {
        session_id: Uuid::new_v4(),
        target_code: task.code.clone(),
        worker: worker.to_string(),
        started_at: now,
        finished_at: now,
        stage_results: Vec::new(),
        session_outcome: SessionOutcome::Aborted,
        console_errors: Vec::new(),
    }
}

//! Per-target test flow state machine
//!
//! Runs one target's ordered stage list against a browser session:
//!
//! ```text
//! Idle → Navigating(entry) → StageRunning(i) → StagePassed/StageFailed
//!      → NextStage | SessionAborted | SessionCompleted
//! ```
//!
//! The implicit navigate/enter step always runs first and is the critical
//! stage: exhausting its retries aborts the session and skips the rest.
//! Every other stage records its pass/fail and the session continues.
//! Control state is polled at stage boundaries only; a stop request lets
//! the in-flight attempt finish, then ends the session as aborted.

use crate::control::ControlHandle;
use crate::detect::{audio, frame, visual};
use crate::driver::{ClickTarget, DriverError, UiDriver};
use chrono::Utc;
use machqa_common::events::{ControlState, EventBus, QaEvent};
use machqa_common::profile::{
    ImageComparisonConfig, ResolvedProfile, StageDefinition, StageKind,
};
use machqa_common::report::{
    SessionOutcome, SessionReport, StageOutcome, StageResult, TargetTask,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one attempt at a stage
struct AttemptReport {
    passed: bool,
    scores: Vec<f64>,
    detail: String,
}

impl AttemptReport {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            scores: Vec::new(),
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            scores: Vec::new(),
            detail: detail.into(),
        }
    }

    fn with_scores(mut self, scores: Vec<f64>) -> Self {
        self.scores = scores;
        self
    }
}

/// Drives one target through its stage list on a single browser session
pub struct TestFlowEngine<'a, D: UiDriver> {
    driver: &'a D,
    control: ControlHandle,
    events: EventBus,
    worker: String,
}

impl<'a, D: UiDriver> TestFlowEngine<'a, D> {
    pub fn new(driver: &'a D, control: ControlHandle, events: EventBus, worker: String) -> Self {
        Self {
            driver,
            control,
            events,
            worker,
        }
    }

    /// Run a full verification session for one target
    ///
    /// Never fails: every error below session level is absorbed into the
    /// returned report.
    pub async fn run_session(
        &self,
        task: &TargetTask,
        profile: &ResolvedProfile,
    ) -> SessionReport {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            worker = %self.worker,
            code = %task.code,
            profile = %profile.profile.name,
            "Starting verification session"
        );
        self.events.emit_lossy(QaEvent::SessionStarted {
            session_id,
            target_code: task.code.clone(),
            worker: self.worker.clone(),
            timestamp: Utc::now(),
        });

        let (stage_results, session_outcome) =
            self.run_stages(session_id, task, profile).await;

        let console_errors = self.driver.drain_console_errors().await;
        let report = SessionReport {
            session_id,
            target_code: task.code.clone(),
            worker: self.worker.clone(),
            started_at,
            finished_at: Utc::now(),
            stage_results,
            session_outcome,
            console_errors,
        };

        info!(
            worker = %self.worker,
            code = %task.code,
            outcome = ?report.session_outcome,
            failed_stages = report.failed_stage_count(),
            "Session finished"
        );
        self.events.emit_lossy(QaEvent::SessionCompleted {
            session_id,
            target_code: task.code.clone(),
            outcome: report.session_outcome,
            failed_stages: report.failed_stage_count(),
            timestamp: Utc::now(),
        });

        report
    }

    async fn run_stages(
        &self,
        session_id: Uuid,
        task: &TargetTask,
        profile: &ResolvedProfile,
    ) -> (Vec<StageResult>, SessionOutcome) {
        let mut results = Vec::new();

        if self.control.wait_until_running().await == ControlState::Stopping {
            return (results, SessionOutcome::Aborted);
        }

        // The implicit navigate/enter step: the profile's entry stage if it
        // declares one, a synthesized default otherwise. Always critical.
        let entry_def = profile
            .entry_stage()
            .cloned()
            .unwrap_or_else(default_entry_stage);
        let entry = self.run_stage(session_id, task, profile, &entry_def).await;
        let entry_passed = entry.passed();
        results.push(entry);

        if !entry_passed {
            warn!(
                worker = %self.worker,
                code = %task.code,
                "Entry stage exhausted its retries, aborting session"
            );
            return (results, SessionOutcome::Aborted);
        }

        for def in &profile.profile.stages {
            if def.kind.is_entry() {
                continue;
            }
            if !def.enabled {
                debug!(stage = %def.name, "Skipping disabled stage");
                continue;
            }

            // pause holds here; stop finishes the session as aborted
            if self.control.wait_until_running().await == ControlState::Stopping {
                info!(
                    worker = %self.worker,
                    code = %task.code,
                    "Stop requested between stages, aborting session"
                );
                return (results, SessionOutcome::Aborted);
            }

            results.push(self.run_stage(session_id, task, profile, def).await);
        }

        (results, SessionOutcome::Completed)
    }

    /// Run one stage with its retry and timeout policy
    async fn run_stage(
        &self,
        session_id: Uuid,
        task: &TargetTask,
        profile: &ResolvedProfile,
        def: &StageDefinition,
    ) -> StageResult {
        let max_attempts = def.max_attempts();
        let timeout = def.timeout();
        let mut last_scores = Vec::new();
        let mut last_detail = String::new();
        let mut attempts_used = 0;

        for attempt in 1..=max_attempts {
            attempts_used = attempt;
            debug!(
                stage = %def.name,
                attempt,
                max_attempts,
                "Running stage attempt"
            );
            self.events.emit_lossy(QaEvent::StageStarted {
                session_id,
                target_code: task.code.clone(),
                stage: def.name.clone(),
                attempt,
                timestamp: Utc::now(),
            });

            match tokio::time::timeout(timeout, self.run_attempt(task, profile, def)).await {
                Ok(Ok(report)) if report.passed => {
                    info!(stage = %def.name, attempt, detail = %report.detail, "Stage passed");
                    self.emit_stage_completed(session_id, task, def, StageOutcome::Pass, attempt);
                    return StageResult {
                        stage_name: def.name.clone(),
                        outcome: StageOutcome::Pass,
                        attempts_used: attempt,
                        similarity_scores: report.scores,
                        detail: report.detail,
                    };
                }
                Ok(Ok(report)) => {
                    warn!(stage = %def.name, attempt, detail = %report.detail, "Stage check failed");
                    last_scores = report.scores;
                    last_detail = report.detail;
                }
                Ok(Err(err)) => {
                    warn!(stage = %def.name, attempt, error = %err, "Stage attempt errored");
                    last_scores = Vec::new();
                    last_detail = err.to_string();
                }
                Err(_) => {
                    warn!(
                        stage = %def.name,
                        attempt,
                        timeout_ms = timeout.as_millis() as u64,
                        "Stage attempt timed out"
                    );
                    last_scores = Vec::new();
                    last_detail = format!(
                        "attempt timed out after {:.1}s",
                        timeout.as_secs_f64()
                    );
                }
            }

            // a stop request ends retries after the in-flight attempt
            if attempt < max_attempts && self.control.current() == ControlState::Stopping {
                warn!(stage = %def.name, "Stop requested, not retrying stage");
                break;
            }
        }

        self.emit_stage_completed(session_id, task, def, StageOutcome::Fail, attempts_used);
        StageResult {
            stage_name: def.name.clone(),
            outcome: StageOutcome::Fail,
            attempts_used,
            similarity_scores: last_scores,
            detail: last_detail,
        }
    }

    fn emit_stage_completed(
        &self,
        session_id: Uuid,
        task: &TargetTask,
        def: &StageDefinition,
        outcome: StageOutcome,
        attempts_used: u32,
    ) {
        self.events.emit_lossy(QaEvent::StageCompleted {
            session_id,
            target_code: task.code.clone(),
            stage: def.name.clone(),
            outcome,
            attempts_used,
            timestamp: Utc::now(),
        });
    }

    /// One attempt: perform the stage's actions and run every enabled check
    async fn run_attempt(
        &self,
        task: &TargetTask,
        profile: &ResolvedProfile,
        def: &StageDefinition,
    ) -> Result<AttemptReport, DriverError> {
        match &def.kind {
            StageKind::Entry { image } => {
                self.driver.navigate(task).await?;
                match self.check_image(profile, &def.name, image.as_ref()).await? {
                    Some((matched, scores, summary)) => {
                        let detail = format!("navigated; {summary}");
                        Ok(if matched {
                            AttemptReport::pass(detail).with_scores(scores)
                        } else {
                            AttemptReport::fail(detail).with_scores(scores)
                        })
                    }
                    None => Ok(AttemptReport::pass("navigated")),
                }
            }

            StageKind::VideoCheck {
                anomaly,
                scope,
                image,
            } => {
                let captured = self.driver.capture_frame(scope).await?;
                let report = frame::inspect_frame(&captured, anomaly);
                if report.is_anomalous() {
                    return Ok(AttemptReport::fail(report.describe()));
                }
                match self.check_image(profile, &def.name, image.as_ref()).await? {
                    Some((matched, scores, summary)) => {
                        let detail = format!("{}; {summary}", report.describe());
                        Ok(if matched {
                            AttemptReport::pass(detail).with_scores(scores)
                        } else {
                            AttemptReport::fail(detail).with_scores(scores)
                        })
                    }
                    None => Ok(AttemptReport::pass(report.describe())),
                }
            }

            StageKind::ButtonCheck { buttons, image } => {
                for button in buttons {
                    let target = ClickTarget::parse(&button.selector);
                    self.driver.perform_click(&target).await.map_err(|e| {
                        DriverError::Action(format!("button '{}': {e}", button.name))
                    })?;
                }
                let clicked = format!("clicked {} controls", buttons.len());
                match self.check_image(profile, &def.name, image.as_ref()).await? {
                    Some((matched, scores, summary)) => {
                        let detail = format!("{clicked}; {summary}");
                        Ok(if matched {
                            AttemptReport::pass(detail).with_scores(scores)
                        } else {
                            AttemptReport::fail(detail).with_scores(scores)
                        })
                    }
                    None => Ok(AttemptReport::pass(clicked)),
                }
            }

            StageKind::BettingCheck {
                amounts,
                bet_selector,
                image,
            } => {
                if let Some(selector) = bet_selector {
                    let target = ClickTarget::parse(selector);
                    for amount in amounts {
                        self.driver.perform_click(&target).await.map_err(|e| {
                            DriverError::Action(format!("bet of {amount}: {e}"))
                        })?;
                    }
                }
                let placed = format!("placed {} bets", amounts.len());
                match self.check_image(profile, &def.name, image.as_ref()).await? {
                    Some((matched, scores, summary)) => {
                        let detail = format!("{placed}; {summary}");
                        Ok(if matched {
                            AttemptReport::pass(detail).with_scores(scores)
                        } else {
                            AttemptReport::fail(detail).with_scores(scores)
                        })
                    }
                    None => Ok(AttemptReport::pass(placed)),
                }
            }

            StageKind::AudioCheck { audio: overrides } => {
                let thresholds = match overrides {
                    Some(over) => profile.profile.audio.merged(over),
                    None => profile.profile.audio,
                };
                let rx = self
                    .driver
                    .capture_audio(Duration::from_secs_f64(thresholds.duration_secs))
                    .await?;
                let analysis = audio::analyze_stream(rx, &thresholds).await;
                let detail = analysis.describe();
                Ok(if analysis.passed() {
                    AttemptReport::pass(detail)
                } else {
                    AttemptReport::fail(detail)
                })
            }

            StageKind::Custom {
                clicks,
                anomaly,
                scope,
                image,
            } => {
                for click in clicks {
                    let target = ClickTarget::parse(&click.selector);
                    self.driver.perform_click(&target).await.map_err(|e| {
                        DriverError::Action(format!("control '{}': {e}", click.name))
                    })?;
                }
                let mut parts = Vec::new();
                if !clicks.is_empty() {
                    parts.push(format!("clicked {} controls", clicks.len()));
                }

                if let Some(thresholds) = anomaly {
                    let captured = self.driver.capture_frame(scope).await?;
                    let report = frame::inspect_frame(&captured, thresholds);
                    if report.is_anomalous() {
                        return Ok(AttemptReport::fail(report.describe()));
                    }
                    parts.push(report.describe());
                }

                match self.check_image(profile, &def.name, image.as_ref()).await? {
                    Some((matched, scores, summary)) => {
                        parts.push(summary);
                        let detail = parts.join("; ");
                        Ok(if matched {
                            AttemptReport::pass(detail).with_scores(scores)
                        } else {
                            AttemptReport::fail(detail).with_scores(scores)
                        })
                    }
                    None => {
                        let detail = if parts.is_empty() {
                            "no checks configured".to_string()
                        } else {
                            parts.join("; ")
                        };
                        Ok(AttemptReport::pass(detail))
                    }
                }
            }
        }
    }

    /// Capture and compare against the stage's reference set, if configured
    ///
    /// Returns `None` when the stage has no enabled comparison. A missing
    /// reference set scores as a non-match rather than an error.
    async fn check_image(
        &self,
        profile: &ResolvedProfile,
        stage_name: &str,
        config: Option<&ImageComparisonConfig>,
    ) -> Result<Option<(bool, Vec<f64>, String)>, DriverError> {
        let Some(config) = config else {
            return Ok(None);
        };
        if !config.enabled {
            return Ok(None);
        }

        let set_name = config.image_set.as_deref().unwrap_or(stage_name);
        let Some(set) = profile.references_for(set_name) else {
            // an unloaded set scores as a non-match, never as a crash
            return Ok(Some((
                false,
                Vec::new(),
                format!("reference set '{set_name}' is not loaded"),
            )));
        };

        let captured = self.driver.capture_frame(&config.scope).await?;
        let outcome = visual::compare_against_set(&captured, set, config.similarity_threshold);
        let scores = outcome.score_values();
        let summary = outcome.summary();
        Ok(Some((outcome.all_matched, scores, summary)))
    }
}

/// Synthesized entry stage for profiles that do not declare one
fn default_entry_stage() -> StageDefinition {
    StageDefinition {
        name: "entry".to_string(),
        description: "navigate into the target machine".to_string(),
        enabled: true,
        timeout_secs: 30.0,
        retry_count: 1,
        kind: StageKind::Entry { image: None },
    }
}

//! Session report types
//!
//! A worker accumulates one [`SessionReport`] per target it runs. The report
//! is owned by that worker until it is handed to the notification sink;
//! nothing in here is shared between workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One machine instance to verify, identified by its unique code
/// (e.g. `873-JJBX-0004`).
///
/// Tasks are created when the shared queue is initialized and consumed
/// exactly once; they are never mutated or returned to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTask {
    pub code: String,
}

impl TargetTask {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Pass/fail verdict for a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pass,
    Fail,
}

/// Result of one stage of a session, immutable once recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub outcome: StageOutcome,
    /// Attempts actually performed (1..=retry_count+1)
    pub attempts_used: u32,
    /// One combined score per reference image evaluated, in reference order.
    /// Empty for stages without image comparison.
    pub similarity_scores: Vec<f64>,
    /// Human-readable outcome detail from the deciding attempt
    pub detail: String,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.outcome == StageOutcome::Pass
    }
}

/// Overall verdict for a session
///
/// `Completed` means every configured stage was evaluated (pass or fail)
/// after a successful entry; `Aborted` means the critical entry stage
/// exhausted its retries or a stop request ended the session early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Aborted,
}

/// Console or page error collected from the browser session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleError {
    pub kind: String,
    pub text: String,
}

/// Consolidated result of one target's verification session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub target_code: String,
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stage_results: Vec<StageResult>,
    pub session_outcome: SessionOutcome,
    pub console_errors: Vec<ConsoleError>,
}

impl SessionReport {
    pub fn completed(&self) -> bool {
        self.session_outcome == SessionOutcome::Completed
    }

    /// True when the session completed and every recorded stage passed
    pub fn all_stages_passed(&self) -> bool {
        self.completed() && self.stage_results.iter().all(StageResult::passed)
    }

    pub fn failed_stage_count(&self) -> usize {
        self.stage_results.iter().filter(|r| !r.passed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, outcome: StageOutcome) -> StageResult {
        StageResult {
            stage_name: name.to_string(),
            outcome,
            attempts_used: 1,
            similarity_scores: Vec::new(),
            detail: String::new(),
        }
    }

    fn report(outcome: SessionOutcome, stages: Vec<StageResult>) -> SessionReport {
        SessionReport {
            session_id: Uuid::new_v4(),
            target_code: "873-JJBX-0004".to_string(),
            worker: "worker-1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stage_results: stages,
            session_outcome: outcome,
            console_errors: Vec::new(),
        }
    }

    #[test]
    fn all_stages_passed_requires_completion() {
        let r = report(SessionOutcome::Aborted, vec![stage("entry", StageOutcome::Pass)]);
        assert!(!r.all_stages_passed());

        let r = report(SessionOutcome::Completed, vec![stage("entry", StageOutcome::Pass)]);
        assert!(r.all_stages_passed());
    }

    #[test]
    fn failed_stage_count_counts_failures_only() {
        let r = report(
            SessionOutcome::Completed,
            vec![
                stage("entry", StageOutcome::Pass),
                stage("video", StageOutcome::Fail),
                stage("audio", StageOutcome::Fail),
            ],
        );
        assert_eq!(r.failed_stage_count(), 2);
        assert!(!r.all_stages_passed());
    }

    #[test]
    fn report_serializes_with_snake_case_outcomes() {
        let r = report(SessionOutcome::Completed, vec![stage("entry", StageOutcome::Pass)]);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"session_outcome\":\"completed\""));
        assert!(json.contains("\"outcome\":\"pass\""));
    }
}

//! Outbound webhook notifications
//!
//! Minimal text webhook client with bounded retries and linear backoff.
//! One message per finished session; rendering keeps the whole report
//! readable in a chat channel. Without a configured URL the client is
//! disabled and sending is a logged no-op.

use machqa_common::report::{SessionReport, StageResult};
use std::time::Duration;
use tracing::{debug, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(6);
const MAX_CONSOLE_ERRORS_SHOWN: usize = 5;

/// Text webhook client for session reports
pub struct WebhookClient {
    url: Option<String>,
    client: reqwest::Client,
    retries: u32,
}

impl WebhookClient {
    pub fn new(url: Option<String>) -> Self {
        let url = url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        match &url {
            Some(u) => info!(url_len = u.len(), "Webhook notifications enabled"),
            None => warn!("No webhook URL configured, notifications disabled"),
        }
        Self {
            url,
            client: reqwest::Client::new(),
            retries: 2,
        }
    }

    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send a text message; returns whether delivery succeeded
    pub async fn send_text(&self, text: &str) -> bool {
        let Some(url) = &self.url else {
            debug!("Webhook disabled, dropping message");
            return false;
        };

        let payload = serde_json::json!({
            "msg_type": "text",
            "content": { "text": text },
        });

        for attempt in 0..=self.retries {
            let result = self
                .client
                .post(url)
                .json(&payload)
                .timeout(SEND_TIMEOUT)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!("Webhook delivery succeeded");
                    return true;
                }
                Ok(response) => {
                    warn!(
                        status = %response.status(),
                        attempt = attempt + 1,
                        "Webhook returned non-success status"
                    );
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "Webhook send failed");
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(800 * (attempt as u64 + 1))).await;
            }
        }

        warn!("Webhook delivery failed after {} attempts", self.retries + 1);
        false
    }

    /// Render and send one session report
    pub async fn send_session_report(&self, report: &SessionReport) -> bool {
        self.send_text(&render_report(report)).await
    }
}

/// Render a session report as a readable text block
pub fn render_report(report: &SessionReport) -> String {
    let mut lines = Vec::new();

    let verdict = if report.all_stages_passed() {
        "PASS"
    } else {
        "FAIL"
    };
    lines.push(format!(
        "Verification report: {} [{}]",
        report.target_code, verdict
    ));
    lines.push(format!(
        "worker: {} | outcome: {:?} | duration: {:.1}s",
        report.worker,
        report.session_outcome,
        (report.finished_at - report.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0
    ));
    lines.push(String::new());

    for stage in &report.stage_results {
        lines.push(render_stage(stage));
    }

    if report.console_errors.is_empty() {
        lines.push("console errors: none".to_string());
    } else {
        lines.push(format!(
            "console errors: {} total",
            report.console_errors.len()
        ));
        for error in report.console_errors.iter().take(MAX_CONSOLE_ERRORS_SHOWN) {
            let mut text = error.text.clone();
            if text.len() > 120 {
                text.truncate(120);
                text.push('…');
            }
            lines.push(format!("  [{}] {}", error.kind, text));
        }
        if report.console_errors.len() > MAX_CONSOLE_ERRORS_SHOWN {
            lines.push(format!(
                "  … and {} more",
                report.console_errors.len() - MAX_CONSOLE_ERRORS_SHOWN
            ));
        }
    }

    lines.join("\n")
}

fn render_stage(stage: &StageResult) -> String {
    let marker = if stage.passed() { "ok" } else { "FAIL" };
    let mut line = format!(
        "[{marker}] {} (attempts: {})",
        stage.stage_name, stage.attempts_used
    );
    if !stage.similarity_scores.is_empty() {
        let scores: Vec<String> = stage
            .similarity_scores
            .iter()
            .map(|s| format!("{s:.3}"))
            .collect();
        line.push_str(&format!(" scores: [{}]", scores.join(", ")));
    }
    if !stage.detail.is_empty() {
        line.push_str(&format!(" — {}", stage.detail));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use machqa_common::report::{ConsoleError, SessionOutcome, StageOutcome};
    use uuid::Uuid;

    fn sample_report() -> SessionReport {
        SessionReport {
            session_id: Uuid::new_v4(),
            target_code: "873-JJBX-0004".to_string(),
            worker: "worker-1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stage_results: vec![
                StageResult {
                    stage_name: "entry".to_string(),
                    outcome: StageOutcome::Pass,
                    attempts_used: 1,
                    similarity_scores: vec![0.94321],
                    detail: "navigated; 1/1 references matched at threshold 0.80".to_string(),
                },
                StageResult {
                    stage_name: "video".to_string(),
                    outcome: StageOutcome::Fail,
                    attempts_used: 3,
                    similarity_scores: Vec::new(),
                    detail: "black frame: 99.8% of sampled pixels below luminance 10".to_string(),
                },
            ],
            session_outcome: SessionOutcome::Completed,
            console_errors: vec![ConsoleError {
                kind: "console".to_string(),
                text: "Uncaught TypeError: spin is not a function".to_string(),
            }],
        }
    }

    #[test]
    fn rendered_report_contains_target_and_stage_outcomes() {
        let text = render_report(&sample_report());
        assert!(text.contains("873-JJBX-0004"));
        assert!(text.contains("[ok] entry (attempts: 1)"));
        assert!(text.contains("scores: [0.943]"));
        assert!(text.contains("[FAIL] video (attempts: 3)"));
        assert!(text.contains("black frame"));
        assert!(text.contains("console errors: 1 total"));
    }

    #[test]
    fn report_with_failures_is_marked_fail() {
        let text = render_report(&sample_report());
        assert!(text.starts_with("Verification report: 873-JJBX-0004 [FAIL]"));
    }

    #[tokio::test]
    async fn disabled_client_drops_messages() {
        let client = WebhookClient::new(None);
        assert!(!client.enabled());
        assert!(!client.send_text("ignored").await);

        let client = WebhookClient::new(Some("   ".to_string()));
        assert!(!client.enabled());
    }
}

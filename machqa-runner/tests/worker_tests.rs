//! Integration tests for the worker loop and the end-to-end scenario

mod helpers;

use helpers::*;
use machqa_common::events::EventBus;
use machqa_common::report::{SessionOutcome, SessionReport, StageOutcome};
use machqa_runner::control::ControlHandle;
use machqa_runner::queue::TaskQueue;
use machqa_runner::worker::Worker;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn codes(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("873-TEST-{i:04}")).collect()
}

#[tokio::test]
async fn end_to_end_three_targets_two_workers() {
    // Each target's entry always passes; the video stage fails its first
    // capture after every navigation, then passes on retry.
    let queue = Arc::new(TaskQueue::new(codes(3)));
    let profiles = profile_set(
        "TEST",
        resolved_profile(vec![video_stage("video", 2, 5.0)]),
    );
    let control = ControlHandle::new();
    let events = EventBus::new(64);

    let mut handles = Vec::new();
    for index in 0..2 {
        let worker = Worker::new(
            format!("worker-{}", index + 1),
            Arc::clone(&queue),
            Arc::clone(&profiles),
            control.clone(),
            events.clone(),
            None,
        );
        handles.push(tokio::spawn(async move {
            let driver = MockDriver::new().failing_first_capture_per_target();
            worker.run(&driver).await
        }));
    }

    let mut reports: Vec<SessionReport> = Vec::new();
    for handle in handles {
        reports.extend(handle.await.unwrap());
    }

    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_eq!(report.session_outcome, SessionOutcome::Completed);
        let video = report
            .stage_results
            .iter()
            .find(|r| r.stage_name == "video")
            .expect("video stage result");
        assert_eq!(video.outcome, StageOutcome::Pass);
        assert_eq!(video.attempts_used, 2);
    }

    // every target went to exactly one worker
    let history = queue.worker_history();
    let total: usize = history.values().map(Vec::len).sum();
    assert_eq!(total, 3);
    assert!(queue.is_exhausted());
}

#[tokio::test]
async fn stopped_worker_exits_without_acquiring() {
    let queue = Arc::new(TaskQueue::new(codes(4)));
    let profiles = profile_set("TEST", resolved_profile(vec![video_stage("video", 0, 5.0)]));
    let control = ControlHandle::new();
    control.request_stop();

    let worker = Worker::new(
        "worker-1",
        Arc::clone(&queue),
        profiles,
        control,
        EventBus::new(16),
        None,
    );
    let driver = MockDriver::new();
    let reports = worker.run(&driver).await;

    assert!(reports.is_empty());
    assert_eq!(queue.remaining(), 4);
    assert_eq!(driver.navigations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remaining_workers_drain_the_queue() {
    let queue = Arc::new(TaskQueue::new(codes(2)));
    let profiles = profile_set("TEST", resolved_profile(vec![video_stage("video", 0, 5.0)]));
    let control = ControlHandle::new();
    let events = EventBus::new(16);

    let running_worker = Worker::new(
        "worker-1",
        Arc::clone(&queue),
        Arc::clone(&profiles),
        control.clone(),
        events.clone(),
        None,
    );
    let driver = MockDriver::new();
    let reports = running_worker.run(&driver).await;
    assert_eq!(reports.len(), 2);
    assert!(queue.is_exhausted());

    // a worker arriving after exhaustion exits cleanly with nothing
    let late_worker = Worker::new(
        "worker-2",
        Arc::clone(&queue),
        profiles,
        control,
        events,
        None,
    );
    let late_driver = MockDriver::new();
    assert!(late_worker.run(&late_driver).await.is_empty());
}

#[tokio::test]
async fn unmatched_target_is_failed_without_any_attempt() {
    let queue = Arc::new(TaskQueue::new(vec!["999-UNKNOWN-0001".to_string()]));
    let profiles = profile_set("TEST", resolved_profile(vec![video_stage("video", 0, 5.0)]));

    let worker = Worker::new(
        "worker-1",
        Arc::clone(&queue),
        profiles,
        ControlHandle::new(),
        EventBus::new(16),
        None,
    );
    let driver = MockDriver::new();
    let reports = worker.run(&driver).await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.session_outcome, SessionOutcome::Aborted);
    assert_eq!(report.stage_results.len(), 1);
    assert_eq!(report.stage_results[0].stage_name, "profile");
    assert_eq!(report.stage_results[0].attempts_used, 0);
    // never attempted in the browser
    assert_eq!(driver.navigations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_target_does_not_take_down_the_worker() {
    // first target's entry never succeeds, second target is healthy
    let queue = Arc::new(TaskQueue::new(codes(2)));
    let profiles = profile_set(
        "TEST",
        resolved_profile(vec![entry_stage(0, None), video_stage("video", 0, 5.0)]),
    );

    let worker = Worker::new(
        "worker-1",
        Arc::clone(&queue),
        profiles,
        ControlHandle::new(),
        EventBus::new(16),
        None,
    );
    let driver = MockDriver::new().with_navigate_failures(1);
    let reports = worker.run(&driver).await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].session_outcome, SessionOutcome::Aborted);
    assert_eq!(reports[1].session_outcome, SessionOutcome::Completed);
}

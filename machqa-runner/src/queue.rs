//! Shared target queue
//!
//! All workers draw machine codes from one FIFO pool: worker A takes
//! codes[0], worker B takes codes[1], whoever finishes first takes
//! codes[2], and so on until the pool is exhausted. Acquisition is the
//! only contended mutation in the whole system; everything hinges on it
//! being atomic.
//!
//! The queue never re-queues a code. Retries happen inside the test flow
//! engine, and a task lost to a stop request stays lost for the run.

use machqa_common::report::TargetTask;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
struct QueueInner {
    codes: Vec<String>,
    next: usize,
    history: HashMap<String, Vec<String>>,
}

/// Thread-safe FIFO distributing target codes to workers exactly once each
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new(codes: Vec<String>) -> Self {
        info!(targets = codes.len(), "Initialized shared target queue");
        Self {
            inner: Mutex::new(QueueInner {
                codes,
                next: 0,
                history: HashMap::new(),
            }),
        }
    }

    /// Hand out the next code, recording it against `worker`
    ///
    /// Returns `None` once the pool is exhausted; exhaustion is permanent
    /// and repeat calls stay `None` without blocking.
    pub fn acquire_next(&self, worker: &str) -> Option<TargetTask> {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");
        if inner.next >= inner.codes.len() {
            debug!(worker, "Target queue exhausted");
            return None;
        }

        let code = inner.codes[inner.next].clone();
        inner.next += 1;
        let taken = inner.next;
        let total = inner.codes.len();
        inner
            .history
            .entry(worker.to_string())
            .or_default()
            .push(code.clone());

        info!(worker, code = %code, progress = %format!("{taken}/{total}"), "Acquired target");
        Some(TargetTask::new(code))
    }

    /// Codes not yet handed out
    pub fn remaining(&self) -> usize {
        let inner = self.inner.lock().expect("task queue lock poisoned");
        inner.codes.len() - inner.next
    }

    /// (handed out, total)
    pub fn progress(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("task queue lock poisoned");
        (inner.next, inner.codes.len())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Codes acquired per worker, in acquisition order
    pub fn worker_history(&self) -> HashMap<String, Vec<String>> {
        let inner = self.inner.lock().expect("task queue lock poisoned");
        inner.history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn codes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("873-JJBX-{i:04}")).collect()
    }

    #[test]
    fn hands_out_codes_in_input_order() {
        let queue = TaskQueue::new(codes(3));
        assert_eq!(queue.acquire_next("a").unwrap().code, "873-JJBX-0000");
        assert_eq!(queue.acquire_next("b").unwrap().code, "873-JJBX-0001");
        assert_eq!(queue.acquire_next("a").unwrap().code, "873-JJBX-0002");
        assert!(queue.acquire_next("a").is_none());
        // exhaustion is idempotent
        assert!(queue.acquire_next("b").is_none());
        assert_eq!(queue.remaining(), 0);
        assert!(queue.is_exhausted());
    }

    #[test]
    fn records_per_worker_history() {
        let queue = TaskQueue::new(codes(3));
        queue.acquire_next("a");
        queue.acquire_next("b");
        queue.acquire_next("a");

        let history = queue.worker_history();
        assert_eq!(history["a"], vec!["873-JJBX-0000", "873-JJBX-0002"]);
        assert_eq!(history["b"], vec!["873-JJBX-0001"]);
    }

    #[test]
    fn concurrent_acquisition_is_exactly_once() {
        let total = 200;
        let queue = Arc::new(TaskQueue::new(codes(total)));
        let mut handles = Vec::new();

        for w in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let worker = format!("worker-{w}");
                let mut seen = Vec::new();
                while let Some(task) = queue.acquire_next(&worker) {
                    seen.push(task.code);
                }
                seen
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        // every code exactly once, none skipped or duplicated
        assert_eq!(all.len(), total);
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(unique.len(), total);

        let (taken, pool) = queue.progress();
        assert_eq!(taken, pool);
    }

    #[test]
    fn empty_queue_is_born_exhausted() {
        let queue = TaskQueue::new(Vec::new());
        assert!(queue.acquire_next("a").is_none());
        assert_eq!(queue.progress(), (0, 0));
    }
}

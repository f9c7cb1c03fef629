//! FIFO ready queue of job ids.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::metrics;

#[derive(Default)]
struct QueueState {
    ids: VecDeque<String>,
    closed: bool,
}

/// Ready queue shared by producers and workers.
///
/// `pop` blocks while the queue is empty and returns `None` once the queue is
/// closed. Pushing an id that is already queued is a no-op.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The state is a plain deque; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a job id. Returns false if it was already queued or the queue
    /// is closed.
    pub(crate) fn push(&self, job_id: &str) -> bool {
        {
            let mut state = self.lock();
            if state.closed || state.ids.iter().any(|id| id == job_id) {
                return false;
            }
            state.ids.push_back(job_id.to_string());
            metrics::QUEUE_DEPTH.set(state.ids.len() as i64);
        }
        self.notify.notify_one();
        true
    }

    /// Remove a queued id (used by cancellation). Returns true if it was present.
    pub(crate) fn remove(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.ids.len();
        state.ids.retain(|id| id != job_id);
        metrics::QUEUE_DEPTH.set(state.ids.len() as i64);
        state.ids.len() != before
    }

    /// Wait for the next id. Returns `None` once the queue is closed.
    pub(crate) async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.ids.pop_front() {
                    metrics::QUEUE_DEPTH.set(state.ids.len() as i64);
                    let more = !state.ids.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers drain the backlog.
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Stop handing out ids and wake every waiting worker.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

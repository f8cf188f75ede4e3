//! Update batching queue
//!
//! Sits between the file watcher and the update pipeline. Change events are
//! deduplicated per file, ordered by priority class then age, collected into
//! batches that share the head's priority and fall within one batch window,
//! and handed to the handler by a bounded pool of cooperative workers.
//!
//! Two guarantees matter to callers:
//!
//! - jobs for the same file are serialised: while a file is queued or in
//!   flight, further `enqueue` calls for it return the same completion
//!   handle instead of re-queueing;
//! - completion handles resolve in the order the corresponding files were
//!   first enqueued, even when batches finish out of order. Finished jobs
//!   park until every earlier job has resolved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::ServerOptions;
use crate::error::Result;
use crate::graph::ModuleId;

/// Job priority. Higher classes are always picked before lower ones;
/// within a class, older jobs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Final state of one update job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The handler completed for this job. User-visible transform errors
    /// count as applied: they were surfaced to clients as `error` messages.
    Applied,
    /// The handler failed with a programming error; the whole batch is
    /// rejected.
    Failed(String),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One-shot completion handle returned by [`UpdateBatcher::enqueue`].
/// Clones share the same underlying completion.
#[derive(Debug, Clone)]
pub struct UpdateHandle {
    rx: watch::Receiver<Option<UpdateOutcome>>,
}

impl UpdateHandle {
    /// Wait until the job has been delivered (or rejected).
    pub async fn wait(&mut self) -> UpdateOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self
                    .rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| UpdateOutcome::Failed("batcher shut down".to_string()));
            }
        }
    }
}

/// Batch handler: processes every file in one batch.
pub type BatchHandler =
    Arc<dyn Fn(Vec<ModuleId>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
struct Job {
    file: ModuleId,
    priority: Priority,
    enqueued_at: Instant,
    seq: u64,
}

struct InFlight {
    tx: watch::Sender<Option<UpdateOutcome>>,
    rx: watch::Receiver<Option<UpdateOutcome>>,
}

struct Finished {
    file: ModuleId,
    outcome: UpdateOutcome,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Job>,
    in_flight: HashMap<ModuleId, InFlight>,
    next_seq: u64,
    resolve_next: u64,
    parked: BTreeMap<u64, Finished>,
    closed: bool,
}

impl QueueState {
    /// Release finished jobs in first-enqueue order.
    fn drain_resolved(&mut self) {
        while let Some(finished) = self.parked.remove(&self.resolve_next) {
            if let Some(entry) = self.in_flight.remove(&finished.file) {
                let _ = entry.tx.send(Some(finished.outcome));
            }
            self.resolve_next += 1;
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    handler: BatchHandler,
    window: Duration,
    max_batch: usize,
}

/// Queue in front of the update pipeline. See module docs for the contract.
pub struct UpdateBatcher {
    inner: Arc<Inner>,
}

impl UpdateBatcher {
    /// Create the batcher and spawn its worker pool. Must be called within
    /// a tokio runtime.
    pub fn new(options: &ServerOptions, handler: BatchHandler) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            handler,
            window: options.batch_window(),
            max_batch: options.max_batch,
        });

        for worker_id in 0..options.concurrency {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                worker(worker_id, inner).await;
            });
        }

        Self { inner }
    }

    /// Queue a change event for `file` at normal priority.
    pub fn enqueue(&self, file: ModuleId) -> UpdateHandle {
        self.enqueue_with_priority(file, Priority::Normal)
    }

    /// Queue a change event. If a completion for `file` is already pending,
    /// the existing handle is returned.
    pub fn enqueue_with_priority(&self, file: ModuleId, priority: Priority) -> UpdateHandle {
        let mut state = self.inner.state.lock();

        if let Some(existing) = state.in_flight.get(&file) {
            return UpdateHandle {
                rx: existing.rx.clone(),
            };
        }

        let (tx, rx) = watch::channel(None);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.in_flight.insert(file.clone(), InFlight { tx, rx: rx.clone() });
        state.pending.push(Job {
            file,
            priority,
            enqueued_at: Instant::now(),
            seq,
        });
        drop(state);

        self.inner.notify.notify_one();
        UpdateHandle { rx }
    }

    /// Number of queued-or-running files.
    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Stop the workers. Unprocessed jobs are rejected.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for job in state.pending.drain(..).collect::<Vec<_>>() {
            state.parked.insert(
                job.seq,
                Finished {
                    file: job.file,
                    outcome: UpdateOutcome::Failed("batcher shut down".to_string()),
                },
            );
        }
        state.drain_resolved();
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

enum Step {
    Wait,
    Sleep(Instant),
    Run(Vec<Job>),
}

async fn worker(worker_id: usize, inner: Arc<Inner>) {
    loop {
        let step = next_step(&inner);
        match step {
            Step::Wait => inner.notify.notified().await,
            Step::Sleep(ready_at) => tokio::time::sleep_until(ready_at).await,
            Step::Run(batch) => {
                let files: Vec<ModuleId> = batch.iter().map(|j| j.file.clone()).collect();
                tracing::debug!(worker_id, batch = files.len(), "processing batch");

                let result = (inner.handler)(files).await;
                let outcome = match result {
                    Ok(()) => UpdateOutcome::Applied,
                    Err(e) => {
                        tracing::error!(worker_id, "batch handler failed: {e}");
                        UpdateOutcome::Failed(e.to_string())
                    }
                };

                let mut state = inner.state.lock();
                for job in batch {
                    state.parked.insert(
                        job.seq,
                        Finished {
                            file: job.file,
                            outcome: outcome.clone(),
                        },
                    );
                }
                state.drain_resolved();
                let more = !state.pending.is_empty();
                drop(state);
                if more {
                    inner.notify.notify_one();
                }
            }
        }

        if inner.state.lock().closed {
            return;
        }
    }
}

/// Decide what a worker should do next: wait for work, sleep until the head
/// job's batch window has elapsed, or take a ripe batch.
fn next_step(inner: &Inner) -> Step {
    let mut state = inner.state.lock();
    if state.closed || state.pending.is_empty() {
        return Step::Wait;
    }

    state
        .pending
        .sort_by(|a, b| (a.priority, a.enqueued_at, a.seq).cmp(&(b.priority, b.enqueued_at, b.seq)));

    let head_enqueued = state.pending[0].enqueued_at;
    let ready_at = head_enqueued + inner.window;
    if Instant::now() < ready_at {
        return Step::Sleep(ready_at);
    }

    let head_priority = state.pending[0].priority;
    let mut take = 0;
    for job in &state.pending {
        if take >= inner.max_batch
            || job.priority != head_priority
            || job.enqueued_at.duration_since(head_enqueued) > inner.window
        {
            break;
        }
        take += 1;
    }

    let batch: Vec<Job> = state.pending.drain(..take).collect();
    if !state.pending.is_empty() {
        inner.notify.notify_one();
    }
    Step::Run(batch)
}

//! Queue processor: drains due tasks and settles each attempt
//!
//! Every polling cycle claims all due tasks and runs one attempt per task on
//! its own tokio task, so a slow identity-store call never delays other
//! tasks. A claimed task is marked in flight and is not claimed again until
//! its attempt has been settled.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::executor::{AttemptOutcome, TaskExecutor};
use super::queue::{millis, Claim, QueueStore, Resolution};
use super::status::DeadLetterCause;
use super::task::ReconciliationRequest;

/// Where a task ended up after one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Applied and removed from the queue
    Resolved,
    /// Failed transiently; back to pending with `attempt_count` attempts made
    RetryScheduled { attempt_count: u32 },
    DeadLettered(DeadLetterCause),
    /// A newer payload arrived during the attempt; the attempt is counted and
    /// the newer payload waits for the next backoff step
    Superseded,
    /// The task vanished while in flight (queue cleared)
    Discarded,
}

/// Attempts started by one call to [`QueueProcessor::dispatch_due`]
#[derive(Debug)]
pub struct DispatchBatch {
    handles: Vec<JoinHandle<TaskDisposition>>,
}

impl DispatchBatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every attempt in the batch, in dispatch order.
    pub async fn settle(self) -> Vec<TaskDisposition> {
        let mut dispositions = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(disposition) => dispositions.push(disposition),
                Err(e) => {
                    error!(error = %e, "Reconciliation attempt task failed");
                    dispositions.push(TaskDisposition::Discarded);
                }
            }
        }
        dispositions
    }
}

/// Scheduling loop over a [`QueueStore`]
#[derive(Clone)]
pub struct QueueProcessor {
    store: Arc<QueueStore>,
    executor: Arc<dyn TaskExecutor>,
    poll_interval: Duration,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<QueueStore>,
        executor: Arc<dyn TaskExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one polling cycle: claim every task due at `now` and start an
    /// attempt for each. Must be called from within a tokio runtime.
    pub fn dispatch_due(&self, now: Instant) -> DispatchBatch {
        let handles = self
            .store
            .claim_due(now)
            .into_iter()
            .map(|claim| {
                let store = Arc::clone(&self.store);
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move { run_attempt(&store, executor.as_ref(), claim).await })
            })
            .collect();
        DispatchBatch { handles }
    }

    /// Start the polling loop on a background task.
    pub fn spawn(&self) -> ProcessorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let processor = self.clone();
        let join = tokio::spawn(async move { processor.run(stop_rx).await });
        ProcessorHandle {
            stop_tx,
            join,
            store: Arc::clone(&self.store),
        }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = millis(self.poll_interval),
            "Reconciliation processor started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let batch = self.dispatch_due(Instant::now());
                    if !batch.is_empty() {
                        debug!(dispatched = batch.len(), "Dispatched due reconciliation tasks");
                    }
                    // Attempts settle themselves; the loop does not wait on them.
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation processor stopped");
    }
}

/// Control handle for a spawned processor loop
#[derive(Debug)]
pub struct ProcessorHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    store: Arc<QueueStore>,
}

impl ProcessorHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Pending and in-flight tasks are not drained; they are lost with the
    /// process. Returns how many were still queued.
    pub async fn shutdown(self) -> usize {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Reconciliation processor exited abnormally");
        }

        let status = self.store.snapshot(Instant::now());
        if status.total_items > 0 {
            warn!(
                pending = status.total_items - status.in_flight_items,
                in_flight = status.in_flight_items,
                "Discarding unreconciled tasks at shutdown; they are not persisted"
            );
        }
        status.total_items
    }
}

async fn run_attempt(
    store: &QueueStore,
    executor: &dyn TaskExecutor,
    claim: Claim,
) -> TaskDisposition {
    let outcome = guarded_attempt(executor, &claim.task.payload).await;
    settle(store, claim, outcome, Instant::now())
}

/// Run one executor attempt, turning a panic into a transient failure.
pub(crate) async fn guarded_attempt(
    executor: &dyn TaskExecutor,
    payload: &ReconciliationRequest,
) -> AttemptOutcome {
    AssertUnwindSafe(executor.attempt(payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AttemptOutcome::TransientFailure(format!("executor panicked: {}", message))
        })
}

/// Feed an attempt's outcome back into the queue.
fn settle(store: &QueueStore, claim: Claim, outcome: AttemptOutcome, now: Instant) -> TaskDisposition {
    let task = &claim.task;
    let attempts_made = task.attempt_count.saturating_add(1);

    let (resolution, reason) = match outcome {
        AttemptOutcome::Success => (
            store.resolve(task.id, claim.revision, attempts_made, now),
            None,
        ),
        AttemptOutcome::TransientFailure(reason) => (
            store.reschedule(task.id, claim.revision, attempts_made, reason.as_str(), now),
            Some(reason),
        ),
        AttemptOutcome::PermanentFailure(reason) => (
            store.dead_letter(
                task.id,
                claim.revision,
                attempts_made,
                DeadLetterCause::PermanentFailure,
                reason.as_str(),
                now,
            ),
            Some(reason),
        ),
    };

    match resolution {
        Resolution::Resolved => {
            info!(
                task_id = %task.id,
                event_kind = %task.payload.event_kind,
                attempt = attempts_made,
                "Reconciliation task resolved"
            );
            TaskDisposition::Resolved
        }
        Resolution::Rescheduled {
            attempt_count,
            next_attempt_at,
            superseded,
        } => {
            let retry_in_ms = millis(next_attempt_at.saturating_duration_since(now));
            if superseded {
                debug!(
                    task_id = %task.id,
                    attempt = attempt_count,
                    retry_in_ms,
                    "Newer payload merged during attempt, retry scheduled for it"
                );
                TaskDisposition::Superseded
            } else {
                warn!(
                    task_id = %task.id,
                    event_kind = %task.payload.event_kind,
                    attempt = attempt_count,
                    retry_in_ms,
                    error = reason.as_deref().unwrap_or("-"),
                    "Reconciliation attempt failed, retry scheduled"
                );
                TaskDisposition::RetryScheduled { attempt_count }
            }
        }
        Resolution::DeadLettered(record) => {
            error!(
                task_id = %record.task_id,
                event_kind = %record.event_kind,
                subscription_id = record.subscription_id.as_deref().unwrap_or("-"),
                customer_id = record.customer_id.as_deref().unwrap_or("-"),
                attempts = record.attempts,
                cause = %record.cause,
                error = %record.final_error,
                "Reconciliation task dead-lettered"
            );
            TaskDisposition::DeadLettered(record.cause)
        }
        Resolution::Missing => TaskDisposition::Discarded,
    }
}

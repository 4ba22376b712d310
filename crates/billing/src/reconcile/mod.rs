//! Webhook reconciliation and retry
//!
//! Billing state changes are written to the identity store as soon as the
//! webhook arrives. When that write fails transiently the request is queued
//! and retried on a fixed backoff schedule (1s, 3s, 9s) until it succeeds or
//! four attempts have failed, at which point it is dead-lettered.
//!
//! A request whose target already has a queued task is never written
//! directly: it is folded into that task so writes to one identity-store
//! user stay in arrival order.
//!
//! The queue is in-memory only. Pending work is lost on restart and the
//! status output says so (`durability`, `lossOnRestart`).

pub mod backoff;
pub mod executor;
pub mod processor;
pub mod queue;
pub mod status;
pub mod task;

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};

pub use backoff::{BackoffPolicy, MAX_ATTEMPTS};
pub use executor::{AttemptOutcome, IdentityStoreExecutor, TaskExecutor};
pub use processor::{DispatchBatch, ProcessorHandle, QueueProcessor, TaskDisposition};
pub use queue::{EnqueueResult, QueueStore, Resolution};
pub use status::{ClearResult, DeadLetterCause, DeadLetterRecord, QueueStatus};
pub use task::{EventKind, ReconciliationRequest, ReconciliationTask, TaskId, TaskTarget};

/// Result of the synchronous first attempt made by [`ReconciliationService::reconcile_now`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Written to the identity store on the first try
    Applied,
    /// Failed transiently and handed to the retry queue
    Queued(EnqueueResult),
    /// Failed permanently; recorded without retry
    DeadLettered(DeadLetterRecord),
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Queued(_) => "queued",
            ReconcileOutcome::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// Process-wide reconciliation component.
///
/// Constructed once at startup and shared (behind an `Arc`) by the webhook
/// handler and the admin endpoints. Owns the queue; the processor loop is
/// started separately with [`ReconciliationService::spawn_processor`].
pub struct ReconciliationService {
    store: Arc<QueueStore>,
    executor: Arc<dyn TaskExecutor>,
    config: ReconcileConfig,
}

impl ReconciliationService {
    pub fn new(executor: Arc<dyn TaskExecutor>, config: ReconcileConfig) -> Self {
        let store = Arc::new(QueueStore::new(
            BackoffPolicy::new(),
            config.dead_letter_history,
        ));
        Self {
            store,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Make the first attempt inline and route the outcome.
    ///
    /// If a task for the same target is already queued, no direct write is
    /// made: the request is merged into that task and reported as queued, so
    /// an older retry can never land after it. Otherwise transient failures
    /// are queued for retry and permanent failures are dead-lettered straight
    /// away with one attempt recorded.
    pub async fn reconcile_now(
        &self,
        request: ReconciliationRequest,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(deferred) = self
            .store
            .merge_if_queued(&request, "deferred behind a queued retry for the same target")
        {
            info!(
                task_id = %deferred.task_id,
                event_kind = %request.event_kind,
                subscription_id = request.subscription_ref().unwrap_or("-"),
                customer_id = request.customer_ref().unwrap_or("-"),
                attempt_count = deferred.attempt_count,
                "Retry already queued for target, merged instead of writing directly"
            );
            return Ok(ReconcileOutcome::Queued(deferred));
        }

        let outcome = processor::guarded_attempt(self.executor.as_ref(), &request).await;

        match outcome {
            AttemptOutcome::Success => {
                info!(
                    event_kind = %request.event_kind,
                    subscription_id = request.subscription_ref().unwrap_or("-"),
                    customer_id = request.customer_ref().unwrap_or("-"),
                    "Identity store reconciled"
                );
                Ok(ReconcileOutcome::Applied)
            }
            AttemptOutcome::TransientFailure(reason) => {
                let queued = self.enqueue_failed(request, reason)?;
                Ok(ReconcileOutcome::Queued(queued))
            }
            AttemptOutcome::PermanentFailure(reason) => {
                let record = self.store.record_dead_letter(
                    request,
                    1,
                    DeadLetterCause::PermanentFailure,
                    reason,
                );
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
                Ok(ReconcileOutcome::DeadLettered(record))
            }
        }
    }

    /// Queue a request whose first attempt already failed.
    pub fn enqueue_failed(
        &self,
        request: ReconciliationRequest,
        error: impl Into<String>,
    ) -> BillingResult<EnqueueResult> {
        let error = error.into();
        let event_kind = request.event_kind;
        let target = request.target();

        match self.store.enqueue_or_update(request, error.as_str(), Instant::now()) {
            Ok(result) => {
                let target = target.map(|t| t.to_string()).unwrap_or_default();
                if result.merged {
                    info!(
                        task_id = %result.task_id,
                        target = %target,
                        attempt_count = result.attempt_count,
                        error = %error,
                        "Reconciliation failure merged into pending task"
                    );
                } else {
                    warn!(
                        task_id = %result.task_id,
                        target = %target,
                        error = %error,
                        "Reconciliation failed, queued for retry"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                error!(
                    event_kind = %event_kind,
                    error = %e,
                    "Cannot queue reconciliation request"
                );
                Err(e)
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.store.snapshot(Instant::now())
    }

    /// Destructive wipe of every pending task. Callers gate access.
    pub fn clear(&self) -> ClearResult {
        let cleared = self.store.clear();
        warn!(items_cleared = cleared, "Reconciliation queue cleared");
        ClearResult::cleared(cleared)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.store.dead_letters()
    }

    /// Put a retained dead-letter record back into the queue.
    ///
    /// The payload is queued like a fresh first failure; if a task for the
    /// same target is already queued it absorbs the payload instead.
    pub fn replay_dead_letter(&self, task_id: TaskId) -> BillingResult<EnqueueResult> {
        let record = self
            .store
            .take_dead_letter(task_id)
            .ok_or(BillingError::DeadLetterNotFound(task_id.as_uuid()))?;

        info!(
            task_id = %task_id,
            event_kind = %record.event_kind,
            "Replaying dead-lettered reconciliation"
        );
        self.enqueue_failed(
            record.request(),
            format!("replayed after {}: {}", record.cause, record.final_error),
        )
    }

    pub fn processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            self.config.poll_interval,
        )
    }

    pub fn spawn_processor(&self) -> ProcessorHandle {
        self.processor().spawn()
    }
}

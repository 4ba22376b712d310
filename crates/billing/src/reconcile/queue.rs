//! In-memory store of pending reconciliation tasks
//!
//! All structural mutations (enqueue, merge, claim, reschedule, remove) go
//! through one mutex, so concurrent enqueues for the same target collapse
//! into a single entry. Critical sections never await.
//!
//! Every attempt outcome is reported back against the payload revision it
//! ran with. A merge during an attempt bumps the revision, so a success or a
//! permanent failure of the older payload never removes the newer one.
//!
//! Nothing here is persisted: a process restart drops every pending task.
//! The queue is also unbounded; a long identity-store outage grows it without
//! limit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

use super::backoff::BackoffPolicy;
use super::status::{DeadLetterCause, DeadLetterRecord, QueueStatus, DURABILITY};
use super::task::{ReconciliationRequest, ReconciliationTask, TaskId, TaskTarget};
use crate::config::DEFAULT_DEAD_LETTER_HISTORY;
use crate::error::{BillingError, BillingResult};

/// Outcome of [`QueueStore::enqueue_or_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    pub task_id: TaskId,
    /// `true` when an existing task for the same target absorbed the request
    pub merged: bool,
    pub attempt_count: u32,
    pub next_attempt_at: Instant,
}

/// A task handed to the processor for one attempt.
///
/// `revision` identifies the payload version being attempted; a merge while
/// the attempt is running bumps the stored revision.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: ReconciliationTask,
    pub revision: u64,
}

/// Where a task ended up once an attempt was reported back
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Task removed from the queue
    Resolved,
    /// Back to pending with the attempt counted. `superseded` is set when a
    /// newer payload was merged during the attempt and has not been tried.
    Rescheduled {
        attempt_count: u32,
        next_attempt_at: Instant,
        superseded: bool,
    },
    /// Removed, counted and recorded
    DeadLettered(DeadLetterRecord),
    /// The task was no longer queued (cleared by an operator)
    Missing,
}

#[derive(Debug)]
struct Entry {
    task: ReconciliationTask,
    in_flight: bool,
    revision: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dead_lettered: u64,
    resolved: u64,
    merged: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<TaskId, Entry>,
    targets: HashMap<TaskTarget, TaskId>,
    dead_letters: VecDeque<DeadLetterRecord>,
    counters: Counters,
}

impl QueueState {
    fn remove(&mut self, id: TaskId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(target) = entry.task.payload.target() {
            if self.targets.get(&target) == Some(&id) {
                self.targets.remove(&target);
            }
        }
        Some(entry)
    }

    /// Fold `request` into the task already queued for `target`, if any.
    fn merge(
        &mut self,
        target: &TaskTarget,
        request: ReconciliationRequest,
        error: String,
    ) -> Option<EnqueueResult> {
        let id = self.targets.get(target).copied()?;
        let entry = self.entries.get_mut(&id)?;
        entry.task.payload.absorb(request);
        entry.task.last_error = error;
        entry.revision += 1;
        let result = EnqueueResult {
            task_id: id,
            merged: true,
            attempt_count: entry.task.attempt_count,
            next_attempt_at: entry.task.next_attempt_at,
        };
        self.counters.merged += 1;
        Some(result)
    }
}

/// Process-wide queue of reconciliation tasks awaiting retry
#[derive(Debug)]
pub struct QueueStore {
    state: Mutex<QueueState>,
    policy: BackoffPolicy,
    dead_letter_history: usize,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new(BackoffPolicy::new(), DEFAULT_DEAD_LETTER_HISTORY)
    }
}

impl QueueStore {
    pub fn new(policy: BackoffPolicy, dead_letter_history: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
            dead_letter_history,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    // A panic while holding the lock cannot leave the maps half-updated in a
    // way later calls would misread, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failed first attempt.
    ///
    /// A new task starts at attempt count 1 with its first retry one backoff
    /// step after `now`. If a task for the same target is already queued (or
    /// in flight), it keeps its id, attempt count and schedule; the newer
    /// request is folded into its payload and the last error replaced.
    pub fn enqueue_or_update(
        &self,
        request: ReconciliationRequest,
        error: impl Into<String>,
        now: Instant,
    ) -> BillingResult<EnqueueResult> {
        let target = request.target().ok_or(BillingError::MissingTarget)?;
        let error = error.into();
        let mut state = self.lock();

        if state.targets.contains_key(&target) {
            if let Some(result) = state.merge(&target, request.clone(), error.clone()) {
                return Ok(result);
            }
        }

        let first_retry = self.policy.delay_for(2).unwrap_or_default();
        let task = ReconciliationTask {
            id: TaskId::new(),
            payload: request,
            attempt_count: 1,
            enqueued_at: now,
            first_failed_at: OffsetDateTime::now_utc(),
            last_failed_at: now,
            next_attempt_at: now + first_retry,
            last_error: error,
        };
        let result = EnqueueResult {
            task_id: task.id,
            merged: false,
            attempt_count: task.attempt_count,
            next_attempt_at: task.next_attempt_at,
        };

        state.targets.insert(target, task.id);
        state.entries.insert(
            task.id,
            Entry {
                task,
                in_flight: false,
                revision: 0,
            },
        );
        Ok(result)
    }

    /// Hand a request to the task already queued for its target, instead of
    /// writing it directly.
    ///
    /// Returns `None` when nothing is queued for the target, in which case
    /// the caller may write directly. Check and merge happen under one lock.
    pub fn merge_if_queued(
        &self,
        request: &ReconciliationRequest,
        reason: impl Into<String>,
    ) -> Option<EnqueueResult> {
        let target = request.target()?;
        let mut state = self.lock();
        if !state.targets.contains_key(&target) {
            return None;
        }
        state.merge(&target, request.clone(), reason.into())
    }

    /// Tasks whose retry time has arrived, oldest first failure first.
    ///
    /// Tasks with an attempt in flight are skipped. The sequence is a
    /// snapshot taken under the lock; iterating it does not hold the lock.
    pub fn due_tasks(&self, now: Instant) -> DueTasks {
        let state = self.lock();
        let mut due: Vec<ReconciliationTask> = state
            .entries
            .values()
            .filter(|entry| !entry.in_flight && entry.task.is_due(now))
            .map(|entry| entry.task.clone())
            .collect();
        drop(state);

        due.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        DueTasks {
            inner: due.into_iter(),
        }
    }

    /// Mark a pending task as in flight. Returns `None` if it is unknown or
    /// already being attempted.
    pub fn claim(&self, id: TaskId) -> Option<Claim> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(&id)?;
        if entry.in_flight {
            return None;
        }
        entry.in_flight = true;
        Some(Claim {
            task: entry.task.clone(),
            revision: entry.revision,
        })
    }

    /// Claim every due task in one critical section, oldest first.
    pub fn claim_due(&self, now: Instant) -> Vec<Claim> {
        let mut state = self.lock();
        let mut claims: Vec<Claim> = state
            .entries
            .values_mut()
            .filter(|entry| !entry.in_flight && entry.task.is_due(now))
            .map(|entry| {
                entry.in_flight = true;
                Claim {
                    task: entry.task.clone(),
                    revision: entry.revision,
                }
            })
            .collect();
        drop(state);

        claims.sort_by(|a, b| {
            a.task
                .enqueued_at
                .cmp(&b.task.enqueued_at)
                .then(a.task.id.cmp(&b.task.id))
        });
        claims
    }

    /// Delete a task unconditionally.
    pub fn remove(&self, id: TaskId) -> Option<ReconciliationTask> {
        self.lock().remove(id).map(|entry| entry.task)
    }

    /// Report a successful attempt made against payload `revision`.
    ///
    /// If a newer payload was merged while the attempt ran, the task is not
    /// removed: the attempt is counted and the newer payload waits for the
    /// next backoff step like any retry.
    pub fn resolve(&self, id: TaskId, revision: u64, attempts_made: u32, now: Instant) -> Resolution {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(&id) else {
            return Resolution::Missing;
        };

        if entry.revision != revision {
            return self.retry_or_exhaust(
                &mut state,
                id,
                attempts_made,
                "applied an older payload; a newer one was merged during the attempt".to_string(),
                now,
                true,
            );
        }

        state.remove(id);
        state.counters.resolved += 1;
        Resolution::Resolved
    }

    /// Report a transient failure.
    ///
    /// The attempt is counted and the task returns to pending one backoff
    /// step out, or is dead-lettered once the attempt ceiling is reached.
    /// The stored payload, newest merge included, is what the retry applies.
    pub fn reschedule(
        &self,
        id: TaskId,
        revision: u64,
        attempts_made: u32,
        error: impl Into<String>,
        now: Instant,
    ) -> Resolution {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(&id) else {
            return Resolution::Missing;
        };
        let superseded = entry.revision != revision;
        self.retry_or_exhaust(&mut state, id, attempts_made, error.into(), now, superseded)
    }

    /// Report a terminal failure of the payload at `revision`.
    ///
    /// A failure of an older payload says nothing about a newer one merged
    /// during the attempt: that task is rescheduled instead, within the
    /// attempt ceiling.
    pub fn dead_letter(
        &self,
        id: TaskId,
        revision: u64,
        attempts_made: u32,
        cause: DeadLetterCause,
        error: impl Into<String>,
        now: Instant,
    ) -> Resolution {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(&id) else {
            return Resolution::Missing;
        };
        let error = error.into();

        if entry.revision != revision {
            return self.retry_or_exhaust(
                &mut state,
                id,
                attempts_made,
                format!("older payload failed ({}); a newer one was merged during the attempt", error),
                now,
                true,
            );
        }

        self.remove_dead_letter(&mut state, id, attempts_made, cause, error)
    }

    fn retry_or_exhaust(
        &self,
        state: &mut QueueState,
        id: TaskId,
        attempts_made: u32,
        error: String,
        now: Instant,
        superseded: bool,
    ) -> Resolution {
        let Some(entry) = state.entries.get_mut(&id) else {
            return Resolution::Missing;
        };
        let attempt_count = entry.task.attempt_count.max(attempts_made);

        let next_delay = if self.policy.allows_retry(attempt_count) {
            self.policy.delay_for(attempt_count + 1)
        } else {
            None
        };

        let Some(delay) = next_delay else {
            let error = if superseded {
                format!("{}; the newer payload was not attempted before the attempt ceiling", error)
            } else {
                error
            };
            return self.remove_dead_letter(
                state,
                id,
                attempt_count,
                DeadLetterCause::RetriesExhausted,
                error,
            );
        };

        entry.in_flight = false;
        entry.task.attempt_count = attempt_count;
        entry.task.last_failed_at = now;
        entry.task.next_attempt_at = now + delay;
        entry.task.last_error = error;
        Resolution::Rescheduled {
            attempt_count,
            next_attempt_at: entry.task.next_attempt_at,
            superseded,
        }
    }

    fn remove_dead_letter(
        &self,
        state: &mut QueueState,
        id: TaskId,
        attempts_made: u32,
        cause: DeadLetterCause,
        error: String,
    ) -> Resolution {
        let Some(entry) = state.remove(id) else {
            return Resolution::Missing;
        };
        let task = entry.task;
        let record = DeadLetterRecord {
            task_id: task.id,
            event_kind: task.payload.event_kind,
            subscription_id: task.payload.subscription_id,
            customer_id: task.payload.customer_id,
            target_state: task.payload.target_state,
            attempts: task.attempt_count.max(attempts_made),
            cause,
            final_error: error,
            first_failed_at: task.first_failed_at,
            dead_lettered_at: OffsetDateTime::now_utc(),
        };
        self.push_dead_letter(state, record.clone());
        Resolution::DeadLettered(record)
    }

    /// Count and record a request that failed permanently before it was ever
    /// queued.
    pub fn record_dead_letter(
        &self,
        request: ReconciliationRequest,
        attempts_made: u32,
        cause: DeadLetterCause,
        error: impl Into<String>,
    ) -> DeadLetterRecord {
        let now = OffsetDateTime::now_utc();
        let record = DeadLetterRecord {
            task_id: TaskId::new(),
            event_kind: request.event_kind,
            subscription_id: request.subscription_id,
            customer_id: request.customer_id,
            target_state: request.target_state,
            attempts: attempts_made,
            cause,
            final_error: error.into(),
            first_failed_at: now,
            dead_lettered_at: now,
        };
        let mut state = self.lock();
        self.push_dead_letter(&mut state, record.clone());
        record
    }

    fn push_dead_letter(&self, state: &mut QueueState, record: DeadLetterRecord) {
        state.counters.dead_lettered += 1;
        if self.dead_letter_history == 0 {
            return;
        }
        state.dead_letters.push_front(record);
        state.dead_letters.truncate(self.dead_letter_history);
    }

    /// Retained dead-letter records, newest first
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock().dead_letters.iter().cloned().collect()
    }

    /// Remove a retained dead-letter record so it can be replayed
    pub fn take_dead_letter(&self, task_id: TaskId) -> Option<DeadLetterRecord> {
        let mut state = self.lock();
        let position = state
            .dead_letters
            .iter()
            .position(|record| record.task_id == task_id)?;
        state.dead_letters.remove(position)
    }

    pub fn get(&self, id: TaskId) -> Option<ReconciliationTask> {
        self.lock().entries.get(&id).map(|entry| entry.task.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics for the status endpoint
    pub fn snapshot(&self, now: Instant) -> QueueStatus {
        let state = self.lock();

        let mut items_by_attempt_count = BTreeMap::new();
        let mut oldest: Option<Instant> = None;
        let mut next_retry: Option<Instant> = None;
        let mut in_flight_items = 0;

        for entry in state.entries.values() {
            *items_by_attempt_count
                .entry(entry.task.attempt_count)
                .or_insert(0) += 1;
            oldest = Some(oldest.map_or(entry.task.enqueued_at, |o| o.min(entry.task.enqueued_at)));
            if entry.in_flight {
                in_flight_items += 1;
            } else {
                next_retry = Some(next_retry.map_or(entry.task.next_attempt_at, |n| {
                    n.min(entry.task.next_attempt_at)
                }));
            }
        }

        QueueStatus {
            total_items: state.entries.len(),
            oldest_item_age_ms: oldest.map(|at| millis(now.saturating_duration_since(at))),
            items_by_attempt_count,
            next_retry_in_ms: next_retry.map(|at| millis(at.saturating_duration_since(now))),
            in_flight_items,
            dead_lettered_total: state.counters.dead_lettered,
            resolved_total: state.counters.resolved,
            merged_total: state.counters.merged,
            durability: DURABILITY,
            loss_on_restart: true,
        }
    }

    /// Drop every pending task and return how many were removed.
    ///
    /// Counters and dead-letter records are kept.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.entries.len();
        state.entries.clear();
        state.targets.clear();
        cleared
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Finite sequence of due tasks returned by [`QueueStore::due_tasks`]
#[derive(Debug)]
pub struct DueTasks {
    inner: std::vec::IntoIter<ReconciliationTask>,
}

impl Iterator for DueTasks {
    type Item = ReconciliationTask;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for DueTasks {}

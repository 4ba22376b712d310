// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Reconciliation
//!
//! Tests retry boundaries, concurrency and operator paths across the queue,
//! processor and service:
//! - Retry schedule and attempt ceiling (RECON-R01 to RECON-R05)
//! - Idempotent enqueue and write ordering per target (RECON-M01 to RECON-M07)
//! - Concurrency and isolation (RECON-C01 to RECON-C04)
//! - Status and clear (RECON-S01 to RECON-S03)

#[cfg(test)]
mod support {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::config::ReconcileConfig;
    use crate::reconcile::{
        AttemptOutcome, EventKind, ReconciliationRequest, ReconciliationService, TaskDisposition,
        TaskExecutor,
    };

    /// Executor with per-target scripted outcomes; unscripted attempts succeed
    #[derive(Default)]
    pub struct ScriptedExecutor {
        scripts: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
        delays: Mutex<HashMap<String, Duration>>,
        attempts: Mutex<HashMap<String, u32>>,
        in_flight: Mutex<HashMap<String, u32>>,
        max_in_flight_per_target: AtomicU32,
        applied: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn script(&self, target: &str, outcomes: Vec<AttemptOutcome>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(target.to_string(), outcomes.into());
        }

        pub fn delay(&self, target: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(target.to_string(), delay);
        }

        pub fn attempts(&self, target: &str) -> u32 {
            self.attempts
                .lock()
                .unwrap()
                .get(target)
                .copied()
                .unwrap_or(0)
        }

        pub fn max_in_flight_per_target(&self) -> u32 {
            self.max_in_flight_per_target.load(Ordering::SeqCst)
        }

        pub fn applied(&self) -> Vec<(String, Value)> {
            self.applied.lock().unwrap().clone()
        }
    }

    fn target_of(payload: &ReconciliationRequest) -> String {
        payload
            .subscription_ref()
            .or(payload.customer_ref())
            .unwrap_or_default()
            .to_string()
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn attempt(&self, payload: &ReconciliationRequest) -> AttemptOutcome {
            let target = target_of(payload);
            {
                *self.attempts.lock().unwrap().entry(target.clone()).or_insert(0) += 1;
                let mut in_flight = self.in_flight.lock().unwrap();
                let current = in_flight.entry(target.clone()).or_insert(0);
                *current += 1;
                self.max_in_flight_per_target
                    .fetch_max(*current, Ordering::SeqCst);
            }

            let delay = self.delays.lock().unwrap().get(&target).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&target)
                .and_then(VecDeque::pop_front)
                .unwrap_or(AttemptOutcome::Success);

            if let Some(current) = self.in_flight.lock().unwrap().get_mut(&target) {
                *current -= 1;
            }
            if outcome.is_success() {
                self.applied
                    .lock()
                    .unwrap()
                    .push((target, payload.target_state.clone()));
            }
            outcome
        }
    }

    pub fn transient(reason: &str) -> AttemptOutcome {
        AttemptOutcome::TransientFailure(reason.to_string())
    }

    pub fn request(subscription_id: &str) -> ReconciliationRequest {
        ReconciliationRequest::new(
            EventKind::SubscriptionUpdated,
            json!({ "subscriptionStatus": "active", "hasActiveSubscription": true }),
        )
        .subscription(subscription_id)
        .customer(format!("cus_{}", subscription_id))
    }

    /// Request carrying an explicit subscription status
    pub fn status_request(subscription_id: &str, kind: EventKind, status: &str) -> ReconciliationRequest {
        ReconciliationRequest::new(kind, json!({ "subscriptionStatus": status }))
            .subscription(subscription_id)
    }

    pub fn service(executor: Arc<ScriptedExecutor>) -> Arc<ReconciliationService> {
        Arc::new(ReconciliationService::new(executor, ReconcileConfig::default()))
    }

    /// Advance the paused clock and run one polling cycle to completion
    pub async fn tick_after(service: &ReconciliationService, delay: Duration) -> Vec<TaskDisposition> {
        tokio::time::advance(delay).await;
        service
            .processor()
            .dispatch_due(tokio::time::Instant::now())
            .settle()
            .await
    }
}

#[cfg(test)]
mod retry_schedule_tests {
    use std::time::Duration;

    use super::support::*;
    use crate::reconcile::{AttemptOutcome, DeadLetterCause, ReconcileOutcome, TaskDisposition};

    // =========================================================================
    // RECON-R01: Task enqueued at t=0; nothing happens before t+1000ms, the
    // retry fires at exactly t+1000ms
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_first_retry_fires_at_one_second() {
        let executor = ScriptedExecutor::new();
        executor.script("sub_1", vec![transient("timeout")]);
        let service = service(executor.clone());

        let outcome = service.reconcile_now(request("sub_1")).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Queued(_)));

        let early = tick_after(&service, Duration::from_millis(999)).await;
        assert!(early.is_empty(), "Task must stay pending before t+1000ms");
        assert_eq!(executor.attempts("sub_1"), 1);

        let on_time = tick_after(&service, Duration::from_millis(1)).await;
        assert_eq!(on_time, vec![TaskDisposition::Resolved]);
        assert_eq!(executor.attempts("sub_1"), 2);
        assert_eq!(service.status().total_items, 0);
    }

    // =========================================================================
    // RECON-R02: Transient failures below the ceiling keep the task queued,
    // waiting 1s, 3s and 9s measured from each prior failure
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_below_ceiling_follow_schedule() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "sub_1",
            vec![transient("timeout"), transient("429"), transient("503")],
        );
        let service = service(executor.clone());
        service.reconcile_now(request("sub_1")).await.unwrap();

        // Attempt 2 at +1s fails
        let result = tick_after(&service, Duration::from_secs(1)).await;
        assert_eq!(result, vec![TaskDisposition::RetryScheduled { attempt_count: 2 }]);
        assert_eq!(service.status().items_by_attempt_count.get(&2), Some(&1));
        assert_eq!(service.status().next_retry_in_ms, Some(3000));

        // Attempt 3 is not due until 3s after that failure
        assert!(tick_after(&service, Duration::from_millis(2999)).await.is_empty());
        let result = tick_after(&service, Duration::from_millis(1)).await;
        assert_eq!(result, vec![TaskDisposition::RetryScheduled { attempt_count: 3 }]);
        assert_eq!(service.status().next_retry_in_ms, Some(9000));

        // Attempt 4 waits 9s and succeeds
        assert!(tick_after(&service, Duration::from_millis(8999)).await.is_empty());
        let result = tick_after(&service, Duration::from_millis(1)).await;
        assert_eq!(result, vec![TaskDisposition::Resolved]);

        assert_eq!(executor.attempts("sub_1"), 4);
        let status = service.status();
        assert_eq!(status.total_items, 0);
        assert_eq!(status.dead_lettered_total, 0);
        assert_eq!(status.resolved_total, 1);
    }

    // =========================================================================
    // RECON-R03: Four consecutive transient failures dead-letter the task; a
    // fifth attempt never happens
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_fourth_failure_dead_letters_without_fifth_attempt() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "sub_1",
            vec![
                transient("timeout"),
                transient("timeout"),
                transient("timeout"),
                transient("timeout"),
            ],
        );
        let service = service(executor.clone());
        service.reconcile_now(request("sub_1")).await.unwrap();

        tick_after(&service, Duration::from_secs(1)).await;
        tick_after(&service, Duration::from_secs(3)).await;
        let last = tick_after(&service, Duration::from_secs(9)).await;
        assert_eq!(
            last,
            vec![TaskDisposition::DeadLettered(DeadLetterCause::RetriesExhausted)]
        );

        for _ in 0..5 {
            assert!(tick_after(&service, Duration::from_secs(30)).await.is_empty());
        }
        assert_eq!(executor.attempts("sub_1"), 4);

        let status = service.status();
        assert_eq!(status.total_items, 0);
        assert_eq!(status.dead_lettered_total, 1);

        let records = service.dead_letters();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 4);
        assert_eq!(records[0].event_kind, crate::reconcile::EventKind::SubscriptionUpdated);
        assert_eq!(records[0].subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(records[0].customer_id.as_deref(), Some("cus_sub_1"));
        assert_eq!(records[0].final_error, "timeout");
    }

    // =========================================================================
    // RECON-R04: Permanent failure on the first attempt dead-letters at once
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_permanent_first_attempt_dead_letters_immediately() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "sub_1",
            vec![AttemptOutcome::PermanentFailure("not found".into())],
        );
        let service = service(executor.clone());

        let outcome = service.reconcile_now(request("sub_1")).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::DeadLettered(_)));

        assert!(tick_after(&service, Duration::from_secs(60)).await.is_empty());
        assert_eq!(executor.attempts("sub_1"), 1);
        assert_eq!(service.status().total_items, 0);
        assert_eq!(service.status().dead_lettered_total, 1);
    }

    // =========================================================================
    // RECON-R05: Permanent failure on a retry ignores the remaining budget
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_on_retry_skips_remaining_budget() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "sub_1",
            vec![
                transient("timeout"),
                AttemptOutcome::PermanentFailure("malformed payload".into()),
            ],
        );
        let service = service(executor.clone());
        service.reconcile_now(request("sub_1")).await.unwrap();

        let result = tick_after(&service, Duration::from_secs(1)).await;
        assert_eq!(
            result,
            vec![TaskDisposition::DeadLettered(DeadLetterCause::PermanentFailure)]
        );
        assert_eq!(service.dead_letters()[0].attempts, 2);
        assert!(tick_after(&service, Duration::from_secs(60)).await.is_empty());
    }
}

#[cfg(test)]
mod merge_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Barrier;

    use super::support::*;
    use crate::reconcile::{
        AttemptOutcome, DeadLetterCause, EventKind, ReconcileOutcome, ReconciliationRequest,
        TaskDisposition,
    };

    // =========================================================================
    // RECON-M01: Two requests for the same subscription and event kind make
    // one queue entry; the second is not written directly
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_duplicate_failures_collapse() {
        let executor = ScriptedExecutor::new();
        executor.script("sub_1", vec![transient("timeout")]);
        let service = service(executor.clone());

        service.reconcile_now(request("sub_1")).await.unwrap();
        let second = service.reconcile_now(request("sub_1")).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Queued(result) if result.merged));

        let status = service.status();
        assert_eq!(status.total_items, 1);
        assert_eq!(status.merged_total, 1);
        assert_eq!(executor.attempts("sub_1"), 1);
    }

    // =========================================================================
    // RECON-M02: Concurrent enqueues of one target never create two
    // entries; totalItems never exceeds distinct targets
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_concurrent_enqueue_of_same_key_collapses() {
        let service = service(ScriptedExecutor::new());
        let barrier = Arc::new(Barrier::new(40));

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    // Four distinct subscriptions, ten failures each
                    let sub = format!("sub_{}", i % 4);
                    service.enqueue_failed(request(&sub), "timeout").unwrap()
                })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().task_id);
        }

        assert_eq!(ids.len(), 4);
        let status = service.status();
        assert_eq!(status.total_items, 4);
        assert_eq!(status.merged_total, 36);
        assert_eq!(status.items_by_attempt_count.get(&1), Some(&4));
    }

    // =========================================================================
    // RECON-M03: A newer payload merged while an attempt is in flight is
    // applied at the next backoff step after the older one succeeds
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_merge_during_flight_reapplies_newest_state() {
        let executor = ScriptedExecutor::new();
        executor.delay("sub_1", Duration::from_secs(2));
        let service = service(executor.clone());
        service.enqueue_failed(request("sub_1"), "timeout").unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = service.processor().dispatch_due(tokio::time::Instant::now());
        assert_eq!(batch.len(), 1);

        // Let the attempt start, then merge a newer state
        tokio::task::yield_now().await;
        let newer = ReconciliationRequest::new(
            EventKind::SubscriptionUpdated,
            json!({ "subscriptionStatus": "canceled", "hasActiveSubscription": false }),
        )
        .subscription("sub_1");
        assert!(service.enqueue_failed(newer, "timeout").unwrap().merged);

        assert_eq!(batch.settle().await, vec![TaskDisposition::Superseded]);
        let status = service.status();
        assert_eq!(status.total_items, 1);
        assert_eq!(status.items_by_attempt_count.get(&2), Some(&1));
        assert_eq!(status.next_retry_in_ms, Some(3000));

        let again = tick_after(&service, Duration::from_secs(3)).await;
        assert_eq!(again, vec![TaskDisposition::Resolved]);

        let applied = executor.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].1["subscriptionStatus"], "canceled");
        assert_eq!(service.status().total_items, 0);
    }

    // =========================================================================
    // RECON-M04: A request for a subscription with a queued retry is merged,
    // not written directly, so the older retry cannot overwrite it
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_queued_retry_never_overwrites_newer_request() {
        let executor = ScriptedExecutor::new();
        executor.script("sub_1", vec![transient("timeout")]);
        let service = service(executor.clone());

        let first = service
            .reconcile_now(status_request("sub_1", EventKind::SubscriptionUpdated, "past_due"))
            .await
            .unwrap();
        assert!(matches!(first, ReconcileOutcome::Queued(_)));

        let second = service
            .reconcile_now(status_request("sub_1", EventKind::SubscriptionUpdated, "active"))
            .await
            .unwrap();
        assert!(matches!(second, ReconcileOutcome::Queued(result) if result.merged));
        assert_eq!(executor.attempts("sub_1"), 1);
        assert!(executor.applied().is_empty());

        let result = tick_after(&service, Duration::from_secs(1)).await;
        assert_eq!(result, vec![TaskDisposition::Resolved]);

        let applied = executor.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1["subscriptionStatus"], "active");
        assert!(tick_after(&service, Duration::from_secs(30)).await.is_empty());
    }

    // =========================================================================
    // RECON-M05: Event kinds do not split a target: a deletion arriving while
    // an update is queued wins, and fields only the update carried survive
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_other_event_kind_merges_into_queued_target() {
        let executor = ScriptedExecutor::new();
        executor.script("sub_1", vec![transient("503")]);
        let service = service(executor.clone());

        let updated = ReconciliationRequest::new(
            EventKind::SubscriptionUpdated,
            json!({ "subscriptionStatus": "active", "priceId": "price_pro" }),
        )
        .subscription("sub_1");
        service.reconcile_now(updated).await.unwrap();

        let deleted = service
            .reconcile_now(status_request("sub_1", EventKind::SubscriptionDeleted, "canceled"))
            .await
            .unwrap();
        assert!(matches!(deleted, ReconcileOutcome::Queued(result) if result.merged));
        assert_eq!(service.status().total_items, 1);

        assert_eq!(
            tick_after(&service, Duration::from_secs(1)).await,
            vec![TaskDisposition::Resolved]
        );
        let applied = executor.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            applied[0].1,
            json!({ "subscriptionStatus": "canceled", "priceId": "price_pro" })
        );
    }

    // =========================================================================
    // RECON-M06: A permanent failure of the payload being attempted does not
    // dead-letter a newer payload merged during that attempt
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_after_merge_keeps_newer_payload() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "sub_1",
            vec![AttemptOutcome::PermanentFailure("malformed payload".into())],
        );
        executor.delay("sub_1", Duration::from_secs(2));
        let service = service(executor.clone());
        service.enqueue_failed(request("sub_1"), "timeout").unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = service.processor().dispatch_due(tokio::time::Instant::now());
        tokio::task::yield_now().await;
        service
            .enqueue_failed(status_request("sub_1", EventKind::SubscriptionDeleted, "canceled"), "timeout")
            .unwrap();

        assert_eq!(batch.settle().await, vec![TaskDisposition::Superseded]);
        let status = service.status();
        assert_eq!(status.total_items, 1);
        assert_eq!(status.dead_lettered_total, 0);
        assert!(service.dead_letters().is_empty());

        assert_eq!(
            tick_after(&service, Duration::from_secs(3)).await,
            vec![TaskDisposition::Resolved]
        );
        let applied = executor.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1["subscriptionStatus"], "canceled");
    }

    // =========================================================================
    // RECON-M07: Superseded attempts count toward the ceiling; a task whose
    // every retry is overtaken by a merge makes at most four attempts and is
    // dead-lettered with the newest payload
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_superseded_retries_respect_attempt_ceiling() {
        let executor = ScriptedExecutor::new();
        executor.script("sub_1", vec![transient("timeout")]);
        let service = service(executor.clone());
        service
            .reconcile_now(status_request("sub_1", EventKind::SubscriptionUpdated, "v1"))
            .await
            .unwrap();
        executor.delay("sub_1", Duration::from_millis(500));

        let rounds = [
            (1, "v2", TaskDisposition::Superseded),
            (3, "v3", TaskDisposition::Superseded),
            (
                9,
                "v4",
                TaskDisposition::DeadLettered(DeadLetterCause::RetriesExhausted),
            ),
        ];
        for (wait_secs, version, expected) in rounds {
            tokio::time::advance(Duration::from_secs(wait_secs)).await;
            let batch = service.processor().dispatch_due(tokio::time::Instant::now());
            assert_eq!(batch.len(), 1);
            tokio::task::yield_now().await;
            let merged = service
                .reconcile_now(status_request("sub_1", EventKind::SubscriptionUpdated, version))
                .await
                .unwrap();
            assert!(matches!(merged, ReconcileOutcome::Queued(result) if result.merged));
            assert_eq!(batch.settle().await, vec![expected]);
        }

        for _ in 0..3 {
            assert!(tick_after(&service, Duration::from_secs(30)).await.is_empty());
        }
        assert_eq!(executor.attempts("sub_1"), 4);

        let records = service.dead_letters();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 4);
        assert_eq!(records[0].target_state["subscriptionStatus"], "v4");
        assert!(records[0].final_error.contains("not attempted"));
        assert_eq!(service.status().total_items, 0);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::support::*;
    use crate::reconcile::{ReconcileOutcome, TaskDisposition};

    // =========================================================================
    // RECON-C01: 100 distinct tasks, each succeeding on its 2nd attempt, drain
    // to an empty queue with no dead letters
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_hundred_tasks_succeed_on_second_attempt() {
        let executor = ScriptedExecutor::new();
        for i in 0..100 {
            executor.script(&format!("sub_{}", i), vec![transient("timeout")]);
        }
        let service = service(executor.clone());

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .reconcile_now(request(&format!("sub_{}", i)))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), ReconcileOutcome::Queued(_)));
        }
        assert_eq!(service.status().total_items, 100);

        let dispositions = tick_after(&service, Duration::from_secs(1)).await;
        assert_eq!(dispositions.len(), 100);
        assert!(dispositions.iter().all(|d| *d == TaskDisposition::Resolved));

        let status = service.status();
        assert_eq!(status.total_items, 0);
        assert_eq!(status.dead_lettered_total, 0);
        assert_eq!(status.resolved_total, 100);
        for i in 0..100 {
            assert_eq!(executor.attempts(&format!("sub_{}", i)), 2);
        }
    }

    // =========================================================================
    // RECON-C02: A task with an attempt in flight is never claimed again
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_in_flight_task_not_attempted_twice() {
        let executor = ScriptedExecutor::new();
        executor.delay("sub_slow", Duration::from_secs(20));
        let service = service(executor.clone());
        service.enqueue_failed(request("sub_slow"), "timeout").unwrap();

        let handle = service.spawn_processor();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let status = service.status();
        assert_eq!(status.in_flight_items, 1);
        assert_eq!(status.next_retry_in_ms, None);
        assert_eq!(executor.attempts("sub_slow"), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(service.status().total_items, 0);
        assert_eq!(executor.max_in_flight_per_target(), 1);
        handle.shutdown().await;
    }

    // =========================================================================
    // RECON-C03: A slow attempt does not hold up other due tasks
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_slow_task_does_not_block_others() {
        let executor = ScriptedExecutor::new();
        executor.delay("sub_slow", Duration::from_secs(30));
        let service = service(executor.clone());
        service.enqueue_failed(request("sub_slow"), "timeout").unwrap();
        service.enqueue_failed(request("sub_fast"), "timeout").unwrap();

        let handle = service.spawn_processor();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(executor.attempts("sub_fast"), 1);
        assert_eq!(executor.applied().len(), 1);
        let status = service.status();
        assert_eq!(status.total_items, 1);
        assert_eq!(status.in_flight_items, 1);

        assert_eq!(handle.shutdown().await, 1);
    }

    // =========================================================================
    // RECON-C04: A panicking attempt is isolated and retried like a transient
    // failure; other tasks in the same cycle still resolve
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_executor_panic_is_isolated() {
        use crate::reconcile::{AttemptOutcome, ReconciliationRequest, TaskExecutor};
        use async_trait::async_trait;

        struct PanicsOnce(std::sync::atomic::AtomicBool);

        #[async_trait]
        impl TaskExecutor for PanicsOnce {
            async fn attempt(&self, payload: &ReconciliationRequest) -> AttemptOutcome {
                if payload.subscription_ref() == Some("sub_bad")
                    && !self.0.swap(true, std::sync::atomic::Ordering::SeqCst)
                {
                    panic!("unexpected response shape");
                }
                AttemptOutcome::Success
            }
        }

        let service = crate::reconcile::ReconciliationService::new(
            Arc::new(PanicsOnce(Default::default())),
            crate::config::ReconcileConfig::default(),
        );
        service.enqueue_failed(request("sub_bad"), "timeout").unwrap();
        service.enqueue_failed(request("sub_good"), "timeout").unwrap();

        let first = tick_after(&service, Duration::from_secs(1)).await;
        assert_eq!(first.len(), 2);
        assert!(first.contains(&TaskDisposition::Resolved));
        assert!(first.contains(&TaskDisposition::RetryScheduled { attempt_count: 2 }));

        let second = tick_after(&service, Duration::from_secs(3)).await;
        assert_eq!(second, vec![TaskDisposition::Resolved]);
        assert_eq!(service.status().total_items, 0);
    }
}

#[cfg(test)]
mod status_tests {
    use std::time::Duration;

    use super::support::*;
    use crate::reconcile::ClearResult;

    // =========================================================================
    // RECON-S01: Empty queue reports null age and null next retry
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_empty_status_reports_nulls() {
        let service = service(ScriptedExecutor::new());
        let value = serde_json::to_value(service.status()).unwrap();

        assert_eq!(value["totalItems"], 0);
        assert!(value["oldestItemAgeMs"].is_null());
        assert!(value["nextRetryInMs"].is_null());
        assert_eq!(value["itemsByAttemptCount"], serde_json::json!({}));
        assert_eq!(value["lossOnRestart"], true);
    }

    // =========================================================================
    // RECON-S02: clear() on K items reports K and leaves an empty queue
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_clear_reports_cleared_count() {
        let service = service(ScriptedExecutor::new());
        for i in 0..7 {
            service
                .enqueue_failed(request(&format!("sub_{}", i)), "timeout")
                .unwrap();
        }

        assert_eq!(service.clear(), ClearResult::cleared(7));
        let status = service.status();
        assert_eq!(status.total_items, 0);
        assert_eq!(status.oldest_item_age_ms, None);
        assert!(tick_after(&service, Duration::from_secs(60)).await.is_empty());
    }

    // =========================================================================
    // RECON-S03: Oldest age and next retry track the paused clock
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_status_age_and_next_retry() {
        let service = service(ScriptedExecutor::new());
        service.enqueue_failed(request("sub_1"), "timeout").unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        service.enqueue_failed(request("sub_2"), "timeout").unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        let status = service.status();
        assert_eq!(status.total_items, 2);
        assert_eq!(status.oldest_item_age_ms, Some(500));
        assert_eq!(status.next_retry_in_ms, Some(500));
        assert_eq!(status.items_by_attempt_count.get(&1), Some(&2));
    }
}

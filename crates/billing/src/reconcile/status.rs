//! Operator-facing views of the reconciliation queue

use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;

use super::task::{EventKind, ReconciliationRequest, TaskId};

/// The queue lives only in process memory.
pub const DURABILITY: &str = "in-memory";

/// Point-in-time queue statistics for the admin status endpoint.
///
/// `lossOnRestart` is always `true`: pending and in-flight items are not
/// persisted and disappear when the process stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Pending items, including those currently in flight
    pub total_items: usize,
    pub oldest_item_age_ms: Option<u64>,
    /// Attempt count -> number of items (keys serialize as strings)
    pub items_by_attempt_count: BTreeMap<u32, usize>,
    /// Delay until the earliest scheduled retry; `None` when nothing is waiting
    pub next_retry_in_ms: Option<u64>,
    pub in_flight_items: usize,
    pub dead_lettered_total: u64,
    pub resolved_total: u64,
    pub merged_total: u64,
    pub durability: &'static str,
    pub loss_on_restart: bool,
}

/// Response body of the destructive queue wipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResult {
    pub success: bool,
    pub items_cleared: usize,
}

impl ClearResult {
    pub fn cleared(items_cleared: usize) -> Self {
        Self {
            success: true,
            items_cleared,
        }
    }
}

/// Why a task left the queue without being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCause {
    RetriesExhausted,
    PermanentFailure,
}

impl std::fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterCause::RetriesExhausted => write!(f, "retries_exhausted"),
            DeadLetterCause::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// Everything an operator needs to replay a dead-lettered write by hand
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub task_id: TaskId,
    pub event_kind: EventKind,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub target_state: serde_json::Value,
    pub attempts: u32,
    pub cause: DeadLetterCause,
    pub final_error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
}

impl DeadLetterRecord {
    pub fn request(&self) -> ReconciliationRequest {
        ReconciliationRequest {
            event_kind: self.event_kind,
            subscription_id: self.subscription_id.clone(),
            customer_id: self.customer_id.clone(),
            target_state: self.target_state.clone(),
        }
    }
}

//! Reconciliation requests and queued tasks

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

/// Billing events that change subscription state in the identity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "checkout.session.completed")]
    CheckoutCompleted,
    #[serde(rename = "customer.subscription.created")]
    SubscriptionCreated,
    #[serde(rename = "customer.subscription.updated")]
    SubscriptionUpdated,
    #[serde(rename = "customer.subscription.deleted")]
    SubscriptionDeleted,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::CheckoutCompleted,
        EventKind::SubscriptionCreated,
        EventKind::SubscriptionUpdated,
        EventKind::SubscriptionDeleted,
        EventKind::InvoicePaid,
        EventKind::InvoicePaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CheckoutCompleted => "checkout.session.completed",
            EventKind::SubscriptionCreated => "customer.subscription.created",
            EventKind::SubscriptionUpdated => "customer.subscription.updated",
            EventKind::SubscriptionDeleted => "customer.subscription.deleted",
            EventKind::InvoicePaid => "invoice.paid",
            EventKind::InvoicePaymentFailed => "invoice.payment_failed",
        }
    }

    /// Parse a Stripe event type string; `None` for types we do not reconcile
    pub fn from_stripe_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the webhook ingress hands over after its first write attempt failed.
///
/// `target_state` is the metadata the identity-store user must end up with.
/// The queue treats it as opaque; only the executor interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRequest {
    pub event_kind: EventKind,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub target_state: serde_json::Value,
}

impl ReconciliationRequest {
    pub fn new(event_kind: EventKind, target_state: serde_json::Value) -> Self {
        Self {
            event_kind,
            subscription_id: None,
            customer_id: None,
            target_state,
        }
    }

    pub fn subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn subscription_ref(&self) -> Option<&str> {
        non_blank(self.subscription_id.as_deref())
    }

    pub fn customer_ref(&self) -> Option<&str> {
        non_blank(self.customer_id.as_deref())
    }

    /// Identity-store write target; also the key that collapses queued work.
    ///
    /// The subscription id wins when present; the customer id is the fallback.
    /// Requests carrying neither have no target and cannot be queued. The
    /// event kind is not part of the key: writes of any kind to one target
    /// share a single task so a stale retry never lands after a newer write.
    pub fn target(&self) -> Option<TaskTarget> {
        match (self.subscription_ref(), self.customer_ref()) {
            (Some(sub), _) => Some(TaskTarget::Subscription(sub.to_string())),
            (None, Some(cus)) => Some(TaskTarget::Customer(cus.to_string())),
            (None, None) => None,
        }
    }

    /// Fold a newer request for the same target into this one.
    ///
    /// Target-state fields from `newer` win and fields only this request
    /// carries are kept, which is what applying both metadata merges in
    /// order leaves behind. A non-object state on either side is replaced.
    pub fn absorb(&mut self, newer: ReconciliationRequest) {
        let ReconciliationRequest {
            event_kind,
            subscription_id,
            customer_id,
            target_state,
        } = newer;

        match (&mut self.target_state, target_state) {
            (serde_json::Value::Object(current), serde_json::Value::Object(incoming)) => {
                current.extend(incoming);
            }
            (current, incoming) => *current = incoming,
        }
        self.event_kind = event_kind;
        if non_blank(subscription_id.as_deref()).is_some() {
            self.subscription_id = subscription_id;
        }
        if non_blank(customer_id.as_deref()).is_some() {
            self.customer_id = customer_id;
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Identity-store write target named by a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskTarget {
    Subscription(String),
    Customer(String),
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTarget::Subscription(id) => write!(f, "subscription:{}", id),
            TaskTarget::Customer(id) => write!(f, "customer:{}", id),
        }
    }
}

/// Stable task identifier, assigned on first enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A queued reconciliation task.
///
/// Scheduling uses the monotonic `tokio` clock; `first_failed_at` is the wall
/// clock equivalent of `enqueued_at`, kept for operator-facing records.
#[derive(Debug, Clone)]
pub struct ReconciliationTask {
    pub id: TaskId,
    pub payload: ReconciliationRequest,
    pub attempt_count: u32,
    pub enqueued_at: Instant,
    pub first_failed_at: OffsetDateTime,
    pub last_failed_at: Instant,
    pub next_attempt_at: Instant,
    pub last_error: String,
}

impl ReconciliationTask {
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at <= now
    }
}

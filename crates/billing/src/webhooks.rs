//! Stripe webhook verification and event translation
//!
//! Verifies the `Stripe-Signature` header, parses the parts of the event the
//! reconciler needs, and derives the identity-store target state for the
//! subscription lifecycle events.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::identity::{CUSTOMER_ID_KEY, SUBSCRIPTION_ID_KEY};
use crate::reconcile::{EventKind, ReconciliationRequest};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verifies Stripe webhook signatures
#[derive(Clone)]
pub struct StripeWebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for StripeWebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeWebhookVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl StripeWebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: SIGNATURE_TOLERANCE_SECS,
        }
    }

    /// Verify and parse a webhook payload against the current time
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<StripeEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_event_at(payload, signature, now)
    }

    /// Verify and parse a webhook payload as of `now` (unix seconds).
    ///
    /// The header has the form `t=<unix>,v1=<hex>[,v1=<hex>...]`; any `v1`
    /// entry matching HMAC-SHA256 of `"{t}.{payload}"` is accepted.
    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<StripeEvent> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in Stripe-Signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in Stripe-Signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let drift = now.saturating_sub(timestamp).saturating_abs();
        if drift > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                drift_secs = drift,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if !matched {
            tracing::warn!("Stripe webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: StripeEvent = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("Malformed webhook event: {}", e))
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Stripe webhook verified"
        );
        Ok(event)
    }
}

/// The subset of a Stripe event the reconciler reads
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

impl StripeEvent {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_stripe_type(&self.event_type)
    }
}

/// Build the reconciliation request for a verified event.
///
/// Returns `None` for event types that do not affect subscription state.
pub fn derive_request(event: &StripeEvent) -> Option<ReconciliationRequest> {
    let kind = event.kind()?;
    let object = &event.data.object;

    let (subscription_id, customer_id, status) = match kind {
        EventKind::CheckoutCompleted => {
            let status = match object.get("status").and_then(Value::as_str) {
                Some("complete") | None => "active",
                Some(other) => other,
            };
            (
                expandable_id(object.get("subscription")),
                expandable_id(object.get("customer")),
                status.to_string(),
            )
        }
        EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => (
            str_field(object, "id"),
            expandable_id(object.get("customer")),
            str_field(object, "status").unwrap_or_else(|| "incomplete".to_string()),
        ),
        EventKind::SubscriptionDeleted => (
            str_field(object, "id"),
            expandable_id(object.get("customer")),
            "canceled".to_string(),
        ),
        EventKind::InvoicePaid => (
            invoice_subscription(object),
            expandable_id(object.get("customer")),
            "active".to_string(),
        ),
        EventKind::InvoicePaymentFailed => (
            invoice_subscription(object),
            expandable_id(object.get("customer")),
            "past_due".to_string(),
        ),
    };

    let mut target = Map::new();
    if let Some(customer) = &customer_id {
        target.insert(CUSTOMER_ID_KEY.to_string(), json!(customer));
    }
    if let Some(subscription) = &subscription_id {
        target.insert(SUBSCRIPTION_ID_KEY.to_string(), json!(subscription));
    }
    target.insert(
        "hasActiveSubscription".to_string(),
        json!(matches!(status.as_str(), "active" | "trialing")),
    );
    target.insert("subscriptionStatus".to_string(), json!(status));

    if matches!(
        kind,
        EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated
    ) {
        let first_item = object.pointer("/items/data/0");
        if let Some(price_id) = first_item.and_then(|item| item.pointer("/price/id")).and_then(Value::as_str) {
            target.insert("priceId".to_string(), json!(price_id));
        }
        // Newer API versions moved the period onto the subscription item
        let period_end = object
            .get("current_period_end")
            .or_else(|| first_item.and_then(|item| item.get("current_period_end")))
            .and_then(Value::as_i64);
        if let Some(period_end) = period_end {
            target.insert("currentPeriodEnd".to_string(), json!(period_end));
        }
        if let Some(cancel) = object.get("cancel_at_period_end").and_then(Value::as_bool) {
            target.insert("cancelAtPeriodEnd".to_string(), json!(cancel));
        }
    }

    Some(ReconciliationRequest {
        event_kind: kind,
        subscription_id,
        customer_id,
        target_state: Value::Object(target),
    })
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Stripe references are either an id string or an expanded object
fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(object) => object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn invoice_subscription(object: &Value) -> Option<String> {
    expandable_id(object.get("subscription"))
        .or_else(|| expandable_id(object.pointer("/parent/subscription_details/subscription")))
}

//! Stripe webhook ingress

use axum::{extract::State, http::HeaderMap, Json};
use lumen_billing::derive_request;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub event_id: String,
    /// `applied`, `queued`, `dead_lettered` or `ignored`
    pub reconciliation: &'static str,
}

/// Verify a Stripe event and reconcile the identity store.
///
/// Once the signature checks out the event is acknowledged with 200 whatever
/// happens to the identity-store write: failures are queued or dead-lettered
/// here rather than pushed back to Stripe.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::Validation("Missing Stripe-Signature header".to_string()))?;

    let event = state.webhook_verifier.verify_event(&body, signature)?;

    let Some(request) = derive_request(&event) else {
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Ignoring webhook event without subscription impact"
        );
        return Ok(Json(WebhookAck {
            received: true,
            event_id: event.id,
            reconciliation: "ignored",
        }));
    };

    let reconciliation = match state.reconciliation.reconcile_now(request).await {
        Ok(outcome) => outcome.as_str(),
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event could not be reconciled or queued"
            );
            "ignored"
        }
    };

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        reconciliation = reconciliation,
        "Stripe webhook processed"
    );

    Ok(Json(WebhookAck {
        received: true,
        event_id: event.id,
        reconciliation,
    }))
}

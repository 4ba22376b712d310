//! Application state

use std::sync::Arc;

use lumen_billing::{ReconciliationService, StripeWebhookVerifier};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Process-wide reconciliation queue, shared by the webhook handler and admin routes
    pub reconciliation: Arc<ReconciliationService>,
    pub webhook_verifier: StripeWebhookVerifier,
}

impl AppState {
    pub fn new(config: Config, reconciliation: Arc<ReconciliationService>) -> Self {
        let webhook_verifier = StripeWebhookVerifier::new(config.stripe_webhook_secret.clone());
        Self {
            config,
            reconciliation,
            webhook_verifier,
        }
    }
}

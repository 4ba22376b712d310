// Billing crate clippy configuration
// The workspace denies unwrap_used and expect_used; unit tests are exempt:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lumen Billing Module
//!
//! Keeps the identity store (Clerk) in step with Stripe subscription state.
//!
//! ## Features
//!
//! - **Webhook Verification**: Stripe-Signature HMAC check and event parsing
//! - **Target State**: Derive user metadata from subscription, checkout and invoice events
//! - **Identity Store**: Clerk user lookup by subscription or customer id, idempotent metadata writes
//! - **Reconciliation Queue**: Failed writes retried at 1s, 3s and 9s, then dead-lettered
//! - **Operator Views**: Queue status, destructive clear, dead-letter history and replay
//!
//! The retry queue lives in process memory. Pending work does not survive a
//! restart.

pub mod config;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::{ClerkConfig, ReconcileConfig};

// Error
pub use error::{BillingError, BillingResult};

// Identity store
pub use identity::{ClerkClient, IdentityStore, IdentityStoreError, IdentityUser};

// Reconciliation
pub use reconcile::{
    AttemptOutcome, BackoffPolicy, ClearResult, DeadLetterCause, DeadLetterRecord,
    DispatchBatch, EnqueueResult, EventKind, IdentityStoreExecutor, ProcessorHandle,
    QueueProcessor, QueueStatus, QueueStore, ReconcileOutcome, ReconciliationRequest,
    ReconciliationService, TaskDisposition, TaskExecutor, TaskId, MAX_ATTEMPTS,
};

// Webhooks
pub use webhooks::{derive_request, StripeEvent, StripeWebhookVerifier};

use std::sync::Arc;

/// Build the reconciliation service against Clerk using environment config
pub fn reconciliation_from_env() -> BillingResult<ReconciliationService> {
    let clerk = ClerkClient::from_env()?;
    let executor = IdentityStoreExecutor::new(Arc::new(clerk));
    Ok(ReconciliationService::new(
        Arc::new(executor),
        ReconcileConfig::from_env(),
    ))
}

//! One reconciliation attempt against the identity store

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::task::ReconciliationRequest;
use crate::identity::{IdentityStore, IdentityStoreError, IdentityUser};

/// Classified result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Retry-eligible failure (network, timeout, rate limit, 5xx)
    TransientFailure(String),
    /// Retrying cannot help (malformed payload, unknown target)
    PermanentFailure(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

impl From<IdentityStoreError> for AttemptOutcome {
    fn from(err: IdentityStoreError) -> Self {
        if err.is_transient() {
            AttemptOutcome::TransientFailure(err.to_string())
        } else {
            AttemptOutcome::PermanentFailure(err.to_string())
        }
    }
}

/// Performs the identity-store write described by a request.
///
/// Each call makes at most one write and must resolve; the queue places no
/// timeout of its own around it. Writes must be idempotent because a retry
/// can race an earlier write whose acknowledgement was lost.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn attempt(&self, payload: &ReconciliationRequest) -> AttemptOutcome;
}

/// Executor backed by an [`IdentityStore`].
///
/// Resolves the user by subscription id first, then by customer id, and
/// merges the target state into the user's public metadata.
#[derive(Clone)]
pub struct IdentityStoreExecutor {
    store: Arc<dyn IdentityStore>,
}

impl IdentityStoreExecutor {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    async fn resolve_user(
        &self,
        payload: &ReconciliationRequest,
    ) -> Result<Option<IdentityUser>, IdentityStoreError> {
        if let Some(subscription_id) = payload.subscription_ref() {
            if let Some(user) = self.store.find_user_by_subscription(subscription_id).await? {
                return Ok(Some(user));
            }
            tracing::debug!(
                subscription_id = %subscription_id,
                "No user for subscription, falling back to customer lookup"
            );
        }

        match payload.customer_ref() {
            Some(customer_id) => self.store.find_user_by_customer(customer_id).await,
            None => Ok(None),
        }
    }
}

/// Reject payloads no retry can fix
pub fn validate_payload(payload: &ReconciliationRequest) -> Result<&Map<String, Value>, String> {
    if payload.subscription_ref().is_none() && payload.customer_ref().is_none() {
        return Err("malformed payload: no subscription or customer id".to_string());
    }
    payload
        .target_state
        .as_object()
        .ok_or_else(|| "malformed payload: target state is not an object".to_string())
}

#[async_trait]
impl TaskExecutor for IdentityStoreExecutor {
    async fn attempt(&self, payload: &ReconciliationRequest) -> AttemptOutcome {
        let metadata = match validate_payload(payload) {
            Ok(metadata) => metadata,
            Err(reason) => return AttemptOutcome::PermanentFailure(reason),
        };

        let user = match self.resolve_user(payload).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return AttemptOutcome::PermanentFailure(format!(
                    "not found: no user for subscription {} or customer {}",
                    payload.subscription_ref().unwrap_or("-"),
                    payload.customer_ref().unwrap_or("-"),
                ))
            }
            Err(e) => return e.into(),
        };

        match self.store.apply_metadata(&user.id, metadata).await {
            Ok(()) => AttemptOutcome::Success,
            Err(e) => e.into(),
        }
    }
}

//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Reconciliation request has neither a subscription id nor a customer id")]
    MissingTarget,

    #[error("Dead-letter record {0} not found")]
    DeadLetterNotFound(Uuid),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,
}

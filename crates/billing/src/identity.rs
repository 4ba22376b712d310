//! Identity store (Clerk) client
//!
//! Subscription state is mirrored into each user's Clerk public metadata.
//! Users are found by the Stripe identifiers stored in that metadata; writes
//! use Clerk's metadata merge endpoint, so applying the same state twice is
//! harmless.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::ClerkConfig;
use crate::error::{BillingError, BillingResult};

/// Public metadata key holding the user's Stripe subscription id
pub const SUBSCRIPTION_ID_KEY: &str = "stripeSubscriptionId";
/// Public metadata key holding the user's Stripe customer id
pub const CUSTOMER_ID_KEY: &str = "stripeCustomerId";

const USERS_PAGE_SIZE: usize = 100;
const MAX_ERROR_BODY: usize = 512;

/// Failure talking to the identity store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityStoreError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited (429)")]
    RateLimited,
    #[error("service unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("credentials rejected ({status})")]
    Unauthorized { status: u16 },
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl IdentityStoreError {
    /// Whether retrying the same call later can succeed.
    ///
    /// Timeouts, connection failures, rate limiting, 5xx and garbled
    /// responses are transient. Missing users, bad credentials and other 4xx
    /// rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IdentityStoreError::Timeout
                | IdentityStoreError::Network(_)
                | IdentityStoreError::RateLimited
                | IdentityStoreError::Unavailable { .. }
                | IdentityStoreError::Decode(_)
        )
    }

    pub fn from_status(status: StatusCode, body: String) -> Self {
        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => IdentityStoreError::RateLimited,
            StatusCode::NOT_FOUND => IdentityStoreError::NotFound(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IdentityStoreError::Unauthorized {
                status: status.as_u16(),
            },
            s if s.is_server_error() => IdentityStoreError::Unavailable {
                status: s.as_u16(),
                body,
            },
            s => IdentityStoreError::Rejected {
                status: s.as_u16(),
                body,
            },
        }
    }
}

impl From<reqwest::Error> for IdentityStoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IdentityStoreError::Timeout
        } else if err.is_decode() {
            IdentityStoreError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            IdentityStoreError::from_status(status, err.to_string())
        } else {
            IdentityStoreError::Network(err.to_string())
        }
    }
}

/// A user record as far as reconciliation cares
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    #[serde(default)]
    pub public_metadata: Value,
}

impl IdentityUser {
    fn metadata_matches(&self, key: &str, value: &str) -> bool {
        self.public_metadata
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|v| v == value)
    }
}

/// Operations the reconciliation executor needs from the identity store.
///
/// Implementations must resolve every call, either through their own
/// timeout or otherwise; the queue does not time attempts out.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<IdentityUser>, IdentityStoreError>;

    async fn find_user_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<IdentityUser>, IdentityStoreError>;

    /// Merge `metadata` into the user's public metadata. Idempotent.
    async fn apply_metadata(
        &self,
        user_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), IdentityStoreError>;
}

/// Clerk Backend API client
#[derive(Clone)]
pub struct ClerkClient {
    http: Client,
    config: ClerkConfig,
}

impl ClerkClient {
    pub fn new(config: ClerkConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(ClerkConfig::from_env()?)
    }

    pub fn config(&self) -> &ClerkConfig {
        &self.config
    }

    async fn find_user_by_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<IdentityUser>, IdentityStoreError> {
        let url = format!("{}/v1/users", self.config.api_url);

        for page in 0..self.config.lookup_max_pages {
            let offset = (page as usize) * USERS_PAGE_SIZE;
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.config.secret_key)
                .query(&[
                    ("limit", USERS_PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                    ("order_by", "-created_at".to_string()),
                ])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(
                    status = %status,
                    metadata_key = key,
                    "Clerk user lookup failed"
                );
                return Err(IdentityStoreError::from_status(status, body));
            }

            let users: Vec<IdentityUser> = response.json().await?;
            let page_len = users.len();

            if let Some(user) = users.into_iter().find(|u| u.metadata_matches(key, value)) {
                return Ok(Some(user));
            }
            if page_len < USERS_PAGE_SIZE {
                return Ok(None);
            }
        }

        tracing::warn!(
            metadata_key = key,
            max_pages = self.config.lookup_max_pages,
            "Clerk user lookup hit page limit without a match"
        );
        Ok(None)
    }
}

#[async_trait]
impl IdentityStore for ClerkClient {
    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<IdentityUser>, IdentityStoreError> {
        self.find_user_by_metadata(SUBSCRIPTION_ID_KEY, subscription_id)
            .await
    }

    async fn find_user_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<IdentityUser>, IdentityStoreError> {
        self.find_user_by_metadata(CUSTOMER_ID_KEY, customer_id).await
    }

    async fn apply_metadata(
        &self,
        user_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), IdentityStoreError> {
        let url = format!("{}/v1/users/{}/metadata", self.config.api_url, user_id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.config.secret_key)
            .json(&json!({ "public_metadata": metadata }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityStoreError::from_status(status, body));
        }

        tracing::debug!(user_id = %user_id, "Clerk metadata updated");
        Ok(())
    }
}

//! Environment-driven configuration for the reconciliation subsystem
//!
//! Values are read from the process environment (a `.env` file is honoured
//! via `dotenvy`). Required values produce [`BillingError::Config`]; numeric
//! values that fail to parse fall back to their defaults with a warning.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_DEAD_LETTER_HISTORY: usize = 100;
pub const DEFAULT_CLERK_API_URL: &str = "https://api.clerk.com";
pub const DEFAULT_CLERK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CLERK_LOOKUP_MAX_PAGES: u32 = 10;

/// Queue processor and history settings
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Fixed polling interval of the processor loop
    pub poll_interval: Duration,
    /// How many dead-letter records are retained for operator replay
    pub dead_letter_history: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            dead_letter_history: DEFAULT_DEAD_LETTER_HISTORY,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let poll_ms: u64 = parse_env_or("RECONCILE_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS);
        Self {
            // A zero interval would make tokio::time::interval panic
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            dead_letter_history: parse_env_or(
                "RECONCILE_DEAD_LETTER_HISTORY",
                DEFAULT_DEAD_LETTER_HISTORY,
            ),
        }
    }
}

/// Clerk Backend API settings
#[derive(Clone)]
pub struct ClerkConfig {
    pub secret_key: String,
    pub api_url: String,
    /// Per-request timeout; every identity-store call resolves within it
    pub timeout: Duration,
    /// Upper bound on user-list pages scanned per lookup
    pub lookup_max_pages: u32,
}

impl std::fmt::Debug for ClerkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClerkConfig")
            .field("secret_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .field("lookup_max_pages", &self.lookup_max_pages)
            .finish()
    }
}

impl ClerkConfig {
    pub fn new(secret_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_url: api_url.into(),
            timeout: Duration::from_secs(DEFAULT_CLERK_TIMEOUT_SECS),
            lookup_max_pages: DEFAULT_CLERK_LOOKUP_MAX_PAGES,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();

        let secret_key = std::env::var("CLERK_SECRET_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("CLERK_SECRET_KEY must be set".to_string()))?;

        let api_url = std::env::var("CLERK_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLERK_API_URL.to_string());

        let timeout_secs: u64 = parse_env_or("CLERK_TIMEOUT_SECS", DEFAULT_CLERK_TIMEOUT_SECS);

        Ok(Self {
            secret_key,
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            lookup_max_pages: parse_env_or(
                "CLERK_LOOKUP_MAX_PAGES",
                DEFAULT_CLERK_LOOKUP_MAX_PAGES,
            )
            .max(1),
        })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    key = key,
                    value = %raw,
                    default = %default,
                    "Invalid value in environment, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

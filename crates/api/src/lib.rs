// API crate clippy configuration
// The workspace denies unwrap_used and expect_used; unit tests are exempt:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Lumen API Library
//!
//! HTTP surface of the billing reconciliation subsystem: the Stripe webhook
//! ingress and the token-gated admin routes for the retry queue.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;

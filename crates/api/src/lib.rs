// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Credmarket API Library
//!
//! The HTTP surface of the billing core: Stripe webhook endpoints, admin
//! refund approval, customer checkout and refund requests, and the credit
//! ledger.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;

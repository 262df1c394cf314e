// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries context strings
#![allow(clippy::too_many_arguments)] // Checkout session requests need many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Credmarket Billing Core
//!
//! Reconciles Stripe with the local credit ledger: subscriptions that grant
//! monthly credits, one-off credit purchases, and admin-approved refunds.
//!
//! ## Features
//!
//! - **Webhooks**: Verified, allow-listed ingestion on two endpoints
//! - **Subscriptions**: Status state machine with a terminal CANCELED
//! - **Invoices**: Exactly-once credit grants keyed by the invoice id
//! - **Ledger**: Non-negative balances with an append-only transaction log
//! - **Refunds**: Request, approval and processor refund in one transaction
//! - **Refund targets**: Payment reference, charge, then a bounded charge search
//! - **Checkout**: Hosted and embedded sessions for credits and plans
//! - **Invariants**: Read-only consistency checks for the worker

pub mod approvals;
pub mod checkout;
pub mod client;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod objects;
pub mod postgres;
pub mod purchases;
pub mod refund;
pub mod resolver;
pub mod router;
pub mod store;
pub mod subscriptions;
pub mod verifier;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod mocks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Approvals
pub use approvals::{ApprovalResult, RefundApprovalService};

// Checkout
pub use checkout::{CheckoutService, CheckoutStarted, CheckoutUi, MAX_CREDITS_PER_PURCHASE};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Gateway
pub use gateway::{CheckoutUiMode, PaymentGateway, RefundTarget};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::CreditLedger;

// Models
pub use models::{
    Customer, InvoiceRecord, InvoiceStatus, Plan, Purchase, PurchaseStatus, RefundRecord,
    RefundRequest, RefundRequestKind, RefundRequestStatus, RefundStatus, Subscription,
    SubscriptionStatus, TransactionKind, TransactionLog,
};

// Storage
pub use postgres::PgBillingStore;
pub use store::{BillingStore, Page, PageRequest};

// Purchases
pub use purchases::PurchaseService;

// Refunds
pub use refund::RefundService;
pub use resolver::{RefundTargetResolver, Resolution, ResolutionSource};

// Routing
pub use router::{Endpoint, EventOutcome};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use verifier::WebhookVerifier;
pub use webhooks::{WebhookHandler, WebhookOutcome};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub approvals: RefundApprovalService,
    pub checkout: CheckoutService,
    pub ledger: CreditLedger,
    pub purchases: PurchaseService,
    pub refunds: RefundService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables, backed by Postgres
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = stripe.config().clone();
        Ok(Self::new(
            config,
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(stripe),
        ))
    }

    /// Create a billing service with explicit config, store and gateway
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let config = Arc::new(config);
        let resolver = RefundTargetResolver::new(gateway.clone(), config.refund_search_max_pages);

        let subscriptions = SubscriptionService::new(store.clone(), gateway.clone());
        let purchases = PurchaseService::new(store.clone());
        let refunds = RefundService::new(store.clone(), gateway.clone());

        Self {
            approvals: RefundApprovalService::new(store.clone(), gateway.clone(), resolver),
            checkout: CheckoutService::new(store.clone(), gateway, config.clone()),
            ledger: CreditLedger::new(store),
            webhooks: WebhookHandler::new(
                &config,
                subscriptions.clone(),
                purchases.clone(),
                refunds.clone(),
            ),
            purchases,
            refunds,
            subscriptions,
        }
    }
}

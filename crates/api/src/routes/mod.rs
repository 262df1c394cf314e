//! HTTP routes

pub mod admin_refunds;
pub mod customers;
pub mod ledger;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_internal_token, state::AppState};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Stripe authenticates itself with the payload signature
    let webhook_routes = Router::new()
        .route("/webhooks/stripe/purchases", post(webhooks::purchases))
        .route(
            "/webhooks/stripe/subscriptions",
            post(webhooks::subscriptions),
        );

    let admin_routes = Router::new()
        .route(
            "/api/v1/admin/refund-requests",
            get(admin_refunds::list_pending),
        )
        .route(
            "/api/v1/admin/refund-requests/{kind}/{id}/approve",
            post(admin_refunds::approve),
        )
        .route(
            "/api/v1/admin/refund-requests/{kind}/{id}/deny",
            post(admin_refunds::deny),
        );

    let customer_routes = Router::new()
        .route(
            "/api/v1/customers/{customer_id}/checkout/credits",
            post(customers::start_credit_checkout),
        )
        .route(
            "/api/v1/customers/{customer_id}/checkout/subscription",
            post(customers::start_subscription_checkout),
        )
        .route(
            "/api/v1/customers/{customer_id}/purchases/{purchase_id}/refund-request",
            post(customers::request_purchase_refund),
        )
        .route(
            "/api/v1/customers/{customer_id}/subscriptions/{subscription_id}/refund-request",
            post(customers::request_subscription_refund),
        )
        .route(
            "/api/v1/customers/{customer_id}/subscriptions/{subscription_id}/cancel-at-period-end",
            post(customers::set_cancel_at_period_end),
        )
        .route(
            "/api/v1/customers/{customer_id}/balance",
            get(ledger::balance),
        )
        .route(
            "/api/v1/customers/{customer_id}/transactions",
            get(ledger::history),
        )
        .route(
            "/api/v1/customers/{customer_id}/credit",
            post(ledger::credit),
        )
        .route("/api/v1/customers/{customer_id}/debit", post(ledger::debit))
        .route("/api/v1/ledger/transfers", post(ledger::transfer));

    let guarded_routes = admin_routes
        .merge(customer_routes)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(webhook_routes)
        .merge(guarded_routes)
        .with_state(state)
}

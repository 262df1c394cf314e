//! Stripe webhook endpoints
//!
//! The body is taken as a raw `String`: the signature covers the exact bytes
//! Stripe sent. Anything but a bad signature or a retryable failure is
//! acknowledged with 200 so Stripe stops redelivering.

use axum::{extract::State, http::HeaderMap, Json};
use credmarket_billing::{BillingError, Endpoint, WebhookOutcome};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn purchases(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    receive(&state, Endpoint::Purchases, &headers, &body).await
}

pub async fn subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    receive(&state, Endpoint::Subscriptions, &headers, &body).await
}

async fn receive(
    state: &AppState,
    endpoint: Endpoint,
    headers: &HeaderMap,
    body: &str,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(endpoint = endpoint.as_str(), "Webhook without signature header");
            ApiError::InvalidSignature
        })?;

    match state.billing.webhooks.handle(endpoint, body, signature).await {
        Ok(outcome) => {
            let processed = matches!(outcome, WebhookOutcome::Processed { .. });
            Ok(Json(json!({ "received": true, "processed": processed })))
        }
        Err(BillingError::WebhookSignatureInvalid) => Err(ApiError::InvalidSignature),
        Err(e) if e.is_retryable() => Err(ApiError::Internal(e.to_string())),
        Err(e) => {
            // Business rejection: retrying would fail the same way
            tracing::warn!(
                endpoint = endpoint.as_str(),
                error = %e,
                "Webhook acknowledged after rejection"
            );
            Ok(Json(json!({ "received": true, "processed": false })))
        }
    }
}

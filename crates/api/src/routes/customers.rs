//! Customer-initiated billing routes: checkout, refund requests and
//! cancel at period end

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use credmarket_billing::{CheckoutStarted, CheckoutUi, RefundRequest, Subscription};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreditCheckoutRequest {
    pub quantity: i32,
    #[serde(default)]
    pub ui: CheckoutUi,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionCheckoutRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub ui: CheckoutUi,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequestBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelAtPeriodEndRequest {
    pub cancel: bool,
}

pub async fn start_credit_checkout(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<CreditCheckoutRequest>,
) -> ApiResult<(StatusCode, Json<CheckoutStarted>)> {
    let started = state
        .billing
        .checkout
        .start_credit_purchase(customer_id, req.quantity, req.ui)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

pub async fn start_subscription_checkout(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<SubscriptionCheckoutRequest>,
) -> ApiResult<(StatusCode, Json<CheckoutStarted>)> {
    let started = state
        .billing
        .checkout
        .start_subscription(customer_id, req.plan_id, req.ui)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

pub async fn request_purchase_refund(
    State(state): State<AppState>,
    Path((customer_id, purchase_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RefundRequestBody>,
) -> ApiResult<(StatusCode, Json<RefundRequest>)> {
    let request = state
        .billing
        .approvals
        .request_purchase_refund(customer_id, purchase_id, req.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn request_subscription_refund(
    State(state): State<AppState>,
    Path((customer_id, subscription_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RefundRequestBody>,
) -> ApiResult<(StatusCode, Json<RefundRequest>)> {
    let request = state
        .billing
        .approvals
        .request_subscription_refund(customer_id, subscription_id, req.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn set_cancel_at_period_end(
    State(state): State<AppState>,
    Path((customer_id, subscription_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<CancelAtPeriodEndRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .set_cancel_at_period_end(customer_id, subscription_id, req.cancel)
        .await?;
    Ok(Json(subscription))
}

//! Credit ledger routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use credmarket_billing::{Customer, TransactionLog};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_customer_id: Uuid,
    pub to_customer_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub customer_id: Uuid,
    pub balance: Decimal,
}

impl From<Customer> for BalanceResponse {
    fn from(customer: Customer) -> Self {
        Self {
            customer_id: customer.id,
            balance: customer.balance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub from: BalanceResponse,
    pub to: BalanceResponse,
}

pub async fn balance(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.billing.ledger.balance(customer_id).await?;
    Ok(Json(BalanceResponse {
        customer_id,
        balance,
    }))
}

pub async fn history(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<TransactionLog>>> {
    let logs = state.billing.ledger.history(customer_id, query.limit).await?;
    Ok(Json(logs))
}

pub async fn credit(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<Json<BalanceResponse>> {
    let customer = state
        .billing
        .ledger
        .credit(customer_id, req.amount, req.reference)
        .await?;
    Ok(Json(customer.into()))
}

/// Spend credits; 403 when the balance does not cover the amount
pub async fn debit(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<Json<BalanceResponse>> {
    let customer = state
        .billing
        .ledger
        .debit(customer_id, req.amount, req.reference)
        .await?;
    Ok(Json(customer.into()))
}

pub async fn transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<TransferResponse>> {
    let (from, to) = state
        .billing
        .ledger
        .transfer(
            req.from_customer_id,
            req.to_customer_id,
            req.amount,
            req.reference,
        )
        .await?;
    Ok(Json(TransferResponse {
        from: from.into(),
        to: to.into(),
    }))
}

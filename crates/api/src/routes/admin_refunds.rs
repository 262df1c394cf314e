//! Admin refund request routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use credmarket_billing::{ApprovalResult, Page, PageRequest, RefundRequest, RefundRequestKind};
use uuid::Uuid;

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

fn parse_kind(segment: &str) -> ApiResult<RefundRequestKind> {
    RefundRequestKind::from_path(segment).ok_or_else(|| {
        ApiError::NotFound(format!("unknown refund request kind '{}'", segment))
    })
}

/// Pending requests of both kinds, newest first
pub async fn list_pending(
    State(state): State<AppState>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<RefundRequest>>> {
    let page = state.billing.approvals.list_pending(page).await?;
    Ok(Json(page))
}

pub async fn approve(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<ApprovalResult>> {
    let kind = parse_kind(&kind)?;
    let result = state.billing.approvals.approve(kind, id, admin_id).await?;
    Ok(Json(result))
}

pub async fn deny(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<RefundRequest>> {
    let kind = parse_kind(&kind)?;
    let request = state.billing.approvals.deny(kind, id, admin_id).await?;
    Ok(Json(request))
}

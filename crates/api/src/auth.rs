//! Internal API authentication
//!
//! Admin and customer routes are called by the application backend, never by
//! browsers directly. They carry `Authorization: Bearer <INTERNAL_API_TOKEN>`;
//! admin routes also name the acting admin in `x-admin-user-id`.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

pub const ADMIN_USER_HEADER: &str = "x-admin-user-id";

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

fn token_matches(presented: &str, expected: &str) -> bool {
    // ct_eq on slices of different lengths returns false without comparing
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Middleware that requires the internal API token
pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let authorized = extract_bearer_token(&request)
        .map(|token| token_matches(token, &state.config.internal_api_token));

    match authorized {
        Some(true) => next.run(request).await,
        Some(false) => {
            tracing::warn!(path = %path, "Rejected request with invalid internal token");
            ApiError::Unauthorized.into_response()
        }
        None => {
            tracing::warn!(path = %path, "Rejected request without internal token");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// The admin acting on a refund request, from `x-admin-user-id`
#[derive(Debug, Clone, Copy)]
pub struct AdminUser(pub Uuid);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(ADMIN_USER_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        Uuid::parse_str(value.trim())
            .map(AdminUser)
            .map_err(|_| ApiError::Validation(format!("{} must be a UUID", ADMIN_USER_HEADER)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_comparison() {
        assert!(token_matches("0123456789abcdef", "0123456789abcdef"));
        assert!(!token_matches("0123456789abcdeF", "0123456789abcdef"));
        assert!(!token_matches("0123456789abcdef0", "0123456789abcdef"));
        assert!(!token_matches("", ""));
    }
}

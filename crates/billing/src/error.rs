//! Billing errors

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing webhook signature. Terminal, never retried.
    Authentication,
    /// Idempotency key already claimed, insufficient balance, wrong state.
    Conflict,
    /// A local record the operation needs does not exist.
    NotFound,
    /// Caller supplied something unusable.
    Invalid,
    /// Store or processor unavailable. The whole operation rolled back.
    Transient,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Refund request {0} has already been decided")]
    RequestAlreadyDecided(uuid::Uuid),

    #[error("An active refund already exists: {0}")]
    RefundAlreadyExists(String),

    #[error("A pending refund request already exists: {0}")]
    DuplicateRefundRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe rejected the request: {0}")]
    StripeRejected(String),

    #[error("Stripe request timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::WebhookSignatureInvalid => ErrorKind::Authentication,
            BillingError::StripeRejected(_) => ErrorKind::Invalid,
            BillingError::InsufficientBalance { .. }
            | BillingError::RequestAlreadyDecided(_)
            | BillingError::RefundAlreadyExists(_)
            | BillingError::DuplicateRefundRequest(_)
            | BillingError::InvalidState(_)
            | BillingError::ConcurrentModification(_) => ErrorKind::Conflict,
            BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::InvalidAmount(_) | BillingError::InvalidInput(_) => ErrorKind::Invalid,
            BillingError::StripeApi(_)
            | BillingError::Timeout(_)
            | BillingError::Database(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Whether a webhook delivery that failed with this error should be
    /// redelivered by the processor.
    ///
    /// A lost conditional update means another delivery raced us, so the
    /// event is retried against fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
            || matches!(self, BillingError::ConcurrentModification(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match &e {
            stripe::StripeError::Stripe(request) if request.http_status == 404 => {
                BillingError::NotFound(e.to_string())
            }
            // 429 is rate limiting and worth retrying; other 4xx will fail the same way again
            stripe::StripeError::Stripe(request)
                if (400..500).contains(&request.http_status) && request.http_status != 429 =>
            {
                BillingError::StripeRejected(e.to_string())
            }
            _ => BillingError::StripeApi(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON conversion failed: {}", e))
    }
}

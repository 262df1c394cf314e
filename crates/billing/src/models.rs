//! Local ledger records
//!
//! Row types for the tables the reconciliation core owns. Status columns are
//! stored as upper-case TEXT.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Local subscription status.
///
/// `Canceled` is terminal: no transition ever leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Map a processor status string onto a local status.
    ///
    /// Total over all strings: anything unrecognized maps to `Pending`.
    pub fn from_external(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" | "trialing" => SubscriptionStatus::Active,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    Pending,
    Paid,
    Canceled,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "PENDING",
            PurchaseStatus::Paid => "PAID",
            PurchaseStatus::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundRequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RefundRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundRequestStatus::Pending => "PENDING",
            RefundRequestStatus::Approved => "APPROVED",
            RefundRequestStatus::Denied => "DENIED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundRequestKind {
    CreditPurchase,
    Subscription,
}

impl RefundRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundRequestKind::CreditPurchase => "CREDIT_PURCHASE",
            RefundRequestKind::Subscription => "SUBSCRIPTION",
        }
    }

    /// Parse the path segment used by the admin endpoints
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "credit" | "credits" | "credit-purchase" => Some(RefundRequestKind::CreditPurchase),
            "subscription" | "subscriptions" => Some(RefundRequestKind::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    /// Processor refund status to local status. Unknown strings stay pending.
    pub fn from_external(status: Option<&str>) -> Self {
        match status.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("succeeded") => RefundStatus::Succeeded,
            Some("failed") | Some("canceled") => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        }
    }

    /// Pending and succeeded refunds block another refund of the same target
    pub fn is_active(&self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Succeeded)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefundStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Succeeded => "SUCCEEDED",
            RefundStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    SubscriptionInvoice,
    CreditPurchase,
    PurchaseRefund,
    SubscriptionRefund,
    Debit,
    Credit,
    TransferOut,
    TransferIn,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::SubscriptionInvoice => "SUBSCRIPTION_INVOICE",
            TransactionKind::CreditPurchase => "CREDIT_PURCHASE",
            TransactionKind::PurchaseRefund => "PURCHASE_REFUND",
            TransactionKind::SubscriptionRefund => "SUBSCRIPTION_REFUND",
            TransactionKind::Debit => "DEBIT",
            TransactionKind::Credit => "CREDIT",
            TransactionKind::TransferOut => "TRANSFER_OUT",
            TransactionKind::TransferIn => "TRANSFER_IN",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub external_customer_ref: Option<String>,
    pub balance: Decimal,
    pub has_purchased: bool,
    pub subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub monthly_credits: Decimal,
    pub external_price_ref: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    /// The administrator: the customer who owns and pays for it
    pub customer_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub external_subscription_ref: Option<String>,
    pub external_checkout_ref: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub external_invoice_ref: String,
    pub subscription_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: InvoiceStatus,
    pub amount: Decimal,
    /// Credits this invoice put on the balance; zero until granted
    pub credits_granted: Decimal,
    pub billing_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub issued_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Purchase {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub external_session_ref: String,
    pub external_payment_ref: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub status: PurchaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl Purchase {
    /// Credits this purchase put on the balance
    pub fn credits(&self) -> Decimal {
        Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RefundRequest {
    pub id: Uuid,
    pub kind: RefundRequestKind,
    pub customer_id: Uuid,
    pub purchase_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub reason: Option<String>,
    pub status: RefundRequestStatus,
    pub decided_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub external_refund_ref: String,
    pub purchase_id: Option<Uuid>,
    pub refund_request_id: Option<Uuid>,
    pub amount: Decimal,
    pub status: RefundStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only audit row for every balance-affecting event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TransactionLog {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub customer_id: Uuid,
    pub status: String,
    /// Signed monetary amount; negative for failures and refunds
    pub amount: Decimal,
    /// Signed balance delta in credits
    pub credits: Decimal,
    pub reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A TransactionLog row not yet written
#[derive(Debug, Clone)]
pub struct NewTransactionLog {
    pub kind: TransactionKind,
    pub customer_id: Uuid,
    pub status: String,
    pub amount: Decimal,
    pub credits: Decimal,
    pub reference: Option<String>,
}

impl NewTransactionLog {
    pub fn into_log(self, now: OffsetDateTime) -> TransactionLog {
        TransactionLog {
            id: Uuid::new_v4(),
            kind: self.kind,
            customer_id: self.customer_id,
            status: self.status,
            amount: self.amount,
            credits: self.credits,
            reference: self.reference,
            created_at: now,
        }
    }
}

/// Convert processor minor units (cents) to a currency amount
pub fn amount_from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Convert a currency amount to processor minor units, rounding half away from zero
pub fn amount_to_cents(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

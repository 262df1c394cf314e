//! Storage seam of the billing core
//!
//! Services never touch SQL directly. Each multi-step mutation is a single
//! [`BillingStore`] method and runs as one database transaction in
//! [`crate::postgres::PgBillingStore`]: either every row changes or none does.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    Customer, InvoiceRecord, InvoiceStatus, Plan, Purchase, RefundRecord, RefundRequest,
    RefundRequestKind, RefundStatus, Subscription, SubscriptionStatus, TransactionLog,
};
use crate::objects::RefundView;

/// What a refund status event did to the stored refund
#[derive(Debug, Clone)]
pub enum RefundStatusUpdate {
    Updated(RefundRecord),
    /// Already terminal, left as is
    Unchanged(RefundRecord),
    /// No refund stored under this ref
    Unknown,
}

/// Subscription created by (or refreshed from) a completed checkout
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub external_subscription_ref: Option<String>,
    pub external_checkout_ref: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone)]
pub struct CheckoutUpsert {
    pub subscription: Subscription,
    /// False when the checkout ref was already known
    pub created: bool,
}

/// Fields refreshed from the processor's current subscription object
#[derive(Debug, Clone)]
pub struct SubscriptionSync {
    pub external_subscription_ref: String,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Outcome of one invoice event, keyed by the external invoice ref
#[derive(Debug, Clone)]
pub struct InvoiceApplication {
    pub external_invoice_ref: String,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub monthly_credits: Decimal,
    /// Invoice amount in currency units, unsigned
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub billing_reason: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    /// When Stripe created the invoice; a newer invoice decides subscription status
    pub issued_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceTransition {
    /// First delivery for this invoice ref
    Created,
    /// FAILED invoice later paid
    UpgradedToPaid,
    /// Duplicate or stale delivery, nothing changed
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct InvoiceOutcome {
    pub invoice: InvoiceRecord,
    pub transition: InvoiceTransition,
    /// Credits granted by this call; zero on replays
    pub credits_granted: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub customer_id: Uuid,
    pub external_session_ref: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct PurchaseCompletion {
    pub external_session_ref: String,
    pub external_payment_ref: Option<String>,
    pub paid_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PurchaseCompleted {
    pub purchase: Purchase,
    /// False when the purchase had already been completed
    pub credited: bool,
}

/// Direction of a single-customer balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub customer_id: Uuid,
    pub direction: BalanceDirection,
    pub amount: Decimal,
    pub reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BalanceTransfer {
    pub from_customer_id: Uuid,
    pub to_customer_id: Uuid,
    pub amount: Decimal,
    pub reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRefundRequest {
    pub kind: RefundRequestKind,
    pub customer_id: Uuid,
    pub purchase_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

pub const MAX_PAGE_LIMIT: i64 = 100;

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PageRequest {
    /// Clamp to sane bounds: pages start at 1, at most `MAX_PAGE_LIMIT` rows
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

/// An admin approving a pending refund request
#[derive(Debug, Clone)]
pub struct RefundApproval {
    pub request_id: Uuid,
    pub admin_id: Uuid,
    /// Invoice whose credits a subscription refund takes back
    pub invoice_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApprovedRefund {
    pub request: RefundRequest,
    /// None when no refund target was found and the money must be returned manually
    pub refund: Option<RefundRecord>,
    pub credits_revoked: Decimal,
}

/// The processor side of a refund approval.
///
/// Runs inside the approval transaction after every local check passed. An
/// error rolls the whole approval back. `Ok(None)` means no refund object was
/// created at the processor.
#[async_trait]
pub trait RefundEffect: Send + Sync {
    async fn execute(&self) -> BillingResult<Option<RefundView>>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Customers and plans

    async fn get_customer(&self, id: Uuid) -> BillingResult<Option<Customer>>;

    async fn find_customer_by_external_ref(
        &self,
        external_customer_ref: &str,
    ) -> BillingResult<Option<Customer>>;

    async fn set_customer_external_ref(
        &self,
        customer_id: Uuid,
        external_customer_ref: &str,
    ) -> BillingResult<()>;

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;

    /// Highest-priority plan whose price is among `price_refs`
    async fn find_plan_by_price_refs(&self, price_refs: &[String]) -> BillingResult<Option<Plan>>;

    // Subscriptions

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_external_ref(
        &self,
        external_subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert keyed by checkout ref, or refresh the existing row. Links the
    /// owning customer unless the subscription is canceled.
    async fn upsert_checkout_subscription(
        &self,
        subscription: NewSubscription,
    ) -> BillingResult<CheckoutUpsert>;

    /// Refresh plan, status and period. Never leaves or enters CANCELED.
    async fn sync_subscription(
        &self,
        sync: SubscriptionSync,
    ) -> BillingResult<Option<Subscription>>;

    /// Force CANCELED, clear cancel flags, unlink every customer
    async fn mark_subscription_canceled(
        &self,
        external_subscription_ref: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription>;

    // Invoices

    async fn latest_paid_invoice(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<InvoiceRecord>>;

    /// Record the invoice, move the subscription, grant credits, log. One
    /// transaction; the invoice ref is the idempotency key.
    async fn apply_invoice(&self, application: InvoiceApplication)
        -> BillingResult<InvoiceOutcome>;

    // Purchases

    async fn create_purchase(&self, purchase: NewPurchase) -> BillingResult<Purchase>;

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>>;

    /// PENDING -> PAID and credit the quantity, at most once.
    /// `None` when no purchase has this session ref.
    async fn complete_purchase(
        &self,
        completion: PurchaseCompletion,
    ) -> BillingResult<Option<PurchaseCompleted>>;

    // Ledger

    /// Conditional balance update plus log entry. A debit larger than the
    /// balance fails with `InsufficientBalance` and writes nothing.
    async fn change_balance(&self, change: BalanceChange) -> BillingResult<Customer>;

    async fn transfer(&self, transfer: BalanceTransfer) -> BillingResult<(Customer, Customer)>;

    async fn transaction_history(
        &self,
        customer_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<TransactionLog>>;

    // Refunds

    async fn create_refund_request(&self, request: NewRefundRequest)
        -> BillingResult<RefundRequest>;

    async fn get_refund_request(&self, id: Uuid) -> BillingResult<Option<RefundRequest>>;

    /// Pending requests of both kinds, newest first
    async fn list_pending_refund_requests(
        &self,
        page: PageRequest,
    ) -> BillingResult<Page<RefundRequest>>;

    async fn deny_refund_request(&self, id: Uuid, admin_id: Uuid)
        -> BillingResult<RefundRequest>;

    async fn approve_purchase_refund(
        &self,
        approval: RefundApproval,
        effect: &dyn RefundEffect,
    ) -> BillingResult<ApprovedRefund>;

    async fn approve_subscription_refund(
        &self,
        approval: RefundApproval,
        effect: &dyn RefundEffect,
    ) -> BillingResult<ApprovedRefund>;

    /// Move a PENDING refund to a terminal status. Terminal rows never change.
    async fn update_refund_status(
        &self,
        external_refund_ref: &str,
        status: RefundStatus,
    ) -> BillingResult<RefundStatusUpdate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_normalization() {
        let page = PageRequest { page: 0, limit: 1000 }.normalized();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
        assert_eq!(page.offset(), 0);

        let third = PageRequest { page: 3, limit: 20 }.normalized();
        assert_eq!(third.offset(), 40);
    }
}

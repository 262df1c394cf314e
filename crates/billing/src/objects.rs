//! Views of Stripe objects
//!
//! Stripe objects arrive in different shapes depending on API version and on
//! which fields were expanded. Instead of reading raw JSON fields, each view
//! keeps every field optional and exposes accessor functions with a fixed
//! fallback order. Views are built from webhook payloads and from
//! `async-stripe` responses (via `from_stripe`).

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::SubscriptionStatus;

/// Re-read an `async-stripe` object as one of the views below
pub fn from_stripe<T: Serialize, V: DeserializeOwned>(object: &T) -> BillingResult<V> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

fn timestamp(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// A reference that is either a bare id or an expanded object
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObjectId {
    pub id: String,
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object(object) => &object.id,
        }
    }
}

fn ref_id(reference: &Option<ObjectRef>) -> Option<&str> {
    reference
        .as_ref()
        .map(|r| r.id())
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListOf<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for ListOf<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

// =============================================================================
// Event envelope
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Deserialize the event's object as the given view
    pub fn object<V: DeserializeOwned>(&self) -> BillingResult<V> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::InvalidInput(format!(
                "event {} carries an unexpected {} object: {}",
                self.id, self.event_type, e
            ))
        })
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        timestamp(Some(self.created))
    }
}

// =============================================================================
// Invoice
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceView {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub charge: Option<ObjectRef>,
    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,
    #[serde(default)]
    pub payments: Option<ListOf<InvoicePayment>>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub lines: Option<ListOf<InvoiceLine>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoicePayment {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment: Option<InvoicePaymentTarget>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoicePaymentTarget {
    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,
    #[serde(default)]
    pub charge: Option<ObjectRef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub price: Option<ObjectRef>,
    #[serde(default)]
    pub pricing: Option<LinePricing>,
    #[serde(default)]
    pub period: Option<LinePeriod>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub proration: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinePricing {
    #[serde(default)]
    pub price_details: Option<PriceDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PriceDetails {
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinePeriod {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

impl InvoiceView {
    fn lines(&self) -> &[InvoiceLine] {
        self.lines.as_ref().map(|l| l.data.as_slice()).unwrap_or(&[])
    }

    fn payments(&self) -> &[InvoicePayment] {
        self.payments
            .as_ref()
            .map(|p| p.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn customer_ref(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    /// Subscription id: top-level field, then the invoice parent, then the
    /// first line item that names one.
    pub fn subscription_ref(&self) -> Option<&str> {
        ref_id(&self.subscription)
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| ref_id(&d.subscription))
            })
            .or_else(|| self.lines().iter().find_map(|l| ref_id(&l.subscription)))
    }

    /// The invoice's own payment reference: the payment intent field, then
    /// the first paid entry of the invoice payments list.
    pub fn payment_reference(&self) -> Option<&str> {
        ref_id(&self.payment_intent).or_else(|| {
            self.payments()
                .iter()
                .filter(|p| p.status.as_deref().map(|s| s == "paid").unwrap_or(true))
                .find_map(|p| p.payment.as_ref().and_then(|t| ref_id(&t.payment_intent)))
        })
    }

    /// Direct charge reference: the charge field, then a charge named in the
    /// invoice payments list.
    pub fn charge_ref(&self) -> Option<&str> {
        ref_id(&self.charge).or_else(|| {
            self.payments()
                .iter()
                .find_map(|p| p.payment.as_ref().and_then(|t| ref_id(&t.charge)))
        })
    }

    /// Price ids of all line items. Newer API versions nest the price under
    /// `pricing.price_details`.
    pub fn price_refs(&self) -> Vec<&str> {
        self.lines()
            .iter()
            .filter_map(|line| {
                ref_id(&line.price).or_else(|| {
                    line.pricing
                        .as_ref()
                        .and_then(|p| p.price_details.as_ref())
                        .and_then(|d| d.price.as_deref())
                })
            })
            .collect()
    }

    /// Amount collected, in cents: `amount_paid`, falling back to `total`
    pub fn amount_paid_cents(&self) -> i64 {
        self.amount_paid.or(self.total).unwrap_or(0)
    }

    pub fn amount_due_cents(&self) -> i64 {
        self.amount_due.or(self.total).unwrap_or(0)
    }

    /// Billing period: the first non-proration line's period, then the
    /// invoice-level period fields.
    pub fn billing_period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let line_period = self
            .lines()
            .iter()
            .filter(|l| !l.proration)
            .find_map(|l| l.period.as_ref());

        match line_period {
            Some(period) if period.start.is_some() || period.end.is_some() => {
                (timestamp(period.start), timestamp(period.end))
            }
            _ => (timestamp(self.period_start), timestamp(self.period_end)),
        }
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        timestamp(self.created)
    }

    pub fn is_paid(&self) -> bool {
        self.status.as_deref() == Some("paid")
    }
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionView {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub items: Option<ListOf<SubscriptionItem>>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub latest_invoice: Option<ObjectRef>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<ObjectRef>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionView {
    fn items(&self) -> &[SubscriptionItem] {
        self.items.as_ref().map(|i| i.data.as_slice()).unwrap_or(&[])
    }

    pub fn customer_ref(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn price_refs(&self) -> Vec<&str> {
        self.items().iter().filter_map(|i| ref_id(&i.price)).collect()
    }

    /// Mapped local status; a missing status maps like any unknown one
    pub fn local_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_external(self.status.as_deref().unwrap_or(""))
    }

    /// Current period: subscription-level fields, then the first item's
    /// (newer API versions only carry it per item).
    pub fn current_period(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        if self.current_period_start.is_some() || self.current_period_end.is_some() {
            return (
                timestamp(self.current_period_start),
                timestamp(self.current_period_end),
            );
        }
        self.items()
            .first()
            .map(|i| {
                (
                    timestamp(i.current_period_start),
                    timestamp(i.current_period_end),
                )
            })
            .unwrap_or((None, None))
    }

    pub fn latest_invoice_ref(&self) -> Option<&str> {
        ref_id(&self.latest_invoice)
    }

    pub fn canceled_at(&self) -> Option<OffsetDateTime> {
        timestamp(self.canceled_at)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| v.as_str())
    }
}

// =============================================================================
// Checkout session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Payment,
    Subscription,
    Other,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CheckoutSessionView {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
}

pub const METADATA_CUSTOMER_ID: &str = "customer_id";
pub const METADATA_PLAN_ID: &str = "plan_id";
pub const METADATA_QUANTITY: &str = "quantity";
pub const METADATA_REFUND_REQUEST_ID: &str = "refund_request_id";

impl CheckoutSessionView {
    pub fn mode(&self) -> CheckoutMode {
        match self.mode.as_deref() {
            Some("payment") => CheckoutMode::Payment,
            Some("subscription") => CheckoutMode::Subscription,
            _ => CheckoutMode::Other,
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| v.as_str())
    }

    /// Local customer id: session metadata, then `client_reference_id`
    pub fn local_customer_id(&self) -> Option<Uuid> {
        self.metadata_value(METADATA_CUSTOMER_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
            .or_else(|| {
                self.client_reference_id
                    .as_deref()
                    .and_then(|v| Uuid::parse_str(v).ok())
            })
    }

    pub fn customer_ref(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn subscription_ref(&self) -> Option<&str> {
        ref_id(&self.subscription)
    }

    pub fn payment_intent_ref(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }

    /// Paid or needs no payment (100% discounts)
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        )
    }
}

// =============================================================================
// Charge, refund, customer
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChargeView {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub invoice: Option<ObjectRef>,
    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: i64,
}

impl ChargeView {
    /// The invoice this charge paid, when the processor recorded one
    pub fn invoice_ref(&self) -> Option<&str> {
        ref_id(&self.invoice)
    }

    pub fn payment_intent_ref(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status.as_deref().map(|s| s == "succeeded").unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RefundView {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub charge: Option<ObjectRef>,
    #[serde(default)]
    pub payment_intent: Option<ObjectRef>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl RefundView {
    /// Refund request an approval created this refund for
    pub fn refund_request_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(METADATA_REFUND_REQUEST_ID))
            .and_then(|v| Uuid::parse_str(v).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomerView {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_ref_accepts_id_or_object() {
        let bare: ObjectRef = serde_json::from_value(json!("ch_1")).unwrap();
        assert_eq!(bare.id(), "ch_1");

        let expanded: ObjectRef =
            serde_json::from_value(json!({"id": "ch_2", "object": "charge", "amount": 100}))
                .unwrap();
        assert_eq!(expanded.id(), "ch_2");
    }

    #[test]
    fn test_invoice_subscription_ref_fallbacks() {
        let top_level: InvoiceView =
            serde_json::from_value(json!({"id": "in_1", "subscription": "sub_1"})).unwrap();
        assert_eq!(top_level.subscription_ref(), Some("sub_1"));

        let parent: InvoiceView = serde_json::from_value(json!({
            "id": "in_2",
            "subscription": null,
            "parent": {"subscription_details": {"subscription": "sub_2"}}
        }))
        .unwrap();
        assert_eq!(parent.subscription_ref(), Some("sub_2"));

        let line: InvoiceView = serde_json::from_value(json!({
            "id": "in_3",
            "lines": {"data": [{"subscription": "sub_3"}]}
        }))
        .unwrap();
        assert_eq!(line.subscription_ref(), Some("sub_3"));

        let none: InvoiceView = serde_json::from_value(json!({"id": "in_4"})).unwrap();
        assert_eq!(none.subscription_ref(), None);
    }

    #[test]
    fn test_invoice_payment_reference_order() {
        let direct: InvoiceView = serde_json::from_value(json!({
            "id": "in_1",
            "payment_intent": "pi_direct",
            "payments": {"data": [{"status": "paid", "payment": {"payment_intent": "pi_list"}}]}
        }))
        .unwrap();
        assert_eq!(direct.payment_reference(), Some("pi_direct"));

        let listed: InvoiceView = serde_json::from_value(json!({
            "id": "in_2",
            "payments": {"data": [
                {"status": "canceled", "payment": {"payment_intent": "pi_old"}},
                {"status": "paid", "payment": {"payment_intent": "pi_list"}}
            ]}
        }))
        .unwrap();
        assert_eq!(listed.payment_reference(), Some("pi_list"));
        assert_eq!(listed.charge_ref(), None);
    }

    #[test]
    fn test_invoice_price_refs_old_and_new_shapes() {
        let invoice: InvoiceView = serde_json::from_value(json!({
            "id": "in_1",
            "lines": {"data": [
                {"price": {"id": "price_old", "object": "price"}},
                {"pricing": {"price_details": {"price": "price_new"}}},
                {"description": "tax"}
            ]}
        }))
        .unwrap();
        assert_eq!(invoice.price_refs(), vec!["price_old", "price_new"]);
    }

    #[test]
    fn test_invoice_billing_period_prefers_regular_line() {
        let invoice: InvoiceView = serde_json::from_value(json!({
            "id": "in_1",
            "period_start": 100,
            "period_end": 200,
            "lines": {"data": [
                {"proration": true, "period": {"start": 1, "end": 2}},
                {"proration": false, "period": {"start": 1_700_000_000, "end": 1_702_592_000}}
            ]}
        }))
        .unwrap();
        let (start, end) = invoice.billing_period();
        assert_eq!(start.unwrap().unix_timestamp(), 1_700_000_000);
        assert_eq!(end.unwrap().unix_timestamp(), 1_702_592_000);

        let bare: InvoiceView =
            serde_json::from_value(json!({"id": "in_2", "period_start": 100, "period_end": 200}))
                .unwrap();
        let (start, end) = bare.billing_period();
        assert_eq!(start.unwrap().unix_timestamp(), 100);
        assert_eq!(end.unwrap().unix_timestamp(), 200);
    }

    #[test]
    fn test_subscription_period_falls_back_to_items() {
        let sub: SubscriptionView = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "items": {"data": [{"price": {"id": "price_1"}, "current_period_start": 10, "current_period_end": 20}]}
        }))
        .unwrap();
        let (start, end) = sub.current_period();
        assert_eq!(start.unwrap().unix_timestamp(), 10);
        assert_eq!(end.unwrap().unix_timestamp(), 20);
        assert_eq!(sub.price_refs(), vec!["price_1"]);
        assert_eq!(sub.local_status(), SubscriptionStatus::Active);
    }

    #[test]
    fn test_checkout_customer_id_fallback() {
        let customer_id = Uuid::new_v4();
        let via_reference: CheckoutSessionView = serde_json::from_value(json!({
            "id": "cs_1",
            "metadata": null,
            "client_reference_id": customer_id.to_string()
        }))
        .unwrap();
        assert_eq!(via_reference.local_customer_id(), Some(customer_id));

        let garbage: CheckoutSessionView = serde_json::from_value(json!({
            "id": "cs_2",
            "metadata": {"customer_id": "not-a-uuid"}
        }))
        .unwrap();
        assert_eq!(garbage.local_customer_id(), None);
    }
}

//! Event allow-list
//!
//! Each webhook endpoint accepts a fixed set of event types. Anything else is
//! acknowledged and dropped so Stripe never retries events this service does
//! not act on.

use crate::objects::WebhookEvent;

/// Which endpoint a delivery arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// One-off credit purchases
    Purchases,
    Subscriptions,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Purchases => "purchases",
            Endpoint::Subscriptions => "subscriptions",
        }
    }
}

/// Handler an accepted event is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PurchaseCompleted,
    SubscriptionCheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    RefundUpdated,
}

/// What a handler did with an accepted event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Business no-op: acknowledged, never retried
    Ignored(String),
}

impl EventOutcome {
    pub fn ignored(reason: impl Into<String>) -> Self {
        EventOutcome::Ignored(reason.into())
    }
}

fn checkout_mode(event: &WebhookEvent) -> Option<&str> {
    event.data.object.get("mode").and_then(|m| m.as_str())
}

/// Pick the handler for an event, or `None` when the endpoint ignores it
pub fn route(endpoint: Endpoint, event: &WebhookEvent) -> Option<Route> {
    let event_type = event.event_type.as_str();

    match (endpoint, event_type) {
        (_, "charge.refund.updated") | (_, "refund.updated") => Some(Route::RefundUpdated),

        (Endpoint::Purchases, "checkout.session.completed") => {
            (checkout_mode(event) == Some("payment")).then_some(Route::PurchaseCompleted)
        }
        (Endpoint::Purchases, "checkout.session.async_payment_succeeded") => {
            Some(Route::PurchaseCompleted)
        }

        (Endpoint::Subscriptions, "checkout.session.completed") => {
            (checkout_mode(event) == Some("subscription"))
                .then_some(Route::SubscriptionCheckoutCompleted)
        }
        (Endpoint::Subscriptions, "customer.subscription.updated") => {
            Some(Route::SubscriptionUpdated)
        }
        (Endpoint::Subscriptions, "customer.subscription.deleted") => {
            Some(Route::SubscriptionDeleted)
        }
        (Endpoint::Subscriptions, "invoice.paid")
        | (Endpoint::Subscriptions, "invoice.payment_succeeded") => Some(Route::InvoicePaid),
        (Endpoint::Subscriptions, "invoice.payment_failed") => Some(Route::InvoicePaymentFailed),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, object: serde_json::Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "livemode": false,
            "created": 1_700_000_000,
            "data": {"object": object}
        }))
        .unwrap()
    }

    #[test]
    fn test_checkout_completed_splits_by_mode() {
        let payment = event("checkout.session.completed", json!({"id": "cs_1", "mode": "payment"}));
        let subscription = event(
            "checkout.session.completed",
            json!({"id": "cs_2", "mode": "subscription"}),
        );

        assert_eq!(
            route(Endpoint::Purchases, &payment),
            Some(Route::PurchaseCompleted)
        );
        assert_eq!(route(Endpoint::Subscriptions, &payment), None);
        assert_eq!(
            route(Endpoint::Subscriptions, &subscription),
            Some(Route::SubscriptionCheckoutCompleted)
        );
        assert_eq!(route(Endpoint::Purchases, &subscription), None);
    }

    #[test]
    fn test_invoice_events_only_on_subscription_endpoint() {
        for kind in ["invoice.paid", "invoice.payment_succeeded"] {
            let e = event(kind, json!({"id": "in_1"}));
            assert_eq!(route(Endpoint::Subscriptions, &e), Some(Route::InvoicePaid));
            assert_eq!(route(Endpoint::Purchases, &e), None);
        }
        let failed = event("invoice.payment_failed", json!({"id": "in_1"}));
        assert_eq!(
            route(Endpoint::Subscriptions, &failed),
            Some(Route::InvoicePaymentFailed)
        );
    }

    #[test]
    fn test_refund_updates_accepted_everywhere() {
        let e = event("charge.refund.updated", json!({"id": "re_1"}));
        assert_eq!(route(Endpoint::Purchases, &e), Some(Route::RefundUpdated));
        assert_eq!(route(Endpoint::Subscriptions, &e), Some(Route::RefundUpdated));
    }

    #[test]
    fn test_unknown_types_are_dropped() {
        for kind in [
            "customer.created",
            "payment_intent.succeeded",
            "invoice.finalized",
            "customer.subscription.trial_will_end",
            "some.future.event",
        ] {
            let e = event(kind, json!({"id": "x"}));
            assert_eq!(route(Endpoint::Subscriptions, &e), None, "{}", kind);
            assert_eq!(route(Endpoint::Purchases, &e), None, "{}", kind);
        }
    }
}

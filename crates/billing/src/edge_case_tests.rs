#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the billing core
//!
//! Drives signed webhook deliveries and service calls against the in-memory
//! store and the scripted gateway. Areas covered:
//! - Invoice replay, reordering and failure-then-success
//! - Duplicate checkout completion
//! - Ledger debits under contention
//! - Refund approval: balance guard, rollback, exclusivity, target search
//! - Terminal CANCELED
//! - Signature, tolerance and live-mode gating
//! - Refund status sync

#[cfg(test)]
mod harness {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::client::StripeConfig;
    use crate::error::BillingResult;
    use crate::mocks::{InMemoryBillingStore, MockGateway};
    use crate::objects::{InvoiceView, SubscriptionView};
    use crate::router::Endpoint;
    use crate::verifier::signature_header;
    use crate::webhooks::WebhookOutcome;
    use crate::BillingService;

    pub const NOW: i64 = 1_700_000_000;
    pub const PRO_PRICE: &str = "price_pro";

    pub struct Harness {
        pub config: StripeConfig,
        pub store: Arc<InMemoryBillingStore>,
        pub gateway: Arc<MockGateway>,
        pub billing: BillingService,
    }

    impl Harness {
        pub fn new() -> Self {
            let config = StripeConfig::for_tests();
            let store = Arc::new(InMemoryBillingStore::new());
            let gateway = Arc::new(MockGateway::new());
            let billing = BillingService::new(config.clone(), store.clone(), gateway.clone());
            Self {
                config,
                store,
                gateway,
                billing,
            }
        }

        pub fn secret(&self, endpoint: Endpoint) -> &str {
            match endpoint {
                Endpoint::Purchases => &self.config.purchases_webhook_secret,
                Endpoint::Subscriptions => &self.config.subscriptions_webhook_secret,
            }
        }

        pub async fn deliver(
            &self,
            endpoint: Endpoint,
            event_id: &str,
            event_type: &str,
            object: Value,
        ) -> BillingResult<WebhookOutcome> {
            let payload = event_payload(event_id, event_type, false, object);
            let header = signature_header(self.secret(endpoint), NOW, &payload);
            self.billing
                .webhooks
                .handle_at(endpoint, &payload, &header, NOW)
                .await
        }
    }

    pub fn event_payload(
        event_id: &str,
        event_type: &str,
        livemode: bool,
        object: Value,
    ) -> String {
        json!({
            "id": event_id,
            "type": event_type,
            "livemode": livemode,
            "created": NOW,
            "data": {"object": object}
        })
        .to_string()
    }

    pub fn invoice_json(id: &str, subscription_ref: &str, status: &str) -> Value {
        json!({
            "id": id,
            "customer": "cus_1",
            "subscription": subscription_ref,
            "status": status,
            "amount_paid": if status == "paid" { 2990 } else { 0 },
            "amount_due": 2990,
            "billing_reason": "subscription_cycle",
            "created": NOW,
            "lines": {"data": [{
                "price": PRO_PRICE,
                "period": {"start": NOW, "end": NOW + 30 * 86_400}
            }]}
        })
    }

    pub fn invoice_view(id: &str, subscription_ref: &str, status: &str) -> InvoiceView {
        serde_json::from_value(invoice_json(id, subscription_ref, status)).unwrap()
    }

    pub fn subscription_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "customer": "cus_1",
            "status": status,
            "items": {"data": [{"price": PRO_PRICE}]},
            "current_period_start": NOW,
            "current_period_end": NOW + 30 * 86_400
        })
    }

    pub fn subscription_view(id: &str, status: &str) -> SubscriptionView {
        serde_json::from_value(subscription_json(id, status)).unwrap()
    }
}

#[cfg(test)]
mod invoice_tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::harness::*;
    use crate::mocks::subscription_fixture;
    use crate::models::{InvoiceStatus, SubscriptionStatus, TransactionKind};
    use crate::router::Endpoint;

    async fn tracked_subscription(h: &Harness) -> (uuid::Uuid, uuid::Uuid) {
        let plan = h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("a@example.com", "cus_1", Decimal::ZERO).await;
        let sub = subscription_fixture(customer.id, plan.id, "sub_1", SubscriptionStatus::Active);
        let sub_id = sub.id;
        h.store.insert_subscription(sub).await;
        (customer.id, sub_id)
    }

    // =========================================================================
    // Failure followed by payment credits once
    // =========================================================================

    #[tokio::test]
    async fn test_failed_then_paid_invoice_credits_once() {
        let h = Harness::new();
        let (customer_id, sub_id) = tracked_subscription(&h).await;

        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "invoice.payment_failed",
            invoice_json("in_1", "sub_1", "open"),
        )
        .await
        .unwrap();
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        h.deliver(
            Endpoint::Subscriptions,
            "evt_2",
            "invoice.paid",
            invoice_json("in_1", "sub_1", "paid"),
        )
        .await
        .unwrap();

        assert_eq!(h.store.balance(customer_id).await, dec!(100));
        let invoices = h.store.invoices().await;
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].status, InvoiceStatus::Paid);
        assert_eq!(invoices[0].credits_granted, dec!(100));

        let logs: Vec<_> = h
            .store
            .logs_for(customer_id)
            .await
            .into_iter()
            .filter(|l| l.kind == TransactionKind::SubscriptionInvoice)
            .collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].amount, dec!(-29.90));
        assert_eq!(logs[1].amount, dec!(29.90));

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Replays of the same paid invoice
    // =========================================================================

    #[tokio::test]
    async fn test_replayed_paid_invoice_is_idempotent() {
        let h = Harness::new();
        let (customer_id, _) = tracked_subscription(&h).await;

        // Stripe sends both event types for one payment, and may redeliver
        for (i, event_type) in ["invoice.paid", "invoice.payment_succeeded", "invoice.paid"]
            .iter()
            .enumerate()
        {
            h.deliver(
                Endpoint::Subscriptions,
                &format!("evt_{}", i),
                event_type,
                invoice_json("in_1", "sub_1", "paid"),
            )
            .await
            .unwrap();
        }

        assert_eq!(h.store.balance(customer_id).await, dec!(100));
        assert_eq!(h.store.invoices().await.len(), 1);
        assert_eq!(h.store.logs_for(customer_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_downgrade_paid_invoice() {
        let h = Harness::new();
        let (customer_id, sub_id) = tracked_subscription(&h).await;

        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "invoice.paid",
            invoice_json("in_1", "sub_1", "paid"),
        )
        .await
        .unwrap();
        h.deliver(
            Endpoint::Subscriptions,
            "evt_2",
            "invoice.payment_failed",
            invoice_json("in_1", "sub_1", "open"),
        )
        .await
        .unwrap();

        assert_eq!(h.store.invoices().await[0].status, InvoiceStatus::Paid);
        assert_eq!(h.store.balance(customer_id).await, dec!(100));
        assert_eq!(h.store.logs_for(customer_id).await.len(), 1);
        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Out-of-order invoices: only the newest one decides status
    // =========================================================================

    #[tokio::test]
    async fn test_older_failed_invoice_after_newer_payment_keeps_active() {
        let h = Harness::new();
        let (customer_id, sub_id) = tracked_subscription(&h).await;

        let mut current = invoice_json("in_2", "sub_1", "paid");
        current["created"] = (NOW + 1_000).into();
        h.deliver(Endpoint::Subscriptions, "evt_1", "invoice.paid", current)
            .await
            .unwrap();

        // Previous cycle's failure, first delivered only now
        let mut previous = invoice_json("in_1", "sub_1", "open");
        previous["created"] = (NOW - 30 * 86_400).into();
        h.deliver(
            Endpoint::Subscriptions,
            "evt_2",
            "invoice.payment_failed",
            previous,
        )
        .await
        .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(h.store.balance(customer_id).await, dec!(100));
        // The failure is still recorded
        assert_eq!(h.store.invoices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_older_paid_invoice_after_newer_failure_keeps_past_due() {
        let h = Harness::new();
        let (customer_id, sub_id) = tracked_subscription(&h).await;

        let mut current = invoice_json("in_2", "sub_1", "open");
        current["created"] = (NOW + 1_000).into();
        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "invoice.payment_failed",
            current,
        )
        .await
        .unwrap();

        let mut previous = invoice_json("in_1", "sub_1", "paid");
        previous["created"] = (NOW - 30 * 86_400).into();
        h.deliver(Endpoint::Subscriptions, "evt_2", "invoice.paid", previous)
            .await
            .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        // Credits for a paid invoice are still granted once
        assert_eq!(h.store.balance(customer_id).await, dec!(100));
    }

    #[tokio::test]
    async fn test_proration_invoice_grants_no_credits() {
        let h = Harness::new();
        let (customer_id, _) = tracked_subscription(&h).await;

        let mut invoice = invoice_json("in_2", "sub_1", "paid");
        invoice["billing_reason"] = "subscription_update".into();
        h.deliver(Endpoint::Subscriptions, "evt_1", "invoice.paid", invoice)
            .await
            .unwrap();

        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
        let invoices = h.store.invoices().await;
        assert_eq!(invoices[0].status, InvoiceStatus::Paid);
        assert_eq!(invoices[0].credits_granted, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_invoice_for_unknown_plan_is_ignored() {
        let h = Harness::new();
        let (customer_id, _) = tracked_subscription(&h).await;

        let mut invoice = invoice_json("in_3", "sub_1", "paid");
        invoice["lines"]["data"][0]["price"] = "price_elsewhere".into();
        let outcome = h
            .deliver(Endpoint::Subscriptions, "evt_1", "invoice.paid", invoice)
            .await
            .unwrap();

        assert!(!outcome.is_processed());
        assert!(h.store.invoices().await.is_empty());
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    // =========================================================================
    // Concurrent deliveries of one invoice
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_invoice_deliveries_credit_exactly_once() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let h = Arc::new(Harness::new());
        let (customer_id, _) = tracked_subscription(&h).await;

        let num_deliveries = 8;
        let barrier = Arc::new(Barrier::new(num_deliveries));
        let mut handles = vec![];

        for i in 0..num_deliveries {
            let h = h.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let event_type = if i % 2 == 0 {
                    "invoice.paid"
                } else {
                    "invoice.payment_succeeded"
                };
                h.deliver(
                    Endpoint::Subscriptions,
                    &format!("evt_{}", i),
                    event_type,
                    invoice_json("in_1", "sub_1", "paid"),
                )
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.store.balance(customer_id).await, dec!(100));
        assert_eq!(h.store.invoices().await.len(), 1);
        assert_eq!(h.store.logs_for(customer_id).await.len(), 1);
    }
}

#[cfg(test)]
mod checkout_tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::harness::*;
    use crate::checkout::CheckoutUi;
    use crate::models::{PurchaseStatus, SubscriptionStatus, TransactionKind};
    use crate::router::Endpoint;

    fn subscription_session(customer_id: uuid::Uuid) -> serde_json::Value {
        json!({
            "id": "cs_sub_1",
            "mode": "subscription",
            "status": "complete",
            "payment_status": "paid",
            "customer": "cus_1",
            "subscription": "sub_9",
            "metadata": {"customer_id": customer_id.to_string()}
        })
    }

    fn seed_processor_subscription(h: &Harness) {
        let mut sub = subscription_view("sub_9", "active");
        sub.latest_invoice = Some(crate::objects::ObjectRef::Id("in_9".into()));
        h.gateway.add_subscription(sub);
        h.gateway.add_invoice(invoice_view("in_9", "sub_9", "paid"));
    }

    // =========================================================================
    // Duplicate checkout completion
    // =========================================================================

    #[tokio::test]
    async fn test_duplicate_checkout_creates_one_subscription() {
        let h = Harness::new();
        h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("a@example.com", "cus_1", Decimal::ZERO).await;
        seed_processor_subscription(&h);

        for event_id in ["evt_1", "evt_2"] {
            h.deliver(
                Endpoint::Subscriptions,
                event_id,
                "checkout.session.completed",
                subscription_session(customer.id),
            )
            .await
            .unwrap();
        }

        let subs = h.store.subscriptions().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].status, SubscriptionStatus::Active);
        assert_eq!(subs[0].external_subscription_ref.as_deref(), Some("sub_9"));

        let stored = h.store.customer(customer.id).await.unwrap();
        assert_eq!(stored.subscription_id, Some(subs[0].id));
        // First invoice credited once across both deliveries
        assert_eq!(stored.balance, dec!(100));
    }

    #[tokio::test]
    async fn test_invoice_before_checkout_is_credited_by_checkout() {
        let h = Harness::new();
        h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("a@example.com", "cus_1", Decimal::ZERO).await;
        seed_processor_subscription(&h);

        let early = h
            .deliver(
                Endpoint::Subscriptions,
                "evt_1",
                "invoice.paid",
                invoice_json("in_9", "sub_9", "paid"),
            )
            .await
            .unwrap();
        assert!(!early.is_processed());
        assert_eq!(h.store.balance(customer.id).await, Decimal::ZERO);

        h.deliver(
            Endpoint::Subscriptions,
            "evt_2",
            "checkout.session.completed",
            subscription_session(customer.id),
        )
        .await
        .unwrap();
        assert_eq!(h.store.balance(customer.id).await, dec!(100));

        // Stripe retries the early event; nothing more is granted
        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "invoice.paid",
            invoice_json("in_9", "sub_9", "paid"),
        )
        .await
        .unwrap();
        assert_eq!(h.store.balance(customer.id).await, dec!(100));
        assert_eq!(h.store.invoices().await.len(), 1);
    }

    // =========================================================================
    // Stripe unavailable mid-checkout
    // =========================================================================

    #[tokio::test]
    async fn test_transient_invoice_read_grants_nothing_until_redelivery() {
        let h = Harness::new();
        h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("a@example.com", "cus_1", Decimal::ZERO).await;
        seed_processor_subscription(&h);
        h.gateway
            .fail_invoice_reads(Some(crate::mocks::ScriptedFailure::Transient));

        let err = h
            .deliver(
                Endpoint::Subscriptions,
                "evt_1",
                "checkout.session.completed",
                subscription_session(customer.id),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.store.balance(customer.id).await, Decimal::ZERO);
        assert!(h.store.invoices().await.is_empty());
        assert!(h.store.logs_for(customer.id).await.is_empty());

        // Stripe redelivers once the outage is over
        h.gateway.fail_invoice_reads(None);
        let outcome = h
            .deliver(
                Endpoint::Subscriptions,
                "evt_1",
                "checkout.session.completed",
                subscription_session(customer.id),
            )
            .await
            .unwrap();

        assert!(outcome.is_processed());
        assert_eq!(h.store.subscriptions().await.len(), 1);
        assert_eq!(h.store.balance(customer.id).await, dec!(100));
        assert_eq!(h.store.invoices().await.len(), 1);
    }

    // =========================================================================
    // Credit purchase completion
    // =========================================================================

    #[tokio::test]
    async fn test_credit_purchase_completes_once() {
        let h = Harness::new();
        let customer = h.store.add_customer("b@example.com", Decimal::ZERO).await;

        let started = h
            .billing
            .checkout
            .start_credit_purchase(customer.id, 10, CheckoutUi::default())
            .await
            .unwrap();
        assert!(started.url.is_some());
        let purchase_id = started.purchase_id.unwrap();

        let session = json!({
            "id": started.session_id,
            "mode": "payment",
            "status": "complete",
            "payment_status": "paid",
            "payment_intent": "pi_1",
            "metadata": {"customer_id": customer.id.to_string(), "quantity": "10"}
        });

        let first = h
            .deliver(Endpoint::Purchases, "evt_1", "checkout.session.completed", session.clone())
            .await
            .unwrap();
        assert!(first.is_processed());
        let second = h
            .deliver(
                Endpoint::Purchases,
                "evt_2",
                "checkout.session.async_payment_succeeded",
                session,
            )
            .await
            .unwrap();
        assert!(!second.is_processed());

        let stored = h.store.customer(customer.id).await.unwrap();
        assert_eq!(stored.balance, dec!(10));
        assert!(stored.has_purchased);

        let purchase = h.billing.purchases.get(purchase_id).await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Paid);
        assert_eq!(purchase.total_price, dec!(15.00));
        assert_eq!(purchase.external_payment_ref.as_deref(), Some("pi_1"));

        let logs = h.store.logs_for(customer.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, TransactionKind::CreditPurchase);
    }

    #[tokio::test]
    async fn test_unpaid_session_completion_waits_for_payment() {
        let h = Harness::new();
        let customer = h.store.add_customer("b@example.com", Decimal::ZERO).await;
        let started = h
            .billing
            .checkout
            .start_credit_purchase(
                customer.id,
                5,
                CheckoutUi::Embedded { return_url: None },
            )
            .await
            .unwrap();
        assert!(started.client_secret.is_some());

        let outcome = h
            .deliver(
                Endpoint::Purchases,
                "evt_1",
                "checkout.session.completed",
                json!({
                    "id": started.session_id,
                    "mode": "payment",
                    "payment_status": "unpaid"
                }),
            )
            .await
            .unwrap();

        assert!(!outcome.is_processed());
        assert_eq!(h.store.balance(customer.id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_subscription_checkout_blocked_while_subscribed() {
        let h = Harness::new();
        let plan = h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("a@example.com", "cus_1", Decimal::ZERO).await;
        h.store
            .insert_subscription(crate::mocks::subscription_fixture(
                customer.id,
                plan.id,
                "sub_1",
                SubscriptionStatus::Active,
            ))
            .await;

        let err = h
            .billing
            .checkout
            .start_subscription(customer.id, plan.id, CheckoutUi::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::BillingError::InvalidState(_)));
        assert!(h.gateway.checkout_requests().is_empty());
    }
}

#[cfg(test)]
mod ledger_tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::Barrier;

    use super::harness::*;
    use crate::error::BillingError;
    use crate::models::TransactionKind;

    // =========================================================================
    // Overdraft
    // =========================================================================

    #[tokio::test]
    async fn test_overdraft_debit_aborts_without_log() {
        let h = Harness::new();
        let customer = h.store.add_customer("c@example.com", dec!(3)).await;

        let err = h
            .billing
            .ledger
            .debit(customer.id, dec!(5), Some("job-1".into()))
            .await
            .unwrap_err();

        match err {
            BillingError::InsufficientBalance {
                requested,
                available,
            } => {
                assert_eq!(requested, dec!(5));
                assert_eq!(available, dec!(3));
            }
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        assert_eq!(h.store.balance(customer.id).await, dec!(3));
        assert!(h.store.logs_for(customer.id).await.is_empty());
    }

    // =========================================================================
    // Concurrent debits never overdraw
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_debits_never_go_negative() {
        let h = Arc::new(Harness::new());
        let customer = h.store.add_customer("c@example.com", dec!(10)).await;

        let num_tasks = 10;
        let barrier = Arc::new(Barrier::new(num_tasks));
        let mut handles = vec![];

        for _ in 0..num_tasks {
            let h = h.clone();
            let barrier = barrier.clone();
            let customer_id = customer.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                h.billing.ledger.debit(customer_id, dec!(3), None).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(after) => {
                    assert!(after.balance >= Decimal::ZERO);
                    succeeded += 1;
                }
                Err(BillingError::InsufficientBalance { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(h.store.balance(customer.id).await, dec!(1));
        let debits = h
            .store
            .logs_for(customer.id)
            .await
            .into_iter()
            .filter(|l| l.kind == TransactionKind::Debit)
            .count();
        assert_eq!(debits, 3);
    }

    #[tokio::test]
    async fn test_transfer_moves_credits_atomically() {
        let h = Harness::new();
        let from = h.store.add_customer("from@example.com", dec!(8)).await;
        let to = h.store.add_customer("to@example.com", dec!(1)).await;

        let err = h
            .billing
            .ledger
            .transfer(from.id, to.id, dec!(9), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { .. }));
        assert_eq!(h.store.balance(to.id).await, dec!(1));

        h.billing
            .ledger
            .transfer(from.id, to.id, dec!(8), Some("gift".into()))
            .await
            .unwrap();
        assert_eq!(h.store.balance(from.id).await, Decimal::ZERO);
        assert_eq!(h.store.balance(to.id).await, dec!(9));
        assert_eq!(h.store.logs_for(from.id).await[0].kind, TransactionKind::TransferOut);
        assert_eq!(h.store.logs_for(to.id).await[0].kind, TransactionKind::TransferIn);
    }
}

#[cfg(test)]
mod refund_tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    use super::harness::*;
    use crate::error::{BillingError, ErrorKind};
    use crate::gateway::RefundTarget;
    use crate::mocks::{purchase_fixture, subscription_fixture, ScriptedFailure};
    use crate::models::{
        PurchaseStatus, RefundRequestKind, RefundRequestStatus, RefundStatus, SubscriptionStatus,
        TransactionKind,
    };
    use crate::objects::{ChargeView, ObjectRef, RefundView};
    use crate::router::Endpoint;

    /// A customer holding `balance` credits and a paid purchase of 10 credits
    async fn paid_purchase(h: &Harness, balance: Decimal) -> (Uuid, Uuid) {
        let customer = h.store.add_customer("d@example.com", balance).await;
        let mut purchase =
            purchase_fixture(customer.id, "cs_pay_1", 10, dec!(1.50), PurchaseStatus::Paid);
        purchase.external_payment_ref = Some("pi_1".into());
        let purchase_id = purchase.id;
        h.store.insert_purchase(purchase).await;
        (customer.id, purchase_id)
    }

    /// A tracked subscription whose invoice `in_1` granted 100 credits
    async fn refundable_subscription(h: &Harness) -> (Uuid, Uuid) {
        let plan = h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("e@example.com", "cus_1", Decimal::ZERO).await;
        let sub = subscription_fixture(customer.id, plan.id, "sub_1", SubscriptionStatus::Active);
        let sub_id = sub.id;
        h.store.insert_subscription(sub).await;
        h.gateway.add_subscription(subscription_view("sub_1", "active"));
        h.gateway.add_invoice(invoice_view("in_1", "sub_1", "paid"));

        h.deliver(
            Endpoint::Subscriptions,
            "evt_paid",
            "invoice.paid",
            invoice_json("in_1", "sub_1", "paid"),
        )
        .await
        .unwrap();
        assert_eq!(h.store.balance(customer.id).await, dec!(100));
        (customer.id, sub_id)
    }

    // =========================================================================
    // Balance guard runs before any money moves
    // =========================================================================

    #[tokio::test]
    async fn test_purchase_refund_with_spent_credits_is_rejected() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(2)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();

        let err = h
            .billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(h.gateway.refund_requests().is_empty());
        assert_eq!(h.store.balance(customer_id).await, dec!(2));
        let purchase = h.billing.purchases.get(purchase_id).await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Paid);
    }

    #[tokio::test]
    async fn test_purchase_refund_approval_revokes_and_refunds() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(12)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, Some("unused".into()))
            .await
            .unwrap();
        let admin_id = Uuid::new_v4();

        let result = h
            .billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, admin_id)
            .await
            .unwrap();

        assert_eq!(result.request.status, RefundRequestStatus::Approved);
        assert_eq!(result.request.decided_by, Some(admin_id));
        assert_eq!(result.credits_revoked, dec!(10));
        assert!(result.warning.is_none());
        assert_eq!(result.refund.unwrap().status, RefundStatus::Pending);

        assert_eq!(h.store.balance(customer_id).await, dec!(2));
        let purchase = h.billing.purchases.get(purchase_id).await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Canceled);

        let sent = h.gateway.refund_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, RefundTarget::PaymentIntent("pi_1".into()));
        assert_eq!(sent[0].amount_cents, Some(1500));

        let logs = h.store.logs_for(customer_id).await;
        let refund_log = logs
            .iter()
            .find(|l| l.kind == TransactionKind::PurchaseRefund)
            .unwrap();
        assert_eq!(refund_log.credits, dec!(-10));
    }

    // =========================================================================
    // Processor failure rolls back the whole approval
    // =========================================================================

    #[tokio::test]
    async fn test_refund_failure_rolls_back_approval() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(10)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();

        h.gateway.fail_refunds(Some(ScriptedFailure::Transient));
        let err = h
            .billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(h.store.balance(customer_id).await, dec!(10));
        assert!(h.store.refunds().await.is_empty());
        let purchase = h.billing.purchases.get(purchase_id).await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Paid);

        // Same request approved once the processor recovers
        h.gateway.fail_refunds(None);
        h.billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
        assert_eq!(h.gateway.refunds_created(), 1);
    }

    // =========================================================================
    // Exclusivity
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_approvals_refund_once() {
        let h = Arc::new(Harness::new());
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(10)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();

        let num_admins = 4;
        let barrier = Arc::new(tokio::sync::Barrier::new(num_admins));
        let mut handles = vec![];
        for _ in 0..num_admins {
            let h = h.clone();
            let barrier = barrier.clone();
            let request_id = request.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                h.billing
                    .approvals
                    .approve(RefundRequestKind::CreditPurchase, request_id, Uuid::new_v4())
                    .await
            }));
        }

        let mut approved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => approved += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
            }
        }

        assert_eq!(approved, 1);
        assert_eq!(h.gateway.refunds_created(), 1);
        assert_eq!(h.store.refunds().await.len(), 1);
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_pending_request_rejected() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(10)).await;
        h.billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();

        let err = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, Some("again".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateRefundRequest(_)));
    }

    #[tokio::test]
    async fn test_denied_request_changes_nothing_and_stays_decided() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(10)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();

        let denied = h
            .billing
            .approvals
            .deny(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(denied.status, RefundRequestStatus::Denied);
        assert_eq!(h.store.balance(customer_id).await, dec!(10));

        let err = h
            .billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::RequestAlreadyDecided(_)));
        assert!(h.gateway.refund_requests().is_empty());
    }

    // =========================================================================
    // Subscription refunds and the charge search
    // =========================================================================

    #[tokio::test]
    async fn test_subscription_refund_without_target_warns_and_cancels() {
        let h = Harness::new();
        let (customer_id, sub_id) = refundable_subscription(&h).await;
        let request = h
            .billing
            .approvals
            .request_subscription_refund(customer_id, sub_id, None)
            .await
            .unwrap();

        let result = h
            .billing
            .approvals
            .approve(RefundRequestKind::Subscription, request.id, Uuid::new_v4())
            .await
            .unwrap();

        assert!(result.warning.is_some());
        assert!(result.refund.is_none());
        assert_eq!(result.credits_revoked, dec!(100));
        assert!(h.gateway.refund_requests().is_empty());
        assert_eq!(h.gateway.list_charges_calls(), 1);
        assert_eq!(h.gateway.canceled_subscriptions(), vec!["sub_1".to_string()]);

        let customer = h.store.customer(customer_id).await.unwrap();
        assert_eq!(customer.balance, Decimal::ZERO);
        assert_eq!(customer.subscription_id, None);
        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);

        let log = h
            .store
            .logs_for(customer_id)
            .await
            .into_iter()
            .find(|l| l.kind == TransactionKind::SubscriptionRefund)
            .unwrap();
        assert_eq!(log.status, "MANUAL");
    }

    #[tokio::test]
    async fn test_subscription_refund_finds_charge_by_search() {
        let h = Harness::new();
        let (customer_id, sub_id) = refundable_subscription(&h).await;
        h.gateway.add_charge(
            "cus_1",
            ChargeView {
                id: "ch_other".into(),
                invoice: Some(ObjectRef::Id("in_0".into())),
                status: Some("succeeded".into()),
                amount: 2990,
                created: NOW - 30 * 86_400,
                ..Default::default()
            },
        );
        h.gateway.add_charge(
            "cus_1",
            ChargeView {
                id: "ch_1".into(),
                invoice: Some(ObjectRef::Id("in_1".into())),
                status: Some("succeeded".into()),
                amount: 2990,
                created: NOW + 60,
                ..Default::default()
            },
        );

        let request = h
            .billing
            .approvals
            .request_subscription_refund(customer_id, sub_id, None)
            .await
            .unwrap();
        let result = h
            .billing
            .approvals
            .approve(RefundRequestKind::Subscription, request.id, Uuid::new_v4())
            .await
            .unwrap();

        assert!(result.warning.is_none());
        assert!(result.refund.is_some());
        let sent = h.gateway.refund_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, RefundTarget::Charge("ch_1".into()));
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_subscription_refund_with_spent_credits_is_rejected() {
        let h = Harness::new();
        let (customer_id, sub_id) = refundable_subscription(&h).await;
        h.billing
            .ledger
            .debit(customer_id, dec!(1), None)
            .await
            .unwrap();
        let request = h
            .billing
            .approvals
            .request_subscription_refund(customer_id, sub_id, None)
            .await
            .unwrap();

        let err = h
            .billing
            .approvals
            .approve(RefundRequestKind::Subscription, request.id, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::InsufficientBalance { .. }));
        assert!(h.gateway.canceled_subscriptions().is_empty());
        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Refund status sync
    // =========================================================================

    #[tokio::test]
    async fn test_refund_status_sync_is_monotonic() {
        let h = Harness::new();
        let (customer_id, purchase_id) = paid_purchase(&h, dec!(10)).await;
        let request = h
            .billing
            .approvals
            .request_purchase_refund(customer_id, purchase_id, None)
            .await
            .unwrap();
        let result = h
            .billing
            .approvals
            .approve(RefundRequestKind::CreditPurchase, request.id, Uuid::new_v4())
            .await
            .unwrap();
        let refund_ref = result.refund.unwrap().external_refund_ref;

        let succeeded = h
            .deliver(
                Endpoint::Purchases,
                "evt_r1",
                "refund.updated",
                json!({"id": refund_ref, "status": "succeeded"}),
            )
            .await
            .unwrap();
        assert!(succeeded.is_processed());

        let late_failure = h
            .deliver(
                Endpoint::Subscriptions,
                "evt_r2",
                "charge.refund.updated",
                json!({"id": refund_ref, "status": "failed"}),
            )
            .await
            .unwrap();
        assert!(!late_failure.is_processed());

        let refunds = h.store.refunds().await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].status, RefundStatus::Succeeded);
    }

    fn stripe_refund(id: &str, request_id: Option<Uuid>) -> RefundView {
        RefundView {
            id: id.to_string(),
            status: Some("pending".to_string()),
            amount: Some(1500),
            metadata: request_id.map(|id| {
                [("refund_request_id".to_string(), id.to_string())]
                    .into_iter()
                    .collect()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refund_update_before_approval_is_recorded_is_retried() {
        let h = Harness::new();
        // Created at Stripe by an approval whose transaction has not committed
        h.gateway
            .add_refund(stripe_refund("re_inflight", Some(Uuid::new_v4())));

        let err = h
            .deliver(
                Endpoint::Purchases,
                "evt_r1",
                "refund.updated",
                json!({"id": "re_inflight", "status": "succeeded"}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ConcurrentModification(_)));
        assert!(err.is_retryable());
        assert!(h.store.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn test_refund_update_metadata_in_payload_skips_stripe_read() {
        let h = Harness::new();
        h.gateway.fail_reads(Some(ScriptedFailure::Transient));

        let err = h
            .deliver(
                Endpoint::Purchases,
                "evt_r1",
                "charge.refund.updated",
                json!({
                    "id": "re_inflight",
                    "status": "failed",
                    "metadata": {"refund_request_id": Uuid::new_v4().to_string()}
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_refund_update_for_foreign_refund_is_ignored() {
        let h = Harness::new();
        // Issued from the Stripe dashboard, not through an approval
        h.gateway.add_refund(stripe_refund("re_dashboard", None));

        let outcome = h
            .deliver(
                Endpoint::Purchases,
                "evt_r1",
                "refund.updated",
                json!({"id": "re_dashboard", "status": "succeeded"}),
            )
            .await
            .unwrap();

        assert!(!outcome.is_processed());
        assert!(h.store.refunds().await.is_empty());
    }
}

#[cfg(test)]
mod subscription_lifecycle_tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    use super::harness::*;
    use crate::error::BillingError;
    use crate::mocks::subscription_fixture;
    use crate::models::SubscriptionStatus;
    use crate::router::Endpoint;

    async fn active_subscription(h: &Harness) -> (Uuid, Uuid) {
        let plan = h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("f@example.com", "cus_1", Decimal::ZERO).await;
        let sub = subscription_fixture(customer.id, plan.id, "sub_1", SubscriptionStatus::Active);
        let sub_id = sub.id;
        h.store.insert_subscription(sub).await;
        h.gateway.add_subscription(subscription_view("sub_1", "active"));
        (customer.id, sub_id)
    }

    // =========================================================================
    // CANCELED is terminal
    // =========================================================================

    #[tokio::test]
    async fn test_canceled_subscription_never_reactivates() {
        let h = Harness::new();
        let (customer_id, sub_id) = active_subscription(&h).await;

        let mut deleted = subscription_json("sub_1", "canceled");
        deleted["canceled_at"] = json!(NOW);
        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "customer.subscription.deleted",
            deleted,
        )
        .await
        .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
        assert_eq!(h.store.customer(customer_id).await.unwrap().subscription_id, None);

        // A stale update claiming the subscription is active again
        let outcome = h
            .deliver(
                Endpoint::Subscriptions,
                "evt_2",
                "customer.subscription.updated",
                subscription_json("sub_1", "active"),
            )
            .await
            .unwrap();
        assert!(!outcome.is_processed());

        // And a late payment for it
        h.deliver(
            Endpoint::Subscriptions,
            "evt_3",
            "invoice.paid",
            invoice_json("in_late", "sub_1", "paid"),
        )
        .await
        .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(h.store.customer(customer_id).await.unwrap().subscription_id, None);
    }

    #[tokio::test]
    async fn test_update_event_never_cancels() {
        let h = Harness::new();
        let (_, sub_id) = active_subscription(&h).await;

        // The processor already reports canceled, but only the deletion
        // event may move the local row there
        let mut ending = subscription_view("sub_1", "canceled");
        ending.cancel_at_period_end = true;
        h.gateway.add_subscription(ending);

        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "customer.subscription.updated",
            subscription_json("sub_1", "active"),
        )
        .await
        .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_past_due_update_is_synced() {
        let h = Harness::new();
        let (_, sub_id) = active_subscription(&h).await;
        h.gateway.add_subscription(subscription_view("sub_1", "past_due"));

        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "customer.subscription.updated",
            subscription_json("sub_1", "active"),
        )
        .await
        .unwrap();

        let sub = h.billing.subscriptions.get(sub_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    // =========================================================================
    // Cancel at period end
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_at_period_end_keeps_status() {
        let h = Harness::new();
        let (customer_id, sub_id) = active_subscription(&h).await;

        let updated = h
            .billing
            .subscriptions
            .set_cancel_at_period_end(customer_id, sub_id, true)
            .await
            .unwrap();
        assert!(updated.cancel_at_period_end);
        assert_eq!(updated.status, SubscriptionStatus::Active);

        let err = h
            .billing
            .subscriptions
            .set_cancel_at_period_end(Uuid::new_v4(), sub_id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_refund_request_for_canceled_subscription_rejected() {
        let h = Harness::new();
        let (customer_id, sub_id) = active_subscription(&h).await;
        h.deliver(
            Endpoint::Subscriptions,
            "evt_1",
            "customer.subscription.deleted",
            subscription_json("sub_1", "canceled"),
        )
        .await
        .unwrap();

        let err = h
            .billing
            .approvals
            .request_subscription_refund(customer_id, sub_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }
}

#[cfg(test)]
mod ingress_tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::harness::*;
    use crate::error::BillingError;
    use crate::mocks::subscription_fixture;
    use crate::models::SubscriptionStatus;
    use crate::router::Endpoint;
    use crate::verifier::signature_header;
    use crate::webhooks::WebhookOutcome;

    async fn tracked(h: &Harness) -> uuid::Uuid {
        let plan = h.store.add_plan("Pro", PRO_PRICE, dec!(100), 1).await;
        let customer = h.store.add_linked_customer("g@example.com", "cus_1", Decimal::ZERO).await;
        h.store
            .insert_subscription(subscription_fixture(
                customer.id,
                plan.id,
                "sub_1",
                SubscriptionStatus::Active,
            ))
            .await;
        customer.id
    }

    // =========================================================================
    // Signature gating
    // =========================================================================

    #[tokio::test]
    async fn test_wrong_endpoint_secret_is_rejected_before_any_write() {
        let h = Harness::new();
        let customer_id = tracked(&h).await;

        let payload = event_payload(
            "evt_1",
            "invoice.paid",
            false,
            invoice_json("in_1", "sub_1", "paid"),
        );
        // Signed for the purchases endpoint, delivered to subscriptions
        let header = signature_header(&h.config.purchases_webhook_secret, NOW, &payload);
        let err = h
            .billing
            .webhooks
            .handle_at(Endpoint::Subscriptions, &payload, &header, NOW)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(h.store.invoices().await.is_empty());
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stale_signature_is_rejected() {
        let h = Harness::new();
        tracked(&h).await;

        let payload = event_payload(
            "evt_1",
            "invoice.paid",
            false,
            invoice_json("in_1", "sub_1", "paid"),
        );
        let signed_at = NOW - h.config.webhook_tolerance_secs - 1;
        let header = signature_header(&h.config.subscriptions_webhook_secret, signed_at, &payload);
        let err = h
            .billing
            .webhooks
            .handle_at(Endpoint::Subscriptions, &payload, &header, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_tampered_payload_is_rejected() {
        let h = Harness::new();
        tracked(&h).await;

        let payload = event_payload(
            "evt_1",
            "invoice.paid",
            false,
            invoice_json("in_1", "sub_1", "paid"),
        );
        let header = signature_header(&h.config.subscriptions_webhook_secret, NOW, &payload);
        let tampered = payload.replace("2990", "99990");
        let err = h
            .billing
            .webhooks
            .handle_at(Endpoint::Subscriptions, &tampered, &header, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(h.store.invoices().await.is_empty());
    }

    // =========================================================================
    // Mode and allow-list
    // =========================================================================

    #[tokio::test]
    async fn test_livemode_mismatch_is_ignored() {
        let h = Harness::new();
        let customer_id = tracked(&h).await;

        let payload = event_payload(
            "evt_1",
            "invoice.paid",
            true,
            invoice_json("in_1", "sub_1", "paid"),
        );
        let header = signature_header(&h.config.subscriptions_webhook_secret, NOW, &payload);
        let outcome = h
            .billing
            .webhooks
            .handle_at(Endpoint::Subscriptions, &payload, &header, NOW)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                event_id: Some("evt_1".into()),
                reason: "livemode mismatch".into(),
            }
        );
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_subscription_events_ignored_on_purchases_endpoint() {
        let h = Harness::new();
        let customer_id = tracked(&h).await;

        let outcome = h
            .deliver(
                Endpoint::Purchases,
                "evt_1",
                "invoice.paid",
                invoice_json("in_1", "sub_1", "paid"),
            )
            .await
            .unwrap();

        assert!(!outcome.is_processed());
        assert!(h.store.invoices().await.is_empty());
        assert_eq!(h.store.balance(customer_id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unreadable_verified_payload_is_acknowledged() {
        let h = Harness::new();
        let payload = "{\"not\": \"an event\"}";
        let header = signature_header(&h.config.purchases_webhook_secret, NOW, payload);

        let outcome = h
            .billing
            .webhooks
            .handle_at(Endpoint::Purchases, payload, &header, NOW)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { event_id: None, .. }));
    }
}

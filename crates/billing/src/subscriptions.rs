//! Subscription and invoice state machine
//!
//! ```text
//! PENDING -> ACTIVE <-> PAST_DUE -> CANCELED
//! ```
//!
//! CANCELED is terminal. Only the deletion event, a refund approval or an
//! explicit cancel moves a subscription there; `customer.subscription.updated`
//! never does. Webhooks can arrive in any order, so handlers re-read current
//! state from Stripe where it matters and every transition is idempotent.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::models::{
    amount_from_cents, Customer, InvoiceStatus, Plan, Subscription, SubscriptionStatus,
};
use crate::objects::{CheckoutSessionView, InvoiceView, SubscriptionView, METADATA_CUSTOMER_ID};
use crate::router::EventOutcome;
use crate::store::{
    BillingStore, InvoiceApplication, InvoiceOutcome, InvoiceTransition, NewSubscription,
    SubscriptionSync,
};

/// Status a sync may write, given what is stored.
///
/// A canceled row never changes, and a sync never cancels: an incoming
/// CANCELED keeps the current status until the deletion event arrives.
pub(crate) fn synced_status(
    current: SubscriptionStatus,
    incoming: SubscriptionStatus,
) -> SubscriptionStatus {
    if current.is_terminal() || incoming.is_terminal() {
        current
    } else {
        incoming
    }
}

/// Subscription status after an invoice event, `None` to leave it alone.
///
/// Replays change nothing, so an old `invoice.paid` redelivered after a newer
/// failure does not flip the subscription back to ACTIVE. Only the newest
/// invoice of a subscription decides: `superseded` is true when another
/// invoice issued later is already stored.
pub(crate) fn status_after_invoice(
    transition: InvoiceTransition,
    final_status: InvoiceStatus,
    superseded: bool,
) -> Option<SubscriptionStatus> {
    match (transition, final_status) {
        (InvoiceTransition::Unchanged, _) => None,
        _ if superseded => None,
        (_, InvoiceStatus::Paid) => Some(SubscriptionStatus::Active),
        (_, InvoiceStatus::Failed) => Some(SubscriptionStatus::PastDue),
    }
}

/// Whether `other` was issued after an invoice issued at `issued_at`.
/// Invoices without an issue time never supersede or get superseded.
pub(crate) fn issued_later(
    issued_at: Option<OffsetDateTime>,
    other: Option<OffsetDateTime>,
) -> bool {
    matches!((issued_at, other), (Some(mine), Some(theirs)) if theirs > mine)
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    async fn plan_for_prices(&self, price_refs: Vec<&str>) -> BillingResult<Option<Plan>> {
        if price_refs.is_empty() {
            return Ok(None);
        }
        let owned: Vec<String> = price_refs.into_iter().map(str::to_string).collect();
        self.store.find_plan_by_price_refs(&owned).await
    }

    /// Local customer for a checkout: session metadata, then
    /// `client_reference_id`, then subscription metadata, then the Stripe
    /// customer back-reference.
    async fn resolve_customer(
        &self,
        session: &CheckoutSessionView,
        subscription: &SubscriptionView,
    ) -> BillingResult<Option<Customer>> {
        let local_id = session.local_customer_id().or_else(|| {
            subscription
                .metadata_value(METADATA_CUSTOMER_ID)
                .and_then(|v| Uuid::parse_str(v).ok())
        });

        if let Some(id) = local_id {
            if let Some(customer) = self.store.get_customer(id).await? {
                return Ok(Some(customer));
            }
        }

        match session.customer_ref().or_else(|| subscription.customer_ref()) {
            Some(external_ref) => self.store.find_customer_by_external_ref(external_ref).await,
            None => Ok(None),
        }
    }

    /// `checkout.session.completed` in subscription mode
    pub async fn handle_checkout_completed(
        &self,
        session: &CheckoutSessionView,
    ) -> BillingResult<EventOutcome> {
        let Some(subscription_ref) = session.subscription_ref() else {
            return Ok(EventOutcome::ignored("checkout session has no subscription"));
        };

        let current = self.gateway.retrieve_subscription(subscription_ref).await?;

        let Some(plan) = self.plan_for_prices(current.price_refs()).await? else {
            tracing::warn!(
                session_id = %session.id,
                subscription_ref = subscription_ref,
                "Checkout for a price outside the plan catalog"
            );
            return Ok(EventOutcome::ignored("no known plan for subscription prices"));
        };

        let Some(customer) = self.resolve_customer(session, &current).await? else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout completed for an unknown customer"
            );
            return Ok(EventOutcome::ignored("customer not found"));
        };

        if customer.external_customer_ref.is_none() {
            if let Some(external_ref) = session.customer_ref() {
                self.store
                    .set_customer_external_ref(customer.id, external_ref)
                    .await?;
            }
        }

        let (period_start, period_end) = current.current_period();
        let upsert = self
            .store
            .upsert_checkout_subscription(NewSubscription {
                customer_id: customer.id,
                plan_id: plan.id,
                status: current.local_status(),
                external_subscription_ref: Some(current.id.clone()),
                external_checkout_ref: session.id.clone(),
                current_period_start: period_start,
                current_period_end: period_end,
                cancel_at_period_end: current.cancel_at_period_end,
            })
            .await?;

        tracing::info!(
            subscription_id = %upsert.subscription.id,
            customer_id = %customer.id,
            plan = %plan.name,
            status = %upsert.subscription.status,
            created = upsert.created,
            "Subscription checkout reconciled"
        );

        self.credit_first_invoice(&upsert.subscription, &plan, &current)
            .await?;

        Ok(EventOutcome::Applied)
    }

    /// Credit the subscription's latest invoice if it is already paid.
    ///
    /// Covers `invoice.paid` arriving before the checkout event, when the
    /// invoice handler could not find the subscription yet.
    async fn credit_first_invoice(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        current: &SubscriptionView,
    ) -> BillingResult<()> {
        let Some(invoice_ref) = current.latest_invoice_ref() else {
            return Ok(());
        };

        let invoice = self.gateway.retrieve_invoice(invoice_ref).await?;
        if !invoice.is_paid() {
            tracing::debug!(
                invoice_ref = invoice_ref,
                status = ?invoice.status,
                "First invoice not paid yet"
            );
            return Ok(());
        }

        self.apply_invoice(subscription, plan, &invoice, InvoiceStatus::Paid)
            .await
            .map(|_| ())
    }

    /// `customer.subscription.updated`.
    ///
    /// The payload may be stale, so the current subscription is fetched.
    pub async fn handle_subscription_updated(
        &self,
        event_subscription: &SubscriptionView,
    ) -> BillingResult<EventOutcome> {
        let Some(local) = self
            .store
            .find_subscription_by_external_ref(&event_subscription.id)
            .await?
        else {
            return Ok(EventOutcome::ignored("subscription not tracked locally"));
        };

        if local.status.is_terminal() {
            return Ok(EventOutcome::ignored("subscription already canceled"));
        }

        let current = self
            .gateway
            .retrieve_subscription(&event_subscription.id)
            .await?;

        let Some(plan) = self.plan_for_prices(current.price_refs()).await? else {
            return Ok(EventOutcome::ignored("no known plan for subscription prices"));
        };

        let (period_start, period_end) = current.current_period();
        let incoming = current.local_status();
        let synced = self
            .store
            .sync_subscription(SubscriptionSync {
                external_subscription_ref: current.id.clone(),
                plan_id: plan.id,
                status: incoming,
                current_period_start: period_start,
                current_period_end: period_end,
                cancel_at_period_end: current.cancel_at_period_end,
            })
            .await?;

        match synced {
            Some(subscription) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    from = %local.status,
                    to = %subscription.status,
                    external_status = ?current.status,
                    cancel_at_period_end = subscription.cancel_at_period_end,
                    "Subscription synced"
                );
                Ok(EventOutcome::Applied)
            }
            None => Ok(EventOutcome::ignored("subscription canceled concurrently")),
        }
    }

    /// `customer.subscription.deleted`
    pub async fn handle_subscription_deleted(
        &self,
        deleted: &SubscriptionView,
    ) -> BillingResult<EventOutcome> {
        if self.plan_for_prices(deleted.price_refs()).await?.is_none() {
            return Ok(EventOutcome::ignored("no known plan for subscription prices"));
        }

        let canceled_at = deleted
            .canceled_at()
            .unwrap_or_else(OffsetDateTime::now_utc);

        match self
            .store
            .mark_subscription_canceled(&deleted.id, canceled_at)
            .await?
        {
            Some(subscription) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    customer_id = %subscription.customer_id,
                    "Subscription canceled"
                );
                Ok(EventOutcome::Applied)
            }
            None => Ok(EventOutcome::ignored("subscription not tracked locally")),
        }
    }

    /// `invoice.paid` / `invoice.payment_succeeded` / `invoice.payment_failed`
    pub async fn handle_invoice(
        &self,
        invoice: &InvoiceView,
        status: InvoiceStatus,
    ) -> BillingResult<EventOutcome> {
        let Some(subscription_ref) = invoice.subscription_ref() else {
            return Ok(EventOutcome::ignored("invoice is not for a subscription"));
        };

        let Some(plan) = self.plan_for_prices(invoice.price_refs()).await? else {
            return Ok(EventOutcome::ignored("no known plan for invoice prices"));
        };

        let Some(subscription) = self
            .store
            .find_subscription_by_external_ref(subscription_ref)
            .await?
        else {
            // The checkout handler credits the first invoice once it runs
            tracing::warn!(
                invoice_id = %invoice.id,
                subscription_ref = subscription_ref,
                "Invoice for a subscription not tracked yet"
            );
            return Ok(EventOutcome::ignored("subscription not tracked locally"));
        };

        self.apply_invoice(&subscription, &plan, invoice, status)
            .await?;
        Ok(EventOutcome::Applied)
    }

    async fn apply_invoice(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        invoice: &InvoiceView,
        status: InvoiceStatus,
    ) -> BillingResult<InvoiceOutcome> {
        let cents = match status {
            InvoiceStatus::Paid => invoice.amount_paid_cents(),
            InvoiceStatus::Failed => invoice.amount_due_cents(),
        };
        let (period_start, period_end) = invoice.billing_period();

        let outcome = self
            .store
            .apply_invoice(InvoiceApplication {
                external_invoice_ref: invoice.id.clone(),
                customer_id: subscription.customer_id,
                subscription_id: Some(subscription.id),
                plan_id: plan.id,
                monthly_credits: plan.monthly_credits,
                amount: amount_from_cents(cents),
                status,
                billing_reason: invoice.billing_reason.clone(),
                period_start,
                period_end,
                issued_at: invoice.created_at(),
            })
            .await?;

        if outcome.credits_granted > Decimal::ZERO {
            tracing::info!(
                invoice_id = %invoice.id,
                customer_id = %subscription.customer_id,
                credits = %outcome.credits_granted,
                "Invoice credits granted"
            );
        } else {
            tracing::info!(
                invoice_id = %invoice.id,
                status = ?outcome.invoice.status,
                transition = ?outcome.transition,
                "Invoice recorded"
            );
        }

        Ok(outcome)
    }

    /// Customer-initiated cancel (or resume) at the end of the current period.
    ///
    /// The subscription stays in its current status; CANCELED arrives later
    /// with the deletion event.
    pub async fn set_cancel_at_period_end(
        &self,
        customer_id: Uuid,
        subscription_id: Uuid,
        cancel: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .filter(|s| s.customer_id == customer_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if subscription.status.is_terminal() {
            return Err(BillingError::InvalidState(format!(
                "subscription {} is already canceled",
                subscription_id
            )));
        }

        let external_ref = subscription.external_subscription_ref.as_deref().ok_or_else(|| {
            BillingError::InvalidState(format!(
                "subscription {} has no Stripe subscription",
                subscription_id
            ))
        })?;

        self.gateway
            .set_cancel_at_period_end(external_ref, cancel)
            .await?;
        let updated = self
            .store
            .set_cancel_at_period_end(subscription_id, cancel)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            customer_id = %customer_id,
            cancel_at_period_end = cancel,
            "Cancel at period end updated"
        );
        Ok(updated)
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))
    }
}

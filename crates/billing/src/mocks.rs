//! In-memory store and scripted Stripe gateway for tests
//!
//! [`InMemoryBillingStore`] applies the same decision functions as the
//! Postgres store. Every method works on a copy of the state and swaps it in
//! only on success, so a failed operation leaves nothing behind.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::approvals::{check_pending, check_purchase_refund, check_subscription_refund};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargePage, ChargeQuery, CheckoutSessionRequest, CheckoutUiMode, CreateCustomerRequest,
    CreateRefundRequest, PaymentGateway, RefundTarget,
};
use crate::ledger::plan_invoice;
use crate::models::{
    amount_from_cents, Customer, InvoiceRecord, InvoiceStatus, NewTransactionLog, Plan, Purchase,
    PurchaseStatus, RefundRecord, RefundRequest, RefundRequestKind, RefundRequestStatus,
    RefundStatus, Subscription, SubscriptionStatus, TransactionKind, TransactionLog,
};
use crate::objects::{
    ChargeView, CheckoutMode, CheckoutSessionView, CustomerView, InvoiceView, ObjectRef,
    RefundView, SubscriptionView,
};
use crate::refund::refund_transition_allowed;
use crate::store::{
    ApprovedRefund, BalanceChange, BalanceDirection, BalanceTransfer, BillingStore,
    CheckoutUpsert, InvoiceApplication, InvoiceOutcome, InvoiceTransition, NewPurchase,
    NewRefundRequest, NewSubscription, Page, PageRequest, PurchaseCompleted, PurchaseCompletion,
    RefundApproval, RefundEffect, RefundStatusUpdate, SubscriptionSync,
};
use crate::subscriptions::{issued_later, status_after_invoice, synced_status};

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone, Default)]
struct StoreState {
    customers: HashMap<Uuid, Customer>,
    plans: Vec<Plan>,
    subscriptions: Vec<Subscription>,
    invoices: Vec<InvoiceRecord>,
    purchases: Vec<Purchase>,
    refund_requests: Vec<RefundRequest>,
    refunds: Vec<RefundRecord>,
    logs: Vec<TransactionLog>,
}

impl StoreState {
    fn customer_mut(&mut self, id: Uuid) -> BillingResult<&mut Customer> {
        self.customers
            .get_mut(&id)
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
    }

    fn credit(
        &mut self,
        id: Uuid,
        amount: Decimal,
        mark_purchased: bool,
    ) -> BillingResult<Customer> {
        let customer = self.customer_mut(id)?;
        customer.balance += amount;
        customer.has_purchased |= mark_purchased;
        Ok(customer.clone())
    }

    fn debit(&mut self, id: Uuid, amount: Decimal) -> BillingResult<Customer> {
        let customer = self.customer_mut(id)?;
        if customer.balance < amount {
            return Err(BillingError::InsufficientBalance {
                requested: amount,
                available: customer.balance,
            });
        }
        customer.balance -= amount;
        Ok(customer.clone())
    }

    fn log(&mut self, log: NewTransactionLog) {
        self.logs.push(log.into_log(OffsetDateTime::now_utc()));
    }

    fn subscription_by_external_ref(&mut self, external_ref: &str) -> Option<&mut Subscription> {
        self.subscriptions
            .iter_mut()
            .rev()
            .find(|s| s.external_subscription_ref.as_deref() == Some(external_ref))
    }

    fn subscription_mut(&mut self, id: Uuid) -> BillingResult<&mut Subscription> {
        self.subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    fn cancel_and_unlink(&mut self, id: Uuid, at: OffsetDateTime) -> BillingResult<Subscription> {
        let subscription = self.subscription_mut(id)?;
        subscription.status = SubscriptionStatus::Canceled;
        subscription.cancel_at_period_end = false;
        subscription.canceled_at = subscription.canceled_at.or(Some(at));
        let canceled = subscription.clone();

        for customer in self.customers.values_mut() {
            if customer.subscription_id == Some(id) {
                customer.subscription_id = None;
            }
        }
        Ok(canceled)
    }

    fn request_mut(&mut self, id: Uuid) -> BillingResult<&mut RefundRequest> {
        self.refund_requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("refund request {}", id)))
    }

    fn approve_request(&mut self, id: Uuid, admin_id: Uuid) -> BillingResult<RefundRequest> {
        let request = self.request_mut(id)?;
        request.status = RefundRequestStatus::Approved;
        request.decided_by = Some(admin_id);
        request.decided_at = Some(OffsetDateTime::now_utc());
        Ok(request.clone())
    }

    fn insert_refund(
        &mut self,
        view: &RefundView,
        purchase_id: Option<Uuid>,
        refund_request_id: Uuid,
        fallback_amount: Decimal,
    ) -> BillingResult<RefundRecord> {
        let status = RefundStatus::from_external(view.status.as_deref());
        let clashes = self.refunds.iter().any(|r| {
            r.external_refund_ref == view.id
                || (status.is_active()
                    && r.status.is_active()
                    && ((purchase_id.is_some() && r.purchase_id == purchase_id)
                        || r.refund_request_id == Some(refund_request_id)))
        });
        if clashes {
            return Err(BillingError::RefundAlreadyExists(view.id.clone()));
        }

        let record = RefundRecord {
            id: Uuid::new_v4(),
            external_refund_ref: view.id.clone(),
            purchase_id,
            refund_request_id: Some(refund_request_id),
            amount: view.amount.map(amount_from_cents).unwrap_or(fallback_amount),
            status,
            created_at: OffsetDateTime::now_utc(),
        };
        self.refunds.push(record.clone());
        Ok(record)
    }
}

/// [`BillingStore`] kept in process memory
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: AsyncMutex<StoreState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a copy of the state; keep the copy only on success
    async fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> BillingResult<T>,
    ) -> BillingResult<T> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let result = f(&mut next)?;
        *guard = next;
        Ok(result)
    }

    // Seeding

    pub async fn add_customer(&self, email: &str, balance: Decimal) -> Customer {
        let customer = Customer {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: None,
            external_customer_ref: None,
            balance,
            has_purchased: false,
            subscription_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id, customer.clone());
        customer
    }

    pub async fn add_linked_customer(
        &self,
        email: &str,
        external_customer_ref: &str,
        balance: Decimal,
    ) -> Customer {
        let mut customer = self.add_customer(email, balance).await;
        customer.external_customer_ref = Some(external_customer_ref.to_string());
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id, customer.clone());
        customer
    }

    pub async fn add_plan(
        &self,
        name: &str,
        external_price_ref: &str,
        monthly_credits: Decimal,
        priority: i32,
    ) -> Plan {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: name.to_string(),
            monthly_credits,
            external_price_ref: external_price_ref.to_string(),
            priority,
        };
        self.state.lock().await.plans.push(plan.clone());
        plan
    }

    /// Insert a subscription and link it to its customer unless canceled
    pub async fn insert_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        if subscription.status != SubscriptionStatus::Canceled {
            if let Some(customer) = state.customers.get_mut(&subscription.customer_id) {
                customer.subscription_id = Some(subscription.id);
            }
        }
        state.subscriptions.push(subscription);
    }

    pub async fn insert_purchase(&self, purchase: Purchase) {
        self.state.lock().await.purchases.push(purchase);
    }

    pub async fn insert_invoice(&self, invoice: InvoiceRecord) {
        self.state.lock().await.invoices.push(invoice);
    }

    // Inspection

    pub async fn customer(&self, id: Uuid) -> Option<Customer> {
        self.state.lock().await.customers.get(&id).cloned()
    }

    pub async fn balance(&self, id: Uuid) -> Decimal {
        self.customer(id)
            .await
            .map(|c| c.balance)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn logs_for(&self, customer_id: Uuid) -> Vec<TransactionLog> {
        self.state
            .lock()
            .await
            .logs
            .iter()
            .filter(|l| l.customer_id == customer_id)
            .cloned()
            .collect()
    }

    pub async fn invoices(&self) -> Vec<InvoiceRecord> {
        self.state.lock().await.invoices.clone()
    }

    pub async fn refunds(&self) -> Vec<RefundRecord> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().await.subscriptions.clone()
    }
}

/// A subscription row as the checkout handler would have created it
pub fn subscription_fixture(
    customer_id: Uuid,
    plan_id: Uuid,
    external_ref: &str,
    status: SubscriptionStatus,
) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        customer_id,
        plan_id: Some(plan_id),
        status,
        external_subscription_ref: Some(external_ref.to_string()),
        external_checkout_ref: format!("cs_for_{}", external_ref),
        current_period_start: None,
        current_period_end: None,
        cancel_at_period_end: false,
        canceled_at: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// A purchase row in the given status
pub fn purchase_fixture(
    customer_id: Uuid,
    session_ref: &str,
    quantity: i32,
    unit_price: Decimal,
    status: PurchaseStatus,
) -> Purchase {
    Purchase {
        id: Uuid::new_v4(),
        customer_id,
        external_session_ref: session_ref.to_string(),
        external_payment_ref: None,
        quantity,
        unit_price,
        total_price: unit_price * Decimal::from(quantity),
        status,
        created_at: OffsetDateTime::now_utc(),
        paid_at: None,
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_customer(&self, id: Uuid) -> BillingResult<Option<Customer>> {
        Ok(self.customer(id).await)
    }

    async fn find_customer_by_external_ref(
        &self,
        external_customer_ref: &str,
    ) -> BillingResult<Option<Customer>> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .values()
            .find(|c| c.external_customer_ref.as_deref() == Some(external_customer_ref))
            .cloned())
    }

    async fn set_customer_external_ref(
        &self,
        customer_id: Uuid,
        external_customer_ref: &str,
    ) -> BillingResult<()> {
        self.transact(|state| {
            let taken = state.customers.values().any(|c| {
                c.id != customer_id
                    && c.external_customer_ref.as_deref() == Some(external_customer_ref)
            });
            if taken {
                return Err(BillingError::InvalidState(format!(
                    "Stripe customer {} belongs to another customer",
                    external_customer_ref
                )));
            }
            let customer = state.customer_mut(customer_id)?;
            match customer.external_customer_ref.as_deref() {
                Some(existing) if existing != external_customer_ref => {
                    Err(BillingError::ConcurrentModification(format!(
                        "customer {} already linked to another Stripe customer",
                        customer_id
                    )))
                }
                _ => {
                    customer.external_customer_ref = Some(external_customer_ref.to_string());
                    Ok(())
                }
            }
        })
        .await
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self
            .state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_plan_by_price_refs(&self, price_refs: &[String]) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        let mut best: Option<&Plan> = None;
        for plan in state
            .plans
            .iter()
            .filter(|p| price_refs.contains(&p.external_price_ref))
        {
            if best.map_or(true, |b| plan.priority > b.priority) {
                best = Some(plan);
            }
        }
        Ok(best.cloned())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn find_subscription_by_external_ref(
        &self,
        external_subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscription_by_external_ref(external_subscription_ref)
            .map(|s| s.clone()))
    }

    async fn upsert_checkout_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<CheckoutUpsert> {
        self.transact(|state| {
            let existing = state
                .subscriptions
                .iter_mut()
                .find(|s| s.external_checkout_ref == new.external_checkout_ref);

            let (subscription, created) = match existing {
                Some(existing) => {
                    if !existing.status.is_terminal() {
                        existing.status = synced_status(existing.status, new.status);
                        existing.plan_id = Some(new.plan_id);
                        if new.external_subscription_ref.is_some() {
                            existing.external_subscription_ref =
                                new.external_subscription_ref.clone();
                        }
                        existing.current_period_start =
                            new.current_period_start.or(existing.current_period_start);
                        existing.current_period_end =
                            new.current_period_end.or(existing.current_period_end);
                        existing.cancel_at_period_end = new.cancel_at_period_end;
                    }
                    (existing.clone(), false)
                }
                None => {
                    let now = OffsetDateTime::now_utc();
                    let subscription = Subscription {
                        id: Uuid::new_v4(),
                        customer_id: new.customer_id,
                        plan_id: Some(new.plan_id),
                        status: new.status,
                        external_subscription_ref: new.external_subscription_ref.clone(),
                        external_checkout_ref: new.external_checkout_ref.clone(),
                        current_period_start: new.current_period_start,
                        current_period_end: new.current_period_end,
                        cancel_at_period_end: new.cancel_at_period_end,
                        canceled_at: (new.status == SubscriptionStatus::Canceled).then_some(now),
                        created_at: now,
                    };
                    state.subscriptions.push(subscription.clone());
                    (subscription, true)
                }
            };

            if subscription.status != SubscriptionStatus::Canceled {
                state.customer_mut(subscription.customer_id)?.subscription_id =
                    Some(subscription.id);
            }

            Ok(CheckoutUpsert {
                subscription,
                created,
            })
        })
        .await
    }

    async fn sync_subscription(
        &self,
        sync: SubscriptionSync,
    ) -> BillingResult<Option<Subscription>> {
        self.transact(|state| {
            let Some(existing) = state.subscription_by_external_ref(&sync.external_subscription_ref)
            else {
                return Ok(None);
            };
            if existing.status.is_terminal() {
                return Ok(None);
            }
            existing.status = synced_status(existing.status, sync.status);
            existing.plan_id = Some(sync.plan_id);
            existing.current_period_start =
                sync.current_period_start.or(existing.current_period_start);
            existing.current_period_end = sync.current_period_end.or(existing.current_period_end);
            existing.cancel_at_period_end = sync.cancel_at_period_end;
            Ok(Some(existing.clone()))
        })
        .await
    }

    async fn mark_subscription_canceled(
        &self,
        external_subscription_ref: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        self.transact(|state| {
            let Some(id) = state
                .subscription_by_external_ref(external_subscription_ref)
                .map(|s| s.id)
            else {
                return Ok(None);
            };
            state.cancel_and_unlink(id, canceled_at).map(Some)
        })
        .await
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        self.transact(|state| {
            let subscription = state
                .subscription_mut(subscription_id)
                .ok()
                .filter(|s| !s.status.is_terminal())
                .ok_or_else(|| {
                    BillingError::InvalidState(format!(
                        "subscription {} is missing or canceled",
                        subscription_id
                    ))
                })?;
            subscription.cancel_at_period_end = cancel_at_period_end;
            Ok(subscription.clone())
        })
        .await
    }

    async fn latest_paid_invoice(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<InvoiceRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .invoices
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                i.subscription_id == Some(subscription_id) && i.status == InvoiceStatus::Paid
            })
            .max_by_key(|(position, i)| (i.issued_at, *position))
            .map(|(_, i)| i.clone()))
    }

    async fn apply_invoice(&self, app: InvoiceApplication) -> BillingResult<InvoiceOutcome> {
        self.transact(|state| {
            let reason = app.billing_reason.as_deref();
            let position = state
                .invoices
                .iter()
                .position(|i| i.external_invoice_ref == app.external_invoice_ref);

            let (invoice, plan) = match position {
                None => {
                    let plan =
                        plan_invoice(None, app.status, reason, app.monthly_credits, app.amount);
                    let invoice = InvoiceRecord {
                        id: Uuid::new_v4(),
                        external_invoice_ref: app.external_invoice_ref.clone(),
                        subscription_id: app.subscription_id,
                        customer_id: app.customer_id,
                        plan_id: Some(app.plan_id),
                        status: plan.final_status,
                        amount: app.amount,
                        credits_granted: plan.grant,
                        billing_reason: app.billing_reason.clone(),
                        period_start: app.period_start,
                        period_end: app.period_end,
                        issued_at: app.issued_at,
                        created_at: OffsetDateTime::now_utc(),
                    };
                    state.invoices.push(invoice.clone());
                    (invoice, plan)
                }
                Some(index) => {
                    let existing = &mut state.invoices[index];
                    let plan = plan_invoice(
                        Some((existing.status, existing.credits_granted)),
                        app.status,
                        reason,
                        app.monthly_credits,
                        app.amount,
                    );
                    if plan.transition == InvoiceTransition::UpgradedToPaid {
                        existing.status = InvoiceStatus::Paid;
                        existing.credits_granted += plan.grant;
                        existing.amount = app.amount;
                    }
                    (existing.clone(), plan)
                }
            };

            let paid_now = plan.final_status == InvoiceStatus::Paid
                && plan.transition != InvoiceTransition::Unchanged;
            if plan.grant > Decimal::ZERO || paid_now {
                state.credit(app.customer_id, plan.grant, paid_now)?;
            }

            if let Some(log_amount) = plan.log_amount {
                state.log(NewTransactionLog {
                    kind: TransactionKind::SubscriptionInvoice,
                    customer_id: app.customer_id,
                    status: plan.final_status.as_str().to_string(),
                    amount: log_amount,
                    credits: plan.grant,
                    reference: Some(app.external_invoice_ref.clone()),
                });
            }

            let superseded = app.subscription_id.is_some_and(|subscription_id| {
                let newest_other = state
                    .invoices
                    .iter()
                    .filter(|i| {
                        i.subscription_id == Some(subscription_id)
                            && i.external_invoice_ref != app.external_invoice_ref
                    })
                    .filter_map(|i| i.issued_at)
                    .max();
                issued_later(invoice.issued_at.or(app.issued_at), newest_other)
            });

            if let (Some(subscription_id), Some(status)) = (
                app.subscription_id,
                status_after_invoice(plan.transition, plan.final_status, superseded),
            ) {
                if let Ok(subscription) = state.subscription_mut(subscription_id) {
                    if !subscription.status.is_terminal() {
                        subscription.status = status;
                    }
                }
            }

            Ok(InvoiceOutcome {
                invoice,
                transition: plan.transition,
                credits_granted: plan.grant,
            })
        })
        .await
    }

    async fn create_purchase(&self, purchase: NewPurchase) -> BillingResult<Purchase> {
        self.transact(|state| {
            if state
                .purchases
                .iter()
                .any(|p| p.external_session_ref == purchase.external_session_ref)
            {
                return Err(BillingError::InvalidState(format!(
                    "checkout session {} already has a purchase",
                    purchase.external_session_ref
                )));
            }
            let record = Purchase {
                id: Uuid::new_v4(),
                customer_id: purchase.customer_id,
                external_session_ref: purchase.external_session_ref.clone(),
                external_payment_ref: None,
                quantity: purchase.quantity,
                unit_price: purchase.unit_price,
                total_price: purchase.total_price,
                status: PurchaseStatus::Pending,
                created_at: OffsetDateTime::now_utc(),
                paid_at: None,
            };
            state.purchases.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        Ok(self
            .state
            .lock()
            .await
            .purchases
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn complete_purchase(
        &self,
        completion: PurchaseCompletion,
    ) -> BillingResult<Option<PurchaseCompleted>> {
        self.transact(|state| {
            let Some(purchase) = state
                .purchases
                .iter_mut()
                .find(|p| p.external_session_ref == completion.external_session_ref)
            else {
                return Ok(None);
            };

            if purchase.status != PurchaseStatus::Pending {
                return Ok(Some(PurchaseCompleted {
                    purchase: purchase.clone(),
                    credited: false,
                }));
            }

            purchase.status = PurchaseStatus::Paid;
            purchase.paid_at = Some(completion.paid_at);
            if completion.external_payment_ref.is_some() {
                purchase.external_payment_ref = completion.external_payment_ref.clone();
            }
            let purchase = purchase.clone();

            state.credit(purchase.customer_id, purchase.credits(), true)?;
            state.log(NewTransactionLog {
                kind: TransactionKind::CreditPurchase,
                customer_id: purchase.customer_id,
                status: purchase.status.as_str().to_string(),
                amount: purchase.total_price,
                credits: purchase.credits(),
                reference: Some(purchase.external_session_ref.clone()),
            });

            Ok(Some(PurchaseCompleted {
                purchase,
                credited: true,
            }))
        })
        .await
    }

    async fn change_balance(&self, change: BalanceChange) -> BillingResult<Customer> {
        self.transact(|state| {
            let (customer, kind, credits) = match change.direction {
                BalanceDirection::Credit => (
                    state.credit(change.customer_id, change.amount, false)?,
                    TransactionKind::Credit,
                    change.amount,
                ),
                BalanceDirection::Debit => (
                    state.debit(change.customer_id, change.amount)?,
                    TransactionKind::Debit,
                    -change.amount,
                ),
            };
            state.log(NewTransactionLog {
                kind,
                customer_id: change.customer_id,
                status: "COMPLETED".to_string(),
                amount: Decimal::ZERO,
                credits,
                reference: change.reference.clone(),
            });
            Ok(customer)
        })
        .await
    }

    async fn transfer(&self, transfer: BalanceTransfer) -> BillingResult<(Customer, Customer)> {
        self.transact(|state| {
            state.customer_mut(transfer.to_customer_id)?;
            let from = state.debit(transfer.from_customer_id, transfer.amount)?;
            let to = state.credit(transfer.to_customer_id, transfer.amount, false)?;
            for (customer_id, kind, credits) in [
                (
                    transfer.from_customer_id,
                    TransactionKind::TransferOut,
                    -transfer.amount,
                ),
                (
                    transfer.to_customer_id,
                    TransactionKind::TransferIn,
                    transfer.amount,
                ),
            ] {
                state.log(NewTransactionLog {
                    kind,
                    customer_id,
                    status: "COMPLETED".to_string(),
                    amount: Decimal::ZERO,
                    credits,
                    reference: transfer.reference.clone(),
                });
            }
            Ok((from, to))
        })
        .await
    }

    async fn transaction_history(
        &self,
        customer_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<TransactionLog>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .await
            .logs
            .iter()
            .rev()
            .filter(|l| l.customer_id == customer_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_refund_request(
        &self,
        request: NewRefundRequest,
    ) -> BillingResult<RefundRequest> {
        self.transact(|state| {
            let duplicate = state.refund_requests.iter().any(|r| {
                r.status == RefundRequestStatus::Pending
                    && ((request.purchase_id.is_some() && r.purchase_id == request.purchase_id)
                        || (request.subscription_id.is_some()
                            && r.subscription_id == request.subscription_id))
            });
            if duplicate {
                let target = request
                    .purchase_id
                    .or(request.subscription_id)
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                return Err(BillingError::DuplicateRefundRequest(target));
            }

            let record = RefundRequest {
                id: Uuid::new_v4(),
                kind: request.kind,
                customer_id: request.customer_id,
                purchase_id: request.purchase_id,
                subscription_id: request.subscription_id,
                reason: request.reason.clone(),
                status: RefundRequestStatus::Pending,
                decided_by: None,
                decided_at: None,
                created_at: OffsetDateTime::now_utc(),
            };
            state.refund_requests.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn get_refund_request(&self, id: Uuid) -> BillingResult<Option<RefundRequest>> {
        Ok(self
            .state
            .lock()
            .await
            .refund_requests
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_pending_refund_requests(
        &self,
        page: PageRequest,
    ) -> BillingResult<Page<RefundRequest>> {
        let page = page.normalized();
        let state = self.state.lock().await;
        let pending: Vec<&RefundRequest> = state
            .refund_requests
            .iter()
            .rev()
            .filter(|r| r.status == RefundRequestStatus::Pending)
            .collect();
        let total = pending.len() as i64;
        let items = pending
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(0))
            .take(usize::try_from(page.limit).unwrap_or(0))
            .cloned()
            .collect();
        Ok(Page {
            items,
            page: page.page,
            limit: page.limit,
            total,
        })
    }

    async fn deny_refund_request(&self, id: Uuid, admin_id: Uuid) -> BillingResult<RefundRequest> {
        self.transact(|state| {
            let request = state.request_mut(id)?;
            if request.status != RefundRequestStatus::Pending {
                return Err(BillingError::RequestAlreadyDecided(id));
            }
            request.status = RefundRequestStatus::Denied;
            request.decided_by = Some(admin_id);
            request.decided_at = Some(OffsetDateTime::now_utc());
            Ok(request.clone())
        })
        .await
    }

    async fn approve_purchase_refund(
        &self,
        approval: RefundApproval,
        effect: &dyn RefundEffect,
    ) -> BillingResult<ApprovedRefund> {
        let mut guard = self.state.lock().await;
        let mut state = guard.clone();

        let request = state.request_mut(approval.request_id)?.clone();
        check_pending(&request, RefundRequestKind::CreditPurchase)?;
        let purchase_id = request.purchase_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no purchase", request.id))
        })?;
        let purchase = state
            .purchases
            .iter()
            .find(|p| p.id == purchase_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))?;
        let has_active_refund = state
            .refunds
            .iter()
            .any(|r| r.purchase_id == Some(purchase.id) && r.status.is_active());
        let balance = state.customer_mut(purchase.customer_id)?.balance;
        check_purchase_refund(&purchase, balance, has_active_refund)?;

        let credits = purchase.credits();
        state.debit(purchase.customer_id, credits)?;

        let view = effect.execute().await?.ok_or_else(|| {
            BillingError::Internal("purchase refund produced no Stripe refund".into())
        })?;
        let refund =
            state.insert_refund(&view, Some(purchase.id), request.id, purchase.total_price)?;

        if let Some(stored) = state.purchases.iter_mut().find(|p| p.id == purchase.id) {
            stored.status = PurchaseStatus::Canceled;
        }
        let request = state.approve_request(request.id, approval.admin_id)?;

        state.log(NewTransactionLog {
            kind: TransactionKind::PurchaseRefund,
            customer_id: purchase.customer_id,
            status: refund.status.as_str().to_string(),
            amount: -refund.amount,
            credits: -credits,
            reference: Some(refund.external_refund_ref.clone()),
        });

        *guard = state;
        Ok(ApprovedRefund {
            request,
            refund: Some(refund),
            credits_revoked: credits,
        })
    }

    async fn approve_subscription_refund(
        &self,
        approval: RefundApproval,
        effect: &dyn RefundEffect,
    ) -> BillingResult<ApprovedRefund> {
        let mut guard = self.state.lock().await;
        let mut state = guard.clone();

        let request = state.request_mut(approval.request_id)?.clone();
        check_pending(&request, RefundRequestKind::Subscription)?;
        let subscription_id = request.subscription_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no subscription", request.id))
        })?;
        let subscription = state.subscription_mut(subscription_id)?.clone();

        let invoice = approval.invoice_ref.as_deref().and_then(|invoice_ref| {
            state
                .invoices
                .iter()
                .find(|i| i.external_invoice_ref == invoice_ref && i.status == InvoiceStatus::Paid)
                .cloned()
        });
        let credits = invoice
            .as_ref()
            .map(|i| i.credits_granted)
            .unwrap_or(Decimal::ZERO);

        let has_active_refund = state
            .refunds
            .iter()
            .any(|r| r.refund_request_id == Some(request.id) && r.status.is_active());
        let balance = state.customer_mut(subscription.customer_id)?.balance;
        check_subscription_refund(balance, credits, has_active_refund)?;

        if credits > Decimal::ZERO {
            state.debit(subscription.customer_id, credits)?;
        }

        let view = effect.execute().await?;
        let refund = match &view {
            Some(view) => Some(state.insert_refund(
                view,
                None,
                request.id,
                invoice.as_ref().map(|i| i.amount).unwrap_or(Decimal::ZERO),
            )?),
            None => None,
        };

        state.cancel_and_unlink(subscription.id, OffsetDateTime::now_utc())?;
        let request = state.approve_request(request.id, approval.admin_id)?;

        state.log(NewTransactionLog {
            kind: TransactionKind::SubscriptionRefund,
            customer_id: subscription.customer_id,
            status: refund
                .as_ref()
                .map(|r| r.status.as_str())
                .unwrap_or("MANUAL")
                .to_string(),
            amount: -refund.as_ref().map(|r| r.amount).unwrap_or(Decimal::ZERO),
            credits: -credits,
            reference: refund
                .as_ref()
                .map(|r| r.external_refund_ref.clone())
                .or_else(|| approval.invoice_ref.clone()),
        });

        *guard = state;
        Ok(ApprovedRefund {
            request,
            refund,
            credits_revoked: credits,
        })
    }

    async fn update_refund_status(
        &self,
        external_refund_ref: &str,
        status: RefundStatus,
    ) -> BillingResult<RefundStatusUpdate> {
        self.transact(|state| {
            let Some(refund) = state
                .refunds
                .iter_mut()
                .find(|r| r.external_refund_ref == external_refund_ref)
            else {
                return Ok(RefundStatusUpdate::Unknown);
            };
            if !refund_transition_allowed(refund.status, status) {
                return Ok(RefundStatusUpdate::Unchanged(refund.clone()));
            }
            refund.status = status;
            Ok(RefundStatusUpdate::Updated(refund.clone()))
        })
        .await
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// How the next scripted call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// 5xx or network trouble; retryable
    Transient,
    /// 4xx; the request will never succeed
    Rejected,
}

impl ScriptedFailure {
    fn error(self, operation: &str) -> BillingError {
        match self {
            ScriptedFailure::Transient => {
                BillingError::StripeApi(format!("{} unavailable", operation))
            }
            ScriptedFailure::Rejected => {
                BillingError::StripeRejected(format!("{} rejected", operation))
            }
        }
    }
}

#[derive(Default)]
struct GatewayState {
    invoices: HashMap<String, InvoiceView>,
    subscriptions: HashMap<String, SubscriptionView>,
    sessions: HashMap<String, CheckoutSessionView>,
    charges: Vec<(String, ChargeView)>,
    refunds: HashMap<String, RefundView>,
    refunds_by_key: HashMap<String, String>,
    refund_requests: Vec<CreateRefundRequest>,
    checkout_requests: Vec<CheckoutSessionRequest>,
    canceled: Vec<String>,
    list_charges_calls: usize,
    customers_created: usize,
    refund_failure: Option<ScriptedFailure>,
    cancel_failure: Option<ScriptedFailure>,
    read_failure: Option<ScriptedFailure>,
    invoice_read_failure: Option<ScriptedFailure>,
}

/// [`PaymentGateway`] backed by scripted Stripe objects
pub struct MockGateway {
    state: Mutex<GatewayState>,
    charge_page_size: usize,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GatewayState::default()),
            charge_page_size: 100,
        }
    }

    /// Cap the page size `list_charges` returns, whatever the query asks for
    pub fn with_charge_page_size(mut self, size: usize) -> Self {
        self.charge_page_size = size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_invoice(&self, invoice: InvoiceView) {
        self.state().invoices.insert(invoice.id.clone(), invoice);
    }

    pub fn add_subscription(&self, subscription: SubscriptionView) {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn add_checkout_session(&self, session: CheckoutSessionView) {
        self.state().sessions.insert(session.id.clone(), session);
    }

    pub fn add_charge(&self, customer_ref: &str, charge: ChargeView) {
        self.state().charges.push((customer_ref.to_string(), charge));
    }

    pub fn fail_refunds(&self, failure: Option<ScriptedFailure>) {
        self.state().refund_failure = failure;
    }

    pub fn fail_cancels(&self, failure: Option<ScriptedFailure>) {
        self.state().cancel_failure = failure;
    }

    /// Fail invoice, subscription and refund retrievals
    pub fn fail_reads(&self, failure: Option<ScriptedFailure>) {
        self.state().read_failure = failure;
    }

    /// Fail only invoice retrievals
    pub fn fail_invoice_reads(&self, failure: Option<ScriptedFailure>) {
        self.state().invoice_read_failure = failure;
    }

    /// A refund that exists at Stripe, whether or not it is stored locally
    pub fn add_refund(&self, refund: RefundView) {
        self.state().refunds.insert(refund.id.clone(), refund);
    }

    pub fn list_charges_calls(&self) -> usize {
        self.state().list_charges_calls
    }

    /// Every create_refund call, replays included
    pub fn refund_requests(&self) -> Vec<CreateRefundRequest> {
        self.state().refund_requests.clone()
    }

    /// Distinct refunds created
    pub fn refunds_created(&self) -> usize {
        self.state().refunds.len()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.state().checkout_requests.clone()
    }

    pub fn canceled_subscriptions(&self) -> Vec<String> {
        self.state().canceled.clone()
    }

    pub fn customers_created(&self) -> usize {
        self.state().customers_created
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<InvoiceView> {
        let state = self.state();
        if let Some(failure) = state.invoice_read_failure.or(state.read_failure) {
            return Err(failure.error("retrieve_invoice"));
        }
        state
            .invoices
            .get(invoice_ref)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_ref)))
    }

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionView> {
        let state = self.state();
        if let Some(failure) = state.read_failure {
            return Err(failure.error("retrieve_subscription"));
        }
        state
            .subscriptions
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_ref)))
    }

    async fn retrieve_checkout_session(
        &self,
        session_ref: &str,
    ) -> BillingResult<CheckoutSessionView> {
        self.state()
            .sessions
            .get(session_ref)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {}", session_ref)))
    }

    async fn retrieve_refund(&self, refund_ref: &str) -> BillingResult<RefundView> {
        let state = self.state();
        if let Some(failure) = state.read_failure {
            return Err(failure.error("retrieve_refund"));
        }
        state
            .refunds
            .get(refund_ref)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("refund {}", refund_ref)))
    }

    async fn list_charges(&self, query: &ChargeQuery) -> BillingResult<ChargePage> {
        let mut state = self.state();
        state.list_charges_calls += 1;

        let matching: Vec<&ChargeView> = state
            .charges
            .iter()
            .filter(|(customer, c)| {
                customer == &query.customer_ref
                    && c.created >= query.created_gte
                    && c.created <= query.created_lte
            })
            .map(|(_, c)| c)
            .collect();

        let start = match &query.starting_after {
            Some(cursor) => matching
                .iter()
                .position(|c| &c.id == cursor)
                .map(|p| p + 1)
                .unwrap_or(matching.len()),
            None => 0,
        };
        let limit = usize::try_from(query.limit)
            .unwrap_or(usize::MAX)
            .clamp(1, self.charge_page_size);
        let end = (start + limit).min(matching.len());

        Ok(ChargePage {
            charges: matching[start..end].iter().map(|c| (*c).clone()).collect(),
            has_more: end < matching.len(),
        })
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> BillingResult<RefundView> {
        let mut state = self.state();
        state.refund_requests.push(request.clone());

        if let Some(failure) = state.refund_failure {
            return Err(failure.error("create_refund"));
        }

        if let Some(existing) = state
            .refunds_by_key
            .get(&request.idempotency_key)
            .and_then(|id| state.refunds.get(id))
        {
            return Ok(existing.clone());
        }

        let (charge, payment_intent) = match &request.target {
            RefundTarget::Charge(id) => (Some(ObjectRef::Id(id.clone())), None),
            RefundTarget::PaymentIntent(id) => (None, Some(ObjectRef::Id(id.clone()))),
        };
        let refund = RefundView {
            id: format!("re_{}", state.refunds.len() + 1),
            status: Some("pending".to_string()),
            amount: request.amount_cents,
            charge,
            payment_intent,
            metadata: Some(request.metadata.clone()),
        };
        state
            .refunds_by_key
            .insert(request.idempotency_key.clone(), refund.id.clone());
        state.refunds.insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionView> {
        let mut state = self.state();
        if let Some(failure) = state.cancel_failure {
            return Err(failure.error("cancel_subscription"));
        }
        let subscription = state
            .subscriptions
            .get_mut(subscription_ref)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_ref)))?;
        subscription.status = Some("canceled".to_string());
        subscription.canceled_at = Some(OffsetDateTime::now_utc().unix_timestamp());
        let canceled = subscription.clone();
        state.canceled.push(subscription_ref.to_string());
        Ok(canceled)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionView> {
        let mut state = self.state();
        let subscription = state
            .subscriptions
            .get_mut(subscription_ref)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_ref)))?;
        subscription.cancel_at_period_end = cancel;
        Ok(subscription.clone())
    }

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
    ) -> BillingResult<CustomerView> {
        let mut state = self.state();
        state.customers_created += 1;
        Ok(CustomerView {
            id: format!("cus_{}", request.local_customer_id.simple()),
            email: Some(request.email.clone()),
            deleted: false,
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionView> {
        let mut state = self.state();
        state.checkout_requests.push(request.clone());

        let id = format!("cs_test_{}", state.checkout_requests.len());
        let (url, client_secret) = match request.ui_mode {
            CheckoutUiMode::Hosted => (Some(format!("https://checkout.stripe.test/{}", id)), None),
            CheckoutUiMode::Embedded => (None, Some(format!("{}_secret", id))),
        };
        let session = CheckoutSessionView {
            id: id.clone(),
            mode: Some(
                match request.mode {
                    CheckoutMode::Subscription => "subscription",
                    _ => "payment",
                }
                .to_string(),
            ),
            status: Some("open".to_string()),
            payment_status: Some("unpaid".to_string()),
            customer: Some(ObjectRef::Id(request.customer_ref.clone())),
            client_reference_id: Some(request.client_reference_id.clone()),
            metadata: Some(request.metadata.clone()),
            url,
            client_secret,
            ..Default::default()
        };
        state.sessions.insert(id, session.clone());
        Ok(session)
    }
}

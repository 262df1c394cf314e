//! PostgreSQL implementation of [`BillingStore`]
//!
//! Each trait method is one transaction. Idempotency rests on the unique
//! external references (`INSERT ... ON CONFLICT DO NOTHING`) and on
//! conditional updates (`WHERE status = 'PENDING'`, `WHERE balance >= $2`);
//! rows are locked with `FOR UPDATE` before any read-modify-write.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::approvals::{check_pending, check_purchase_refund, check_subscription_refund};
use crate::error::{BillingError, BillingResult};
use crate::ledger::plan_invoice;
use crate::models::{
    amount_from_cents, Customer, InvoiceRecord, InvoiceStatus, NewTransactionLog, Plan, Purchase,
    RefundRecord, RefundRequest, RefundRequestKind, RefundStatus, Subscription,
    SubscriptionStatus, TransactionKind, TransactionLog,
};
use crate::objects::RefundView;
use crate::store::{
    ApprovedRefund, BalanceChange, BalanceDirection, BalanceTransfer, BillingStore,
    CheckoutUpsert, InvoiceApplication, InvoiceOutcome, InvoiceTransition, NewPurchase,
    NewRefundRequest, NewSubscription, Page, PageRequest, PurchaseCompleted, PurchaseCompletion,
    RefundApproval, RefundEffect, RefundStatusUpdate, SubscriptionSync,
};
use crate::refund::refund_transition_allowed;
use crate::subscriptions::{issued_later, status_after_invoice, synced_status};

const CUSTOMER_COLUMNS: &str =
    "id, email, name, external_customer_ref, balance, has_purchased, subscription_id, created_at";
const PLAN_COLUMNS: &str = "id, name, monthly_credits, external_price_ref, priority";
const SUBSCRIPTION_COLUMNS: &str = "id, customer_id, plan_id, status, external_subscription_ref, \
     external_checkout_ref, current_period_start, current_period_end, cancel_at_period_end, \
     canceled_at, created_at";
const INVOICE_COLUMNS: &str = "id, external_invoice_ref, subscription_id, customer_id, plan_id, \
     status, amount, credits_granted, billing_reason, period_start, period_end, issued_at, \
     created_at";
const PURCHASE_COLUMNS: &str = "id, customer_id, external_session_ref, external_payment_ref, \
     quantity, unit_price, total_price, status, created_at, paid_at";
const REFUND_REQUEST_COLUMNS: &str = "id, kind, customer_id, purchase_id, subscription_id, \
     reason, status, decided_by, decided_at, created_at";
const REFUND_COLUMNS: &str =
    "id, external_refund_ref, purchase_id, refund_request_id, amount, status, created_at";
const LOG_COLUMNS: &str = "id, kind, customer_id, status, amount, credits, reference, created_at";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// In-transaction steps
// =============================================================================

async fn insert_log(conn: &mut PgConnection, log: NewTransactionLog) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transaction_logs (id, kind, customer_id, status, amount, credits, reference)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(log.kind)
    .bind(log.customer_id)
    .bind(&log.status)
    .bind(log.amount)
    .bind(log.credits)
    .bind(&log.reference)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_customer(conn: &mut PgConnection, id: Uuid) -> BillingResult<Customer> {
    let sql = format!("SELECT {} FROM customers WHERE id = $1 FOR UPDATE", CUSTOMER_COLUMNS);
    sqlx::query_as::<_, Customer>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
}

async fn credit_in_tx(
    conn: &mut PgConnection,
    customer_id: Uuid,
    amount: Decimal,
    mark_purchased: bool,
) -> BillingResult<Customer> {
    let sql = format!(
        r#"
        UPDATE customers
        SET balance = balance + $2,
            has_purchased = has_purchased OR $3,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        CUSTOMER_COLUMNS
    );
    sqlx::query_as::<_, Customer>(&sql)
        .bind(customer_id)
        .bind(amount)
        .bind(mark_purchased)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
}

/// Decrement only while the balance covers `amount`; zero rows aborts
async fn debit_in_tx(
    conn: &mut PgConnection,
    customer_id: Uuid,
    amount: Decimal,
) -> BillingResult<Customer> {
    let sql = format!(
        r#"
        UPDATE customers
        SET balance = balance - $2, updated_at = NOW()
        WHERE id = $1 AND balance >= $2
        RETURNING {}
        "#,
        CUSTOMER_COLUMNS
    );
    let updated = sqlx::query_as::<_, Customer>(&sql)
        .bind(customer_id)
        .bind(amount)
        .fetch_optional(&mut *conn)
        .await?;

    match updated {
        Some(customer) => Ok(customer),
        None => {
            let available: Option<Decimal> =
                sqlx::query_scalar("SELECT balance FROM customers WHERE id = $1")
                    .bind(customer_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            match available {
                Some(available) => Err(BillingError::InsufficientBalance {
                    requested: amount,
                    available,
                }),
                None => Err(BillingError::CustomerNotFound(customer_id.to_string())),
            }
        }
    }
}

async fn lock_refund_request(conn: &mut PgConnection, id: Uuid) -> BillingResult<RefundRequest> {
    let sql = format!(
        "SELECT {} FROM refund_requests WHERE id = $1 FOR UPDATE",
        REFUND_REQUEST_COLUMNS
    );
    sqlx::query_as::<_, RefundRequest>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("refund request {}", id)))
}

async fn mark_request_approved(
    conn: &mut PgConnection,
    id: Uuid,
    admin_id: Uuid,
) -> BillingResult<RefundRequest> {
    let sql = format!(
        r#"
        UPDATE refund_requests
        SET status = 'APPROVED', decided_by = $2, decided_at = NOW()
        WHERE id = $1 AND status = 'PENDING'
        RETURNING {}
        "#,
        REFUND_REQUEST_COLUMNS
    );
    sqlx::query_as::<_, RefundRequest>(&sql)
        .bind(id)
        .bind(admin_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BillingError::ConcurrentModification(format!("refund request {}", id)))
}

async fn insert_refund(
    conn: &mut PgConnection,
    view: &RefundView,
    purchase_id: Option<Uuid>,
    refund_request_id: Uuid,
    fallback_amount: Decimal,
) -> BillingResult<RefundRecord> {
    let amount = view.amount.map(amount_from_cents).unwrap_or(fallback_amount);
    let sql = format!(
        r#"
        INSERT INTO refunds (id, external_refund_ref, purchase_id, refund_request_id, amount, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        REFUND_COLUMNS
    );
    sqlx::query_as::<_, RefundRecord>(&sql)
        .bind(Uuid::new_v4())
        .bind(&view.id)
        .bind(purchase_id)
        .bind(refund_request_id)
        .bind(amount)
        .bind(RefundStatus::from_external(view.status.as_deref()))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::RefundAlreadyExists(view.id.clone())
            } else {
                e.into()
            }
        })
}

async fn cancel_and_unlink(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    canceled_at: OffsetDateTime,
) -> BillingResult<Subscription> {
    let sql = format!(
        r#"
        UPDATE subscriptions
        SET status = 'CANCELED',
            cancel_at_period_end = FALSE,
            canceled_at = COALESCE(canceled_at, $2),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        SUBSCRIPTION_COLUMNS
    );
    let subscription = sqlx::query_as::<_, Subscription>(&sql)
        .bind(subscription_id)
        .bind(canceled_at)
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query(
        "UPDATE customers SET subscription_id = NULL, updated_at = NOW() WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .execute(&mut *conn)
    .await?;

    Ok(subscription)
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_customer(&self, id: Uuid) -> BillingResult<Option<Customer>> {
        let sql = format!("SELECT {} FROM customers WHERE id = $1", CUSTOMER_COLUMNS);
        Ok(sqlx::query_as::<_, Customer>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_customer_by_external_ref(
        &self,
        external_customer_ref: &str,
    ) -> BillingResult<Option<Customer>> {
        let sql = format!(
            "SELECT {} FROM customers WHERE external_customer_ref = $1",
            CUSTOMER_COLUMNS
        );
        Ok(sqlx::query_as::<_, Customer>(&sql)
            .bind(external_customer_ref)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_customer_external_ref(
        &self,
        customer_id: Uuid,
        external_customer_ref: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET external_customer_ref = $2, updated_at = NOW()
            WHERE id = $1 AND (external_customer_ref IS NULL OR external_customer_ref = $2)
            "#,
        )
        .bind(customer_id)
        .bind(external_customer_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::InvalidState(format!(
                    "Stripe customer {} belongs to another customer",
                    external_customer_ref
                ))
            } else {
                e.into()
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "customer {} already linked to another Stripe customer",
                customer_id
            )));
        }
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let sql = format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS);
        Ok(sqlx::query_as::<_, Plan>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_plan_by_price_refs(&self, price_refs: &[String]) -> BillingResult<Option<Plan>> {
        if price_refs.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            r#"
            SELECT {} FROM plans
            WHERE external_price_ref = ANY($1)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
            PLAN_COLUMNS
        );
        Ok(sqlx::query_as::<_, Plan>(&sql)
            .bind(price_refs)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = $1", SUBSCRIPTION_COLUMNS);
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_subscription_by_external_ref(
        &self,
        external_subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE external_subscription_ref = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(external_subscription_ref)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn upsert_checkout_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<CheckoutUpsert> {
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO subscriptions (
                id, customer_id, plan_id, status, external_subscription_ref,
                external_checkout_ref, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    CASE WHEN $4 = 'CANCELED' THEN NOW() END)
            ON CONFLICT (external_checkout_ref) DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let inserted = sqlx::query_as::<_, Subscription>(&insert)
            .bind(Uuid::new_v4())
            .bind(new.customer_id)
            .bind(new.plan_id)
            .bind(new.status)
            .bind(&new.external_subscription_ref)
            .bind(&new.external_checkout_ref)
            .bind(new.current_period_start)
            .bind(new.current_period_end)
            .bind(new.cancel_at_period_end)
            .fetch_optional(&mut *tx)
            .await?;

        let (subscription, created) = match inserted {
            Some(subscription) => (subscription, true),
            None => {
                let select = format!(
                    "SELECT {} FROM subscriptions WHERE external_checkout_ref = $1 FOR UPDATE",
                    SUBSCRIPTION_COLUMNS
                );
                let existing = sqlx::query_as::<_, Subscription>(&select)
                    .bind(&new.external_checkout_ref)
                    .fetch_one(&mut *tx)
                    .await?;

                if existing.status.is_terminal() {
                    (existing, false)
                } else {
                    let update = format!(
                        r#"
                        UPDATE subscriptions
                        SET status = $2,
                            plan_id = $3,
                            external_subscription_ref = COALESCE($4, external_subscription_ref),
                            current_period_start = COALESCE($5, current_period_start),
                            current_period_end = COALESCE($6, current_period_end),
                            cancel_at_period_end = $7,
                            updated_at = NOW()
                        WHERE id = $1 AND status <> 'CANCELED'
                        RETURNING {}
                        "#,
                        SUBSCRIPTION_COLUMNS
                    );
                    let refreshed = sqlx::query_as::<_, Subscription>(&update)
                        .bind(existing.id)
                        .bind(synced_status(existing.status, new.status))
                        .bind(new.plan_id)
                        .bind(&new.external_subscription_ref)
                        .bind(new.current_period_start)
                        .bind(new.current_period_end)
                        .bind(new.cancel_at_period_end)
                        .fetch_one(&mut *tx)
                        .await?;
                    (refreshed, false)
                }
            }
        };

        if subscription.status != SubscriptionStatus::Canceled {
            sqlx::query(
                "UPDATE customers SET subscription_id = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(subscription.customer_id)
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CheckoutUpsert {
            subscription,
            created,
        })
    }

    async fn sync_subscription(
        &self,
        sync: SubscriptionSync,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE external_subscription_ref = $1
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let Some(existing) = sqlx::query_as::<_, Subscription>(&select)
            .bind(&sync.external_subscription_ref)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        if existing.status.is_terminal() {
            return Ok(None);
        }

        let update = format!(
            r#"
            UPDATE subscriptions
            SET status = $2,
                plan_id = $3,
                current_period_start = COALESCE($4, current_period_start),
                current_period_end = COALESCE($5, current_period_end),
                cancel_at_period_end = $6,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'CANCELED'
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let updated = sqlx::query_as::<_, Subscription>(&update)
            .bind(existing.id)
            .bind(synced_status(existing.status, sync.status))
            .bind(sync.plan_id)
            .bind(sync.current_period_start)
            .bind(sync.current_period_end)
            .bind(sync.cancel_at_period_end)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn mark_subscription_canceled(
        &self,
        external_subscription_ref: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE external_subscription_ref = $1
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let Some(existing) = sqlx::query_as::<_, Subscription>(&select)
            .bind(external_subscription_ref)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let subscription = cancel_and_unlink(&mut tx, existing.id, canceled_at).await?;
        tx.commit().await?;
        Ok(Some(subscription))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'CANCELED'
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, Subscription>(&sql)
            .bind(subscription_id)
            .bind(cancel_at_period_end)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidState(format!(
                    "subscription {} is missing or canceled",
                    subscription_id
                ))
            })
    }

    async fn latest_paid_invoice(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM invoices
            WHERE subscription_id = $1 AND status = 'PAID'
            ORDER BY issued_at DESC NULLS LAST, created_at DESC
            LIMIT 1
            "#,
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn apply_invoice(&self, app: InvoiceApplication) -> BillingResult<InvoiceOutcome> {
        let mut tx = self.pool.begin().await?;
        let reason = app.billing_reason.as_deref();

        // Serializes invoices of one subscription so the newest-invoice check holds
        if let Some(subscription_id) = app.subscription_id {
            sqlx::query("SELECT id FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(subscription_id)
                .fetch_optional(&mut *tx)
                .await?;
        }

        // First writer wins on the invoice ref
        let first = plan_invoice(None, app.status, reason, app.monthly_credits, app.amount);
        let insert = format!(
            r#"
            INSERT INTO invoices (
                id, external_invoice_ref, subscription_id, customer_id, plan_id,
                status, amount, credits_granted, billing_reason, period_start, period_end,
                issued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (external_invoice_ref) DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let inserted = sqlx::query_as::<_, InvoiceRecord>(&insert)
            .bind(Uuid::new_v4())
            .bind(&app.external_invoice_ref)
            .bind(app.subscription_id)
            .bind(app.customer_id)
            .bind(app.plan_id)
            .bind(first.final_status)
            .bind(app.amount)
            .bind(first.grant)
            .bind(&app.billing_reason)
            .bind(app.period_start)
            .bind(app.period_end)
            .bind(app.issued_at)
            .fetch_optional(&mut *tx)
            .await?;

        let (invoice, plan) = match inserted {
            Some(invoice) => (invoice, first),
            None => {
                let select = format!(
                    "SELECT {} FROM invoices WHERE external_invoice_ref = $1 FOR UPDATE",
                    INVOICE_COLUMNS
                );
                let existing = sqlx::query_as::<_, InvoiceRecord>(&select)
                    .bind(&app.external_invoice_ref)
                    .fetch_one(&mut *tx)
                    .await?;

                let plan = plan_invoice(
                    Some((existing.status, existing.credits_granted)),
                    app.status,
                    reason,
                    app.monthly_credits,
                    app.amount,
                );

                if plan.transition == InvoiceTransition::UpgradedToPaid {
                    let update = format!(
                        r#"
                        UPDATE invoices
                        SET status = 'PAID',
                            credits_granted = credits_granted + $2,
                            amount = $3,
                            updated_at = NOW()
                        WHERE id = $1 AND status = 'FAILED'
                        RETURNING {}
                        "#,
                        INVOICE_COLUMNS
                    );
                    let upgraded = sqlx::query_as::<_, InvoiceRecord>(&update)
                        .bind(existing.id)
                        .bind(plan.grant)
                        .bind(app.amount)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| {
                            BillingError::ConcurrentModification(format!(
                                "invoice {}",
                                app.external_invoice_ref
                            ))
                        })?;
                    (upgraded, plan)
                } else {
                    (existing, plan)
                }
            }
        };

        let paid_now = plan.final_status == InvoiceStatus::Paid
            && plan.transition != InvoiceTransition::Unchanged;
        if plan.grant > Decimal::ZERO || paid_now {
            credit_in_tx(&mut tx, app.customer_id, plan.grant, paid_now).await?;
        }

        if let Some(log_amount) = plan.log_amount {
            insert_log(
                &mut tx,
                NewTransactionLog {
                    kind: TransactionKind::SubscriptionInvoice,
                    customer_id: app.customer_id,
                    status: plan.final_status.as_str().to_string(),
                    amount: log_amount,
                    credits: plan.grant,
                    reference: Some(app.external_invoice_ref.clone()),
                },
            )
            .await?;
        }

        let superseded = match app.subscription_id {
            Some(subscription_id) if plan.transition != InvoiceTransition::Unchanged => {
                let newest_other: Option<OffsetDateTime> = sqlx::query_scalar(
                    r#"
                    SELECT MAX(issued_at) FROM invoices
                    WHERE subscription_id = $1 AND external_invoice_ref <> $2
                    "#,
                )
                .bind(subscription_id)
                .bind(&app.external_invoice_ref)
                .fetch_one(&mut *tx)
                .await?;
                issued_later(invoice.issued_at.or(app.issued_at), newest_other)
            }
            _ => false,
        };

        if let (Some(subscription_id), Some(status)) = (
            app.subscription_id,
            status_after_invoice(plan.transition, plan.final_status, superseded),
        ) {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = $2, updated_at = NOW()
                WHERE id = $1 AND status <> 'CANCELED'
                "#,
            )
            .bind(subscription_id)
            .bind(status)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(InvoiceOutcome {
            invoice,
            transition: plan.transition,
            credits_granted: plan.grant,
        })
    }

    async fn create_purchase(&self, purchase: NewPurchase) -> BillingResult<Purchase> {
        let sql = format!(
            r#"
            INSERT INTO purchases (
                id, customer_id, external_session_ref, quantity, unit_price, total_price, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING {}
            "#,
            PURCHASE_COLUMNS
        );
        sqlx::query_as::<_, Purchase>(&sql)
            .bind(Uuid::new_v4())
            .bind(purchase.customer_id)
            .bind(&purchase.external_session_ref)
            .bind(purchase.quantity)
            .bind(purchase.unit_price)
            .bind(purchase.total_price)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BillingError::InvalidState(format!(
                        "checkout session {} already has a purchase",
                        purchase.external_session_ref
                    ))
                } else {
                    e.into()
                }
            })
    }

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        let sql = format!("SELECT {} FROM purchases WHERE id = $1", PURCHASE_COLUMNS);
        Ok(sqlx::query_as::<_, Purchase>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn complete_purchase(
        &self,
        completion: PurchaseCompletion,
    ) -> BillingResult<Option<PurchaseCompleted>> {
        let mut tx = self.pool.begin().await?;

        let update = format!(
            r#"
            UPDATE purchases
            SET status = 'PAID',
                paid_at = $3,
                external_payment_ref = COALESCE($2, external_payment_ref)
            WHERE external_session_ref = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            PURCHASE_COLUMNS
        );
        let paid = sqlx::query_as::<_, Purchase>(&update)
            .bind(&completion.external_session_ref)
            .bind(&completion.external_payment_ref)
            .bind(completion.paid_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(purchase) = paid else {
            let select = format!(
                "SELECT {} FROM purchases WHERE external_session_ref = $1",
                PURCHASE_COLUMNS
            );
            let existing = sqlx::query_as::<_, Purchase>(&select)
                .bind(&completion.external_session_ref)
                .fetch_optional(&mut *tx)
                .await?;
            return Ok(existing.map(|purchase| PurchaseCompleted {
                purchase,
                credited: false,
            }));
        };

        credit_in_tx(&mut tx, purchase.customer_id, purchase.credits(), true).await?;
        insert_log(
            &mut tx,
            NewTransactionLog {
                kind: TransactionKind::CreditPurchase,
                customer_id: purchase.customer_id,
                status: purchase.status.as_str().to_string(),
                amount: purchase.total_price,
                credits: purchase.credits(),
                reference: Some(purchase.external_session_ref.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(Some(PurchaseCompleted {
            purchase,
            credited: true,
        }))
    }

    async fn change_balance(&self, change: BalanceChange) -> BillingResult<Customer> {
        let mut tx = self.pool.begin().await?;

        let (customer, kind, credits) = match change.direction {
            BalanceDirection::Credit => (
                credit_in_tx(&mut tx, change.customer_id, change.amount, false).await?,
                TransactionKind::Credit,
                change.amount,
            ),
            BalanceDirection::Debit => (
                debit_in_tx(&mut tx, change.customer_id, change.amount).await?,
                TransactionKind::Debit,
                -change.amount,
            ),
        };

        insert_log(
            &mut tx,
            NewTransactionLog {
                kind,
                customer_id: change.customer_id,
                status: "COMPLETED".to_string(),
                amount: Decimal::ZERO,
                credits,
                reference: change.reference,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(customer)
    }

    async fn transfer(&self, transfer: BalanceTransfer) -> BillingResult<(Customer, Customer)> {
        let mut tx = self.pool.begin().await?;

        // Lock both rows in id order so opposite transfers cannot deadlock
        let locked: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM customers WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(vec![transfer.from_customer_id, transfer.to_customer_id])
        .fetch_all(&mut *tx)
        .await?;
        for id in [transfer.from_customer_id, transfer.to_customer_id] {
            if !locked.contains(&id) {
                return Err(BillingError::CustomerNotFound(id.to_string()));
            }
        }

        let from = debit_in_tx(&mut tx, transfer.from_customer_id, transfer.amount).await?;
        let to = credit_in_tx(&mut tx, transfer.to_customer_id, transfer.amount, false).await?;

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
            insert_log(
                &mut tx,
                NewTransactionLog {
                    kind,
                    customer_id,
                    status: "COMPLETED".to_string(),
                    amount: Decimal::ZERO,
                    credits,
                    reference: transfer.reference.clone(),
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok((from, to))
    }

    async fn transaction_history(
        &self,
        customer_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<TransactionLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM transaction_logs
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            LOG_COLUMNS
        );
        Ok(sqlx::query_as::<_, TransactionLog>(&sql)
            .bind(customer_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_refund_request(
        &self,
        request: NewRefundRequest,
    ) -> BillingResult<RefundRequest> {
        let sql = format!(
            r#"
            INSERT INTO refund_requests (
                id, kind, customer_id, purchase_id, subscription_id, reason, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING {}
            "#,
            REFUND_REQUEST_COLUMNS
        );
        sqlx::query_as::<_, RefundRequest>(&sql)
            .bind(Uuid::new_v4())
            .bind(request.kind)
            .bind(request.customer_id)
            .bind(request.purchase_id)
            .bind(request.subscription_id)
            .bind(&request.reason)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    let target = request
                        .purchase_id
                        .or(request.subscription_id)
                        .map(|id| id.to_string())
                        .unwrap_or_default();
                    BillingError::DuplicateRefundRequest(target)
                } else {
                    e.into()
                }
            })
    }

    async fn get_refund_request(&self, id: Uuid) -> BillingResult<Option<RefundRequest>> {
        let sql = format!(
            "SELECT {} FROM refund_requests WHERE id = $1",
            REFUND_REQUEST_COLUMNS
        );
        Ok(sqlx::query_as::<_, RefundRequest>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_pending_refund_requests(
        &self,
        page: PageRequest,
    ) -> BillingResult<Page<RefundRequest>> {
        let page = page.normalized();
        let sql = format!(
            r#"
            SELECT {} FROM refund_requests
            WHERE status = 'PENDING'
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
            REFUND_REQUEST_COLUMNS
        );
        let items = sqlx::query_as::<_, RefundRequest>(&sql)
            .bind(page.limit)
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM refund_requests WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;

        Ok(Page {
            items,
            page: page.page,
            limit: page.limit,
            total,
        })
    }

    async fn deny_refund_request(&self, id: Uuid, admin_id: Uuid) -> BillingResult<RefundRequest> {
        let sql = format!(
            r#"
            UPDATE refund_requests
            SET status = 'DENIED', decided_by = $2, decided_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            REFUND_REQUEST_COLUMNS
        );
        let denied = sqlx::query_as::<_, RefundRequest>(&sql)
            .bind(id)
            .bind(admin_id)
            .fetch_optional(&self.pool)
            .await?;

        match denied {
            Some(request) => Ok(request),
            None => match self.get_refund_request(id).await? {
                Some(_) => Err(BillingError::RequestAlreadyDecided(id)),
                None => Err(BillingError::NotFound(format!("refund request {}", id))),
            },
        }
    }

    async fn approve_purchase_refund(
        &self,
        approval: RefundApproval,
        effect: &dyn RefundEffect,
    ) -> BillingResult<ApprovedRefund> {
        let mut tx = self.pool.begin().await?;

        let request = lock_refund_request(&mut tx, approval.request_id).await?;
        check_pending(&request, RefundRequestKind::CreditPurchase)?;
        let purchase_id = request.purchase_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no purchase", request.id))
        })?;

        let select = format!(
            "SELECT {} FROM purchases WHERE id = $1 FOR UPDATE",
            PURCHASE_COLUMNS
        );
        let purchase = sqlx::query_as::<_, Purchase>(&select)
            .bind(purchase_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))?;

        let has_active_refund: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM refunds
                WHERE purchase_id = $1 AND status IN ('PENDING', 'SUCCEEDED')
            )
            "#,
        )
        .bind(purchase.id)
        .fetch_one(&mut *tx)
        .await?;

        let customer = lock_customer(&mut tx, purchase.customer_id).await?;
        check_purchase_refund(&purchase, customer.balance, has_active_refund)?;

        let credits = purchase.credits();
        debit_in_tx(&mut tx, customer.id, credits).await?;

        // Last step before the writes: a processor failure rolls everything back
        let view = effect.execute().await?.ok_or_else(|| {
            BillingError::Internal("purchase refund produced no Stripe refund".into())
        })?;

        let refund = insert_refund(
            &mut tx,
            &view,
            Some(purchase.id),
            request.id,
            purchase.total_price,
        )
        .await?;

        let cancelled = sqlx::query(
            "UPDATE purchases SET status = 'CANCELED' WHERE id = $1 AND status = 'PAID'",
        )
        .bind(purchase.id)
        .execute(&mut *tx)
        .await?;
        if cancelled.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "purchase {}",
                purchase.id
            )));
        }

        let request = mark_request_approved(&mut tx, request.id, approval.admin_id).await?;

        insert_log(
            &mut tx,
            NewTransactionLog {
                kind: TransactionKind::PurchaseRefund,
                customer_id: customer.id,
                status: refund.status.as_str().to_string(),
                amount: -refund.amount,
                credits: -credits,
                reference: Some(refund.external_refund_ref.clone()),
            },
        )
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let request = lock_refund_request(&mut tx, approval.request_id).await?;
        check_pending(&request, RefundRequestKind::Subscription)?;
        let subscription_id = request.subscription_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no subscription", request.id))
        })?;

        let select = format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, Subscription>(&select)
            .bind(subscription_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        let invoice = match &approval.invoice_ref {
            Some(invoice_ref) => {
                let select = format!(
                    "SELECT {} FROM invoices WHERE external_invoice_ref = $1 AND status = 'PAID' FOR UPDATE",
                    INVOICE_COLUMNS
                );
                sqlx::query_as::<_, InvoiceRecord>(&select)
                    .bind(invoice_ref)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };
        let credits = invoice
            .as_ref()
            .map(|i| i.credits_granted)
            .unwrap_or(Decimal::ZERO);

        let has_active_refund: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM refunds
                WHERE refund_request_id = $1 AND status IN ('PENDING', 'SUCCEEDED')
            )
            "#,
        )
        .bind(request.id)
        .fetch_one(&mut *tx)
        .await?;

        let customer = lock_customer(&mut tx, subscription.customer_id).await?;
        check_subscription_refund(customer.balance, credits, has_active_refund)?;

        if credits > Decimal::ZERO {
            debit_in_tx(&mut tx, customer.id, credits).await?;
        }

        let view = effect.execute().await?;

        let refund = match &view {
            Some(view) => Some(
                insert_refund(
                    &mut tx,
                    view,
                    None,
                    request.id,
                    invoice.as_ref().map(|i| i.amount).unwrap_or(Decimal::ZERO),
                )
                .await?,
            ),
            None => None,
        };

        cancel_and_unlink(&mut tx, subscription.id, OffsetDateTime::now_utc()).await?;
        let request = mark_request_approved(&mut tx, request.id, approval.admin_id).await?;

        insert_log(
            &mut tx,
            NewTransactionLog {
                kind: TransactionKind::SubscriptionRefund,
                customer_id: customer.id,
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
            },
        )
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT {} FROM refunds WHERE external_refund_ref = $1 FOR UPDATE",
            REFUND_COLUMNS
        );
        let Some(current) = sqlx::query_as::<_, RefundRecord>(&select)
            .bind(external_refund_ref)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(RefundStatusUpdate::Unknown);
        };

        if !refund_transition_allowed(current.status, status) {
            return Ok(RefundStatusUpdate::Unchanged(current));
        }

        let update = format!(
            r#"
            UPDATE refunds
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            REFUND_COLUMNS
        );
        let updated = sqlx::query_as::<_, RefundRecord>(&update)
            .bind(current.id)
            .bind(status)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RefundStatusUpdate::Updated(updated))
    }
}

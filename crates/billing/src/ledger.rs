//! Credit ledger
//!
//! Balance changes happen only here and in the store methods that call into
//! [`plan_invoice`]. Every change is a conditional update plus an append-only
//! TransactionLog row in the same transaction.

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Customer, InvoiceStatus, TransactionLog};
use crate::store::{
    BalanceChange, BalanceDirection, BalanceTransfer, BillingStore, InvoiceTransition,
};

/// Billing reason Stripe uses for proration and plan-change invoices
pub const BILLING_REASON_SUBSCRIPTION_UPDATE: &str = "subscription_update";

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// Whether an invoice with this billing reason earns the plan's monthly credits.
///
/// Proration and upgrade invoices do not; every other reason (creation,
/// regular cycle, manual) does.
pub fn grants_credits(billing_reason: Option<&str>) -> bool {
    billing_reason != Some(BILLING_REASON_SUBSCRIPTION_UPDATE)
}

/// What applying one invoice event does to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoicePlan {
    pub transition: InvoiceTransition,
    pub final_status: InvoiceStatus,
    /// Credits to add to the balance
    pub grant: Decimal,
    /// Signed monetary amount for the TransactionLog entry, if one is written
    pub log_amount: Option<Decimal>,
}

/// Decide the effect of an invoice event given what is already recorded.
///
/// - first PAID: grant credits (unless proration), log `+amount`
/// - first FAILED: no credits, log `-amount`
/// - FAILED then PAID: grant once, guarded by `credits_granted`
/// - PAID is never overturned; duplicates change nothing
pub fn plan_invoice(
    existing: Option<(InvoiceStatus, Decimal)>,
    incoming: InvoiceStatus,
    billing_reason: Option<&str>,
    monthly_credits: Decimal,
    amount: Decimal,
) -> InvoicePlan {
    let regular_grant = if grants_credits(billing_reason) {
        monthly_credits
    } else {
        Decimal::ZERO
    };
    let amount = amount.abs();

    match (existing, incoming) {
        (None, InvoiceStatus::Paid) => InvoicePlan {
            transition: InvoiceTransition::Created,
            final_status: InvoiceStatus::Paid,
            grant: regular_grant,
            log_amount: Some(amount),
        },
        (None, InvoiceStatus::Failed) => InvoicePlan {
            transition: InvoiceTransition::Created,
            final_status: InvoiceStatus::Failed,
            grant: Decimal::ZERO,
            log_amount: Some(-amount),
        },
        (Some((InvoiceStatus::Failed, already_granted)), InvoiceStatus::Paid) => InvoicePlan {
            transition: InvoiceTransition::UpgradedToPaid,
            final_status: InvoiceStatus::Paid,
            grant: if already_granted > Decimal::ZERO {
                Decimal::ZERO
            } else {
                regular_grant
            },
            log_amount: Some(amount),
        },
        (Some((status, _)), _) => InvoicePlan {
            transition: InvoiceTransition::Unchanged,
            final_status: status,
            grant: Decimal::ZERO,
            log_amount: None,
        },
    }
}

pub(crate) fn ensure_positive(amount: Decimal) -> BillingResult<()> {
    if amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Direct balance operations on behalf of other services
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn credit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> BillingResult<Customer> {
        ensure_positive(amount)?;
        let customer = self
            .store
            .change_balance(BalanceChange {
                customer_id,
                direction: BalanceDirection::Credit,
                amount,
                reference,
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            amount = %amount,
            balance = %customer.balance,
            "Credits added"
        );
        Ok(customer)
    }

    /// Fails with `InsufficientBalance` without writing anything when the
    /// balance does not cover `amount`.
    pub async fn debit(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> BillingResult<Customer> {
        ensure_positive(amount)?;
        let result = self
            .store
            .change_balance(BalanceChange {
                customer_id,
                direction: BalanceDirection::Debit,
                amount,
                reference,
            })
            .await;

        match &result {
            Ok(customer) => tracing::info!(
                customer_id = %customer_id,
                amount = %amount,
                balance = %customer.balance,
                "Credits debited"
            ),
            Err(BillingError::InsufficientBalance { available, .. }) => tracing::warn!(
                customer_id = %customer_id,
                amount = %amount,
                available = %available,
                "Debit rejected for insufficient balance"
            ),
            Err(_) => {}
        }
        result
    }

    /// Debit one customer and credit another in one transaction
    pub async fn transfer(
        &self,
        from_customer_id: Uuid,
        to_customer_id: Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> BillingResult<(Customer, Customer)> {
        ensure_positive(amount)?;
        if from_customer_id == to_customer_id {
            return Err(BillingError::InvalidInput(
                "cannot transfer credits to the same customer".into(),
            ));
        }

        let (from, to) = self
            .store
            .transfer(BalanceTransfer {
                from_customer_id,
                to_customer_id,
                amount,
                reference,
            })
            .await?;

        tracing::info!(
            from_customer_id = %from_customer_id,
            to_customer_id = %to_customer_id,
            amount = %amount,
            "Credits transferred"
        );
        Ok((from, to))
    }

    pub async fn balance(&self, customer_id: Uuid) -> BillingResult<Decimal> {
        self.store
            .get_customer(customer_id)
            .await?
            .map(|c| c.balance)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    pub async fn history(
        &self,
        customer_id: Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<TransactionLog>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
        self.store.transaction_history(customer_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_first_paid_invoice_grants_and_logs_positive() {
        let plan = plan_invoice(
            None,
            InvoiceStatus::Paid,
            Some("subscription_cycle"),
            dec!(100),
            dec!(29.90),
        );
        assert_eq!(plan.transition, InvoiceTransition::Created);
        assert_eq!(plan.grant, dec!(100));
        assert_eq!(plan.log_amount, Some(dec!(29.90)));
    }

    #[test]
    fn test_first_failed_invoice_logs_negative_without_credit() {
        let plan = plan_invoice(None, InvoiceStatus::Failed, None, dec!(100), dec!(29.90));
        assert_eq!(plan.final_status, InvoiceStatus::Failed);
        assert_eq!(plan.grant, Decimal::ZERO);
        assert_eq!(plan.log_amount, Some(dec!(-29.90)));
    }

    #[test]
    fn test_failed_then_paid_grants_once() {
        let upgrade = plan_invoice(
            Some((InvoiceStatus::Failed, Decimal::ZERO)),
            InvoiceStatus::Paid,
            None,
            dec!(100),
            dec!(10),
        );
        assert_eq!(upgrade.transition, InvoiceTransition::UpgradedToPaid);
        assert_eq!(upgrade.grant, dec!(100));

        let replay = plan_invoice(
            Some((InvoiceStatus::Paid, dec!(100))),
            InvoiceStatus::Paid,
            None,
            dec!(100),
            dec!(10),
        );
        assert_eq!(replay.transition, InvoiceTransition::Unchanged);
        assert_eq!(replay.grant, Decimal::ZERO);
        assert_eq!(replay.log_amount, None);
    }

    #[test]
    fn test_paid_is_never_overturned() {
        let plan = plan_invoice(
            Some((InvoiceStatus::Paid, dec!(100))),
            InvoiceStatus::Failed,
            None,
            dec!(100),
            dec!(10),
        );
        assert_eq!(plan.final_status, InvoiceStatus::Paid);
        assert_eq!(plan.transition, InvoiceTransition::Unchanged);
    }

    #[test]
    fn test_marker_blocks_second_grant_on_upgrade() {
        let plan = plan_invoice(
            Some((InvoiceStatus::Failed, dec!(100))),
            InvoiceStatus::Paid,
            None,
            dec!(100),
            dec!(10),
        );
        assert_eq!(plan.grant, Decimal::ZERO);
    }

    #[test]
    fn test_proration_invoice_grants_nothing() {
        assert!(!grants_credits(Some("subscription_update")));
        assert!(grants_credits(Some("subscription_create")));
        assert!(grants_credits(None));

        let plan = plan_invoice(
            None,
            InvoiceStatus::Paid,
            Some("subscription_update"),
            dec!(100),
            dec!(5),
        );
        assert_eq!(plan.final_status, InvoiceStatus::Paid);
        assert_eq!(plan.grant, Decimal::ZERO);
    }

    #[test]
    fn test_amounts_must_be_positive() {
        assert!(ensure_positive(dec!(0.01)).is_ok());
        assert!(matches!(
            ensure_positive(Decimal::ZERO),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(ensure_positive(dec!(-1)).is_err());
    }
}

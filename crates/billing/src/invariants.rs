//! Ledger invariant checks
//!
//! Read-only SQL checks over the reconciliation tables. They never write;
//! the worker runs them on a schedule and reports what it finds.
//!
//! ## What is checked
//!
//! 1. No customer balance is negative
//! 2. No customer still points at a CANCELED subscription
//! 3. Every PAID regular invoice of a plan with credits granted them
//! 4. At most one active refund per purchase and per refund request
//! 5. Every PAID purchase has its credit log entry

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::BILLING_REASON_SUBSCRIPTION_UPDATE;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customers affected
    pub customer_ids: Vec<Uuid>,
    pub description: String,
    /// Row-level details for whoever reconciles it
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or credits are wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Emit one log line per violation at a level matching its severity
    pub fn log(&self) {
        for violation in &self.violations {
            match violation.severity {
                ViolationSeverity::Critical | ViolationSeverity::High => tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    customer_ids = ?violation.customer_ids,
                    context = %violation.context,
                    "{}",
                    violation.description
                ),
                ViolationSeverity::Medium | ViolationSeverity::Low => tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    customer_ids = ?violation.customer_ids,
                    context = %violation.context,
                    "{}",
                    violation.description
                ),
            }
        }
        tracing::info!(
            checks_run = self.checks_run,
            checks_passed = self.checks_passed,
            checks_failed = self.checks_failed,
            healthy = self.healthy,
            "Ledger invariant check finished"
        );
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    customer_id: Uuid,
    balance: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledLinkRow {
    customer_id: Uuid,
    subscription_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UncreditedInvoiceRow {
    customer_id: Uuid,
    external_invoice_ref: String,
    billing_reason: Option<String>,
    monthly_credits: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateRefundRow {
    customer_id: Uuid,
    target: String,
    target_id: Uuid,
    refund_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnloggedPurchaseRow {
    customer_id: Uuid,
    purchase_id: Uuid,
    external_session_ref: String,
    quantity: i32,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_canceled_subscriptions_unlinked().await?);
        violations.extend(self.check_paid_invoices_credited().await?);
        violations.extend(self.check_single_active_refund().await?);
        violations.extend(self.check_paid_purchases_logged().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: balances never go below zero
    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT id AS customer_id, balance
            FROM customers
            WHERE balance < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!("Customer balance is negative: {}", row.balance),
                context: serde_json::json!({ "balance": row.balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: CANCELED subscriptions are unlinked from every customer
    async fn check_canceled_subscriptions_unlinked(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledLinkRow> = sqlx::query_as(
            r#"
            SELECT c.id AS customer_id, s.id AS subscription_id
            FROM customers c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE s.status = 'CANCELED'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_subscription_unlinked".to_string(),
                customer_ids: vec![row.customer_id],
                description: "Customer still linked to a canceled subscription".to_string(),
                context: serde_json::json!({ "subscription_id": row.subscription_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: a PAID invoice outside plan changes carries its credits
    async fn check_paid_invoices_credited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UncreditedInvoiceRow> = sqlx::query_as(
            r#"
            SELECT
                i.customer_id,
                i.external_invoice_ref,
                i.billing_reason,
                p.monthly_credits
            FROM invoices i
            JOIN plans p ON p.id = i.plan_id
            WHERE i.status = 'PAID'
              AND i.credits_granted = 0
              AND p.monthly_credits > 0
              AND i.billing_reason IS DISTINCT FROM $1
            "#,
        )
        .bind(BILLING_REASON_SUBSCRIPTION_UPDATE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoice_credited".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Paid invoice {} granted no credits (plan grants {})",
                    row.external_invoice_ref, row.monthly_credits
                ),
                context: serde_json::json!({
                    "invoice": row.external_invoice_ref,
                    "billing_reason": row.billing_reason,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: refunds in PENDING or SUCCEEDED are exclusive per target
    async fn check_single_active_refund(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateRefundRow> = sqlx::query_as(
            r#"
            SELECT p.customer_id, 'purchase' AS target, r.purchase_id AS target_id,
                   COUNT(*) AS refund_count
            FROM refunds r
            JOIN purchases p ON p.id = r.purchase_id
            WHERE r.status IN ('PENDING', 'SUCCEEDED')
            GROUP BY p.customer_id, r.purchase_id
            HAVING COUNT(*) > 1
            UNION ALL
            SELECT q.customer_id, 'refund_request' AS target, r.refund_request_id AS target_id,
                   COUNT(*) AS refund_count
            FROM refunds r
            JOIN refund_requests q ON q.id = r.refund_request_id
            WHERE r.status IN ('PENDING', 'SUCCEEDED')
            GROUP BY q.customer_id, r.refund_request_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_refund".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "{} {} has {} active refunds (expected at most 1)",
                    row.target, row.target_id, row.refund_count
                ),
                context: serde_json::json!({
                    "target": row.target,
                    "target_id": row.target_id,
                    "refund_count": row.refund_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: crediting a purchase always wrote its log entry
    async fn check_paid_purchases_logged(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnloggedPurchaseRow> = sqlx::query_as(
            r#"
            SELECT p.customer_id, p.id AS purchase_id, p.external_session_ref, p.quantity
            FROM purchases p
            WHERE p.status = 'PAID'
              AND NOT EXISTS (
                  SELECT 1 FROM transaction_logs l
                  WHERE l.kind = 'CREDIT_PURCHASE'
                    AND l.customer_id = p.customer_id
                    AND l.reference = p.external_session_ref
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_purchase_logged".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Paid purchase {} has no credit log entry",
                    row.purchase_id
                ),
                context: serde_json::json!({
                    "purchase_id": row.purchase_id,
                    "session": row.external_session_ref,
                    "quantity": row.quantity,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "non_negative_balance" => self.check_non_negative_balance().await,
            "canceled_subscription_unlinked" => self.check_canceled_subscriptions_unlinked().await,
            "paid_invoice_credited" => self.check_paid_invoices_credited().await,
            "single_active_refund" => self.check_single_active_refund().await,
            "paid_purchase_logged" => self.check_paid_purchases_logged().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "non_negative_balance",
            "canceled_subscription_unlinked",
            "paid_invoice_credited",
            "single_active_refund",
            "paid_purchase_logged",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            customer_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            5,
            vec![
                violation("non_negative_balance"),
                violation("non_negative_balance"),
                violation("paid_purchase_logged"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_active_refund"));
    }
}

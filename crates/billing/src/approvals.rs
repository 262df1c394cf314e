//! Refund requests and their admin approval
//!
//! A refund request is PENDING until an admin approves or denies it; both
//! decisions are final. Approval takes back the credits the refunded payment
//! granted, records the processor refund, and (for subscriptions) cancels the
//! subscription. All of it commits in one store transaction, with the
//! processor call executed last inside that transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{CreateRefundRequest, PaymentGateway, RefundTarget};
use crate::models::{
    amount_to_cents, Purchase, PurchaseStatus, RefundRecord, RefundRequest, RefundRequestKind,
    RefundRequestStatus, SubscriptionStatus,
};
use crate::objects::{RefundView, METADATA_REFUND_REQUEST_ID};
use crate::resolver::{RefundTargetResolver, Resolution};
use crate::store::{
    BillingStore, NewRefundRequest, Page, PageRequest, RefundApproval, RefundEffect,
};

// =============================================================================
// Eligibility, shared by every store implementation
// =============================================================================

pub(crate) fn check_pending(request: &RefundRequest, kind: RefundRequestKind) -> BillingResult<()> {
    if request.kind != kind {
        return Err(BillingError::NotFound(format!(
            "{} refund request {}",
            kind.as_str(),
            request.id
        )));
    }
    if request.status != RefundRequestStatus::Pending {
        return Err(BillingError::RequestAlreadyDecided(request.id));
    }
    Ok(())
}

/// A purchase refund needs a PAID purchase, no active refund, and the
/// purchased credits still on the balance.
///
/// The balance check stands in for "credits not yet spent". It is only an
/// approximation: there is no per-purchase consumption record, so credits
/// from other sources can cover a purchase whose own credits were spent.
pub(crate) fn check_purchase_refund(
    purchase: &Purchase,
    balance: Decimal,
    has_active_refund: bool,
) -> BillingResult<()> {
    if purchase.status != PurchaseStatus::Paid {
        return Err(BillingError::InvalidState(format!(
            "purchase {} is {}, only PAID purchases can be refunded",
            purchase.id,
            purchase.status.as_str()
        )));
    }
    if has_active_refund {
        return Err(BillingError::RefundAlreadyExists(format!(
            "purchase {}",
            purchase.id
        )));
    }
    let credits = purchase.credits();
    if balance < credits {
        return Err(BillingError::InsufficientBalance {
            requested: credits,
            available: balance,
        });
    }
    Ok(())
}

/// A subscription refund takes back the credits of the refunded invoice
pub(crate) fn check_subscription_refund(
    balance: Decimal,
    credits_to_revoke: Decimal,
    has_active_refund: bool,
) -> BillingResult<()> {
    if has_active_refund {
        return Err(BillingError::RefundAlreadyExists(
            "subscription refund request".into(),
        ));
    }
    if balance < credits_to_revoke {
        return Err(BillingError::InsufficientBalance {
            requested: credits_to_revoke,
            available: balance,
        });
    }
    Ok(())
}

// =============================================================================
// Processor effects
// =============================================================================

fn idempotency_key(request_id: Uuid) -> String {
    format!("refund-request-{}", request_id)
}

fn refund_metadata(request: &RefundRequest, admin_id: Uuid) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_REFUND_REQUEST_ID.to_string(), request.id.to_string());
    metadata.insert("customer_id".to_string(), request.customer_id.to_string());
    metadata.insert("admin_user_id".to_string(), admin_id.to_string());
    metadata
}

struct PurchaseRefundEffect {
    gateway: Arc<dyn PaymentGateway>,
    request: CreateRefundRequest,
}

#[async_trait]
impl RefundEffect for PurchaseRefundEffect {
    async fn execute(&self) -> BillingResult<Option<RefundView>> {
        self.gateway.create_refund(&self.request).await.map(Some)
    }
}

struct SubscriptionRefundEffect {
    gateway: Arc<dyn PaymentGateway>,
    refund: Option<CreateRefundRequest>,
    subscription_ref: Option<String>,
}

#[async_trait]
impl RefundEffect for SubscriptionRefundEffect {
    async fn execute(&self) -> BillingResult<Option<RefundView>> {
        // Refund first: it carries an idempotency key, so a retried approval
        // gets the same refund back even if the cancel below failed
        let refund = match &self.refund {
            Some(request) => Some(self.gateway.create_refund(request).await?),
            None => None,
        };

        if let Some(subscription_ref) = &self.subscription_ref {
            match self.gateway.cancel_subscription(subscription_ref).await {
                Ok(_) => {}
                Err(BillingError::NotFound(_)) | Err(BillingError::StripeRejected(_)) => {
                    tracing::warn!(
                        subscription_ref = %subscription_ref,
                        "Subscription already gone at Stripe, canceling locally only"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(refund)
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResult {
    pub request: RefundRequest,
    pub refund: Option<RefundRecord>,
    pub credits_revoked: Decimal,
    /// Set when the money could not be returned automatically
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct RefundApprovalService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    resolver: RefundTargetResolver,
}

impl RefundApprovalService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        resolver: RefundTargetResolver,
    ) -> Self {
        Self {
            store,
            gateway,
            resolver,
        }
    }

    async fn load_request(
        &self,
        id: Uuid,
        kind: RefundRequestKind,
    ) -> BillingResult<RefundRequest> {
        let request = self
            .store
            .get_refund_request(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("refund request {}", id)))?;
        check_pending(&request, kind)?;
        Ok(request)
    }

    /// Pending requests of both kinds, newest first
    pub async fn list_pending(&self, page: PageRequest) -> BillingResult<Page<RefundRequest>> {
        self.store
            .list_pending_refund_requests(page.normalized())
            .await
    }

    pub async fn approve(
        &self,
        kind: RefundRequestKind,
        request_id: Uuid,
        admin_id: Uuid,
    ) -> BillingResult<ApprovalResult> {
        match kind {
            RefundRequestKind::CreditPurchase => {
                self.approve_purchase_refund(request_id, admin_id).await
            }
            RefundRequestKind::Subscription => {
                self.approve_subscription_refund(request_id, admin_id).await
            }
        }
    }

    async fn approve_purchase_refund(
        &self,
        request_id: Uuid,
        admin_id: Uuid,
    ) -> BillingResult<ApprovalResult> {
        let request = self
            .load_request(request_id, RefundRequestKind::CreditPurchase)
            .await?;
        let purchase_id = request.purchase_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no purchase", request_id))
        })?;
        let purchase = self
            .store
            .get_purchase(purchase_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))?;
        let customer = self
            .store
            .get_customer(purchase.customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(purchase.customer_id.to_string()))?;

        // Cheap early rejection; the store repeats the check under lock
        check_purchase_refund(&purchase, customer.balance, false)?;

        let payment_ref = match purchase.external_payment_ref.clone() {
            Some(payment_ref) => payment_ref,
            None => self
                .gateway
                .retrieve_checkout_session(&purchase.external_session_ref)
                .await?
                .payment_intent_ref()
                .map(str::to_string)
                .ok_or_else(|| {
                    BillingError::InvalidState(format!(
                        "purchase {} has no payment to refund",
                        purchase.id
                    ))
                })?,
        };

        let effect = PurchaseRefundEffect {
            gateway: self.gateway.clone(),
            request: CreateRefundRequest {
                target: RefundTarget::PaymentIntent(payment_ref),
                amount_cents: amount_to_cents(purchase.total_price),
                idempotency_key: idempotency_key(request.id),
                metadata: refund_metadata(&request, admin_id),
            },
        };

        let approved = self
            .store
            .approve_purchase_refund(
                RefundApproval {
                    request_id,
                    admin_id,
                    invoice_ref: None,
                },
                &effect,
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            admin_id = %admin_id,
            purchase_id = %purchase.id,
            credits_revoked = %approved.credits_revoked,
            "Credit purchase refund approved"
        );

        Ok(ApprovalResult {
            request: approved.request,
            refund: approved.refund,
            credits_revoked: approved.credits_revoked,
            warning: None,
        })
    }

    async fn approve_subscription_refund(
        &self,
        request_id: Uuid,
        admin_id: Uuid,
    ) -> BillingResult<ApprovalResult> {
        let request = self
            .load_request(request_id, RefundRequestKind::Subscription)
            .await?;
        let subscription_id = request.subscription_id.ok_or_else(|| {
            BillingError::Internal(format!("refund request {} has no subscription", request_id))
        })?;
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        let customer = self
            .store
            .get_customer(subscription.customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(subscription.customer_id.to_string()))?;
        let invoice = self.store.latest_paid_invoice(subscription.id).await?;

        let credits_to_revoke = invoice
            .as_ref()
            .map(|i| i.credits_granted)
            .unwrap_or(Decimal::ZERO);
        check_subscription_refund(customer.balance, credits_to_revoke, false)?;

        let resolution = match &invoice {
            Some(invoice) => {
                self.resolver
                    .resolve_invoice_ref(&invoice.external_invoice_ref)
                    .await?
            }
            None => Resolution::NoTarget,
        };

        let warning = match (&resolution, &invoice) {
            (Resolution::Found { .. }, _) => None,
            (Resolution::NoTarget, Some(invoice)) => Some(format!(
                "No refund target found for invoice {}; the refund must be issued manually",
                invoice.external_invoice_ref
            )),
            (Resolution::NoTarget, None) => Some(
                "Subscription has no paid invoice; the refund must be issued manually".to_string(),
            ),
        };

        let subscription_ref = if subscription.status == SubscriptionStatus::Canceled {
            None
        } else {
            subscription.external_subscription_ref.clone()
        };

        let effect = SubscriptionRefundEffect {
            gateway: self.gateway.clone(),
            refund: resolution.target().map(|target| CreateRefundRequest {
                target: target.clone(),
                amount_cents: None,
                idempotency_key: idempotency_key(request.id),
                metadata: refund_metadata(&request, admin_id),
            }),
            subscription_ref,
        };

        let approved = self
            .store
            .approve_subscription_refund(
                RefundApproval {
                    request_id,
                    admin_id,
                    invoice_ref: invoice.as_ref().map(|i| i.external_invoice_ref.clone()),
                },
                &effect,
            )
            .await?;

        if let Some(warning) = &warning {
            tracing::warn!(
                request_id = %request_id,
                subscription_id = %subscription.id,
                warning = %warning,
                "Subscription refund approved without processor refund"
            );
        } else {
            tracing::info!(
                request_id = %request_id,
                admin_id = %admin_id,
                subscription_id = %subscription.id,
                credits_revoked = %approved.credits_revoked,
                "Subscription refund approved"
            );
        }

        Ok(ApprovalResult {
            request: approved.request,
            refund: approved.refund,
            credits_revoked: approved.credits_revoked,
            warning,
        })
    }

    /// Deny a pending request. No balance, purchase or subscription changes.
    pub async fn deny(
        &self,
        kind: RefundRequestKind,
        request_id: Uuid,
        admin_id: Uuid,
    ) -> BillingResult<RefundRequest> {
        self.load_request(request_id, kind).await?;
        let request = self.store.deny_refund_request(request_id, admin_id).await?;
        tracing::info!(
            request_id = %request_id,
            admin_id = %admin_id,
            kind = kind.as_str(),
            "Refund request denied"
        );
        Ok(request)
    }

    /// A customer asks for a credit purchase to be refunded
    pub async fn request_purchase_refund(
        &self,
        customer_id: Uuid,
        purchase_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<RefundRequest> {
        let purchase = self
            .store
            .get_purchase(purchase_id)
            .await?
            .filter(|p| p.customer_id == customer_id)
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))?;

        if purchase.status != PurchaseStatus::Paid {
            return Err(BillingError::InvalidState(format!(
                "purchase {} is {}",
                purchase.id,
                purchase.status.as_str()
            )));
        }

        let request = self
            .store
            .create_refund_request(NewRefundRequest {
                kind: RefundRequestKind::CreditPurchase,
                customer_id,
                purchase_id: Some(purchase_id),
                subscription_id: None,
                reason,
            })
            .await?;

        tracing::info!(
            request_id = %request.id,
            customer_id = %customer_id,
            purchase_id = %purchase_id,
            "Credit purchase refund requested"
        );
        Ok(request)
    }

    /// A customer asks for their subscription's last payment back
    pub async fn request_subscription_refund(
        &self,
        customer_id: Uuid,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<RefundRequest> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .filter(|s| s.customer_id == customer_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "subscription {} is already canceled",
                subscription.id
            )));
        }

        let request = self
            .store
            .create_refund_request(NewRefundRequest {
                kind: RefundRequestKind::Subscription,
                customer_id,
                purchase_id: None,
                subscription_id: Some(subscription_id),
                reason,
            })
            .await?;

        tracing::info!(
            request_id = %request.id,
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Subscription refund requested"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn purchase(status: PurchaseStatus, quantity: i32) -> Purchase {
        Purchase {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            external_session_ref: "cs_1".into(),
            external_payment_ref: Some("pi_1".into()),
            quantity,
            unit_price: dec!(1.50),
            total_price: dec!(1.50) * Decimal::from(quantity),
            status,
            created_at: OffsetDateTime::now_utc(),
            paid_at: None,
        }
    }

    fn request(kind: RefundRequestKind, status: RefundRequestStatus) -> RefundRequest {
        RefundRequest {
            id: Uuid::new_v4(),
            kind,
            customer_id: Uuid::new_v4(),
            purchase_id: None,
            subscription_id: None,
            reason: None,
            status,
            decided_by: None,
            decided_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_decided_requests_conflict() {
        for status in [RefundRequestStatus::Approved, RefundRequestStatus::Denied] {
            let r = request(RefundRequestKind::CreditPurchase, status);
            assert!(matches!(
                check_pending(&r, RefundRequestKind::CreditPurchase),
                Err(BillingError::RequestAlreadyDecided(_))
            ));
        }
    }

    #[test]
    fn test_kind_mismatch_is_not_found() {
        let r = request(RefundRequestKind::Subscription, RefundRequestStatus::Pending);
        assert!(matches!(
            check_pending(&r, RefundRequestKind::CreditPurchase),
            Err(BillingError::NotFound(_))
        ));
    }

    #[test]
    fn test_purchase_refund_needs_unspent_credits() {
        let p = purchase(PurchaseStatus::Paid, 10);
        assert!(check_purchase_refund(&p, dec!(10), false).is_ok());
        assert!(matches!(
            check_purchase_refund(&p, dec!(9.5), false),
            Err(BillingError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_purchase_refund_needs_paid_purchase_without_active_refund() {
        let pending = purchase(PurchaseStatus::Pending, 1);
        assert!(matches!(
            check_purchase_refund(&pending, dec!(100), false),
            Err(BillingError::InvalidState(_))
        ));

        let paid = purchase(PurchaseStatus::Paid, 1);
        assert!(matches!(
            check_purchase_refund(&paid, dec!(100), true),
            Err(BillingError::RefundAlreadyExists(_))
        ));
    }

    #[test]
    fn test_subscription_refund_balance_check() {
        assert!(check_subscription_refund(dec!(100), dec!(100), false).is_ok());
        assert!(check_subscription_refund(dec!(5), Decimal::ZERO, false).is_ok());
        assert!(matches!(
            check_subscription_refund(dec!(99), dec!(100), false),
            Err(BillingError::InsufficientBalance { .. })
        ));
    }
}

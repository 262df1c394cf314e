//! Refund status tracking
//!
//! Refunds start PENDING when an approval creates them at Stripe. The
//! `charge.refund.updated` and `refund.updated` events move them to
//! SUCCEEDED or FAILED. Those are terminal; a late or replayed event never
//! reopens a refund.
//!
//! Stripe can send the update before the approval transaction that records
//! the refund has committed. An unknown refund that an approval created is
//! reported as retryable so the event comes back.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::models::{RefundRecord, RefundStatus};
use crate::objects::RefundView;
use crate::router::EventOutcome;
use crate::store::{BillingStore, RefundStatusUpdate};

/// Whether a stored refund may move to `incoming`
pub(crate) fn refund_transition_allowed(current: RefundStatus, incoming: RefundStatus) -> bool {
    current == RefundStatus::Pending && incoming.is_terminal()
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl RefundService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn handle_refund_updated(&self, refund: &RefundView) -> BillingResult<EventOutcome> {
        let incoming = RefundStatus::from_external(refund.status.as_deref());
        if !incoming.is_terminal() {
            return Ok(EventOutcome::ignored("refund still pending"));
        }

        match self.store.update_refund_status(&refund.id, incoming).await? {
            RefundStatusUpdate::Updated(record) => {
                log_settled(&record);
                Ok(EventOutcome::Applied)
            }
            RefundStatusUpdate::Unchanged(_) => {
                Ok(EventOutcome::ignored("refund already in a terminal state"))
            }
            RefundStatusUpdate::Unknown => self.unknown_refund(refund).await,
        }
    }

    /// Payload metadata first, then a fresh read from Stripe
    async fn unknown_refund(&self, refund: &RefundView) -> BillingResult<EventOutcome> {
        let request_id = match refund.refund_request_id() {
            Some(id) => Some(id),
            None => self.gateway.retrieve_refund(&refund.id).await?.refund_request_id(),
        };

        match request_id {
            Some(request_id) => {
                tracing::warn!(
                    external_refund_ref = %refund.id,
                    refund_request_id = %request_id,
                    "Refund update arrived before its approval was recorded"
                );
                Err(BillingError::ConcurrentModification(format!(
                    "refund {} is not recorded yet",
                    refund.id
                )))
            }
            None => Ok(EventOutcome::ignored("refund not created by an approval")),
        }
    }
}

fn log_settled(record: &RefundRecord) {
    if record.status == RefundStatus::Failed {
        // Credits were already taken back at approval; money was not returned
        tracing::error!(
            refund_id = %record.id,
            external_refund_ref = %record.external_refund_ref,
            amount = %record.amount,
            "Stripe refund failed, manual reconciliation needed"
        );
    } else {
        tracing::info!(
            refund_id = %record.id,
            external_refund_ref = %record.external_refund_ref,
            "Refund succeeded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_status_is_monotonic() {
        use RefundStatus::*;
        assert!(refund_transition_allowed(Pending, Succeeded));
        assert!(refund_transition_allowed(Pending, Failed));
        assert!(!refund_transition_allowed(Pending, Pending));
        assert!(!refund_transition_allowed(Succeeded, Failed));
        assert!(!refund_transition_allowed(Failed, Succeeded));
    }
}

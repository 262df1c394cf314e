//! One-off credit purchases
//!
//! A purchase row is created PENDING when the checkout session is opened and
//! keyed by the session id. Completion flips it to PAID and credits the
//! quantity in the same transaction; the `status = PENDING` guard makes that
//! happen once no matter how often Stripe delivers the event.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::Purchase;
use crate::objects::{CheckoutMode, CheckoutSessionView};
use crate::router::EventOutcome;
use crate::store::{BillingStore, PurchaseCompletion};

#[derive(Clone)]
pub struct PurchaseService {
    store: Arc<dyn BillingStore>,
}

impl PurchaseService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// `checkout.session.completed` (payment mode) and
    /// `checkout.session.async_payment_succeeded`
    pub async fn handle_session_paid(
        &self,
        session: &CheckoutSessionView,
    ) -> BillingResult<EventOutcome> {
        if session.mode() != CheckoutMode::Payment {
            return Ok(EventOutcome::ignored("not a payment checkout"));
        }

        // Delayed payment methods complete the session unpaid and send
        // async_payment_succeeded later
        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed without payment yet"
            );
            return Ok(EventOutcome::ignored("payment not completed"));
        }

        let completed = self
            .store
            .complete_purchase(PurchaseCompletion {
                external_session_ref: session.id.clone(),
                external_payment_ref: session.payment_intent_ref().map(str::to_string),
                paid_at: OffsetDateTime::now_utc(),
            })
            .await?;

        match completed {
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "Paid checkout session has no local purchase"
                );
                Ok(EventOutcome::ignored("unknown checkout session"))
            }
            Some(done) if !done.credited => {
                tracing::debug!(
                    purchase_id = %done.purchase.id,
                    status = ?done.purchase.status,
                    "Purchase already completed"
                );
                Ok(EventOutcome::ignored("purchase already completed"))
            }
            Some(done) => {
                tracing::info!(
                    purchase_id = %done.purchase.id,
                    customer_id = %done.purchase.customer_id,
                    credits = %done.purchase.credits(),
                    "Credit purchase completed"
                );
                Ok(EventOutcome::Applied)
            }
        }
    }

    pub async fn get(&self, purchase_id: Uuid) -> BillingResult<Purchase> {
        self.store
            .get_purchase(purchase_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("purchase {}", purchase_id)))
    }
}

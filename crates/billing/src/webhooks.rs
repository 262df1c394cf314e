//! Stripe webhook handling
//!
//! Two endpoints, each with its own signing secret: one for one-off credit
//! purchases, one for subscriptions. A delivery is verified, checked against
//! the configured live/test mode, routed through the allow-list and handed to
//! the owning service. Nothing is written before the signature passes.

use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::error::BillingResult;
use crate::models::InvoiceStatus;
use crate::objects::{CheckoutSessionView, InvoiceView, RefundView, SubscriptionView, WebhookEvent};
use crate::purchases::PurchaseService;
use crate::refund::RefundService;
use crate::router::{route, Endpoint, EventOutcome, Route};
use crate::subscriptions::SubscriptionService;
use crate::verifier::WebhookVerifier;

/// Result of a delivery that passed signature verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { event_id: String, event_type: String },
    Ignored { event_id: Option<String>, reason: String },
}

impl WebhookOutcome {
    fn ignored(event_id: Option<&str>, reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            event_id: event_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, WebhookOutcome::Processed { .. })
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    purchases_verifier: WebhookVerifier,
    subscriptions_verifier: WebhookVerifier,
    live_mode: bool,
    subscriptions: SubscriptionService,
    purchases: PurchaseService,
    refunds: RefundService,
}

impl WebhookHandler {
    pub fn new(
        config: &StripeConfig,
        subscriptions: SubscriptionService,
        purchases: PurchaseService,
        refunds: RefundService,
    ) -> Self {
        Self {
            purchases_verifier: WebhookVerifier::new(
                config.purchases_webhook_secret.clone(),
                config.webhook_tolerance_secs,
            ),
            subscriptions_verifier: WebhookVerifier::new(
                config.subscriptions_webhook_secret.clone(),
                config.webhook_tolerance_secs,
            ),
            live_mode: config.is_live_mode(),
            subscriptions,
            purchases,
            refunds,
        }
    }

    fn verifier(&self, endpoint: Endpoint) -> &WebhookVerifier {
        match endpoint {
            Endpoint::Purchases => &self.purchases_verifier,
            Endpoint::Subscriptions => &self.subscriptions_verifier,
        }
    }

    pub async fn handle(
        &self,
        endpoint: Endpoint,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookOutcome> {
        self.handle_at(
            endpoint,
            payload,
            signature,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .await
    }

    /// Handle a delivery, verifying the signature against `now`
    pub async fn handle_at(
        &self,
        endpoint: Endpoint,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookOutcome> {
        self.verifier(endpoint).verify_at(payload, signature, now)?;

        // Signed by Stripe but unreadable: retrying would fail the same way
        let event: WebhookEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    endpoint = endpoint.as_str(),
                    error = %e,
                    "Verified webhook payload is not a readable event"
                );
                return Ok(WebhookOutcome::ignored(None, "malformed event payload"));
            }
        };

        if event.livemode != self.live_mode {
            tracing::warn!(
                event_id = %event.id,
                event_livemode = event.livemode,
                configured_livemode = self.live_mode,
                "Webhook from the other Stripe mode ignored"
            );
            return Ok(WebhookOutcome::ignored(Some(&event.id), "livemode mismatch"));
        }

        let Some(handler) = route(endpoint, &event) else {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                endpoint = endpoint.as_str(),
                "Event type not handled on this endpoint"
            );
            return Ok(WebhookOutcome::ignored(
                Some(&event.id),
                format!("{} not handled", event.event_type),
            ));
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            endpoint = endpoint.as_str(),
            "Processing Stripe webhook"
        );

        let outcome = match self.dispatch(handler, &event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Webhook processing failed, Stripe will retry"
                    );
                } else {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Webhook rejected"
                    );
                }
                return Err(e);
            }
        };

        Ok(match outcome {
            EventOutcome::Applied => WebhookOutcome::Processed {
                event_id: event.id,
                event_type: event.event_type,
            },
            EventOutcome::Ignored(reason) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Webhook acknowledged without changes"
                );
                WebhookOutcome::ignored(Some(&event.id), reason)
            }
        })
    }

    async fn dispatch(&self, route: Route, event: &WebhookEvent) -> BillingResult<EventOutcome> {
        match route {
            Route::PurchaseCompleted => {
                let session: CheckoutSessionView = event.object()?;
                self.purchases.handle_session_paid(&session).await
            }
            Route::SubscriptionCheckoutCompleted => {
                let session: CheckoutSessionView = event.object()?;
                self.subscriptions.handle_checkout_completed(&session).await
            }
            Route::SubscriptionUpdated => {
                let subscription: SubscriptionView = event.object()?;
                self.subscriptions
                    .handle_subscription_updated(&subscription)
                    .await
            }
            Route::SubscriptionDeleted => {
                let subscription: SubscriptionView = event.object()?;
                self.subscriptions
                    .handle_subscription_deleted(&subscription)
                    .await
            }
            Route::InvoicePaid => {
                let invoice: InvoiceView = event.object()?;
                self.subscriptions
                    .handle_invoice(&invoice, InvoiceStatus::Paid)
                    .await
            }
            Route::InvoicePaymentFailed => {
                let invoice: InvoiceView = event.object()?;
                self.subscriptions
                    .handle_invoice(&invoice, InvoiceStatus::Failed)
                    .await
            }
            Route::RefundUpdated => {
                let refund: RefundView = event.object()?;
                self.refunds.handle_refund_updated(&refund).await
            }
        }
    }
}

//! Checkout session creation
//!
//! Stripe Checkout runs in one of two UI modes with mutually exclusive
//! parameters: hosted pages need success and cancel URLs, embedded checkout
//! needs a return URL and hands back a client secret. [`CheckoutUi`] makes it
//! impossible to mix them.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutSessionRequest, CheckoutUiMode, CreateCustomerRequest, PaymentGateway};
use crate::models::{Customer, SubscriptionStatus};
use crate::objects::{CheckoutMode, METADATA_CUSTOMER_ID, METADATA_PLAN_ID, METADATA_QUANTITY};
use crate::store::{BillingStore, NewPurchase};

/// Largest number of credits a single checkout may buy
pub const MAX_CREDITS_PER_PURCHASE: i32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "ui_mode", rename_all = "snake_case")]
pub enum CheckoutUi {
    Hosted {
        #[serde(default)]
        success_url: Option<String>,
        #[serde(default)]
        cancel_url: Option<String>,
    },
    Embedded {
        #[serde(default)]
        return_url: Option<String>,
    },
}

impl Default for CheckoutUi {
    fn default() -> Self {
        CheckoutUi::Hosted {
            success_url: None,
            cancel_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutStarted {
    pub session_id: String,
    pub ui_mode: CheckoutUiMode,
    /// Redirect target for hosted checkout
    pub url: Option<String>,
    /// Mount secret for embedded checkout
    pub client_secret: Option<String>,
    pub purchase_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: Arc<StripeConfig>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<StripeConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    async fn load_customer(&self, customer_id: Uuid) -> BillingResult<Customer> {
        self.store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    /// Stripe customer for a local customer, created on first checkout
    pub async fn ensure_external_customer(&self, customer: &Customer) -> BillingResult<String> {
        if let Some(external_ref) = &customer.external_customer_ref {
            return Ok(external_ref.clone());
        }

        let created = self
            .gateway
            .create_customer(&CreateCustomerRequest {
                email: customer.email.clone(),
                name: customer.name.clone(),
                local_customer_id: customer.id,
            })
            .await?;
        self.store
            .set_customer_external_ref(customer.id, &created.id)
            .await?;

        tracing::info!(
            customer_id = %customer.id,
            stripe_customer_id = %created.id,
            "Stripe customer created"
        );
        Ok(created.id)
    }

    fn session_request(
        &self,
        mode: CheckoutMode,
        ui: &CheckoutUi,
        customer_ref: String,
        price_ref: String,
        quantity: u64,
        customer_id: Uuid,
        metadata: HashMap<String, String>,
    ) -> CheckoutSessionRequest {
        let base = self.config.app_base_url.trim_end_matches('/');
        let default_success =
            format!("{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}", base);
        let default_cancel = format!("{}/billing/cancel", base);
        let default_return = format!("{}/billing/return?session_id={{CHECKOUT_SESSION_ID}}", base);

        let (ui_mode, success_url, cancel_url, return_url) = match ui {
            CheckoutUi::Hosted {
                success_url,
                cancel_url,
            } => (
                CheckoutUiMode::Hosted,
                success_url.clone().unwrap_or(default_success),
                cancel_url.clone().unwrap_or(default_cancel),
                String::new(),
            ),
            CheckoutUi::Embedded { return_url } => (
                CheckoutUiMode::Embedded,
                String::new(),
                String::new(),
                return_url.clone().unwrap_or(default_return),
            ),
        };

        CheckoutSessionRequest {
            mode,
            ui_mode,
            customer_ref,
            price_ref,
            quantity,
            client_reference_id: customer_id.to_string(),
            metadata,
            success_url,
            cancel_url,
            return_url,
            idempotency_key: format!("checkout-{}", Uuid::new_v4()),
        }
    }

    /// Open a checkout for `quantity` credits and record the PENDING purchase
    pub async fn start_credit_purchase(
        &self,
        customer_id: Uuid,
        quantity: i32,
        ui: CheckoutUi,
    ) -> BillingResult<CheckoutStarted> {
        if quantity <= 0 || quantity > MAX_CREDITS_PER_PURCHASE {
            return Err(BillingError::InvalidAmount(format!(
                "quantity must be between 1 and {}",
                MAX_CREDITS_PER_PURCHASE
            )));
        }

        let customer = self.load_customer(customer_id).await?;
        let customer_ref = self.ensure_external_customer(&customer).await?;

        let mut metadata = HashMap::new();
        metadata.insert(METADATA_CUSTOMER_ID.to_string(), customer_id.to_string());
        metadata.insert(METADATA_QUANTITY.to_string(), quantity.to_string());

        let request = self.session_request(
            CheckoutMode::Payment,
            &ui,
            customer_ref,
            self.config.credit_price_id.clone(),
            quantity as u64,
            customer_id,
            metadata,
        );
        let session = self.gateway.create_checkout_session(&request).await?;

        let unit_price = self.config.credit_unit_price;
        let purchase = self
            .store
            .create_purchase(NewPurchase {
                customer_id,
                external_session_ref: session.id.clone(),
                quantity,
                unit_price,
                total_price: unit_price * Decimal::from(quantity),
            })
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            purchase_id = %purchase.id,
            session_id = %session.id,
            quantity = quantity,
            "Credit purchase checkout started"
        );

        Ok(CheckoutStarted {
            session_id: session.id,
            ui_mode: request.ui_mode,
            url: session.url,
            client_secret: session.client_secret,
            purchase_id: Some(purchase.id),
        })
    }

    /// Open a subscription checkout for a plan. A customer with a live
    /// subscription cannot start another one.
    pub async fn start_subscription(
        &self,
        customer_id: Uuid,
        plan_id: Uuid,
        ui: CheckoutUi,
    ) -> BillingResult<CheckoutStarted> {
        let customer = self.load_customer(customer_id).await?;
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

        if let Some(current_id) = customer.subscription_id {
            if let Some(current) = self.store.get_subscription(current_id).await? {
                if current.status != SubscriptionStatus::Canceled {
                    return Err(BillingError::InvalidState(format!(
                        "customer {} already has subscription {}",
                        customer_id, current.id
                    )));
                }
            }
        }

        let customer_ref = self.ensure_external_customer(&customer).await?;

        let mut metadata = HashMap::new();
        metadata.insert(METADATA_CUSTOMER_ID.to_string(), customer_id.to_string());
        metadata.insert(METADATA_PLAN_ID.to_string(), plan.id.to_string());

        let request = self.session_request(
            CheckoutMode::Subscription,
            &ui,
            customer_ref,
            plan.external_price_ref.clone(),
            1,
            customer_id,
            metadata,
        );
        let session = self.gateway.create_checkout_session(&request).await?;

        tracing::info!(
            customer_id = %customer_id,
            plan = %plan.name,
            session_id = %session.id,
            "Subscription checkout started"
        );

        Ok(CheckoutStarted {
            session_id: session.id,
            ui_mode: request.ui_mode,
            url: session.url,
            client_secret: session.client_secret,
            purchase_id: None,
        })
    }
}

//! Payment processor gateway
//!
//! Every call the billing core makes to Stripe goes through [`PaymentGateway`].
//! The live implementation bounds each request with the configured timeout and
//! retries reads with exponential backoff. Writes are sent once with an
//! idempotency key, so a caller retrying a whole operation never produces a
//! second refund or checkout session.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, Charge, CheckoutSession, CheckoutSessionMode, CheckoutSessionUiMode,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCustomer, CreateRefund, Customer,
    Invoice, ListCharges, RangeBounds, RangeQuery, Refund, RefundReasonFilter, Subscription,
    UpdateSubscription,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::objects::{
    from_stripe, ChargeView, CheckoutMode, CheckoutSessionView, CustomerView, InvoiceView,
    RefundView, SubscriptionView,
};

/// Total attempts for a read, first try included
const READ_ATTEMPTS: usize = 3;

/// Maximum page size Stripe accepts for list endpoints
pub const MAX_PAGE_SIZE: u64 = 100;

/// What a refund is issued against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundTarget {
    PaymentIntent(String),
    Charge(String),
}

impl RefundTarget {
    pub fn reference(&self) -> &str {
        match self {
            RefundTarget::PaymentIntent(id) | RefundTarget::Charge(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateRefundRequest {
    pub target: RefundTarget,
    /// Partial amount in cents; the full payment when absent
    pub amount_cents: Option<i64>,
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

/// One page of a customer's charges inside a creation window
#[derive(Debug, Clone)]
pub struct ChargeQuery {
    pub customer_ref: String,
    pub created_gte: i64,
    pub created_lte: i64,
    pub starting_after: Option<String>,
    pub limit: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChargePage {
    pub charges: Vec<ChargeView>,
    pub has_more: bool,
}

/// Embedded checkout renders inside the app and returns a client secret;
/// hosted checkout redirects to a Stripe page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutUiMode {
    #[default]
    Hosted,
    Embedded,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub mode: CheckoutMode,
    pub ui_mode: CheckoutUiMode,
    pub customer_ref: String,
    pub price_ref: String,
    pub quantity: u64,
    pub client_reference_id: String,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
    pub return_url: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    pub local_customer_id: uuid::Uuid,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<InvoiceView>;

    async fn retrieve_subscription(&self, subscription_ref: &str)
        -> BillingResult<SubscriptionView>;

    async fn retrieve_checkout_session(&self, session_ref: &str)
        -> BillingResult<CheckoutSessionView>;

    async fn retrieve_refund(&self, refund_ref: &str) -> BillingResult<RefundView>;

    async fn list_charges(&self, query: &ChargeQuery) -> BillingResult<ChargePage>;

    async fn create_refund(&self, request: &CreateRefundRequest) -> BillingResult<RefundView>;

    async fn cancel_subscription(&self, subscription_ref: &str)
        -> BillingResult<SubscriptionView>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionView>;

    async fn create_customer(&self, request: &CreateCustomerRequest)
        -> BillingResult<CustomerView>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionView>;
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> BillingResult<T> {
    raw.parse::<T>()
        .map_err(|_| BillingError::InvalidInput(format!("Invalid {} ID: {}", what, raw)))
}

impl StripeClient {
    /// Bound a single Stripe request by the configured timeout
    async fn timed<T, Fut>(&self, operation: &str, request: Fut) -> BillingResult<T>
    where
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config().api_timeout, request).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_secs = self.config().api_timeout.as_secs(),
                    "Stripe request timed out"
                );
                Err(BillingError::Timeout(operation.to_string()))
            }
        }
    }

    /// Retry a read while the failure is transient
    async fn read<T, F, Fut>(&self, operation: &str, mut request: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(20)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(READ_ATTEMPTS - 1);

        RetryIf::spawn(
            strategy,
            || self.timed(operation, request()),
            |e: &BillingError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::debug!(operation = operation, error = %e, "Retrying Stripe read");
                }
                retry
            },
        )
        .await
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<InvoiceView> {
        let id: stripe::InvoiceId = parse_id(invoice_ref, "invoice")?;
        let invoice = self
            .read("retrieve_invoice", || {
                Invoice::retrieve(self.inner(), &id, &[])
            })
            .await?;
        from_stripe(&invoice)
    }

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionView> {
        let id: stripe::SubscriptionId = parse_id(subscription_ref, "subscription")?;
        let subscription = self
            .read("retrieve_subscription", || {
                Subscription::retrieve(self.inner(), &id, &[])
            })
            .await?;
        from_stripe(&subscription)
    }

    async fn retrieve_checkout_session(
        &self,
        session_ref: &str,
    ) -> BillingResult<CheckoutSessionView> {
        let id: stripe::CheckoutSessionId = parse_id(session_ref, "checkout session")?;
        let session = self
            .read("retrieve_checkout_session", || {
                CheckoutSession::retrieve(self.inner(), &id, &[])
            })
            .await?;
        from_stripe(&session)
    }

    async fn retrieve_refund(&self, refund_ref: &str) -> BillingResult<RefundView> {
        let id: stripe::RefundId = parse_id(refund_ref, "refund")?;
        let refund = self
            .read("retrieve_refund", || Refund::retrieve(self.inner(), &id, &[]))
            .await?;
        from_stripe(&refund)
    }

    async fn list_charges(&self, query: &ChargeQuery) -> BillingResult<ChargePage> {
        let customer: stripe::CustomerId = parse_id(&query.customer_ref, "customer")?;
        let starting_after: Option<stripe::ChargeId> = query
            .starting_after
            .as_deref()
            .map(|c| parse_id(c, "charge"))
            .transpose()?;

        let mut params = ListCharges::new();
        params.customer = Some(customer);
        params.created = Some(RangeQuery::Bounds(RangeBounds {
            gte: Some(query.created_gte),
            lte: Some(query.created_lte),
            ..Default::default()
        }));
        params.limit = Some(query.limit.clamp(1, MAX_PAGE_SIZE));
        params.starting_after = starting_after;

        let list = self
            .read("list_charges", || Charge::list(self.inner(), &params))
            .await?;

        let charges = list
            .data
            .iter()
            .map(from_stripe)
            .collect::<BillingResult<Vec<ChargeView>>>()?;

        Ok(ChargePage {
            charges,
            has_more: list.has_more,
        })
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> BillingResult<RefundView> {
        let mut params = CreateRefund::new();
        match &request.target {
            RefundTarget::PaymentIntent(id) => {
                params.payment_intent = Some(parse_id(id, "payment intent")?);
            }
            RefundTarget::Charge(id) => {
                params.charge = Some(parse_id(id, "charge")?);
            }
        }
        params.amount = request.amount_cents;
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);
        if !request.metadata.is_empty() {
            params.metadata = Some(request.metadata.clone());
        }

        let client = self.idempotent(&request.idempotency_key);
        let refund = self
            .timed("create_refund", Refund::create(&client, params))
            .await?;

        tracing::info!(
            refund_id = %refund.id,
            target = request.target.reference(),
            amount_cents = ?request.amount_cents,
            "Stripe refund created"
        );

        from_stripe(&refund)
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionView> {
        let id: stripe::SubscriptionId = parse_id(subscription_ref, "subscription")?;
        let subscription = self
            .timed(
                "cancel_subscription",
                Subscription::cancel(self.inner(), &id, CancelSubscription::default()),
            )
            .await?;
        from_stripe(&subscription)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionView> {
        let id: stripe::SubscriptionId = parse_id(subscription_ref, "subscription")?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };
        let subscription = self
            .timed(
                "set_cancel_at_period_end",
                Subscription::update(self.inner(), &id, params),
            )
            .await?;
        from_stripe(&subscription)
    }

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
    ) -> BillingResult<CustomerView> {
        let local_id = request.local_customer_id.to_string();
        let params = CreateCustomer {
            email: Some(&request.email),
            name: request.name.as_deref(),
            metadata: Some(
                vec![("customer_id".to_string(), local_id.clone())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        let client = self.idempotent(&format!("customer-{}", local_id));
        let customer = self
            .timed("create_customer", Customer::create(&client, params))
            .await?;
        from_stripe(&customer)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionView> {
        let mode = match request.mode {
            CheckoutMode::Payment => CheckoutSessionMode::Payment,
            CheckoutMode::Subscription => CheckoutSessionMode::Subscription,
            CheckoutMode::Other => {
                return Err(BillingError::InvalidInput(
                    "Checkout mode must be payment or subscription".into(),
                ))
            }
        };

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(mode);
        params.customer = Some(parse_id(&request.customer_ref, "customer")?);
        params.client_reference_id = Some(&request.client_reference_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_ref.clone()),
            quantity: Some(request.quantity),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());

        match request.ui_mode {
            CheckoutUiMode::Hosted => {
                params.ui_mode = Some(CheckoutSessionUiMode::Hosted);
                params.success_url = Some(&request.success_url);
                params.cancel_url = Some(&request.cancel_url);
            }
            CheckoutUiMode::Embedded => {
                params.ui_mode = Some(CheckoutSessionUiMode::Embedded);
                params.return_url = Some(&request.return_url);
            }
        }

        let client = self.idempotent(&request.idempotency_key);
        let session = self
            .timed(
                "create_checkout_session",
                CheckoutSession::create(&client, params),
            )
            .await?;

        tracing::info!(
            session_id = %session.id,
            client_reference_id = %request.client_reference_id,
            "Checkout session created"
        );

        from_stripe(&session)
    }
}

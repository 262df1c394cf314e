//! Stripe client and configuration

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_TIMEOUT_SECS: u64 = 20;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
const DEFAULT_REFUND_SEARCH_MAX_PAGES: usize = 10;

/// Stripe configuration, read once at startup
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret of the one-off credit purchase endpoint
    pub purchases_webhook_secret: String,
    /// Signing secret of the subscription endpoint
    pub subscriptions_webhook_secret: String,
    /// Price used for a single credit in purchase checkouts
    pub credit_price_id: String,
    /// Local price of a single credit, in currency units
    pub credit_unit_price: Decimal,
    pub app_base_url: String,
    pub api_timeout: Duration,
    pub webhook_tolerance_secs: i64,
    /// Page ceiling for the charge enumeration fallback
    pub refund_search_max_pages: usize,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("live_mode", &self.is_live_mode())
            .field("credit_price_id", &self.credit_price_id)
            .field("credit_unit_price", &self.credit_unit_price)
            .field("app_base_url", &self.app_base_url)
            .field("api_timeout", &self.api_timeout)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("refund_search_max_pages", &self.refund_search_max_pages)
            .finish_non_exhaustive()
    }
}

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} must be set", name)))
}

fn optional_parsed<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value", name))),
        _ => Ok(default),
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let credit_unit_price = Decimal::from_str(required("CREDIT_UNIT_PRICE")?.trim())
            .map_err(|_| BillingError::Config("CREDIT_UNIT_PRICE must be a decimal".into()))?;
        if credit_unit_price <= Decimal::ZERO {
            return Err(BillingError::Config(
                "CREDIT_UNIT_PRICE must be positive".into(),
            ));
        }

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            purchases_webhook_secret: required("STRIPE_WEBHOOK_SECRET_PURCHASES")?,
            subscriptions_webhook_secret: required("STRIPE_WEBHOOK_SECRET_SUBSCRIPTIONS")?,
            credit_price_id: required("STRIPE_CREDIT_PRICE_ID")?,
            credit_unit_price,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            api_timeout: Duration::from_secs(optional_parsed(
                "STRIPE_API_TIMEOUT_SECS",
                DEFAULT_API_TIMEOUT_SECS,
            )?),
            webhook_tolerance_secs: optional_parsed(
                "WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?,
            refund_search_max_pages: optional_parsed(
                "REFUND_SEARCH_MAX_PAGES",
                DEFAULT_REFUND_SEARCH_MAX_PAGES,
            )?,
        })
    }

    /// Whether the secret key talks to live mode. Events whose `livemode`
    /// flag disagrees are acknowledged and dropped.
    pub fn is_live_mode(&self) -> bool {
        self.secret_key.starts_with("sk_live_") || self.secret_key.starts_with("rk_live_")
    }

    /// Config for tests, never talks to Stripe
    pub fn for_tests() -> Self {
        Self {
            secret_key: "sk_test_local".to_string(),
            purchases_webhook_secret: "whsec_purchases".to_string(),
            subscriptions_webhook_secret: "whsec_subscriptions".to_string(),
            credit_price_id: "price_credit".to_string(),
            credit_unit_price: Decimal::new(150, 2),
            app_base_url: "http://localhost:3000".to_string(),
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            refund_search_max_pages: 3,
        }
    }
}

/// Process-wide Stripe handle, built once at startup and cloned into services
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client that sends the given idempotency key with every request
    pub fn idempotent(&self, key: &str) -> stripe::Client {
        self.inner
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }
}

//! Refund target resolution
//!
//! Stripe often hands back invoices without an expanded payment, so the
//! object to refund has to be located through fallbacks, tried in order:
//!
//! 1. the invoice's own payment reference
//! 2. the invoice's charge reference
//! 3. the customer's charges created within ±45 days of the invoice, matched
//!    on each charge's invoice back-reference
//!
//! Running out of fallbacks is [`Resolution::NoTarget`], not an error. The
//! caller completes its local bookkeeping and flags the refund for manual
//! follow-up.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeQuery, PaymentGateway, RefundTarget, MAX_PAGE_SIZE};
use crate::objects::{ChargeView, InvoiceView};

pub const SEARCH_WINDOW_DAYS: i64 = 45;
const SECONDS_PER_DAY: i64 = 86_400;

/// Creation-time bounds for the charge search, unix seconds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub start: i64,
    pub end: i64,
}

impl SearchWindow {
    pub fn around(created: i64) -> Self {
        let span = SEARCH_WINDOW_DAYS * SECONDS_PER_DAY;
        Self {
            start: created.saturating_sub(span),
            end: created.saturating_add(span),
        }
    }
}

/// Lazy walk over a customer's charges, one page per call, capped at
/// `max_pages`. The cursor can be saved and handed to [`ChargePager::resume`].
pub struct ChargePager<'a> {
    gateway: &'a dyn PaymentGateway,
    customer_ref: String,
    window: SearchWindow,
    cursor: Option<String>,
    pages_fetched: usize,
    max_pages: usize,
    exhausted: bool,
}

impl<'a> ChargePager<'a> {
    pub fn new(
        gateway: &'a dyn PaymentGateway,
        customer_ref: impl Into<String>,
        window: SearchWindow,
        max_pages: usize,
    ) -> Self {
        Self {
            gateway,
            customer_ref: customer_ref.into(),
            window,
            cursor: None,
            pages_fetched: 0,
            max_pages,
            exhausted: false,
        }
    }

    /// Continue after the charge id returned by [`ChargePager::cursor`]
    pub fn resume(
        gateway: &'a dyn PaymentGateway,
        customer_ref: impl Into<String>,
        window: SearchWindow,
        max_pages: usize,
        cursor: Option<String>,
    ) -> Self {
        let mut pager = Self::new(gateway, customer_ref, window, max_pages);
        pager.cursor = cursor;
        pager
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// True once the processor reported no more pages
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next page of charges; `None` when exhausted or at the page ceiling
    pub async fn next_page(&mut self) -> BillingResult<Option<Vec<ChargeView>>> {
        if self.exhausted || self.pages_fetched >= self.max_pages {
            return Ok(None);
        }

        let page = self
            .gateway
            .list_charges(&ChargeQuery {
                customer_ref: self.customer_ref.clone(),
                created_gte: self.window.start,
                created_lte: self.window.end,
                starting_after: self.cursor.clone(),
                limit: MAX_PAGE_SIZE,
            })
            .await?;

        self.pages_fetched += 1;
        match page.charges.last() {
            Some(last) => self.cursor = Some(last.id.clone()),
            None => self.exhausted = true,
        }
        if !page.has_more {
            self.exhausted = true;
        }

        Ok(Some(page.charges))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    PaymentReference,
    ChargeReference,
    ChargeSearch { pages: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found {
        target: RefundTarget,
        source: ResolutionSource,
    },
    NoTarget,
}

impl Resolution {
    pub fn target(&self) -> Option<&RefundTarget> {
        match self {
            Resolution::Found { target, .. } => Some(target),
            Resolution::NoTarget => None,
        }
    }
}

fn refundable_charge_for<'c>(
    charges: &'c [ChargeView],
    invoice_ref: &str,
) -> Option<&'c ChargeView> {
    charges
        .iter()
        .find(|c| c.invoice_ref() == Some(invoice_ref) && c.is_succeeded() && !c.refunded)
}

#[derive(Clone)]
pub struct RefundTargetResolver {
    gateway: Arc<dyn PaymentGateway>,
    max_pages: usize,
}

impl RefundTargetResolver {
    pub fn new(gateway: Arc<dyn PaymentGateway>, max_pages: usize) -> Self {
        Self { gateway, max_pages }
    }

    /// Fetch the current invoice and resolve it. An invoice the processor no
    /// longer knows resolves to `NoTarget`.
    pub async fn resolve_invoice_ref(&self, invoice_ref: &str) -> BillingResult<Resolution> {
        match self.gateway.retrieve_invoice(invoice_ref).await {
            Ok(invoice) => self.resolve(&invoice).await,
            Err(BillingError::NotFound(_)) | Err(BillingError::StripeRejected(_)) => {
                tracing::warn!(
                    invoice_ref = invoice_ref,
                    "Invoice not retrievable, no refund target"
                );
                Ok(Resolution::NoTarget)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn resolve(&self, invoice: &InvoiceView) -> BillingResult<Resolution> {
        if let Some(payment_ref) = invoice.payment_reference() {
            return Ok(Resolution::Found {
                target: RefundTarget::PaymentIntent(payment_ref.to_string()),
                source: ResolutionSource::PaymentReference,
            });
        }

        if let Some(charge_ref) = invoice.charge_ref() {
            return Ok(Resolution::Found {
                target: RefundTarget::Charge(charge_ref.to_string()),
                source: ResolutionSource::ChargeReference,
            });
        }

        let (Some(customer_ref), Some(created)) = (invoice.customer_ref(), invoice.created) else {
            tracing::warn!(
                invoice_id = %invoice.id,
                "Invoice has no customer or creation time, charge search skipped"
            );
            return Ok(Resolution::NoTarget);
        };

        let mut pager = ChargePager::new(
            self.gateway.as_ref(),
            customer_ref,
            SearchWindow::around(created),
            self.max_pages,
        );

        while let Some(charges) = pager.next_page().await? {
            if let Some(charge) = refundable_charge_for(&charges, &invoice.id) {
                tracing::info!(
                    invoice_id = %invoice.id,
                    charge_id = %charge.id,
                    pages = pager.pages_fetched(),
                    "Refund target found by charge search"
                );
                return Ok(Resolution::Found {
                    target: RefundTarget::Charge(charge.id.clone()),
                    source: ResolutionSource::ChargeSearch {
                        pages: pager.pages_fetched(),
                    },
                });
            }
        }

        tracing::warn!(
            invoice_id = %invoice.id,
            customer_ref = customer_ref,
            pages = pager.pages_fetched(),
            exhausted = pager.is_exhausted(),
            "No refund target found for invoice"
        );
        Ok(Resolution::NoTarget)
    }
}

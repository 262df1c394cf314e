//! Stripe webhook signature verification
//!
//! The `Stripe-Signature` header has the form `t=<unix>,v1=<hex>[,v1=<hex>...]`.
//! The expected signature is HMAC-SHA256, keyed with the endpoint's signing
//! secret, over `"<t>.<raw body>"`. Stripe sends several `v1` entries while a
//! secret is being rolled, so any matching entry is accepted.
//!
//! Every failure collapses into [`BillingError::WebhookSignatureInvalid`]. The
//! caller cannot tell a malformed header from a tampered payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "v1";

/// Verifies deliveries for one webhook endpoint
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        match key {
            "t" => timestamp = Some(value.parse::<i64>().ok()?),
            SCHEME => {
                // Undecodable entries are skipped; another v1 may still match
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    Some(SignatureHeader {
        timestamp: timestamp?,
        signatures,
    })
}

/// HMAC-SHA256 of `"<timestamp>.<payload>"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a valid header, as Stripe would send it
#[cfg(any(test, feature = "testing"))]
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> String {
    let signature = compute_signature(secret, timestamp, payload).unwrap_or_default();
    format!("t={},{}={}", timestamp, SCHEME, hex::encode(signature))
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &str, header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> BillingResult<()> {
        let Some(parsed) = parse_header(header) else {
            tracing::warn!("Malformed Stripe-Signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        };

        if parsed.signatures.is_empty() {
            tracing::warn!("Stripe-Signature header carries no v1 signature");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let age = now.saturating_sub(parsed.timestamp).saturating_abs();
        if age > self.tolerance_secs {
            tracing::warn!(
                age_secs = age,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(&self.secret, parsed.timestamp, payload)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;

        let matched = parsed
            .signatures
            .iter()
            .fold(false, |found, candidate| {
                found | bool::from(candidate.as_slice().ct_eq(expected.as_slice()))
            });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }
}

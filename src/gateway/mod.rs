use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub mod onepay;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use onepay::OnePayClient;
#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeGateway;

#[derive(Debug, Clone, Serialize)]
pub struct CustomerInfo {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub reference: String,
    pub customer: CustomerInfo,
    /// Where the provider sends the payer's browser afterwards.
    pub redirect_url: String,
    /// Opaque tag echoed back in the callback.
    pub additional_data: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutCreated {
    pub provider_tx_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusOutcome {
    Paid,
    Failed,
    Pending,
}

/// Provider-reported view of a transaction. Amount and currency are
/// echoed back so the engine can cross-check them against the ledger
/// before trusting a PAID signal.
#[derive(Debug, Clone)]
pub struct TransactionStatus {
    pub outcome: StatusOutcome,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Boundary to the external payment provider. Injected so tests can
/// script outcomes without a network.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutCreated>;
    async fn get_status(&self, provider_tx_id: &str) -> Result<TransactionStatus>;
}

/// Formats minor units as a decimal string with exactly two places.
/// The provider rejects requests whose hash or amount deviates from
/// this format, so it is applied to both.
pub fn format_amount_2dp(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let cents = amount_cents.unsigned_abs();
    format!("{}{}.{:02}", sign, cents / 100, cents % 100)
}

/// Converts a provider-reported decimal amount back to integer minor
/// units so comparisons never go through floating point equality.
pub fn to_minor_units(amount: f64) -> Option<i64> {
    if !amount.is_finite() {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

/// Request hash per the provider docs:
/// sha256(app_id + currency + amount(2dp) + salt), hex-encoded.
pub fn request_hash(app_id: &str, currency: &str, amount_cents: i64, salt: &str) -> String {
    let raw = format!("{}{}{}{}", app_id, currency, format_amount_2dp(amount_cents), salt);
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

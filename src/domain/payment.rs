use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "ONEPAY";

/// One payment attempt against the external gateway. Records are never
/// deleted; they form the financial audit trail for the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: String,
    /// External-facing idempotency string sent to the provider.
    /// At most 21 characters, alphanumeric plus dash.
    pub reference: String,
    /// Set once the provider accepts the checkout request; unique after that.
    pub provider_tx_id: Option<String>,
    pub currency: String,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    /// Count of checkout-creation calls made for this record.
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Verbatim last inbound callback payload, kept for audit only.
    pub last_callback: Option<serde_json::Value>,
    pub redirect_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Paid,
    Failed,
    Canceled,
}

impl PaymentStatus {
    /// INITIATED and PENDING may still move; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentStatus::Initiated | PaymentStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

/// Asynchronous callback body posted by the provider. The shape is owned
/// by the provider and matched exactly. Unauthenticated, so its contents
/// are advisory: stored for audit, never trusted as sole proof of payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub transaction_id: Option<String>,
    pub status: Option<i64>,
    pub status_message: Option<String>,
    pub additional_data: Option<String>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conference registration order. Owned by the registration subsystem;
/// the reconciliation core only reads it and mirrors payment status back.
/// The payment ledger, not this mirror, is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Public registration code shown to the attendee (e.g. "APSC-00123").
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_status: OrderPaymentStatus,
    pub payment_provider: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPaymentStatus {
    Unpaid,
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

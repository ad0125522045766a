use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::*;
use crate::error::Result;

pub mod credential_repository;
pub mod order_repository;
pub mod payment_ledger;

pub use credential_repository::SqliteCredentialRepository;
pub use order_repository::SqliteOrderRepository;
pub use payment_ledger::SqlitePaymentLedger;

/// Narrow view of the registration subsystem. The reconciliation core
/// reads orders and writes back the best-effort payment mirror; it never
/// owns registration data.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: CreateOrderRequest) -> Result<Order>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>>;
    async fn save_payment_mirror(
        &self,
        id: Uuid,
        status: OrderPaymentStatus,
        provider: &str,
        reference: Option<&str>,
    ) -> Result<()>;
}

/// The persistent record of payment attempts, and the authority on
/// payment state. All status transitions are conditional writes keyed on
/// the expected pre-state, so concurrent initiations, callbacks, and
/// polls for the same order cannot corrupt a record: a losing writer
/// observes `None` and reloads the winner's result.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Returns the existing transient (INITIATED/PENDING) payment for the
    /// order if one exists, otherwise inserts a fresh INITIATED record
    /// with the supplied reference. At most one transient payment exists
    /// per order at any time.
    async fn create_or_reuse_transient(
        &self,
        order_id: Uuid,
        amount_cents: i64,
        currency: &str,
        reference: String,
    ) -> Result<Payment>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;

    /// Latest payment for the order, by creation time.
    async fn find_latest(&self, order_id: Uuid) -> Result<Option<Payment>>;

    async fn find_by_provider_tx(&self, provider_tx_id: &str) -> Result<Option<Payment>>;

    /// Bumps the attempt counter and clears the previous error before a
    /// checkout-creation call. Only applies while the record is transient.
    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Payment>>;

    /// Stores the provider's checkout response and moves the record to
    /// PENDING. Conditional on the record still being transient.
    async fn record_checkout(
        &self,
        id: Uuid,
        provider_tx_id: &str,
        redirect_url: &str,
    ) -> Result<Option<Payment>>;

    /// Transient -> PAID. Returns `None` if another writer got there
    /// first (or the record already reached a terminal state).
    async fn mark_paid(&self, id: Uuid, paid_at: DateTime<Utc>) -> Result<Option<Payment>>;

    /// Transient -> FAILED, recording the reason. Returns `None` if the
    /// record was no longer transient. A PAID record is never demoted.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<Option<Payment>>;

    /// Diagnostic annotation; permitted in any state, including PAID.
    async fn record_error(&self, id: Uuid, message: &str) -> Result<()>;

    /// Stores the verbatim callback payload for audit; any state.
    async fn record_callback(&self, id: Uuid, payload: &serde_json::Value) -> Result<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn create(&self, record: CredentialRecord) -> Result<CredentialRecord>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<CredentialRecord>>;
    async fn find_active_by_order(&self, order_id: Uuid) -> Result<Option<CredentialRecord>>;
    async fn revoke_for_order(&self, order_id: Uuid) -> Result<u64>;
    /// Sets the sent-at marker if it is not already set. Returns whether
    /// this call claimed it, which is what makes notification at-most-once.
    async fn mark_email_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

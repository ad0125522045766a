//! Reconciliation of gateway-reported payment state with the local
//! ledger. Three independent signals feed this engine: synchronous
//! initiation, the provider's asynchronous callback, and client polling
//! that performs bounded active verification. The ledger's conditional
//! writes are the only mutual exclusion; a writer that loses a race
//! reloads and adopts the winner's result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::VerificationConfig,
    credential::CredentialIssuer,
    domain::{CallbackPayload, Order, OrderPaymentStatus, Payment, PaymentStatus, PROVIDER_NAME},
    error::{AppError, Result},
    gateway::{CheckoutRequest, CustomerInfo, PaymentGateway, StatusOutcome},
    notify::{render_qr_svg, Notifier},
    repository::{OrderRepository, PaymentLedger},
};

/// Provider constraint on the idempotency reference.
const MAX_REFERENCE_LEN: usize = 21;

#[derive(Debug, Clone, Serialize)]
pub struct InitiateOutcome {
    pub payment_id: Uuid,
    pub provider_tx_id: Option<String>,
    pub redirect_url: String,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackOutcome {
    pub status: PaymentStatus,
    pub already_processed: bool,
}

pub struct ReconciliationEngine {
    orders: Arc<dyn OrderRepository>,
    ledger: Arc<dyn PaymentLedger>,
    gateway: Arc<dyn PaymentGateway>,
    issuer: Arc<CredentialIssuer>,
    notifier: Arc<Notifier>,
    /// Base URL the provider redirects the payer's browser back to.
    return_url: String,
    verification: VerificationConfig,
}

impl ReconciliationEngine {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        ledger: Arc<dyn PaymentLedger>,
        gateway: Arc<dyn PaymentGateway>,
        issuer: Arc<CredentialIssuer>,
        notifier: Arc<Notifier>,
        return_url: String,
        verification: VerificationConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            gateway,
            issuer,
            notifier,
            return_url,
            verification,
        }
    }

    /// Starts (or resumes) checkout for an order. Reuses the transient
    /// payment when one exists, so a client retrying after a lost
    /// response gets the same provider transaction back.
    pub async fn initiate(&self, order_id: Uuid) -> Result<InitiateOutcome> {
        let order = self.find_order(order_id).await?;
        if order.payment_status == OrderPaymentStatus::Paid {
            return Err(AppError::Conflict("Order is already paid".to_string()));
        }
        // Orders come from the registration subsystem; a zero or negative
        // amount can never be settled and must not reach the provider.
        if order.amount_cents <= 0 {
            return Err(AppError::BadRequest(
                "Order amount must be positive".to_string(),
            ));
        }

        let payment = self
            .ledger
            .create_or_reuse_transient(
                order.id,
                order.amount_cents,
                &order.currency,
                make_reference(&order.code),
            )
            .await?;

        // A PENDING payment that already has a checkout link means the
        // provider accepted an earlier request; hand the link back.
        if payment.status == PaymentStatus::Pending {
            if let Some(redirect_url) = payment.redirect_url.clone() {
                return Ok(InitiateOutcome {
                    payment_id: payment.id,
                    provider_tx_id: payment.provider_tx_id,
                    redirect_url,
                    reused: true,
                });
            }
        }

        let payment = match self.ledger.begin_attempt(payment.id).await? {
            Some(payment) => payment,
            // Lost a race against a concurrent poll/callback that closed
            // the record; report its outcome instead of re-initiating.
            None => {
                return Err(AppError::Conflict(
                    "Payment is no longer in progress".to_string(),
                ))
            }
        };

        tracing::info!(
            "Initiating checkout for order {} (attempt {})",
            order.id,
            payment.attempts
        );

        let request = CheckoutRequest {
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            reference: payment.reference.clone(),
            customer: CustomerInfo {
                first_name: or_na(&order.first_name),
                last_name: or_na(&order.last_name),
                email: order.email.clone(),
                phone: order.phone.clone().unwrap_or_else(|| "N/A".to_string()),
            },
            redirect_url: format!(
                "{}?rid={}",
                self.return_url,
                urlencoding::encode(&order.id.to_string())
            ),
            additional_data: order.code.clone(),
        };

        let created = match self.gateway.create_checkout(&request).await {
            Ok(created) => created,
            Err(err) => {
                // Surface the failure; the FAILED record keeps the error
                // for diagnostics and a later initiate starts fresh.
                self.ledger.mark_failed(payment.id, &err.to_string()).await?;
                self.mirror_order(&order, OrderPaymentStatus::Failed, None).await;
                return Err(err);
            }
        };

        let payment = self
            .ledger
            .record_checkout(payment.id, &created.provider_tx_id, &created.redirect_url)
            .await?
            .ok_or_else(|| {
                AppError::Conflict("Payment state changed during initiation".to_string())
            })?;

        self.mirror_order(
            &order,
            OrderPaymentStatus::Pending,
            Some(&created.provider_tx_id),
        )
        .await;

        Ok(InitiateOutcome {
            payment_id: payment.id,
            provider_tx_id: payment.provider_tx_id,
            redirect_url: created.redirect_url,
            reused: false,
        })
    }

    /// Ingests the provider's asynchronous callback. The payload is
    /// recorded verbatim for audit but treated as advisory: callbacks are
    /// unauthenticated and known to be noisy (retried after card
    /// failures, delivered out of order), so this path never marks a
    /// payment FAILED and marks PAID only through the same verified
    /// status query the polling path uses. It must return quickly; the
    /// provider retries aggressively on timeout.
    ///
    /// TODO: verify the callback signature once the provider documents
    /// the scheme; until then the payload is audit-only.
    pub async fn ingest_callback(&self, payload: CallbackPayload) -> Result<CallbackOutcome> {
        let tx_id = payload
            .transaction_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::BadRequest("Missing transaction_id".to_string()))?;

        let payment = self
            .ledger
            .find_by_provider_tx(&tx_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound("Payment not found for transaction_id".to_string())
            })?;

        let raw = serde_json::to_value(&payload)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        self.ledger.record_callback(payment.id, &raw).await?;

        if payment.status == PaymentStatus::Paid {
            return Ok(CallbackOutcome {
                status: PaymentStatus::Paid,
                already_processed: true,
            });
        }

        // One best-effort verification; gateway trouble is recorded and
        // left for the polling path rather than bounced to the provider.
        let status = match self.verify_and_sync(&payment).await {
            Ok(updated) => updated.status,
            Err(err) if err.is_transient() => {
                self.ledger.record_error(payment.id, &err.to_string()).await?;
                payment.status
            }
            Err(err) => return Err(err),
        };

        Ok(CallbackOutcome {
            status,
            already_processed: false,
        })
    }

    /// Resolves the order's payment to a definitive state, actively
    /// verifying against the provider for up to the configured budget.
    /// Blocks the caller for that long in the worst case; clients treat
    /// it as a long-poll. Exhausting the budget without a PAID or FAILED
    /// answer closes the payment as FAILED so no order stays stuck.
    pub async fn get_status(&self, order_id: Uuid) -> Result<Payment> {
        let order = self.find_order(order_id).await?;

        let payment = self
            .ledger
            .find_latest(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("No payment found for this order".to_string()))?;

        // Terminal records are returned unchanged; PAID additionally gets
        // a finalization retry in case issuing or sending failed earlier.
        if payment.status == PaymentStatus::Paid {
            self.ensure_finalized(&order, &payment).await;
            return self.reload(payment.id).await;
        }
        if payment.status.is_terminal() {
            return Ok(payment);
        }

        if payment.provider_tx_id.is_none() {
            // The provider never accepted a checkout for this record, so
            // there is nothing to verify against.
            return self
                .close_as_failed(&order, payment.id, "Missing provider transaction id")
                .await;
        }

        let interval_secs = self.verification.interval_secs.max(1);
        let interval = Duration::from_secs(interval_secs);
        let checks = (self.verification.budget_secs.div_ceil(interval_secs)).max(1);

        let mut last_error: Option<String> = None;

        for attempt in 0..checks {
            // Reload: a callback may have advanced the record mid-loop.
            let current = self.reload(payment.id).await?;
            if current.status == PaymentStatus::Paid {
                self.ensure_finalized(&order, &current).await;
                return self.reload(payment.id).await;
            }
            if current.status.is_terminal() {
                return Ok(current);
            }

            match self.verify_and_sync(&current).await {
                Ok(updated) if updated.status == PaymentStatus::Paid => {
                    return self.reload(payment.id).await;
                }
                Ok(updated) if updated.status.is_terminal() => return Ok(updated),
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    // Provider unreachable or garbled; keep polling until
                    // the budget runs out.
                    tracing::warn!(
                        "Verification attempt {} for order {} failed: {}",
                        attempt + 1,
                        order_id,
                        err
                    );
                    last_error = Some(err.to_string());
                    self.ledger.record_error(payment.id, &err.to_string()).await?;
                }
                Err(err) => return Err(err),
            }

            if attempt + 1 < checks {
                tokio::time::sleep(interval).await;
            }
        }

        let reason = last_error
            .unwrap_or_else(|| "Payment not confirmed within verification window".to_string());
        self.close_as_failed(&order, payment.id, &reason).await
    }

    /// One authoritative status query plus ledger sync. PAID is accepted
    /// only when the provider's declared amount and currency match the
    /// ledger record; a mismatch is a Conflict and the record keeps its
    /// pre-check status for manual review.
    async fn verify_and_sync(&self, payment: &Payment) -> Result<Payment> {
        if payment.status == PaymentStatus::Paid {
            return Ok(payment.clone());
        }
        let Some(tx_id) = payment.provider_tx_id.as_deref() else {
            return Ok(payment.clone());
        };

        let order = self.find_order(payment.order_id).await?;
        let reported = self.gateway.get_status(tx_id).await?;

        match reported.outcome {
            StatusOutcome::Paid => {
                if let Some(amount_cents) = reported.amount_cents {
                    if amount_cents != payment.amount_cents {
                        return Err(AppError::Conflict(
                            "Payment amount mismatch. Manual review required.".to_string(),
                        ));
                    }
                }
                if let Some(currency) = reported.currency.as_deref() {
                    if currency != payment.currency {
                        return Err(AppError::Conflict(
                            "Payment currency mismatch. Manual review required.".to_string(),
                        ));
                    }
                }

                let paid_at = reported.paid_at.unwrap_or_else(Utc::now);
                match self.ledger.mark_paid(payment.id, paid_at).await? {
                    Some(updated) => {
                        tracing::info!(
                            "Payment {} for order {} confirmed PAID",
                            payment.id,
                            payment.order_id
                        );
                        self.mirror_order(
                            &order,
                            OrderPaymentStatus::Paid,
                            payment.provider_tx_id.as_deref(),
                        )
                        .await;
                        // The money is confirmed; a finalization failure
                        // is recorded and retried later, never rolled back.
                        self.ensure_finalized(&order, &updated).await;
                        self.reload(payment.id).await
                    }
                    // Another writer finished first; its result stands.
                    None => self.reload(payment.id).await,
                }
            }
            StatusOutcome::Failed => {
                let reason = reported
                    .message
                    .unwrap_or_else(|| "Payment failed at the provider".to_string());
                match self.ledger.mark_failed(payment.id, &reason).await? {
                    Some(updated) => {
                        self.mirror_order(
                            &order,
                            OrderPaymentStatus::Failed,
                            payment.provider_tx_id.as_deref(),
                        )
                        .await;
                        Ok(updated)
                    }
                    None => self.reload(payment.id).await,
                }
            }
            StatusOutcome::Pending => Ok(payment.clone()),
        }
    }

    /// Issues (or reuses) the credential and sends the confirmation
    /// email at most once. Failures are recorded on the payment record
    /// and never unwind the PAID transition; a later poll retries.
    async fn ensure_finalized(&self, order: &Order, payment: &Payment) {
        let result = async {
            let issued = self.issuer.issue(order.id).await?;
            let qr_svg = render_qr_svg(&issued.qr_text)?;
            // Re-read the order so the issuer saw the PAID mirror even
            // when we raced ahead of it.
            let order = self.find_order(order.id).await?;
            self.notifier
                .notify_once(&order, &issued.record, &qr_svg)
                .await
        }
        .await;

        match result {
            Ok(sent) => {
                if sent {
                    tracing::info!("Confirmation sent for order {}", order.id);
                }
            }
            Err(err) => {
                tracing::error!("Finalization for order {} failed: {}", order.id, err);
                let note = format!("Finalize failed: {}", err);
                if let Err(record_err) = self.ledger.record_error(payment.id, &note).await {
                    tracing::error!("Could not record finalization error: {}", record_err);
                }
            }
        }
    }

    async fn close_as_failed(
        &self,
        order: &Order,
        payment_id: Uuid,
        reason: &str,
    ) -> Result<Payment> {
        match self.ledger.mark_failed(payment_id, reason).await? {
            Some(updated) => {
                self.mirror_order(order, OrderPaymentStatus::Failed, updated.provider_tx_id.as_deref())
                    .await;
                Ok(updated)
            }
            // The payment reached a terminal state concurrently (for
            // example a late callback confirmed it); return that instead.
            None => self.reload(payment_id).await,
        }
    }

    /// The order's payment fields are a best-effort mirror of the
    /// ledger; mirror failures are logged, not propagated.
    async fn mirror_order(
        &self,
        order: &Order,
        status: OrderPaymentStatus,
        reference: Option<&str>,
    ) {
        if let Err(err) = self
            .orders
            .save_payment_mirror(order.id, status, PROVIDER_NAME, reference)
            .await
        {
            tracing::error!("Failed to mirror payment status onto order {}: {}", order.id, err);
        }
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Order> {
        self.orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Order not found".to_string()))
    }

    async fn reload(&self, payment_id: Uuid) -> Result<Payment> {
        self.ledger
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| AppError::Internal("Payment record disappeared".to_string()))
    }
}

fn or_na(value: &str) -> String {
    if value.trim().is_empty() {
        "N/A".to_string()
    } else {
        value.to_string()
    }
}

/// Builds the provider-facing reference: the sanitized order code plus a
/// random suffix, trimmed so the whole string fits the provider's
/// 21-character limit.
pub fn make_reference(order_code: &str) -> String {
    let mut bytes = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix = hex::encode_upper(bytes);

    let base: String = order_code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    let max_base_len = MAX_REFERENCE_LEN - 1 - suffix.len();
    let trimmed: String = base.chars().take(max_base_len).collect();
    let trimmed = if trimmed.is_empty() {
        "REG".to_string()
    } else {
        trimmed
    };

    format!("{}-{}", trimmed, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_fits_provider_limit() {
        let reference = make_reference("APSC-2026-REGISTRATION-00123");
        assert!(reference.len() <= MAX_REFERENCE_LEN);
        assert!(reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn reference_strips_unsafe_characters() {
        let reference = make_reference("ap sc/20_26!");
        let (base, _) = reference.rsplit_once('-').unwrap();
        assert_eq!(base, "apsc2026");
    }

    #[test]
    fn reference_falls_back_for_empty_codes() {
        let reference = make_reference("!!!");
        assert!(reference.starts_with("REG-"));
    }

    #[test]
    fn reference_suffix_varies() {
        let a = make_reference("APSC-001");
        let b = make_reference("APSC-001");
        assert_ne!(a, b);
    }
}

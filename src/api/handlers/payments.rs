use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    api::state::AppState,
    domain::{CallbackPayload, Payment, PaymentStatus},
    error::Result,
};

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<Payment> for StatusResponse {
    fn from(payment: Payment) -> Self {
        Self {
            status: payment.status,
            provider_tx_id: payment.provider_tx_id,
            redirect_url: payment.redirect_url,
            paid_at: payment.paid_at,
            last_error: payment.last_error,
        }
    }
}

pub async fn initiate(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Value>> {
    let outcome = state.engine.initiate(order_id).await?;
    Ok(Json(json!({
        "payment_id": outcome.payment_id,
        "provider_tx_id": outcome.provider_tx_id,
        "redirect_url": outcome.redirect_url,
        "reused": outcome.reused,
    })))
}

/// Provider-facing callback endpoint. Unauthenticated by provider
/// design; the engine treats the payload as advisory and answers fast
/// so the provider does not retry.
pub async fn callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> Result<Json<Value>> {
    let outcome = state.engine.ingest_callback(payload).await?;
    Ok(Json(json!({
        "ok": true,
        "status": outcome.status,
        "already_processed": outcome.already_processed,
    })))
}

/// Long-poll: blocks up to the verification budget before answering
/// with a definitive status.
pub async fn status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<StatusResponse>> {
    let payment = state.engine.get_status(order_id).await?;
    Ok(Json(payment.into()))
}

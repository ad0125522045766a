use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    config::CredentialConfig,
    domain::{CheckInStatus, CredentialRecord, CredentialStatus, Order, OrderPaymentStatus},
    error::{AppError, Result},
    repository::{CredentialRepository, OrderRepository},
};

/// Claims carried by the QR token. `iat`/`exp` are set explicitly from
/// the stored record so the exact same token can be regenerated later
/// without keeping the raw token around.
#[derive(Debug, Serialize, Deserialize)]
pub struct QrClaims {
    /// Order id.
    pub sub: String,
    /// Public registration code.
    pub rid: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct IssuedCredential {
    pub record: CredentialRecord,
    pub token: String,
    /// What actually goes into the QR image: "PREFIX.<token>".
    pub qr_text: String,
    pub reused: bool,
}

/// Issues the signed, revocable entry credential for a paid order.
/// Idempotent: an order with a live credential gets the same token back.
pub struct CredentialIssuer {
    orders: Arc<dyn OrderRepository>,
    credentials: Arc<dyn CredentialRepository>,
    config: CredentialConfig,
}

impl CredentialIssuer {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        credentials: Arc<dyn CredentialRepository>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            orders,
            credentials,
            config,
        }
    }

    pub async fn issue(&self, order_id: Uuid) -> Result<IssuedCredential> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

        if order.payment_status != OrderPaymentStatus::Paid {
            return Err(AppError::Conflict(
                "Cannot issue credential until payment is PAID".to_string(),
            ));
        }

        let now = Utc::now();

        // Live credential: regenerate the identical token instead of
        // minting a new one, so re-display and re-send stay idempotent.
        if let Some(existing) = self.credentials.find_active_by_order(order_id).await? {
            if !existing.is_expired(now) {
                let token = self.sign_token(
                    &order,
                    &existing.jti,
                    existing.issued_at,
                    existing.expires_at,
                )?;
                let qr_text = self.qr_text(&token);
                return Ok(IssuedCredential {
                    record: existing,
                    token,
                    qr_text,
                    reused: true,
                });
            }
        }

        // Expired or missing: anything previously active is revoked first
        // so at most one credential per order can ever check in.
        let revoked = self.credentials.revoke_for_order(order_id).await?;
        if revoked > 0 {
            tracing::info!("Revoked {} prior credential(s) for order {}", revoked, order_id);
        }

        let issued_at = now;
        let expires_at = now + Duration::days(self.config.expires_in_days);
        let jti = make_jti();

        let token = self.sign_token(&order, &jti, issued_at, expires_at)?;
        let token_hash = sha256_hex(&token);

        let record = self
            .credentials
            .create(CredentialRecord {
                id: Uuid::new_v4(),
                order_id,
                jti,
                token_hash,
                status: CredentialStatus::Active,
                issued_at,
                expires_at,
                check_in_status: CheckInStatus::NotCheckedIn,
                checked_in_at: None,
                email_sent_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let qr_text = self.qr_text(&token);
        Ok(IssuedCredential {
            record,
            token,
            qr_text,
            reused: false,
        })
    }

    /// Validates a presented token's signature and expiry. Used by the
    /// check-in side; revocation checks happen against the stored record.
    pub fn verify_token(&self, token: &str) -> Result<QrClaims> {
        let data = decode::<QrClaims>(
            token,
            &DecodingKey::from_secret(self.config.signing_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| AppError::BadRequest(format!("Invalid credential token: {}", e)))?;

        Ok(data.claims)
    }

    pub fn qr_text(&self, token: &str) -> String {
        format!("{}.{}", self.config.qr_prefix, token)
    }

    fn sign_token(
        &self,
        order: &Order,
        jti: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = QrClaims {
            sub: order.id.to_string(),
            rid: order.code.clone(),
            jti: jti.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.signing_secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("Failed to sign credential token: {}", e)))
    }
}

fn make_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

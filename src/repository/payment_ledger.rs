use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{Payment, PaymentStatus, PROVIDER_NAME},
    error::{AppError, Result},
    repository::PaymentLedger,
};

#[derive(FromRow)]
struct PaymentRow {
    id: String,
    order_id: String,
    provider: String,
    reference: String,
    provider_tx_id: Option<String>,
    currency: String,
    amount_cents: i64,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    last_callback: Option<String>,
    redirect_url: Option<String>,
    paid_at: Option<NaiveDateTime>,
    canceled_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, order_id, provider, reference, provider_tx_id, currency,
           amount_cents, status, attempts, last_error, last_callback,
           redirect_url, paid_at, canceled_at, created_at, updated_at
    FROM payments
"#;

pub struct SqlitePaymentLedger {
    pool: SqlitePool,
}

impl SqlitePaymentLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: PaymentRow) -> Result<Payment> {
        let last_callback = match row.last_callback {
            Some(raw) => Some(
                serde_json::from_str(&raw).map_err(|e| AppError::Database(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Payment {
            id: Uuid::parse_str(&row.id).map_err(|e| AppError::Database(e.to_string()))?,
            order_id: Uuid::parse_str(&row.order_id)
                .map_err(|e| AppError::Database(e.to_string()))?,
            provider: row.provider,
            reference: row.reference,
            provider_tx_id: row.provider_tx_id,
            currency: row.currency,
            amount_cents: row.amount_cents,
            status: Self::parse_status(&row.status)?,
            attempts: row.attempts,
            last_error: row.last_error,
            last_callback,
            redirect_url: row.redirect_url,
            paid_at: row.paid_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            canceled_at: row.canceled_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            updated_at: DateTime::from_naive_utc_and_offset(row.updated_at, Utc),
        })
    }

    fn parse_status(s: &str) -> Result<PaymentStatus> {
        match s {
            "INITIATED" => Ok(PaymentStatus::Initiated),
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELED" => Ok(PaymentStatus::Canceled),
            _ => Err(AppError::Database(format!("Invalid payment status: {}", s))),
        }
    }

    async fn fetch_required(&self, id: Uuid) -> Result<Payment> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Database("Payment vanished after update".to_string()))
    }
}

#[async_trait]
impl PaymentLedger for SqlitePaymentLedger {
    async fn create_or_reuse_transient(
        &self,
        order_id: Uuid,
        amount_cents: i64,
        currency: &str,
        reference: String,
    ) -> Result<Payment> {
        let order_id_str = order_id.to_string();

        // Lookup and insert share one transaction so two concurrent
        // initiations cannot both insert a transient record.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let existing = sqlx::query_as::<_, PaymentRow>(&format!(
            "{} WHERE order_id = ? AND status IN ('INITIATED', 'PENDING') ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(&order_id_str)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        if let Some(row) = existing {
            tx.commit().await.map_err(|e| AppError::Database(e.to_string()))?;
            return Self::row_to_payment(row);
        }

        let id = Uuid::new_v4();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, order_id, provider, reference, currency, amount_cents,
                status, attempts, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'INITIATED', 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&order_id_str)
        .bind(PROVIDER_NAME)
        .bind(&reference)
        .bind(currency)
        .bind(amount_cents)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| AppError::Database(e.to_string()))?;

        self.fetch_required(id).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_payment(r)?)),
            None => Ok(None),
        }
    }

    async fn find_latest(&self, order_id: Uuid) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "{} WHERE order_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(order_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_payment(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_provider_tx(&self, provider_tx_id: &str) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "{} WHERE provider_tx_id = ?",
            SELECT_COLUMNS
        ))
        .bind(provider_tx_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_payment(r)?)),
            None => Ok(None),
        }
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Payment>> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET attempts = attempts + 1,
                last_error = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('INITIATED', 'PENDING')
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch_required(id).await?))
    }

    async fn record_checkout(
        &self,
        id: Uuid,
        provider_tx_id: &str,
        redirect_url: &str,
    ) -> Result<Option<Payment>> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET provider_tx_id = ?,
                redirect_url = ?,
                status = 'PENDING',
                updated_at = ?
            WHERE id = ? AND status IN ('INITIATED', 'PENDING')
            "#,
        )
        .bind(provider_tx_id)
        .bind(redirect_url)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch_required(id).await?))
    }

    async fn mark_paid(&self, id: Uuid, paid_at: DateTime<Utc>) -> Result<Option<Payment>> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'PAID',
                paid_at = ?,
                last_error = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('INITIATED', 'PENDING')
            "#,
        )
        .bind(paid_at.naive_utc())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch_required(id).await?))
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<Option<Payment>> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'FAILED',
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('INITIATED', 'PENDING')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch_required(id).await?))
    }

    async fn record_error(&self, id: Uuid, message: &str) -> Result<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE payments SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    async fn record_callback(&self, id: Uuid, payload: &serde_json::Value) -> Result<()> {
        let now = Utc::now().naive_utc();
        let raw = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(e.to_string()))?;

        sqlx::query("UPDATE payments SET last_callback = ?, updated_at = ? WHERE id = ?")
            .bind(raw)
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{CheckInStatus, CredentialRecord, CredentialStatus},
    error::{AppError, Result},
    repository::CredentialRepository,
};

#[derive(FromRow)]
struct CredentialRow {
    id: String,
    order_id: String,
    jti: String,
    token_hash: String,
    status: String,
    issued_at: NaiveDateTime,
    expires_at: NaiveDateTime,
    check_in_status: String,
    checked_in_at: Option<NaiveDateTime>,
    email_sent_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

pub struct SqliteCredentialRepository {
    pool: SqlitePool,
}

impl SqliteCredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: CredentialRow) -> Result<CredentialRecord> {
        Ok(CredentialRecord {
            id: Uuid::parse_str(&row.id).map_err(|e| AppError::Database(e.to_string()))?,
            order_id: Uuid::parse_str(&row.order_id)
                .map_err(|e| AppError::Database(e.to_string()))?,
            jti: row.jti,
            token_hash: row.token_hash,
            status: Self::parse_status(&row.status)?,
            issued_at: DateTime::from_naive_utc_and_offset(row.issued_at, Utc),
            expires_at: DateTime::from_naive_utc_and_offset(row.expires_at, Utc),
            check_in_status: Self::parse_check_in(&row.check_in_status)?,
            checked_in_at: row.checked_in_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            email_sent_at: row.email_sent_at.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)),
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            updated_at: DateTime::from_naive_utc_and_offset(row.updated_at, Utc),
        })
    }

    fn parse_status(s: &str) -> Result<CredentialStatus> {
        match s {
            "ACTIVE" => Ok(CredentialStatus::Active),
            "REVOKED" => Ok(CredentialStatus::Revoked),
            "EXPIRED" => Ok(CredentialStatus::Expired),
            _ => Err(AppError::Database(format!("Invalid credential status: {}", s))),
        }
    }

    fn status_to_str(status: CredentialStatus) -> &'static str {
        match status {
            CredentialStatus::Active => "ACTIVE",
            CredentialStatus::Revoked => "REVOKED",
            CredentialStatus::Expired => "EXPIRED",
        }
    }

    fn parse_check_in(s: &str) -> Result<CheckInStatus> {
        match s {
            "NOT_CHECKED_IN" => Ok(CheckInStatus::NotCheckedIn),
            "CHECKED_IN" => Ok(CheckInStatus::CheckedIn),
            _ => Err(AppError::Database(format!("Invalid check-in status: {}", s))),
        }
    }

    fn check_in_to_str(status: CheckInStatus) -> &'static str {
        match status {
            CheckInStatus::NotCheckedIn => "NOT_CHECKED_IN",
            CheckInStatus::CheckedIn => "CHECKED_IN",
        }
    }
}

#[async_trait]
impl CredentialRepository for SqliteCredentialRepository {
    async fn create(&self, record: CredentialRecord) -> Result<CredentialRecord> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, order_id, jti, token_hash, status, issued_at, expires_at,
                check_in_status, checked_in_at, email_sent_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.order_id.to_string())
        .bind(&record.jti)
        .bind(&record.token_hash)
        .bind(Self::status_to_str(record.status))
        .bind(record.issued_at.naive_utc())
        .bind(record.expires_at.naive_utc())
        .bind(Self::check_in_to_str(record.check_in_status))
        .bind(record.checked_in_at.map(|dt| dt.naive_utc()))
        .bind(record.email_sent_at.map(|dt| dt.naive_utc()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        self.find_by_id(record.id)
            .await?
            .ok_or_else(|| AppError::Database("Failed to retrieve created credential".to_string()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, order_id, jti, token_hash, status, issued_at, expires_at,
                   check_in_status, checked_in_at, email_sent_at, created_at, updated_at
            FROM credentials
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(r)?)),
            None => Ok(None),
        }
    }

    async fn find_active_by_order(&self, order_id: Uuid) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, order_id, jti, token_hash, status, issued_at, expires_at,
                   check_in_status, checked_in_at, email_sent_at, created_at, updated_at
            FROM credentials
            WHERE order_id = ? AND status = 'ACTIVE'
            ORDER BY issued_at DESC
            LIMIT 1
            "#,
        )
        .bind(order_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(r)?)),
            None => Ok(None),
        }
    }

    async fn revoke_for_order(&self, order_id: Uuid) -> Result<u64> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET status = 'REVOKED', updated_at = ?
            WHERE order_id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(now)
        .bind(order_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn mark_email_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET email_sent_at = ?, updated_at = ?
            WHERE id = ? AND email_sent_at IS NULL
            "#,
        )
        .bind(at.naive_utc())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

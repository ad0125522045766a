use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{CreateOrderRequest, Order, OrderPaymentStatus},
    error::{AppError, Result},
    repository::OrderRepository,
};

#[derive(FromRow)]
struct OrderRow {
    id: String,
    code: String,
    first_name: String,
    last_name: String,
    email: String,
    phone: Option<String>,
    amount_cents: i64,
    currency: String,
    payment_status: String,
    payment_provider: Option<String>,
    payment_reference: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_order(row: OrderRow) -> Result<Order> {
        Ok(Order {
            id: Uuid::parse_str(&row.id).map_err(|e| AppError::Database(e.to_string()))?,
            code: row.code,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            phone: row.phone,
            amount_cents: row.amount_cents,
            currency: row.currency,
            payment_status: Self::parse_status(&row.payment_status)?,
            payment_provider: row.payment_provider,
            payment_reference: row.payment_reference,
            created_at: DateTime::from_naive_utc_and_offset(row.created_at, Utc),
            updated_at: DateTime::from_naive_utc_and_offset(row.updated_at, Utc),
        })
    }

    fn parse_status(s: &str) -> Result<OrderPaymentStatus> {
        match s {
            "UNPAID" => Ok(OrderPaymentStatus::Unpaid),
            "PENDING" => Ok(OrderPaymentStatus::Pending),
            "PAID" => Ok(OrderPaymentStatus::Paid),
            "FAILED" => Ok(OrderPaymentStatus::Failed),
            _ => Err(AppError::Database(format!("Invalid order payment status: {}", s))),
        }
    }

    fn status_to_str(status: OrderPaymentStatus) -> &'static str {
        match status {
            OrderPaymentStatus::Unpaid => "UNPAID",
            OrderPaymentStatus::Pending => "PENDING",
            OrderPaymentStatus::Paid => "PAID",
            OrderPaymentStatus::Failed => "FAILED",
        }
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn create(&self, order: CreateOrderRequest) -> Result<Order> {
        if order.amount_cents <= 0 {
            return Err(AppError::BadRequest(
                "Order amount must be positive".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, code, first_name, last_name, email, phone,
                amount_cents, currency, payment_status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'UNPAID', ?, ?)
            "#,
        )
        .bind(&id_str)
        .bind(&order.code)
        .bind(&order.first_name)
        .bind(&order.last_name)
        .bind(&order.email)
        .bind(&order.phone)
        .bind(order.amount_cents)
        .bind(&order.currency)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Database("Failed to retrieve created order".to_string()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        let id_str = id.to_string();
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT id, code, first_name, last_name, email, phone,
                   amount_cents, currency, payment_status, payment_provider,
                   payment_reference, created_at, updated_at
            FROM orders
            WHERE id = ?
            "#,
        )
        .bind(id_str)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_order(r)?)),
            None => Ok(None),
        }
    }

    async fn save_payment_mirror(
        &self,
        id: Uuid,
        status: OrderPaymentStatus,
        provider: &str,
        reference: Option<&str>,
    ) -> Result<()> {
        let id_str = id.to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = ?,
                payment_provider = ?,
                payment_reference = COALESCE(?, payment_reference),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Self::status_to_str(status))
        .bind(provider)
        .bind(reference)
        .bind(now)
        .bind(&id_str)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }
}

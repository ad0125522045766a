use std::sync::Arc;

use chrono::Utc;
use confpay::{
    config::{CredentialConfig, VerificationConfig},
    credential::CredentialIssuer,
    domain::{CallbackPayload, CreateOrderRequest, Order, OrderPaymentStatus, PaymentStatus},
    error::AppError,
    gateway::{CheckoutCreated, FakeGateway, StatusOutcome, TransactionStatus},
    notify::{Notifier, RecordingMailer},
    reconcile::ReconciliationEngine,
    repository::{
        CredentialRepository, OrderRepository, PaymentLedger, SqliteCredentialRepository,
        SqliteOrderRepository, SqlitePaymentLedger,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

struct Harness {
    pool: SqlitePool,
    orders: Arc<dyn OrderRepository>,
    ledger: Arc<dyn PaymentLedger>,
    credentials: Arc<dyn CredentialRepository>,
    gateway: Arc<FakeGateway>,
    mailer: Arc<RecordingMailer>,
    engine: ReconciliationEngine,
}

async fn setup() -> anyhow::Result<Harness> {
    // Single connection, no acquire-time ping: several tests pause
    // tokio's clock, and a ping under the pool's acquire timeout would
    // trip the auto-advanced timer.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .test_before_acquire(false)
        .connect(":memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // Under a paused clock, tokio auto-advances straight to the nearest
    // pending timer whenever the runtime is idle. sqlx pings each
    // connection on its way back into the pool — a real-time round trip
    // to the sqlite worker thread — so a pool acquire that has to wait
    // on it would arm its timeout timer and have it fired instantly.
    // A fine-grained ticker keeps the nearest timer 1ms away, so virtual
    // time advances in small steps and the worker threads get real time
    // to respond.
    tokio::spawn(async {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    });

    let orders: Arc<dyn OrderRepository> = Arc::new(SqliteOrderRepository::new(pool.clone()));
    let ledger: Arc<dyn PaymentLedger> = Arc::new(SqlitePaymentLedger::new(pool.clone()));
    let credentials: Arc<dyn CredentialRepository> =
        Arc::new(SqliteCredentialRepository::new(pool.clone()));

    let gateway = Arc::new(FakeGateway::new());
    let mailer = Arc::new(RecordingMailer::new());

    let issuer = Arc::new(CredentialIssuer::new(
        orders.clone(),
        credentials.clone(),
        CredentialConfig {
            signing_secret: "test-secret".to_string(),
            qr_prefix: "APSC2026".to_string(),
            expires_in_days: 30,
        },
    ));
    let notifier = Arc::new(Notifier::new(credentials.clone(), mailer.clone()));

    let engine = ReconciliationEngine::new(
        orders.clone(),
        ledger.clone(),
        gateway.clone(),
        issuer,
        notifier,
        "http://localhost:8080/payment/return".to_string(),
        VerificationConfig {
            budget_secs: 60,
            interval_secs: 5,
        },
    );

    Ok(Harness {
        pool,
        orders,
        ledger,
        credentials,
        gateway,
        mailer,
        engine,
    })
}

async fn demo_order(h: &Harness) -> anyhow::Result<Order> {
    Ok(h.orders
        .create(CreateOrderRequest {
            code: "APSC-00001".to_string(),
            first_name: "Maya".to_string(),
            last_name: "Perera".to_string(),
            email: "maya@example.com".to_string(),
            phone: Some("+94770000000".to_string()),
            amount_cents: 10000,
            currency: "USD".to_string(),
        })
        .await?)
}

fn paid_report(amount_cents: i64, currency: &str) -> TransactionStatus {
    TransactionStatus {
        outcome: StatusOutcome::Paid,
        amount_cents: Some(amount_cents),
        currency: Some(currency.to_string()),
        paid_at: Some(Utc::now()),
        message: Some("SUCCESS".to_string()),
    }
}

fn pending_report() -> TransactionStatus {
    TransactionStatus {
        outcome: StatusOutcome::Pending,
        amount_cents: None,
        currency: None,
        paid_at: None,
        message: Some("Awaiting confirmation".to_string()),
    }
}

#[tokio::test]
async fn test_initiate_then_reuse_returns_same_checkout() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;

    let first = h.engine.initiate(order.id).await?;
    assert!(!first.reused);
    assert_eq!(first.provider_tx_id.as_deref(), Some("TX-FAKE-1"));

    // Client lost the response and retries: same transaction, no new
    // checkout call against the provider
    let second = h.engine.initiate(order.id).await?;
    assert!(second.reused);
    assert_eq!(second.provider_tx_id, first.provider_tx_id);
    assert_eq!(second.redirect_url, first.redirect_url);
    assert_eq!(h.gateway.checkout_calls(), 1);

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.attempts, 1);
    assert!(payment.reference.len() <= 21);

    let mirrored = h.orders.find_by_id(order.id).await?.unwrap();
    assert_eq!(mirrored.payment_status, OrderPaymentStatus::Pending);
    assert_eq!(mirrored.payment_reference.as_deref(), Some("TX-FAKE-1"));

    Ok(())
}

#[tokio::test]
async fn test_initiate_missing_order_and_paid_order() -> anyhow::Result<()> {
    let h = setup().await?;

    let missing = h.engine.initiate(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));

    let order = demo_order(&h).await?;
    h.orders
        .save_payment_mirror(order.id, OrderPaymentStatus::Paid, "ONEPAY", Some("TX-OLD"))
        .await?;

    let double_pay = h.engine.initiate(order.id).await;
    assert!(matches!(double_pay, Err(AppError::Conflict(_))));

    Ok(())
}

#[tokio::test]
async fn test_initiate_rejects_non_positive_amount() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;

    // The registration subsystem owns the orders table, so a bad amount
    // can appear without going through our repository
    sqlx::query("UPDATE orders SET amount_cents = 0 WHERE id = ?")
        .bind(order.id.to_string())
        .execute(&h.pool)
        .await?;

    let result = h.engine.initiate(order.id).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert_eq!(h.gateway.checkout_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_initiate_surfaces_gateway_failure() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;

    h.gateway.fail_checkout();
    let result = h.engine.initiate(order.id).await;
    assert!(matches!(result, Err(AppError::Gateway(_))));

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment.last_error.is_some());

    // A terminal record does not block trying again
    h.gateway.set_checkout(CheckoutCreated {
        provider_tx_id: "TX-FAKE-2".to_string(),
        redirect_url: "https://pay.example/checkout/TX-FAKE-2".to_string(),
    });
    let retry = h.engine.initiate(order.id).await?;
    assert!(!retry.reused);
    assert_eq!(retry.provider_tx_id.as_deref(), Some("TX-FAKE-2"));

    Ok(())
}

#[tokio::test]
async fn test_paid_flow_finalizes_exactly_once() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    h.gateway.push_status(paid_report(10000, "USD"));

    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert!(payment.paid_at.is_some());

    // Finalization: credential issued, exactly one email
    let credential = h.credentials.find_active_by_order(order.id).await?.unwrap();
    assert!(credential.email_sent_at.is_some());
    assert_eq!(h.mailer.sent_count(), 1);
    assert_eq!(h.mailer.sent()[0].to, "maya@example.com");

    let mirrored = h.orders.find_by_id(order.id).await?.unwrap();
    assert_eq!(mirrored.payment_status, OrderPaymentStatus::Paid);

    // PAID is absorbing: repeated polls return the same record, never
    // re-verify, never re-send
    let status_calls = h.gateway.status_calls();
    let again = h.engine.get_status(order.id).await?;
    assert_eq!(again.status, PaymentStatus::Paid);
    assert_eq!(again.paid_at, payment.paid_at);
    assert_eq!(h.gateway.status_calls(), status_calls);
    assert_eq!(h.mailer.sent_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_amount_mismatch_is_conflict_and_status_unchanged() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    // Gateway asserts PAID but for 99.00 instead of 100.00
    h.gateway.push_status(paid_report(9900, "USD"));

    let result = h.engine.get_status(order.id).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(h.credentials.find_active_by_order(order.id).await?.is_none());
    assert_eq!(h.mailer.sent_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_currency_mismatch_is_conflict() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    h.gateway.push_status(paid_report(10000, "LKR"));

    let result = h.engine.get_status(order.id).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_gateway_exhausts_budget_then_fails_terminally() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    h.gateway.set_fallback_unreachable("connection refused");

    // Pause the clock so the 5s poll intervals auto-advance instantly
    tokio::time::pause();

    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment.last_error.as_deref().unwrap().contains("connection refused"));

    // 60s budget at 5s intervals = 12 polls
    assert_eq!(h.gateway.status_calls(), 12);

    let mirrored = h.orders.find_by_id(order.id).await?.unwrap();
    assert_eq!(mirrored.payment_status, OrderPaymentStatus::Failed);

    // FAILED is terminal: a later poll answers from the ledger alone
    let again = h.engine.get_status(order.id).await?;
    assert_eq!(again.status, PaymentStatus::Failed);
    assert_eq!(h.gateway.status_calls(), 12);

    Ok(())
}

#[tokio::test]
async fn test_pending_forever_exhausts_budget() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    h.gateway.set_fallback_status(pending_report());

    tokio::time::pause();

    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.last_error.as_deref(),
        Some("Payment not confirmed within verification window")
    );

    Ok(())
}

#[tokio::test]
async fn test_gateway_failure_mid_window_then_paid() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    // Two transport errors, then the provider confirms: transient
    // trouble must not abort the loop early
    h.gateway.push_unreachable("timeout");
    h.gateway.push_unreachable("timeout");
    h.gateway.push_status(paid_report(10000, "USD"));

    tokio::time::pause();

    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(h.gateway.status_calls(), 3);
    assert_eq!(h.mailer.sent_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_missing_provider_tx_id_fails_fast() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;

    // A record the provider never accepted (e.g. process died mid-initiate)
    h.ledger
        .create_or_reuse_transient(order.id, 10000, "USD", "APSC-00001-AAAAAA".to_string())
        .await?;

    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.last_error.as_deref(),
        Some("Missing provider transaction id")
    );
    assert_eq!(h.gateway.status_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_status_for_unknown_order_or_payment() -> anyhow::Result<()> {
    let h = setup().await?;

    let missing = h.engine.get_status(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));

    let order = demo_order(&h).await?;
    let no_payment = h.engine.get_status(order.id).await;
    assert!(matches!(no_payment, Err(AppError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_callback_validation() -> anyhow::Result<()> {
    let h = setup().await?;

    let missing_tx = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: None,
            status: Some(1),
            status_message: Some("SUCCESS".to_string()),
            additional_data: None,
        })
        .await;
    assert!(matches!(missing_tx, Err(AppError::BadRequest(_))));

    let unknown_tx = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: Some("TX-UNKNOWN".to_string()),
            status: Some(1),
            status_message: Some("SUCCESS".to_string()),
            additional_data: None,
        })
        .await;
    assert!(matches!(unknown_tx, Err(AppError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_callback_is_advisory_and_never_fails_a_payment() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    // Provider claims failure; authoritative status still says pending.
    // Gateway callbacks are noisy (card retries, out-of-order delivery),
    // so this must not close the payment.
    h.gateway.set_fallback_status(pending_report());

    let outcome = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: Some("TX-FAKE-1".to_string()),
            status: Some(0),
            status_message: Some("Card declined".to_string()),
            additional_data: Some("APSC-00001".to_string()),
        })
        .await?;
    assert_eq!(outcome.status, PaymentStatus::Pending);
    assert!(!outcome.already_processed);

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    // The payload is kept verbatim for audit
    let callback = payment.last_callback.unwrap();
    assert_eq!(callback["status_message"], "Card declined");

    Ok(())
}

#[tokio::test]
async fn test_callback_asserted_success_is_verified_before_trust() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    // Callback says paid and the authoritative query agrees
    h.gateway.push_status(paid_report(10000, "USD"));

    let outcome = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: Some("TX-FAKE-1".to_string()),
            status: Some(1),
            status_message: Some("SUCCESS".to_string()),
            additional_data: None,
        })
        .await?;
    assert_eq!(outcome.status, PaymentStatus::Paid);
    assert_eq!(h.mailer.sent_count(), 1);

    // Retried callback for the same transaction is a no-op
    let retried = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: Some("TX-FAKE-1".to_string()),
            status: Some(1),
            status_message: Some("SUCCESS".to_string()),
            additional_data: None,
        })
        .await?;
    assert!(retried.already_processed);
    assert_eq!(h.mailer.sent_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_callback_survives_gateway_outage() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    // The best-effort verify fails; the callback must still be
    // acknowledged (the provider retries aggressively on errors)
    h.gateway.set_fallback_unreachable("connection refused");

    let outcome = h
        .engine
        .ingest_callback(CallbackPayload {
            transaction_id: Some("TX-FAKE-1".to_string()),
            status: Some(1),
            status_message: Some("SUCCESS".to_string()),
            additional_data: None,
        })
        .await?;
    assert_eq!(outcome.status, PaymentStatus::Pending);

    let payment = h.ledger.find_latest(order.id).await?.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.last_error.as_deref().unwrap().contains("connection refused"));

    Ok(())
}

#[tokio::test]
async fn test_concurrent_initiations_share_one_payment() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;

    let (a, b) = tokio::join!(h.engine.initiate(order.id), h.engine.initiate(order.id));
    let a = a?;
    let b = b?;
    assert_eq!(a.payment_id, b.payment_id);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE order_id = ?")
        .bind(order.id.to_string())
        .fetch_one(&h.pool)
        .await?;
    assert_eq!(count, 1);

    Ok(())
}

#[tokio::test]
async fn test_failed_finalization_is_retried_on_next_poll() -> anyhow::Result<()> {
    let h = setup().await?;
    let order = demo_order(&h).await?;
    h.engine.initiate(order.id).await?;

    h.mailer.fail_next_send();
    h.gateway.push_status(paid_report(10000, "USD"));

    // PAID sticks even though the email could not be sent
    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert!(payment.last_error.as_deref().unwrap().starts_with("Finalize failed"));
    assert_eq!(h.mailer.sent_count(), 0);

    // Next poll retries finalization and succeeds
    let payment = h.engine.get_status(order.id).await?;
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(h.mailer.sent_count(), 1);

    let credential = h.credentials.find_active_by_order(order.id).await?.unwrap();
    assert!(credential.email_sent_at.is_some());

    Ok(())
}

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confpay::{
    api,
    config::Settings,
    credential::CredentialIssuer,
    gateway::OnePayClient,
    notify::{LogMailer, Mailer, Notifier, SmtpMailer},
    reconcile::ReconciliationEngine,
    repository::{
        SqliteCredentialRepository, SqliteOrderRepository, SqlitePaymentLedger,
        CredentialRepository, OrderRepository, PaymentLedger,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confpay=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}. Using defaults.", e);
        Settings::default()
    });

    tracing::info!(
        "Starting confpay on {}:{}",
        settings.server.host,
        settings.server.port
    );

    // Initialize database
    let db_pool = SqlitePoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    // Repositories
    let order_repo: Arc<dyn OrderRepository> =
        Arc::new(SqliteOrderRepository::new(db_pool.clone()));
    let ledger: Arc<dyn PaymentLedger> = Arc::new(SqlitePaymentLedger::new(db_pool.clone()));
    let credential_repo: Arc<dyn CredentialRepository> =
        Arc::new(SqliteCredentialRepository::new(db_pool.clone()));

    // Gateway client, constructed once and shared
    let gateway = Arc::new(OnePayClient::new(settings.gateway.clone())?);

    // Mailer: SMTP when configured, otherwise log-only so the full
    // finalization path still runs in development
    let mailer: Arc<dyn Mailer> = if settings.email.enabled {
        tracing::info!("Email delivery enabled via SMTP");
        Arc::new(SmtpMailer::new(&settings.email)?)
    } else {
        tracing::info!("Email delivery disabled; sends will be logged only");
        Arc::new(LogMailer)
    };

    let issuer = Arc::new(CredentialIssuer::new(
        order_repo.clone(),
        credential_repo.clone(),
        settings.credential.clone(),
    ));
    let notifier = Arc::new(Notifier::new(credential_repo.clone(), mailer));

    let engine = Arc::new(ReconciliationEngine::new(
        order_repo,
        ledger,
        gateway,
        issuer,
        notifier,
        settings.gateway.redirect_url.clone(),
        settings.verification.clone(),
    ));

    let app = api::create_app(engine);

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        settings.server.host, settings.server.port
    ))
    .await?;

    tracing::info!(
        "Server listening on http://{}:{}",
        settings.server.host,
        settings.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}

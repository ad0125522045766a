pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::reconcile::ReconciliationEngine;
use state::AppState;

pub fn create_app(engine: Arc<ReconciliationEngine>) -> Router {
    let app_state = AppState::new(engine);

    Router::new()
        // Root and health endpoints
        .route("/", get(handlers::root::root))
        .route("/health", get(handlers::root::health_check))
        // Payment reconciliation endpoints
        .nest("/api/payments", payment_routes())
        .with_state(app_state)
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive()) // Configure properly for production
        .layer(TraceLayer::new_for_http())
}

fn payment_routes() -> Router<AppState> {
    Router::new()
        // Provider-facing callback (no auth; see engine notes)
        .route("/callback", post(handlers::payments::callback))
        .route("/:order_id/initiate", post(handlers::payments::initiate))
        .route("/:order_id/status", get(handlers::payments::status))
}

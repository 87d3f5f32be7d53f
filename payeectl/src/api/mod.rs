//! HTTP surface: router and shared application state.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dossier::clients::Classifier;
use dossier::{ExclusionFilter, Pipeline, RecordStore, SearchTracker};

pub mod handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub pipeline: Arc<Pipeline>,
    pub tracker: Arc<SearchTracker>,
    pub filter: Arc<ExclusionFilter>,
    pub classifier: Arc<dyn Classifier>,
    pub webhook_secret: Option<String>,
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(handlers::upload::upload_batch))
        .route("/upload/batches", get(handlers::upload::list_batches))
        .route(
            "/upload/batches/{batch_id}/cancel",
            post(handlers::upload::cancel_batch),
        )
        .route("/status/{batch_id}", get(handlers::upload::batch_status))
        .route(
            "/classifications/{batch_id}",
            get(handlers::classifications::list_classifications),
        )
        .route("/classify-single", post(handlers::classify::classify_single))
        .route(
            "/keywords",
            post(handlers::keywords::create_keyword).get(handlers::keywords::list_keywords),
        )
        .route(
            "/keywords/{keyword_id}",
            patch(handlers::keywords::update_keyword).delete(handlers::keywords::delete_keyword),
        )
        .route("/keywords/test", post(handlers::keywords::test_keyword))
        .route(
            "/webhooks/merchant/search-notifications",
            post(handlers::webhooks::receive_notification),
        )
        .route(
            "/webhooks/merchant/health",
            get(handlers::webhooks::webhook_health),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Uploads can be large; everything else stays small.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

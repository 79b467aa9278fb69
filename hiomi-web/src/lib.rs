//! hiomi-web library - pneumonia detection demo service
//!
//! Serves the same-origin inference proxy and a detection session API that
//! uploads an image and follows its result through the Result Reconciler.

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use hiomi_client::{HiomiClient, Reconciler};
use hiomi_common::ServiceConfig;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod error;

pub use error::{ApiError, ApiResult};

/// Room for multipart boundaries and text fields on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub client: HiomiClient,
    /// One pending detection per service instance
    pub reconciler: Arc<Reconciler>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(client: HiomiClient) -> Self {
        let reconciler = Arc::new(client.reconciler());
        Self {
            client,
            reconciler,
            startup_time: Utc::now(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        self.client.config()
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let body_limit = usize::try_from(state.config().upload.max_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/api/process_image", post(api::process_image))
        .route(
            "/api/detect",
            post(api::start_detection).delete(api::cancel_detection),
        )
        .route("/api/detect/state", get(api::detection_state))
        .route("/api/detect/events", get(api::detection_events))
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

//! # Router & shared state

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use infrastructure::bakta_repository::BaktaRepository;
use infrastructure::job_repository::JobRepository;
use infrastructure::store::Store;
use pipeline_core::traits::BaktaApi;
use shared::config::AppConfig;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bakta_orchestrator::BaktaOrchestrator;
use crate::server::{bakta_handlers, handlers};

/// Genome uploads can be large; cap the body well above typical drafts.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub jobs: JobRepository,
    pub bakta: BaktaRepository,
    pub bakta_api: Arc<dyn BaktaApi>,
    pub orchestrator: Arc<BaktaOrchestrator>,
}

pub fn create_router(state: Arc<AppState>, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/predict", post(handlers::predict))
        .route("/aggregate", post(handlers::aggregate))
        .route("/sequence", post(handlers::sequence))
        .route("/visualize", post(handlers::visualize))
        .route("/jobs", get(handlers::list_jobs))
        .route(
            "/jobs/:id",
            get(handlers::get_job)
                .patch(handlers::patch_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/:id/download", get(handlers::download))
        .route("/bakta/jobs", post(bakta_handlers::submit).get(bakta_handlers::list))
        .route(
            "/bakta/jobs/:id",
            get(bakta_handlers::get).delete(bakta_handlers::delete),
        )
        .route("/bakta/jobs/:id/files/:file_type", get(bakta_handlers::download_file))
        .route("/bakta/jobs/:id/annotations", get(bakta_handlers::annotations))
        .route("/bakta/jobs/:id/logs", get(bakta_handlers::logs))
        .route("/bakta/version", get(bakta_handlers::version))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    }
}

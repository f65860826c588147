//! Axum router for the /api/v1 surface.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, publications, runs, scholars, settings};
use crate::sse::run_stream;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Runs
        .route("/runs", post(runs::trigger_run).get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        .route("/runs/{id}/stream", get(run_stream))
        // Publications
        .route("/publications", get(publications::list_publications))
        .route("/publications/mark-all-read", post(publications::mark_all_read))
        .route("/publications/mark-selected-read", post(publications::mark_selected_read))
        .route("/publications/{id}/favorite", post(publications::set_favorite))
        .route("/publications/{id}/retry-pdf", post(publications::retry_pdf))
        // Scholars
        .route("/scholars", get(scholars::list_scholars).post(scholars::create_scholar))
        .route("/scholars/search", post(scholars::search_scholars))
        // Settings
        .route("/settings", get(settings::get_settings).put(settings::put_settings))
        // Health
        .route("/health", get(health::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

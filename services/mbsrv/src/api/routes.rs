//! API route configuration

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use crate::lifecycle::DriverManager;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<DriverManager>,
}

impl AppState {
    pub fn new(driver: Arc<DriverManager>) -> Self {
        Self { driver }
    }
}

/// Build the control plane router
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))
        .route("/api/start", post(handlers::start_driver))
        .route("/api/stop", post(handlers::stop_driver))
        .route("/api/restart", post(handlers::restart_driver))
        .route("/api/debug/{mode}", post(handlers::set_debug))
        .route("/api/points", get(handlers::list_points))
        .route(
            "/api/points/{name}",
            get(handlers::get_point).put(handlers::set_point),
        )
        .route(
            "/api/registers/{table}",
            get(handlers::read_registers).put(handlers::write_registers),
        )
        .route(
            "/api/registers/{table}/quality",
            put(handlers::set_quality),
        )
        .route(
            "/api/registers/{table}/changes",
            get(handlers::changed_since),
        )
        .layer(axum::middleware::from_fn(common::logging::http_request_logger))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}

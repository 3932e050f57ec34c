//! HTTP routes for the operator surface
//!
//! Health, metrics and admin endpoints. CRM operations themselves are
//! invoked in-process through the integration manager.

pub mod admin;
pub mod health;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::AppState;

/// Upper bound for any operator request, backend probes included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Create the operator router
pub fn create_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/circuit-breakers/reset",
            post(admin::reset_circuit_breakers),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin::admin_auth_middleware,
        ));

    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/tiers", get(health::tier_health))
        .route("/health/backends", get(health::backend_health))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/metrics/tiers", get(metrics::tier_metrics));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

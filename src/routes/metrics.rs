//! Prometheus metrics endpoints
//!
//! `/metrics` serves the exporter's text output followed by the rolling
//! per-tier window aggregates; `/metrics/tiers` serves the same aggregates
//! as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::{
    tiers::{Tier, TierMetricsSnapshot},
    AppState,
};

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: Lazy<PrometheusHandle> = Lazy::new(|| {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if metrics::set_global_recorder(recorder).is_err() {
        warn!("A metrics recorder is already installed; Prometheus output will be empty");
    }
    handle
});

/// Initialize metrics (call once at startup)
pub fn init_metrics() {
    Lazy::force(&PROMETHEUS_HANDLE);
    register_metrics();
}

fn register_metrics() {
    metrics::describe_counter!(
        "crm_tier_requests_total",
        "Backend calls per tier and outcome"
    );
    metrics::describe_histogram!(
        "crm_tier_request_duration_seconds",
        "Backend call duration in seconds"
    );
    metrics::describe_counter!(
        "crm_tier_errors_total",
        "Failed backend calls per tier and error category"
    );
    metrics::describe_counter!(
        "crm_tier_retries_total",
        "In-tier retries after transient errors"
    );
    metrics::describe_counter!(
        "crm_tier_skipped_total",
        "Calls that skipped a tier because its breaker was open"
    );
    metrics::describe_counter!(
        "crm_failover_total",
        "Operations served by a tier after an earlier tier failed"
    );
    metrics::describe_gauge!(
        "crm_circuit_state",
        "Circuit breaker state per tier (0 closed, 1 half-open, 2 open)"
    );
    metrics::describe_counter!(
        "crm_token_refresh_total",
        "OAuth access token refreshes by result"
    );
}

/// Prometheus text endpoint
pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = PROMETHEUS_HANDLE.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&state.manager.metrics().render_text());

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Per-tier window aggregates as JSON
pub async fn tier_metrics(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<Tier, TierMetricsSnapshot>> {
    Json(state.manager.get_tier_metrics())
}

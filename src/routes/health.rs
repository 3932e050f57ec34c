//! Health check endpoints
//!
//! - `/health` - Full health check with dependency and tier status
//! - `/health/ready` - Readiness probe
//! - `/health/live` - Liveness probe
//! - `/health/tiers` - Breaker state per tier
//! - `/health/backends` - Active probe of every enabled backend

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::{
    backends::BackendHealth,
    manager::TierHealth,
    tiers::{CircuitState, Tier},
    AppState,
};

/// Health status enum
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Individual dependency check result
#[derive(Debug, Serialize)]
pub struct DependencyCheck {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: String,
    pub token_store: DependencyCheck,
    pub tiers: BTreeMap<Tier, TierHealth>,
}

/// Simple health response for liveness/readiness
#[derive(Debug, Serialize)]
pub struct SimpleHealthResponse {
    pub status: HealthStatus,
}

/// Backend probe report
#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub status: HealthStatus,
    pub backends: Vec<BackendHealth>,
}

async fn check_token_store(state: &AppState) -> DependencyCheck {
    let start = Instant::now();
    match state.token_store.ping().await {
        Ok(()) => DependencyCheck {
            status: HealthStatus::Healthy,
            latency_ms: start.elapsed().as_millis() as u64,
            error: None,
        },
        Err(e) => DependencyCheck {
            status: HealthStatus::Unhealthy,
            latency_ms: start.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    }
}

/// Healthy when every enabled tier is closed, degraded when some are not,
/// unhealthy when none can take traffic
fn tiers_status(tiers: &BTreeMap<Tier, TierHealth>) -> HealthStatus {
    let enabled: Vec<&TierHealth> = tiers.values().filter(|t| t.enabled).collect();
    let available = enabled
        .iter()
        .filter(|t| t.breaker_state != CircuitState::Open)
        .count();
    let closed = enabled
        .iter()
        .filter(|t| t.breaker_state == CircuitState::Closed)
        .count();

    if available == 0 {
        HealthStatus::Unhealthy
    } else if closed < enabled.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Full health check endpoint
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let token_store = check_token_store(&state).await;
    let tiers = state.manager.get_tier_health();

    let overall_status = if token_store.status == HealthStatus::Unhealthy {
        HealthStatus::Unhealthy
    } else {
        tiers_status(&tiers)
    };

    let response = HealthResponse {
        status: overall_status.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        token_store,
        tiers,
    };

    (overall_status.status_code(), Json(response))
}

/// Readiness probe endpoint
///
/// Ready when the token store answers and at least one enabled tier has a
/// breaker that is not open.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<SimpleHealthResponse>) {
    let token_store = check_token_store(&state).await;
    let tiers = tiers_status(&state.manager.get_tier_health());

    let any_unhealthy =
        token_store.status == HealthStatus::Unhealthy || tiers == HealthStatus::Unhealthy;
    let status = if any_unhealthy {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Healthy
    };

    (status.status_code(), Json(SimpleHealthResponse { status }))
}

/// Liveness probe endpoint
pub async fn liveness_check() -> (StatusCode, Json<SimpleHealthResponse>) {
    (
        StatusCode::OK,
        Json(SimpleHealthResponse {
            status: HealthStatus::Healthy,
        }),
    )
}

/// Breaker state and counters per tier
pub async fn tier_health(State(state): State<Arc<AppState>>) -> Json<BTreeMap<Tier, TierHealth>> {
    Json(state.manager.get_tier_health())
}

/// Probe every enabled backend; unhealthy only if all probes fail
pub async fn backend_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<BackendsResponse>) {
    let backends = state.manager.check_backends().await;
    let healthy = backends.iter().filter(|b| b.healthy).count();

    let status = if healthy == backends.len() {
        HealthStatus::Healthy
    } else if healthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };

    (status.status_code(), Json(BackendsResponse { status, backends }))
}

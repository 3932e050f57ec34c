//! Operator actions

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    error::AppError,
    manager::TierHealth,
    tiers::Tier,
    AppState,
};

/// Header carrying the admin key
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset: bool,
    pub tiers: BTreeMap<Tier, TierHealth>,
}

/// Require `x-admin-key` when an admin key is configured
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.admin_api_key {
        let provided = request
            .headers()
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if !provided.is_some_and(|key| keys_match(key, expected)) {
            warn!(path = %request.uri().path(), "Rejected admin request");
            return AppError::Authentication("missing or invalid admin key".to_string())
                .into_response();
        }
    }
    next.run(request).await
}

/// Compare fixed-length digests so timing does not depend on where the keys differ
fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Force every circuit breaker back to CLOSED
pub async fn reset_circuit_breakers(State(state): State<Arc<AppState>>) -> Json<ResetResponse> {
    state.manager.reset_circuit_breakers();
    info!("Circuit breakers reset by operator");
    Json(ResetResponse {
        reset: true,
        tiers: state.manager.get_tier_health(),
    })
}

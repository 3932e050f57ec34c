//! Operator endpoint tests
//!
//! Health, metrics and admin routes served by the real router over a
//! manager wired to the mock CRM server.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use crm_router::{routes::admin::ADMIN_KEY_HEADER, OperationKind, RoutingContext, Tier};

use crate::common::{constants, open_breaker, operator_server, test_state};
use crate::mocks::{CrmTestData, MockCrmServer};

fn admin_key(value: &'static str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(ADMIN_KEY_HEADER),
        HeaderValue::from_static(value),
    )
}

#[tokio::test]
async fn test_liveness_always_healthy() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[]).await;
    open_breaker(&state, Tier::Mcp);
    open_breaker(&state, Tier::Sdk);
    open_breaker(&state, Tier::Rest);
    let app = operator_server(state);

    let response = app.get("/health/live").await;

    response.assert_status_ok();
    response.assert_json(&json!({ "status": "healthy" }));
}

#[tokio::test]
async fn test_readiness_with_in_memory_store() {
    let server = MockCrmServer::start().await;
    let app = operator_server(test_state(&server, &[]).await);

    let response = app.get("/health/ready").await;

    response.assert_status_ok();
    response.assert_json(&json!({ "status": "healthy" }));
}

#[tokio::test]
async fn test_readiness_fails_when_every_breaker_is_open() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[]).await;
    for tier in Tier::ALL {
        open_breaker(&state, tier);
    }
    let app = operator_server(state);

    let response = app.get("/health/ready").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_full_health_reports_degraded_tier() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[]).await;
    open_breaker(&state, Tier::Mcp);
    let app = operator_server(state);

    let response = app.get("/health").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["token_store"]["status"], "healthy");
    assert_eq!(json["tiers"]["MCP"]["breakerState"], "OPEN");
    assert_eq!(json["tiers"]["SDK"]["breakerState"], "CLOSED");
    assert!(json.get("version").is_some());
    assert!(json.get("uptime_seconds").is_some());
}

#[tokio::test]
async fn test_tier_health_lists_every_tier() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[("CRM_REST_ENABLED", "false")]).await;
    open_breaker(&state, Tier::Sdk);
    let app = operator_server(state);

    let response = app.get("/health/tiers").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["MCP"]["enabled"], true);
    assert_eq!(json["MCP"]["priority"], 1);
    assert_eq!(json["MCP"]["breakerState"], "CLOSED");
    assert_eq!(json["SDK"]["breakerState"], "OPEN");
    assert_eq!(json["SDK"]["timesOpened"], 1);
    assert_eq!(json["REST"]["enabled"], false);
}

#[tokio::test]
async fn test_backend_probes_report_each_tier() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_tools_list().await;
    server.mock_v2_current_user().await;
    server.mock_v2_org().await;
    let app = operator_server(test_state(&server, &[]).await);

    let response = app.get("/health/backends").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    let backends = json["backends"].as_array().expect("backends array");
    assert_eq!(backends.len(), 3);
    assert!(backends.iter().all(|b| b["healthy"] == true));
}

#[tokio::test]
async fn test_backend_probes_degraded_when_one_tier_fails() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_status(503).await;
    server.mock_v2_current_user().await;
    server.mock_v2_org().await;
    let state = test_state(&server, &[]).await;
    let app = operator_server(state.clone());

    let response = app.get("/health/backends").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["status"], "degraded");
    let mcp = json["backends"]
        .as_array()
        .and_then(|b| b.iter().find(|b| b["tier"] == "MCP"))
        .expect("MCP probe present");
    assert_eq!(mcp["healthy"], false);

    // Probes bypass the breakers
    let health = state.manager.get_tier_health();
    assert_eq!(health[&Tier::Mcp].failure_count, 0);
}

#[tokio::test]
async fn test_tier_metrics_after_a_call() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;
    state
        .manager
        .get_account(
            "42",
            RoutingContext::new(OperationKind::Read).with_preferred_tier(Tier::Rest),
        )
        .await
        .expect("REST read should succeed");
    let app = operator_server(state);

    let response = app.get("/metrics/tiers").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["REST"]["totalRequests"], 1);
    assert_eq!(json["REST"]["successRate"], 100.0);
    assert_eq!(json["MCP"]["totalRequests"], 0);
    assert_eq!(json["MCP"]["successRate"], 0.0);
}

#[tokio::test]
async fn test_prometheus_text_includes_window_aggregates() {
    let server = MockCrmServer::start().await;
    let app = operator_server(test_state(&server, &[]).await);

    let response = app.get("/metrics").await;

    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains("crm_tier_window_requests{tier=\"MCP\"} 0"));
    assert!(text.contains("crm_tier_latency_ms{tier=\"REST\",quantile=\"0.99\"}"));
}

#[tokio::test]
async fn test_admin_reset_requires_key() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[("ADMIN_API_KEY", constants::TEST_ADMIN_KEY)]).await;
    open_breaker(&state, Tier::Mcp);
    let app = operator_server(state.clone());

    let response = app.post("/admin/circuit-breakers/reset").await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let (name, value) = admin_key("wrong-key");
    let response = app
        .post("/admin/circuit-breakers/reset")
        .add_header(name, value)
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    // Rejected requests leave the breaker alone
    assert_eq!(
        state.manager.get_tier_health()[&Tier::Mcp].breaker_state,
        crm_router::tiers::CircuitState::Open
    );

    let (name, value) = admin_key(constants::TEST_ADMIN_KEY);
    let response = app
        .post("/admin/circuit-breakers/reset")
        .add_header(name, value)
        .await;
    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["reset"], true);
    assert_eq!(json["tiers"]["MCP"]["breakerState"], "CLOSED");
    assert_eq!(json["tiers"]["MCP"]["timesOpened"], 0);
}

#[tokio::test]
async fn test_admin_reset_open_without_configured_key() {
    let server = MockCrmServer::start().await;
    let state = test_state(&server, &[]).await;
    open_breaker(&state, Tier::Sdk);
    let app = operator_server(state);

    let response = app.post("/admin/circuit-breakers/reset").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["tiers"]["SDK"]["breakerState"], "CLOSED");
}

#[tokio::test]
async fn test_admin_reset_rejects_get() {
    let server = MockCrmServer::start().await;
    let app = operator_server(test_state(&server, &[]).await);

    let response = app.get("/admin/circuit-breakers/reset").await;

    response.assert_status(StatusCode::METHOD_NOT_ALLOWED);
}

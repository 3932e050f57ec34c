//! Failover and circuit breaker tests
//!
//! The agent-context hint makes MCP the primary tier, so every cascade here
//! starts at MCP and falls back to SDK then REST.

use pretty_assertions::assert_eq;
use serde_json::json;

use crm_router::{tiers::CircuitState, AppError, OperationKind, RoutingContext, Tier};

use crate::common::{open_breaker, test_state};
use crate::mocks::{CrmTestData, MockCrmServer, MCP_PATH};

fn agent_read() -> RoutingContext {
    RoutingContext::new(OperationKind::Read).from_agent()
}

#[tokio::test]
async fn test_open_mcp_breaker_fails_over_to_sdk_with_identical_result() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;
    open_breaker(&state, Tier::Mcp);

    let via_failover = state
        .manager
        .get_account("42", agent_read())
        .await
        .expect("failover to SDK should succeed");
    let direct = state
        .manager
        .get_account(
            "42",
            RoutingContext::new(OperationKind::Read).with_preferred_tier(Tier::Sdk),
        )
        .await
        .expect("direct SDK read should succeed");

    assert_eq!(via_failover, direct);
    assert!(server.requests_to(MCP_PATH).await.is_empty());

    let health = state.manager.get_tier_health();
    assert_eq!(health[&Tier::Mcp].breaker_state, CircuitState::Open);
    assert_eq!(health[&Tier::Sdk].breaker_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_failover_disabled_returns_circuit_open() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[("CRM_ENABLE_FAILOVER", "false")]).await;
    open_breaker(&state, Tier::Mcp);

    let err = state
        .manager
        .get_account("42", agent_read())
        .await
        .unwrap_err();

    assert!(
        matches!(err, AppError::CircuitOpen { tier: Tier::Mcp }),
        "got {err:?}"
    );
    assert!(server.received_requests().await.is_empty());
}

#[tokio::test]
async fn test_mcp_server_errors_retry_then_fail_over() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_status(500).await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;

    let account = state
        .manager
        .get_account("42", agent_read())
        .await
        .expect("SDK should serve the read");
    assert_eq!(account.id, "42");

    // One call plus three retries on MCP, then a single SDK call
    assert_eq!(server.requests_to(MCP_PATH).await.len(), 4);
    assert_eq!(server.requests_to("/crm/v2/Accounts/42").await.len(), 1);

    let metrics = state.manager.get_tier_metrics();
    assert_eq!(metrics[&Tier::Mcp].failure_count, 4);
    assert_eq!(metrics[&Tier::Sdk].success_count, 1);
}

#[tokio::test]
async fn test_mcp_authentication_error_fails_over() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_rpc_error(-32001, "unauthorized").await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;

    let account = state
        .manager
        .get_account("42", agent_read())
        .await
        .expect("SDK should serve the read");

    assert_eq!(account.id, "42");
    // Authentication errors are not retried in-tier
    assert_eq!(server.requests_to(MCP_PATH).await.len(), 1);
}

#[tokio::test]
async fn test_rate_limited_call_honors_retry_after_and_stays_on_tier() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_rate_limited(0, 1).await;
    server
        .mock_mcp_tool("get_record", json!({ "data": [CrmTestData::account("42", "Acme")] }))
        .await;
    let state = test_state(&server, &[]).await;

    let account = state
        .manager
        .get_account("42", agent_read())
        .await
        .expect("MCP should succeed after the rate limit clears");

    assert_eq!(account.id, "42");
    assert_eq!(server.requests_to(MCP_PATH).await.len(), 2);
    assert!(server.requests_to("/crm/v2/Accounts/42").await.is_empty());
}

#[tokio::test]
async fn test_every_tier_failing_reports_each_failure() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_status(503).await;
    server
        .mock_v2_status(
            "Accounts",
            "42",
            503,
            json!({ "code": "INTERNAL_ERROR", "message": "unavailable" }),
        )
        .await;
    let state = test_state(&server, &[]).await;

    let err = state
        .manager
        .get_account("42", agent_read())
        .await
        .unwrap_err();

    let AppError::FailoverExhausted { failures } = &err else {
        panic!("expected FailoverExhausted, got {err:?}");
    };
    let tiers: Vec<Tier> = failures.iter().map(|f| f.tier).collect();
    assert_eq!(tiers, vec![Tier::Mcp, Tier::Sdk, Tier::Rest]);
    assert!(failures.iter().all(|f| f.category == "server_error"));

    // MCP 1+3, SDK 1+2, REST 1+1
    assert_eq!(server.requests_to(MCP_PATH).await.len(), 4);
    assert_eq!(server.requests_to("/crm/v2/Accounts/42").await.len(), 5);
}

#[tokio::test]
async fn test_failover_deadline_stops_the_cascade() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_status(503).await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;

    // Already past: nothing may be attempted
    let ctx = agent_read().with_deadline(std::time::Instant::now());
    let err = state.manager.get_account("42", ctx).await.unwrap_err();

    let AppError::FailoverExhausted { failures } = &err else {
        panic!("expected FailoverExhausted, got {err:?}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].category, "deadline_exceeded");
    assert!(server.received_requests().await.is_empty());
}

//! Tier backend tests
//!
//! Each test pins a call to one tier with a preferred-tier hint and checks
//! the traffic that reaches the mock CRM server.

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

use crm_router::{
    backends::{ListQuery, Record},
    AppError, OperationKind, RoutingContext, Tier,
};

use crate::common::{constants, test_state};
use crate::mocks::{CrmTestData, MockCrmServer, MCP_PATH};

fn pinned(operation: OperationKind, tier: Tier) -> RoutingContext {
    RoutingContext::new(operation).with_preferred_tier(tier)
}

fn record(id: &str, rating: &str) -> Record {
    let mut fields = Map::new();
    fields.insert("Rating".to_string(), Value::String(rating.to_string()));
    Record::new(id, fields)
}

#[tokio::test]
async fn test_rest_get_record_sends_zoho_oauth_header() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_get_record("Accounts", "42", CrmTestData::account("42", "Acme"))
        .await;
    let state = test_state(&server, &[]).await;

    let account = state
        .manager
        .get_account("42", pinned(OperationKind::Read, Tier::Rest))
        .await
        .expect("REST read should succeed");

    assert_eq!(account.id, "42");
    assert_eq!(account.fields.get("Account_Name"), Some(&json!("Acme")));

    let requests = server.requests_to("/crm/v2/Accounts/42").await;
    assert_eq!(requests.len(), 1);
    let auth = requests[0]
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    assert_eq!(
        auth,
        Some(format!("Zoho-oauthtoken {}", constants::TEST_ACCESS_TOKEN).as_str())
    );
}

#[tokio::test]
async fn test_mcp_get_record_calls_tool_with_bearer_token() {
    let server = MockCrmServer::start().await;
    server
        .mock_mcp_tool("get_record", json!({ "data": [CrmTestData::account("42", "Acme")] }))
        .await;
    let state = test_state(&server, &[]).await;

    let account = state
        .manager
        .get_account("42", RoutingContext::new(OperationKind::Read).from_agent())
        .await
        .expect("MCP read should succeed");
    assert_eq!(account.id, "42");

    let requests = server.requests_to(MCP_PATH).await;
    assert_eq!(requests.len(), 1);
    let auth = requests[0]
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    assert_eq!(
        auth,
        Some(format!("Bearer {}", constants::TEST_ACCESS_TOKEN).as_str())
    );

    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["method"], "tools/call");
    assert_eq!(body["params"]["name"], "get_record");
    assert_eq!(body["params"]["arguments"]["module"], "Accounts");
    assert_eq!(body["params"]["arguments"]["record_id"], "42");
}

#[tokio::test]
async fn test_mcp_update_record_returns_written_record() {
    let server = MockCrmServer::start().await;
    server
        .mock_mcp_tool(
            "update_record",
            json!({ "data": [CrmTestData::write_success("42")] }),
        )
        .await;
    let state = test_state(&server, &[]).await;

    let mut fields = Map::new();
    fields.insert("Rating".to_string(), json!("Hot"));
    let updated = state
        .manager
        .update_account("42", &fields, pinned(OperationKind::Write, Tier::Mcp))
        .await
        .expect("MCP update should succeed");

    assert_eq!(updated.id, "42");
}

#[tokio::test]
async fn test_mcp_not_found_rpc_error_is_not_found() {
    let server = MockCrmServer::start().await;
    server.mock_mcp_rpc_error(-32002, "record not found").await;
    let state = test_state(&server, &[]).await;

    let err = state
        .manager
        .get_account("404", pinned(OperationKind::Read, Tier::Mcp))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    // Not-found never fails over; only the MCP endpoint saw traffic
    assert!(server.requests_to("/crm/v2/Accounts/404").await.is_empty());
}

#[tokio::test]
async fn test_sdk_get_many_pages_until_limit() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_list_page("Accounts", 1, CrmTestData::accounts(1, 200), true)
        .await;
    server
        .mock_v2_list_page("Accounts", 2, CrmTestData::accounts(201, 100), false)
        .await;
    let state = test_state(&server, &[]).await;

    let accounts = state
        .manager
        .get_accounts(
            &ListQuery::default(),
            250,
            pinned(OperationKind::BulkRead, Tier::Sdk),
        )
        .await
        .expect("SDK listing should succeed");

    assert_eq!(accounts.len(), 250);
    assert_eq!(accounts[0].id, "1");
    assert_eq!(accounts[249].id, "250");
    assert_eq!(server.requests_to("/crm/v2/Accounts").await.len(), 2);
}

#[tokio::test]
async fn test_rest_get_many_makes_a_single_call() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_list_page("Accounts", 1, CrmTestData::accounts(1, 200), true)
        .await;
    let state = test_state(&server, &[]).await;

    let accounts = state
        .manager
        .get_accounts(&ListQuery::default(), 250, pinned(OperationKind::Read, Tier::Rest))
        .await
        .expect("REST listing should succeed");

    assert_eq!(accounts.len(), 200);
    let requests = server.requests_to("/crm/v2/Accounts").await;
    assert_eq!(requests.len(), 1);
    let per_page = requests[0]
        .url
        .query_pairs()
        .find(|(k, _)| k == "per_page")
        .map(|(_, v)| v.into_owned());
    assert_eq!(per_page.as_deref(), Some("200"));
}

#[tokio::test]
async fn test_sdk_bulk_update_splits_into_batches() {
    let server = MockCrmServer::start().await;
    server.mock_v2_bulk_update("Accounts", &["105"]).await;
    let state = test_state(&server, &[]).await;

    let records: Vec<Record> = (1..=150).map(|i| record(&i.to_string(), "Warm")).collect();
    let outcome = state
        .manager
        .bulk_update_accounts(&records, RoutingContext::new(OperationKind::BulkWrite))
        .await
        .expect("SDK bulk update should succeed");

    assert_eq!(outcome.total(), 150);
    assert_eq!(outcome.succeeded.len(), 149);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].id, "105");
    assert_eq!(outcome.failed[0].code, "INVALID_DATA");

    let requests = server.requests_to("/crm/v2/Accounts").await;
    let mut batch_sizes: Vec<usize> = requests
        .iter()
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            body["data"].as_array().map(Vec::len).unwrap_or_default()
        })
        .collect();
    batch_sizes.sort_unstable();
    assert_eq!(batch_sizes, vec![50, 100]);

    let metrics = state.manager.get_tier_metrics();
    assert_eq!(metrics[&Tier::Sdk].total_requests, 1);
}

#[tokio::test]
async fn test_bulk_read_chunks_ids_into_list_calls() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_list_page("Accounts", 1, CrmTestData::accounts(1, 100), false)
        .await;
    let state = test_state(&server, &[]).await;

    let ids: Vec<String> = (1..=150).map(|i| i.to_string()).collect();
    let accounts = state
        .manager
        .bulk_read_accounts(&ids, RoutingContext::new(OperationKind::Read))
        .await
        .expect("bulk read should succeed");

    let requests = server.requests_to("/crm/v2/Accounts").await;
    assert_eq!(requests.len(), 2);
    let id_counts: Vec<usize> = requests
        .iter()
        .map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "ids")
                .map(|(_, v)| v.split(',').count())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(id_counts, vec![100, 50]);
    // The mock answers both chunks with the same 100 records
    assert_eq!(accounts.len(), 150);
}

#[tokio::test]
async fn test_rest_search_with_no_content_is_empty() {
    let server = MockCrmServer::start().await;
    server.mock_v2_search("Accounts", 204, vec![]).await;
    let state = test_state(&server, &[]).await;

    let results = state
        .manager
        .search_accounts(
            "(Account_Name:equals:Nobody)",
            10,
            pinned(OperationKind::Search, Tier::Rest),
        )
        .await
        .expect("empty search should succeed");

    assert!(results.is_empty());
    let requests = server.requests_to("/crm/v2/Accounts/search").await;
    assert_eq!(requests.len(), 1);
    let criteria = requests[0]
        .url
        .query_pairs()
        .find(|(k, _)| k == "criteria")
        .map(|(_, v)| v.into_owned());
    assert_eq!(criteria.as_deref(), Some("(Account_Name:equals:Nobody)"));
}

#[tokio::test]
async fn test_rest_not_found_does_not_fail_over() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_status(
            "Accounts",
            "404",
            404,
            json!({ "code": "INVALID_URL_PATTERN", "message": "not found" }),
        )
        .await;
    let state = test_state(&server, &[]).await;

    let err = state
        .manager
        .get_account("404", pinned(OperationKind::Read, Tier::Rest))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    assert_eq!(server.requests_to("/crm/v2/Accounts/404").await.len(), 1);
    assert!(server.requests_to(MCP_PATH).await.is_empty());

    // A missing record says nothing about tier health
    let metrics = state.manager.get_tier_metrics();
    assert_eq!(metrics[&Tier::Rest].failure_count, 0);
}

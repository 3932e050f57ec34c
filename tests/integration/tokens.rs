//! OAuth token lifecycle tests
//!
//! Token refresh goes through the mock accounts server; the REST tier is
//! pinned so every call carries a `Zoho-oauthtoken` header.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;

use crm_router::{tokens::OAUTH_TOKEN_TYPE, AppError, OperationKind, RoutingContext, Tier};

use crate::common::{build_state, constants, seeded_token_store, test_config};
use crate::mocks::{CrmTestData, MockCrmServer, TOKEN_PATH};

const STALE: &str = "stale-token";
const FRESH: &str = "fresh-token";

fn rest_read() -> RoutingContext {
    RoutingContext::new(OperationKind::Read).with_preferred_tier(Tier::Rest)
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_and_request_replayed() {
    let server = MockCrmServer::start().await;
    server.mock_reject_token(STALE).await;
    server
        .mock_v2_get_record_with_token("Accounts", "42", FRESH, CrmTestData::account("42", "Acme"))
        .await;
    server.mock_token_refresh_success(FRESH, 3600).await;

    let store = seeded_token_store(STALE, Duration::from_secs(3600)).await;
    let state = build_state(test_config(&server, &[]), store.clone());

    let account = state
        .manager
        .get_account("42", rest_read())
        .await
        .expect("replay with the refreshed token should succeed");
    assert_eq!(account.id, "42");

    let refreshes = server.requests_to(TOKEN_PATH).await;
    assert_eq!(refreshes.len(), 1);
    let grant: Vec<(String, String)> = refreshes[0]
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert!(grant.contains(&(
        "refresh_token".to_string(),
        constants::TEST_REFRESH_TOKEN.to_string()
    )));
    assert!(grant.contains(&("client_id".to_string(), constants::TEST_CLIENT_ID.to_string())));

    let record = store.get(OAUTH_TOKEN_TYPE).await.unwrap().unwrap();
    assert_eq!(record.access_token, FRESH);
    // Refresh responses omit the refresh token; the stored one survives
    assert_eq!(record.refresh_token.as_deref(), Some(constants::TEST_REFRESH_TOKEN));
}

#[tokio::test]
async fn test_concurrent_rejections_share_one_refresh() {
    let server = MockCrmServer::start().await;
    server.mock_reject_token(STALE).await;
    server
        .mock_v2_get_record_with_token("Accounts", "42", FRESH, CrmTestData::account("42", "Acme"))
        .await;
    server.mock_token_refresh_success(FRESH, 3600).await;

    let store = seeded_token_store(STALE, Duration::from_secs(3600)).await;
    let state = build_state(test_config(&server, &[]), store);

    let calls = (0..10).map(|_| {
        let state = Arc::clone(&state);
        async move { state.manager.get_account("42", rest_read()).await }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(server.requests_to(TOKEN_PATH).await.len(), 1);
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_before_the_call() {
    let server = MockCrmServer::start().await;
    server
        .mock_v2_get_record_with_token("Accounts", "42", FRESH, CrmTestData::account("42", "Acme"))
        .await;
    server.mock_token_refresh_success(FRESH, 3600).await;

    // Inside the five minute safety margin
    let store = seeded_token_store(STALE, Duration::from_secs(60)).await;
    let state = build_state(test_config(&server, &[]), store.clone());

    state
        .manager
        .get_account("42", rest_read())
        .await
        .expect("call with the proactively refreshed token should succeed");

    // The stale token never reached the records API
    let record_requests = server.requests_to("/crm/v2/Accounts/42").await;
    assert_eq!(record_requests.len(), 1);
    assert!(!store.is_expired(OAUTH_TOKEN_TYPE).await.unwrap());
}

#[tokio::test]
async fn test_failed_refresh_is_an_authentication_error() {
    let server = MockCrmServer::start().await;
    server.mock_token_refresh_error("invalid_code").await;

    let store = seeded_token_store(STALE, Duration::ZERO).await;
    let config = test_config(&server, &[("CRM_ENABLE_FAILOVER", "false")]);
    let state = build_state(config, store);

    let err = state
        .manager
        .get_account("42", rest_read())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Authentication(_)), "got {err:?}");
    assert!(server.requests_to("/crm/v2/Accounts/42").await.is_empty());
}

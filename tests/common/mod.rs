//! Common test utilities for the CRM router
//!
//! Builds a fully wired [`AppState`] (token store, OAuth refresher, tier
//! backends and integration manager) pointed at a [`MockCrmServer`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;

use crm_router::{
    backends::build_backends,
    routes,
    tiers::Tier,
    tokens::{TokenProvider, TokenStore, ZohoOAuthRefresher, OAUTH_TOKEN_TYPE},
    AppState, Config, IntegrationManager,
};

use crate::mocks::MockCrmServer;

/// Test configuration constants
pub mod constants {
    pub const TEST_CLIENT_ID: &str = "test-client-id";
    pub const TEST_CLIENT_SECRET: &str = "test-client-secret";
    pub const TEST_ACCESS_TOKEN: &str = "test-access-token";
    pub const TEST_REFRESH_TOKEN: &str = "test-refresh-token";
    pub const TEST_ADMIN_KEY: &str = "test-admin-key";
}

/// Load a [`Config`] pointed at the mock server, plus `overrides`
pub fn test_config(server: &MockCrmServer, overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("TOKEN_STORE_BACKEND", "memory".to_string()),
        ("ZOHO_CLIENT_ID", constants::TEST_CLIENT_ID.to_string()),
        ("ZOHO_CLIENT_SECRET", constants::TEST_CLIENT_SECRET.to_string()),
        ("ZOHO_MCP_URL", server.mcp_url()),
        ("ZOHO_API_DOMAIN", server.uri()),
        ("ZOHO_ACCOUNTS_URL", server.uri()),
        ("CRM_MCP_TIMEOUT_SECONDS", "5".to_string()),
        ("CRM_SDK_TIMEOUT_SECONDS", "5".to_string()),
        ("CRM_REST_TIMEOUT_SECONDS", "5".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let mut config =
        Config::from_lookup(|key| vars.get(key).cloned()).expect("test config should load");
    // Keep in-tier retries fast
    config.tiers.routing.retry_base_delay = Duration::from_millis(5);
    config
}

/// In-memory token store holding a valid access token
pub async fn seeded_token_store(access_token: &str, lifetime: Duration) -> Arc<TokenStore> {
    let store = Arc::new(TokenStore::in_memory());
    tokio_test::assert_ok!(
        store
            .save(
                access_token,
                Some(constants::TEST_REFRESH_TOKEN),
                lifetime,
                OAUTH_TOKEN_TYPE,
            )
            .await
    );
    store
}

/// Fully wired application state around the given config and token store
pub fn build_state(config: Config, token_store: Arc<TokenStore>) -> Arc<AppState> {
    let client = reqwest::Client::new();
    let refresher = Arc::new(ZohoOAuthRefresher::new(client.clone(), &config));
    let tokens = Arc::new(TokenProvider::new(
        token_store.clone(),
        refresher,
        OAUTH_TOKEN_TYPE,
    ));

    let backends = build_backends(&config, &config.tiers, client, tokens);
    let manager = Arc::new(
        IntegrationManager::new(config.tiers.clone(), backends).expect("manager should build"),
    );

    Arc::new(AppState::new_for_testing(config, manager, token_store))
}

/// Application state with a valid token that needs no refresh
pub async fn test_state(server: &MockCrmServer, overrides: &[(&str, &str)]) -> Arc<AppState> {
    let config = test_config(server, overrides);
    let store = seeded_token_store(constants::TEST_ACCESS_TOKEN, Duration::from_secs(3600)).await;
    build_state(config, store)
}

/// Operator router wrapped in an axum-test server
pub fn operator_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(routes::create_router(state)).expect("Failed to create test server")
}

/// Trip a tier's breaker by recording failures up to its threshold
pub fn open_breaker(state: &AppState, tier: Tier) {
    let breaker = state
        .manager
        .breaker(tier)
        .expect("every tier has a breaker");
    for _ in 0..breaker.config().failure_threshold {
        breaker.record_failure();
    }
}

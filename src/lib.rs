//! CRM router - three-tier CRM integration manager
//!
//! Dispatches CRM operations across an agent-tool channel, a bulk SDK
//! channel and a REST fallback. Each tier sits behind its own circuit
//! breaker, OAuth tokens are persisted with expiry-aware refresh, and
//! per-tier latency and error metrics are kept for health reporting.

pub mod backends;
pub mod config;
pub mod error;
pub mod manager;
pub mod routes;
pub mod storage;
pub mod tiers;
pub mod tokens;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

pub use crate::config::{Config, TokenStoreKind};
pub use crate::error::{AppError, AppResult};
pub use crate::manager::IntegrationManager;
pub use crate::tiers::{OperationKind, RoutingContext, Tier};

use crate::{
    backends::build_backends,
    storage::{InMemoryTokenStorage, RedisTokenStorage},
    tokens::{TokenProvider, TokenStore, TokenStoreBackend, ZohoOAuthRefresher, OAUTH_TOKEN_TYPE},
};

/// Application state shared across all request handlers
pub struct AppState {
    pub config: Config,
    pub manager: Arc<IntegrationManager>,
    pub token_store: Arc<TokenStore>,
    pub start_time: Instant,
}

impl AppState {
    /// Create a new application state
    pub async fn new(config: Config) -> Result<Self> {
        let backend = match config.token_store {
            TokenStoreKind::Redis => {
                let redis_client = redis::Client::open(config.redis_url.as_str())
                    .context("Invalid REDIS_URL")?;
                let redis = redis::aio::ConnectionManager::new(redis_client)
                    .await
                    .context("Failed to connect to Redis")?;
                TokenStoreBackend::Redis(Arc::new(RedisTokenStorage::new(redis)))
            }
            TokenStoreKind::Memory => {
                TokenStoreBackend::InMemory(Arc::new(InMemoryTokenStorage::new()))
            }
        };
        let token_store = Arc::new(TokenStore::new(backend, config.token_safety_margin));
        info!(backend = token_store.backend_name(), "Token store initialized");

        // Per-tier timeouts are enforced by the manager
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let refresher = Arc::new(ZohoOAuthRefresher::new(http_client.clone(), &config));
        let tokens = Arc::new(TokenProvider::new(
            token_store.clone(),
            refresher,
            OAUTH_TOKEN_TYPE,
        ));

        if let Some(refresh_token) = &config.zoho_refresh_token {
            tokens
                .seed(refresh_token)
                .await
                .context("Failed to seed token store")?;
        }

        let backends = build_backends(&config, &config.tiers, http_client, tokens);
        let manager = Arc::new(
            IntegrationManager::new(config.tiers.clone(), backends)
                .context("Failed to build integration manager")?,
        );

        Ok(Self {
            config,
            manager,
            token_store,
            start_time: Instant::now(),
        })
    }

    /// Create an application state around a prebuilt manager and store
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(
        config: Config,
        manager: Arc<IntegrationManager>,
        token_store: Arc<TokenStore>,
    ) -> Self {
        Self {
            config,
            manager,
            token_store,
            start_time: Instant::now(),
        }
    }
}

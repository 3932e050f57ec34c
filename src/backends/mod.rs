//! CRM backend clients
//!
//! One client per tier, all behind the [`CrmBackend`] contract. Clients
//! authenticate through the shared [`TokenProvider`] and reclassify every
//! transport failure into [`crate::error::AppError`].

pub mod http;
pub mod mcp;
pub mod models;
pub mod rest;
pub mod sdk;
pub mod zoho;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::Config,
    error::AppResult,
    tiers::{Tier, TierSettings},
    tokens::TokenProvider,
};

pub use self::http::{AuthScheme, CrmHttp};
pub use self::mcp::McpBackend;
pub use self::models::{
    BackendHealth, BulkUpdateOutcome, Fields, ListQuery, Record, RecordFailure, SortOrder,
};
pub use self::rest::RestBackend;
pub use self::sdk::SdkBackend;

/// Operation contract every tier implements
#[async_trait]
pub trait CrmBackend: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get_one(&self, module: &str, id: &str) -> AppResult<Record>;

    async fn get_many(
        &self,
        module: &str,
        query: &ListQuery,
        limit: usize,
    ) -> AppResult<Vec<Record>>;

    async fn update(&self, module: &str, id: &str, fields: &Fields) -> AppResult<Record>;

    async fn bulk_update(&self, module: &str, records: &[Record]) -> AppResult<BulkUpdateOutcome>;

    async fn search(&self, module: &str, criteria: &str, limit: usize) -> AppResult<Vec<Record>>;

    async fn health_check(&self) -> AppResult<()>;
}

/// Backends keyed by the tier they serve
pub type BackendMap = HashMap<Tier, Arc<dyn CrmBackend>>;

/// Build a client for every enabled tier
pub fn build_backends(
    config: &Config,
    settings: &TierSettings,
    client: reqwest::Client,
    tokens: Arc<TokenProvider>,
) -> BackendMap {
    let mut backends = BackendMap::new();

    for tier_config in settings.tiers.iter().filter(|t| t.enabled) {
        let tier = tier_config.tier;
        let scheme = match tier {
            Tier::Mcp => AuthScheme::Bearer,
            Tier::Sdk | Tier::Rest => AuthScheme::ZohoOAuth,
        };
        let http = CrmHttp::new(client.clone(), tokens.clone(), tier, scheme)
            .with_rate_limit(tier_config.rate_limit_per_second);

        let backend: Arc<dyn CrmBackend> = match tier {
            Tier::Mcp => Arc::new(McpBackend::new(http, &config.zoho_mcp_url)),
            Tier::Sdk => Arc::new(SdkBackend::new(http, &config.zoho_api_domain)),
            Tier::Rest => Arc::new(RestBackend::new(http, &config.zoho_api_domain)),
        };
        backends.insert(tier, backend);
    }

    backends
}

//! Configuration management for the CRM router
//!
//! Configuration is loaded from environment variables (and `.env` via
//! `dotenvy` in the binary). Tier settings are validated before the
//! integration manager is built, so a bad deployment fails at startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::tiers::{CircuitBreakerConfig, Tier, TierConfig, TierSettings};

/// Where OAuth tokens are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStoreKind {
    Redis,
    Memory,
}

impl FromStr for TokenStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            other => bail!("unknown token store backend '{}'", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind the operator server to
    pub host: String,
    /// Port to listen on
    pub port: u16,

    /// Redis connection URL
    pub redis_url: String,
    pub token_store: TokenStoreKind,
    /// Tokens expiring within this margin are refreshed proactively
    pub token_safety_margin: Duration,

    /// Tier 1 JSON-RPC endpoint
    pub zoho_mcp_url: String,
    /// Base URL of the v2 API used by tiers 2 and 3
    pub zoho_api_domain: String,
    /// Accounts server for token refresh
    pub zoho_accounts_url: String,
    pub zoho_client_id: String,
    pub zoho_client_secret: String,
    /// Seeds the token store when no record exists yet
    pub zoho_refresh_token: Option<String>,

    /// Required as `x-admin-key` on admin routes when set
    pub admin_api_key: Option<String>,

    pub tiers: TierSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            host: get("ROUTER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "ROUTER_PORT", 8090)?,

            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            token_store: parse_or(&get, "TOKEN_STORE_BACKEND", TokenStoreKind::Redis)?,
            token_safety_margin: Duration::from_secs(parse_or(
                &get,
                "TOKEN_SAFETY_MARGIN_SECONDS",
                300,
            )?),

            zoho_mcp_url: get("ZOHO_MCP_URL").unwrap_or_default(),
            zoho_api_domain: get("ZOHO_API_DOMAIN")
                .unwrap_or_else(|| "https://www.zohoapis.com".to_string()),
            zoho_accounts_url: get("ZOHO_ACCOUNTS_URL")
                .unwrap_or_else(|| "https://accounts.zoho.com".to_string()),
            zoho_client_id: get("ZOHO_CLIENT_ID").context("ZOHO_CLIENT_ID must be set")?,
            zoho_client_secret: get("ZOHO_CLIENT_SECRET")
                .context("ZOHO_CLIENT_SECRET must be set")?,
            zoho_refresh_token: get("ZOHO_REFRESH_TOKEN"),

            admin_api_key: get("ADMIN_API_KEY"),

            tiers: tier_settings(&get)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers
            .validate()
            .context("Invalid CRM tier configuration")?;

        let mcp_enabled = self.tiers.tier(Tier::Mcp).is_some_and(|t| t.enabled);
        if mcp_enabled && self.zoho_mcp_url.is_empty() {
            bail!("ZOHO_MCP_URL must be set while the MCP tier is enabled");
        }
        Ok(())
    }
}

fn tier_settings<G>(get: &G) -> Result<TierSettings>
where
    G: Fn(&str) -> Option<String>,
{
    let defaults = CircuitBreakerConfig::default();
    let circuit_breaker = CircuitBreakerConfig {
        failure_threshold: parse_or(
            get,
            "CRM_CIRCUIT_FAILURE_THRESHOLD",
            defaults.failure_threshold,
        )?,
        success_threshold: parse_or(
            get,
            "CRM_CIRCUIT_SUCCESS_THRESHOLD",
            defaults.success_threshold,
        )?,
        open_duration: Duration::from_secs(parse_or(
            get,
            "CRM_CIRCUIT_OPEN_SECONDS",
            defaults.open_duration.as_secs(),
        )?),
    };

    let mut settings = TierSettings {
        circuit_breaker: circuit_breaker.clone(),
        metrics_window: parse_or(get, "CRM_METRICS_WINDOW", 1000)?,
        ..TierSettings::default()
    };

    settings.routing.bulk_threshold =
        parse_or(get, "CRM_BULK_THRESHOLD", settings.routing.bulk_threshold)?;
    settings.routing.enable_failover = parse_bool_or(get, "CRM_ENABLE_FAILOVER", true)?;
    settings.routing.max_total_duration = parse_opt::<u64, _>(get, "CRM_FAILOVER_DEADLINE_SECONDS")?
        .map(Duration::from_secs);

    settings.tiers = Tier::ALL
        .iter()
        .map(|tier| tier_config(get, *tier, &circuit_breaker))
        .collect::<Result<_>>()?;

    Ok(settings)
}

fn tier_config<G>(get: &G, tier: Tier, global: &CircuitBreakerConfig) -> Result<TierConfig>
where
    G: Fn(&str) -> Option<String>,
{
    let prefix = tier.env_prefix();
    let key = |suffix: &str| format!("{}_{}", prefix, suffix);
    let defaults = TierConfig::default_for(tier);

    let failure_override = parse_opt::<u32, _>(get, &key("CIRCUIT_FAILURE_THRESHOLD"))?;
    let open_override = parse_opt::<u64, _>(get, &key("CIRCUIT_OPEN_SECONDS"))?;
    let circuit_breaker = (failure_override.is_some() || open_override.is_some()).then(|| {
        CircuitBreakerConfig {
            failure_threshold: failure_override.unwrap_or(global.failure_threshold),
            success_threshold: global.success_threshold,
            open_duration: open_override
                .map(Duration::from_secs)
                .unwrap_or(global.open_duration),
        }
    });

    Ok(TierConfig {
        tier,
        enabled: parse_bool_or(get, &key("ENABLED"), defaults.enabled)?,
        timeout: Duration::from_secs(parse_or(
            get,
            &key("TIMEOUT_SECONDS"),
            defaults.timeout.as_secs(),
        )?),
        max_retries: parse_or(get, &key("MAX_RETRIES"), defaults.max_retries)?,
        priority: parse_or(get, &key("PRIORITY"), defaults.priority)?,
        rate_limit_per_second: parse_opt(get, &key("RATE_LIMIT_PER_SECOND"))?,
        circuit_breaker,
    })
}

fn parse_opt<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e))
        })
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => bail!("Invalid {}: expected a boolean, got '{}'", key, v),
    }
}

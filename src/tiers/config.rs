//! Tier configuration types
//!
//! Validated, immutable settings for each backend tier plus the routing and
//! circuit breaker knobs shared by the integration manager.

use std::time::Duration;

use serde::Serialize;

use crate::error::{AppError, AppResult};

use super::Tier;

/// Immutable settings for one backend tier
#[derive(Debug, Clone, Serialize)]
pub struct TierConfig {
    pub tier: Tier,
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_retries: u32,
    /// Lower values are tried first; ties fall back to tier order
    pub priority: u32,
    /// Client-side request rate cap, if any
    pub rate_limit_per_second: Option<u32>,
    /// Breaker settings overriding the global ones for this tier
    #[serde(skip)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl TierConfig {
    /// Defaults for a tier: MCP 30s/3 retries, SDK 60s/2, REST 30s/1
    pub fn default_for(tier: Tier) -> Self {
        let (timeout_secs, max_retries, priority) = match tier {
            Tier::Mcp => (30, 3, 1),
            Tier::Sdk => (60, 2, 2),
            Tier::Rest => (30, 1, 3),
        };
        Self {
            tier,
            enabled: true,
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            priority,
            rate_limit_per_second: None,
            circuit_breaker: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.timeout.is_zero() {
            return Err(AppError::Configuration(format!(
                "tier {} timeout must be greater than zero",
                self.tier
            )));
        }
        if self.rate_limit_per_second == Some(0) {
            return Err(AppError::Configuration(format!(
                "tier {} rate limit must be greater than zero",
                self.tier
            )));
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        Ok(())
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before closing
    pub success_threshold: u32,
    /// Time spent OPEN before trial calls are admitted
    #[serde(with = "duration_secs")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(AppError::Configuration(
                "circuit breaker thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Routing and failover settings
#[derive(Debug, Clone, Serialize)]
pub struct RoutingConfig {
    /// Record count at which a call is routed to the bulk tier
    pub bulk_threshold: usize,
    pub enable_failover: bool,
    /// Upper bound on a whole failover cascade, retries included
    #[serde(with = "opt_duration_secs")]
    pub max_total_duration: Option<Duration>,
    /// Longest wait honored from an upstream Retry-After hint
    #[serde(with = "duration_secs")]
    pub max_retry_after: Duration,
    /// Base delay for exponential backoff between in-tier retries
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bulk_threshold: 10,
            enable_failover: true,
            max_total_duration: None,
            max_retry_after: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

/// Full tier set handed to the integration manager
#[derive(Debug, Clone)]
pub struct TierSettings {
    pub tiers: Vec<TierConfig>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub routing: RoutingConfig,
    /// Size of each tier's request metrics window
    pub metrics_window: usize,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            tiers: Tier::ALL.iter().map(|t| TierConfig::default_for(*t)).collect(),
            circuit_breaker: CircuitBreakerConfig::default(),
            routing: RoutingConfig::default(),
            metrics_window: 1000,
        }
    }
}

impl TierSettings {
    /// Replace the settings of one tier
    pub fn with_tier(mut self, config: TierConfig) -> Self {
        self.tiers.retain(|t| t.tier != config.tier);
        self.tiers.push(config);
        self
    }

    pub fn tier(&self, tier: Tier) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Breaker settings for a tier, falling back to the global ones
    pub fn breaker_for(&self, tier: Tier) -> CircuitBreakerConfig {
        self.tier(tier)
            .and_then(|t| t.circuit_breaker.clone())
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.tiers.iter().any(|t| t.enabled) {
            return Err(AppError::Configuration(
                "at least one CRM tier must be enabled".to_string(),
            ));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if self.tiers[..i].iter().any(|t| t.tier == tier.tier) {
                return Err(AppError::Configuration(format!(
                    "tier {} configured more than once",
                    tier.tier
                )));
            }
            tier.validate()?;
        }
        self.circuit_breaker.validate()?;
        if self.routing.bulk_threshold == 0 {
            return Err(AppError::Configuration(
                "bulk threshold must be greater than zero".to_string(),
            ));
        }
        if self.metrics_window == 0 {
            return Err(AppError::Configuration(
                "metrics window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}

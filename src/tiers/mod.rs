//! Tier routing module
//!
//! Tier identities, per-tier configuration, routing hints, circuit breakers,
//! request metrics and the selection rules that pick a tier for a call.

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod router;
pub mod stats;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::{CircuitBreakerConfig, RoutingConfig, TierConfig, TierSettings};
pub use context::{OperationKind, RoutingContext};
pub use router::TierRouter;
pub use stats::{MetricsCollector, TierMetricsSnapshot};

/// One of the three backend transports for the same logical CRM operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    /// Tier 1: agent-tool channel, single records, lowest latency
    Mcp,
    /// Tier 2: bulk SDK channel
    Sdk,
    /// Tier 3: REST fallback
    Rest,
}

impl Tier {
    /// All tiers in their natural (tier number) order
    pub const ALL: [Tier; 3] = [Tier::Mcp, Tier::Sdk, Tier::Rest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Mcp => "MCP",
            Tier::Sdk => "SDK",
            Tier::Rest => "REST",
        }
    }

    /// Environment variable prefix for this tier's settings
    pub(crate) fn env_prefix(&self) -> &'static str {
        match self {
            Tier::Mcp => "CRM_MCP",
            Tier::Sdk => "CRM_SDK",
            Tier::Rest => "CRM_REST",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MCP" | "TIER1" => Ok(Tier::Mcp),
            "SDK" | "TIER2" => Ok(Tier::Sdk),
            "REST" | "TIER3" => Ok(Tier::Rest),
            other => Err(AppError::Configuration(format!("unknown tier '{}'", other))),
        }
    }
}

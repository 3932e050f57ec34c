//! Tier selection
//!
//! Picks the first tier for a call from its routing context and builds the
//! ordered attempt plan used for failover. Selection is pure: breaker state
//! is consulted by the integration manager while walking the plan.

use tracing::debug;

use super::{
    config::{RoutingConfig, TierConfig},
    context::RoutingContext,
    Tier,
};

/// Why a tier was selected, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Preferred,
    AgentContext,
    Bulk,
    Realtime,
    Priority,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SelectionReason::Preferred => "preferred",
            SelectionReason::AgentContext => "agent_context",
            SelectionReason::Bulk => "bulk",
            SelectionReason::Realtime => "realtime",
            SelectionReason::Priority => "priority",
        };
        f.write_str(s)
    }
}

/// Rule-based tier selector over the enabled tiers
#[derive(Debug, Clone)]
pub struct TierRouter {
    /// Enabled tiers sorted by ascending priority, ties by tier order
    enabled: Vec<Tier>,
    bulk_threshold: usize,
}

impl TierRouter {
    pub fn new(tiers: &[TierConfig], routing: &RoutingConfig) -> Self {
        let mut enabled: Vec<&TierConfig> = tiers.iter().filter(|t| t.enabled).collect();
        enabled.sort_by_key(|t| (t.priority, t.tier));

        Self {
            enabled: enabled.into_iter().map(|t| t.tier).collect(),
            bulk_threshold: routing.bulk_threshold,
        }
    }

    /// Enabled tiers in ascending priority
    pub fn enabled_tiers(&self) -> &[Tier] {
        &self.enabled
    }

    pub fn is_enabled(&self, tier: Tier) -> bool {
        self.enabled.contains(&tier)
    }

    /// Select the primary tier; the first matching rule wins:
    ///
    /// 1. enabled preferred tier
    /// 2. record count ≥ bulk threshold → SDK
    /// 3. agent context → MCP
    /// 4. bulk operation kind → SDK
    /// 5. realtime → MCP
    /// 6. first enabled tier by priority
    ///
    /// Rules 2–5 only apply when their tier is enabled. Returns `None` when no
    /// tier is enabled.
    pub fn select(&self, ctx: &RoutingContext) -> Option<(Tier, SelectionReason)> {
        let over_threshold = ctx.record_count() >= self.bulk_threshold;
        let sdk_enabled = self.is_enabled(Tier::Sdk);

        let preferred = ctx.preferred_tier().filter(|t| self.is_enabled(*t));

        let candidate = if let Some(preferred) = preferred {
            Some((preferred, SelectionReason::Preferred))
        } else if over_threshold && sdk_enabled {
            // The agent channel is single-record; volume overrides agent context
            Some((Tier::Sdk, SelectionReason::Bulk))
        } else if ctx.agent_context() && self.is_enabled(Tier::Mcp) {
            Some((Tier::Mcp, SelectionReason::AgentContext))
        } else if ctx.operation().is_bulk() && sdk_enabled {
            Some((Tier::Sdk, SelectionReason::Bulk))
        } else if ctx.requires_realtime() && self.is_enabled(Tier::Mcp) {
            Some((Tier::Mcp, SelectionReason::Realtime))
        } else {
            self.enabled
                .first()
                .map(|tier| (*tier, SelectionReason::Priority))
        };

        if let Some((tier, reason)) = candidate {
            debug!(
                tier = %tier,
                reason = %reason,
                operation = %ctx.operation(),
                record_count = ctx.record_count(),
                "Selected primary tier"
            );
        }
        candidate
    }

    /// Ordered attempt plan: the primary tier, then (with failover) every other
    /// enabled tier in ascending priority
    pub fn plan(&self, ctx: &RoutingContext, failover: bool) -> Vec<Tier> {
        let Some((primary, _)) = self.select(ctx) else {
            return vec![];
        };

        let mut plan = vec![primary];
        if failover {
            plan.extend(self.enabled.iter().copied().filter(|t| *t != primary));
        }
        plan
    }
}

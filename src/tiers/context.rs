//! Routing hints supplied by callers
//!
//! A [`RoutingContext`] is advisory: it influences which tier is tried first
//! but never which tiers exist. It is immutable once built.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppResult;

use super::Tier;

/// Kind of CRM operation being routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    BulkRead,
    BulkWrite,
    Search,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::BulkRead => "bulk_read",
            OperationKind::BulkWrite => "bulk_write",
            OperationKind::Search => "search",
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.as_str().starts_with("bulk_")
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call routing hints
#[derive(Debug, Clone)]
pub struct RoutingContext {
    operation: OperationKind,
    record_count: usize,
    preferred_tier: Option<Tier>,
    requires_realtime: bool,
    agent_context: bool,
    deadline: Option<Instant>,
}

impl RoutingContext {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            record_count: 1,
            preferred_tier: None,
            requires_realtime: false,
            agent_context: false,
            deadline: None,
        }
    }

    /// Same hints for a different operation kind
    pub fn with_operation(mut self, operation: OperationKind) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_record_count(mut self, record_count: usize) -> Self {
        self.record_count = record_count;
        self
    }

    pub fn with_preferred_tier(mut self, tier: Tier) -> Self {
        self.preferred_tier = Some(tier);
        self
    }

    /// Parse a preferred tier name; unknown names are rejected here rather
    /// than silently ignored at routing time
    pub fn with_preferred_tier_name(self, name: &str) -> AppResult<Self> {
        Ok(self.with_preferred_tier(name.parse()?))
    }

    pub fn realtime(mut self) -> Self {
        self.requires_realtime = true;
        self
    }

    pub fn from_agent(mut self) -> Self {
        self.agent_context = true;
        self
    }

    /// Bound the whole call, failover included
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A timeout too large to represent leaves the call unbounded
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn preferred_tier(&self) -> Option<Tier> {
        self.preferred_tier
    }

    pub fn requires_realtime(&self) -> bool {
        self.requires_realtime
    }

    pub fn agent_context(&self) -> bool {
        self.agent_context
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

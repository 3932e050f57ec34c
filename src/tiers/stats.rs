//! Per-tier request metrics
//!
//! Keeps a bounded window of the most recent calls per tier and aggregates it
//! on demand. Every record is also mirrored into the `metrics` facade so the
//! Prometheus exporter sees the same traffic.
//!
//! Snapshots may race with concurrent `record` calls and return slightly stale
//! percentiles. Nothing here is persisted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Tier;

/// Number of error categories reported per tier
const TOP_ERRORS: usize = 5;

/// One completed backend call
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub tier: Tier,
    pub duration_ms: f64,
    pub success: bool,
    pub error_category: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Error category with its frequency in the window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCount {
    pub category: String,
    pub count: usize,
}

/// Aggregated view of one tier's window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetricsSnapshot {
    pub tier: Tier,
    pub total_requests: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Percentage in [0, 100]; 0 when the window is empty
    pub success_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub top_errors: Vec<ErrorCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl TierMetricsSnapshot {
    fn empty(tier: Tier) -> Self {
        Self {
            tier,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            avg_ms: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            top_errors: vec![],
            last_request_at: None,
        }
    }
}

/// Bounded FIFO window of recent calls, newest at the front
struct Window {
    samples: Mutex<VecDeque<RequestMetric>>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, metric: RequestMetric) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_front(metric);
        samples.truncate(self.capacity);
    }

    fn copy(&self) -> Vec<RequestMetric> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.iter().cloned().collect()
    }
}

/// Per-tier recorder of backend call outcomes
pub struct MetricsCollector {
    windows: HashMap<Tier, Window>,
}

impl MetricsCollector {
    /// Create a collector with one window of `capacity` samples per tier
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            windows: Tier::ALL
                .iter()
                .map(|tier| (*tier, Window::new(capacity)))
                .collect(),
        }
    }

    /// Append one call outcome to the tier's window
    pub fn record(
        &self,
        tier: Tier,
        duration: Duration,
        success: bool,
        error_category: Option<&str>,
    ) {
        let status = if success { "success" } else { "failure" };
        metrics::counter!("crm_tier_requests_total", "tier" => tier.as_str(), "status" => status)
            .increment(1);
        metrics::histogram!("crm_tier_request_duration_seconds", "tier" => tier.as_str())
            .record(duration.as_secs_f64());
        if let Some(category) = error_category {
            metrics::counter!(
                "crm_tier_errors_total",
                "tier" => tier.as_str(),
                "category" => category.to_string()
            )
            .increment(1);
        }

        if let Some(window) = self.windows.get(&tier) {
            window.push(RequestMetric {
                tier,
                duration_ms: duration.as_secs_f64() * 1000.0,
                success,
                error_category: error_category.map(str::to_string),
                recorded_at: Utc::now(),
            });
        }
    }

    /// Aggregate the tier's current window
    pub fn snapshot(&self, tier: Tier) -> TierMetricsSnapshot {
        // Copy under the lock, aggregate outside it
        let samples = match self.windows.get(&tier) {
            Some(window) => window.copy(),
            None => return TierMetricsSnapshot::empty(tier),
        };
        aggregate(tier, &samples)
    }

    /// Snapshots for every tier
    pub fn export_all(&self) -> BTreeMap<Tier, TierMetricsSnapshot> {
        Tier::ALL
            .iter()
            .map(|tier| (*tier, self.snapshot(*tier)))
            .collect()
    }

    /// Line-oriented export of all snapshots in Prometheus text style
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (tier, snap) in self.export_all() {
            let t = tier.as_str();
            let _ = writeln!(
                out,
                "crm_tier_window_requests{{tier=\"{t}\"}} {}",
                snap.total_requests
            );
            let _ = writeln!(
                out,
                "crm_tier_window_failures{{tier=\"{t}\"}} {}",
                snap.failure_count
            );
            let _ = writeln!(out, "crm_tier_success_rate{{tier=\"{t}\"}} {:.2}", snap.success_rate);
            let quantiles = [("0.5", snap.p50_ms), ("0.95", snap.p95_ms), ("0.99", snap.p99_ms)];
            for (quantile, value) in quantiles {
                let _ = writeln!(
                    out,
                    "crm_tier_latency_ms{{tier=\"{t}\",quantile=\"{quantile}\"}} {:.3}",
                    value
                );
            }
            for error in &snap.top_errors {
                let _ = writeln!(
                    out,
                    "crm_tier_window_errors{{tier=\"{t}\",category=\"{}\"}} {}",
                    error.category, error.count
                );
            }
        }
        out
    }
}

fn aggregate(tier: Tier, samples: &[RequestMetric]) -> TierMetricsSnapshot {
    if samples.is_empty() {
        return TierMetricsSnapshot::empty(tier);
    }

    let total = samples.len();
    let success_count = samples.iter().filter(|m| m.success).count();

    let mut durations: Vec<f64> = samples.iter().map(|m| m.duration_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = durations.iter().sum::<f64>() / total as f64;

    let mut error_counts: HashMap<&str, usize> = HashMap::new();
    for category in samples.iter().filter_map(|m| m.error_category.as_deref()) {
        *error_counts.entry(category).or_insert(0) += 1;
    }
    let mut top_errors: Vec<ErrorCount> = error_counts
        .into_iter()
        .map(|(category, count)| ErrorCount {
            category: category.to_string(),
            count,
        })
        .collect();
    top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    top_errors.truncate(TOP_ERRORS);

    TierMetricsSnapshot {
        tier,
        total_requests: total,
        success_count,
        failure_count: total - success_count,
        success_rate: success_count as f64 / total as f64 * 100.0,
        avg_ms,
        p50_ms: durations[percentile_index(total, 50)],
        p95_ms: durations[percentile_index(total, 95)],
        p99_ms: durations[percentile_index(total, 99)],
        top_errors,
        last_request_at: samples.first().map(|m| m.recorded_at),
    }
}

/// Nearest-rank index: `ceil(p/100 * len) - 1`, clamped to the slice
fn percentile_index(len: usize, percentile: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = (percentile * len).div_ceil(100);
    rank.saturating_sub(1).min(len - 1)
}

//! Integration manager
//!
//! Entry point for CRM operations. Each call is routed to a primary tier,
//! guarded by that tier's circuit breaker, retried within the tier for
//! transient errors, and failed over to the remaining enabled tiers in
//! priority order. Breakers and metrics belong to the manager instance, so
//! independent managers never share state.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    backends::{BackendHealth, BackendMap, BulkUpdateOutcome, CrmBackend, Fields, ListQuery, Record},
    error::{AppError, AppResult, TierFailure},
    tiers::{
        backoff::{calculate_backoff, rate_limit_delay},
        CircuitBreaker, CircuitState, MetricsCollector, OperationKind, RoutingContext, Tier,
        TierMetricsSnapshot, TierRouter, TierSettings,
    },
};

/// CRM module holding accounts
pub const ACCOUNTS_MODULE: &str = "Accounts";

/// Maximum record ids per list call
const IDS_PER_REQUEST: usize = 100;

/// Health view of one tier
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierHealth {
    pub enabled: bool,
    pub priority: u32,
    pub breaker_state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_seconds: Option<u64>,
    pub times_opened: u64,
}

pub struct IntegrationManager {
    settings: TierSettings,
    router: TierRouter,
    backends: BackendMap,
    breakers: HashMap<Tier, CircuitBreaker>,
    metrics: MetricsCollector,
}

impl IntegrationManager {
    /// Build a manager over `backends`; every enabled tier needs a backend
    pub fn new(settings: TierSettings, backends: BackendMap) -> AppResult<Self> {
        settings.validate()?;

        for tier in settings.tiers.iter().filter(|t| t.enabled) {
            if !backends.contains_key(&tier.tier) {
                return Err(AppError::Configuration(format!(
                    "tier {} is enabled but has no backend",
                    tier.tier
                )));
            }
        }

        let breakers = Tier::ALL
            .iter()
            .map(|tier| (*tier, CircuitBreaker::new(*tier, settings.breaker_for(*tier))))
            .collect();
        let router = TierRouter::new(&settings.tiers, &settings.routing);
        let metrics = MetricsCollector::new(settings.metrics_window);

        info!(
            tiers = ?router.enabled_tiers(),
            failover = settings.routing.enable_failover,
            "Integration manager initialized"
        );

        Ok(Self {
            settings,
            router,
            backends,
            breakers,
            metrics,
        })
    }

    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn breaker(&self, tier: Tier) -> Option<&CircuitBreaker> {
        self.breakers.get(&tier)
    }

    // Account operations

    pub async fn get_account(&self, id: &str, ctx: RoutingContext) -> AppResult<Record> {
        self.get_record(ACCOUNTS_MODULE, id, ctx).await
    }

    pub async fn get_accounts(
        &self,
        query: &ListQuery,
        limit: usize,
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        self.get_records(ACCOUNTS_MODULE, query, limit, ctx).await
    }

    pub async fn update_account(
        &self,
        id: &str,
        fields: &Fields,
        ctx: RoutingContext,
    ) -> AppResult<Record> {
        self.update_record(ACCOUNTS_MODULE, id, fields, ctx).await
    }

    /// Read many accounts by id; routed as a bulk read of `ids.len()` records
    pub async fn bulk_read_accounts(
        &self,
        ids: &[String],
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        self.bulk_read_records(ACCOUNTS_MODULE, ids, ctx).await
    }

    /// Update many accounts; routed as a bulk write of `records.len()` records
    pub async fn bulk_update_accounts(
        &self,
        records: &[Record],
        ctx: RoutingContext,
    ) -> AppResult<BulkUpdateOutcome> {
        self.bulk_update_records(ACCOUNTS_MODULE, records, ctx).await
    }

    pub async fn search_accounts(
        &self,
        criteria: &str,
        limit: usize,
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        self.search_records(ACCOUNTS_MODULE, criteria, limit, ctx).await
    }

    // Module-generic operations

    pub async fn get_record(
        &self,
        module: &str,
        id: &str,
        ctx: RoutingContext,
    ) -> AppResult<Record> {
        self.execute(&ctx, |backend| async move { backend.get_one(module, id).await })
            .await
    }

    pub async fn get_records(
        &self,
        module: &str,
        query: &ListQuery,
        limit: usize,
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        self.execute(&ctx, |backend| async move {
            backend.get_many(module, query, limit).await
        })
        .await
    }

    pub async fn update_record(
        &self,
        module: &str,
        id: &str,
        fields: &Fields,
        ctx: RoutingContext,
    ) -> AppResult<Record> {
        self.execute(&ctx, |backend| async move {
            backend.update(module, id, fields).await
        })
        .await
    }

    pub async fn bulk_read_records(
        &self,
        module: &str,
        ids: &[String],
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = ctx
            .with_operation(OperationKind::BulkRead)
            .with_record_count(ids.len());

        self.execute(&ctx, |backend| async move {
            let mut records = Vec::with_capacity(ids.len());
            for chunk in ids.chunks(IDS_PER_REQUEST) {
                let query = ListQuery::for_ids(chunk.iter().cloned());
                records.extend(backend.get_many(module, &query, chunk.len()).await?);
            }
            Ok::<_, AppError>(records)
        })
        .await
    }

    pub async fn bulk_update_records(
        &self,
        module: &str,
        records: &[Record],
        ctx: RoutingContext,
    ) -> AppResult<BulkUpdateOutcome> {
        if records.is_empty() {
            return Ok(BulkUpdateOutcome::default());
        }
        let ctx = ctx
            .with_operation(OperationKind::BulkWrite)
            .with_record_count(records.len());

        self.execute(&ctx, |backend| async move {
            backend.bulk_update(module, records).await
        })
        .await
    }

    pub async fn search_records(
        &self,
        module: &str,
        criteria: &str,
        limit: usize,
        ctx: RoutingContext,
    ) -> AppResult<Vec<Record>> {
        self.execute(&ctx, |backend| async move {
            backend.search(module, criteria, limit).await
        })
        .await
    }

    // Health and operator surface

    pub fn get_tier_health(&self) -> BTreeMap<Tier, TierHealth> {
        Tier::ALL
            .iter()
            .filter_map(|tier| {
                let breaker = self.breakers.get(tier)?;
                let config = self.settings.tier(*tier);
                let snapshot = breaker.snapshot();
                Some((
                    *tier,
                    TierHealth {
                        enabled: self.router.is_enabled(*tier),
                        priority: config.map(|c| c.priority).unwrap_or_default(),
                        breaker_state: snapshot.state,
                        failure_count: snapshot.failure_count,
                        success_count: snapshot.success_count,
                        retry_in_seconds: snapshot.retry_in_seconds,
                        times_opened: snapshot.times_opened,
                    },
                ))
            })
            .collect()
    }

    pub fn get_tier_metrics(&self) -> BTreeMap<Tier, TierMetricsSnapshot> {
        self.metrics.export_all()
    }

    pub fn reset_circuit_breakers(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
        info!("All circuit breakers reset");
    }

    /// Probe every enabled backend concurrently
    ///
    /// Probes bypass the breakers and are not recorded in the request metrics.
    pub async fn check_backends(&self) -> Vec<BackendHealth> {
        let probes = self.router.enabled_tiers().iter().filter_map(|tier| {
            let backend = self.backends.get(tier)?.clone();
            let timeout = self
                .settings
                .tier(*tier)
                .map(|c| c.timeout)
                .unwrap_or(Duration::from_secs(30));
            Some(async move {
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, backend.health_check()).await;
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                let error = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("health check timed out after {}s", timeout.as_secs())),
                };
                BackendHealth {
                    tier: backend.tier(),
                    healthy: error.is_none(),
                    latency_ms,
                    error,
                }
            })
        });

        futures::future::join_all(probes).await
    }

    // Execution

    /// Walk the attempt plan until one tier succeeds
    #[instrument(
        skip(self, ctx, op),
        fields(
            operation_id = %Uuid::new_v4(),
            operation = %ctx.operation(),
            record_count = ctx.record_count()
        )
    )]
    async fn execute<T, F, Fut>(&self, ctx: &RoutingContext, op: F) -> AppResult<T>
    where
        F: Fn(Arc<dyn CrmBackend>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let failover = self.settings.routing.enable_failover;
        let plan = self.router.plan(ctx, failover);
        if plan.is_empty() {
            return Err(AppError::Configuration("no CRM tier is enabled".to_string()));
        }

        let deadline = earliest(
            ctx.deadline(),
            self.settings
                .routing
                .max_total_duration
                .and_then(|d| Instant::now().checked_add(d)),
        );

        let mut failures: Vec<TierFailure> = Vec::new();
        for tier in plan {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let err = AppError::DeadlineExceeded { tier };
                if !failover {
                    return Err(err);
                }
                warn!(tier = %tier, "Deadline reached before tier could be attempted");
                failures.push(failure(tier, &err));
                break;
            }

            let (Some(breaker), Some(backend)) =
                (self.breakers.get(&tier), self.backends.get(&tier))
            else {
                continue;
            };

            if let Err(err) = breaker.check() {
                metrics::counter!("crm_tier_skipped_total", "tier" => tier.as_str()).increment(1);
                if !failover {
                    return Err(err);
                }
                debug!(tier = %tier, "Circuit open, skipping tier");
                failures.push(failure(tier, &err));
                continue;
            }

            match self.attempt_tier(tier, breaker, backend, deadline, &op).await {
                Ok(value) => {
                    if !failures.is_empty() {
                        metrics::counter!("crm_failover_total", "tier" => tier.as_str())
                            .increment(1);
                        info!(
                            tier = %tier,
                            skipped = failures.len(),
                            "Operation served after failover"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if !err.allows_failover() || !failover => return Err(err),
                Err(err @ AppError::DeadlineExceeded { .. }) => {
                    warn!(tier = %tier, "Deadline reached during tier attempt");
                    failures.push(failure(tier, &err));
                    break;
                }
                Err(err) => {
                    warn!(tier = %tier, error = %err, "Tier failed, failing over");
                    failures.push(failure(tier, &err));
                }
            }
        }

        warn!(failures = failures.len(), "All CRM tiers failed");
        Err(AppError::FailoverExhausted { failures })
    }

    /// Call one tier, retrying transient errors up to its `max_retries`
    async fn attempt_tier<T, F, Fut>(
        &self,
        tier: Tier,
        breaker: &CircuitBreaker,
        backend: &Arc<dyn CrmBackend>,
        deadline: Option<Instant>,
        op: &F,
    ) -> AppResult<T>
    where
        F: Fn(Arc<dyn CrmBackend>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let (tier_timeout, max_retries) = self
            .settings
            .tier(tier)
            .map(|c| (c.timeout, c.max_retries))
            .ok_or_else(|| AppError::Configuration(format!("tier {} is not configured", tier)))?;
        let routing = &self.settings.routing;

        let mut attempt: u32 = 0;
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let timeout = remaining.map_or(tier_timeout, |r| r.min(tier_timeout));

            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, op(backend.clone())).await {
                Ok(result) => result,
                Err(_) if timeout < tier_timeout => Err(AppError::DeadlineExceeded { tier }),
                Err(_) => Err(AppError::backend(
                    tier,
                    None,
                    format!("timed out after {}s", tier_timeout.as_secs()),
                )),
            };
            let elapsed = started.elapsed();

            let err = match result {
                Ok(value) => {
                    self.metrics.record(tier, elapsed, true, None);
                    breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            match &err {
                // The caller ran out of time; the tier itself proved nothing
                AppError::DeadlineExceeded { .. } => breaker.release_trial(),
                e if e.counts_as_backend_failure() => {
                    self.metrics.record(tier, elapsed, false, Some(e.category()));
                    breaker.record_failure();
                }
                _ => {
                    self.metrics.record(tier, elapsed, true, None);
                    breaker.record_success();
                }
            }

            if !err.is_retryable() || attempt >= max_retries {
                return Err(err);
            }
            attempt += 1;

            let delay = match &err {
                AppError::RateLimited { retry_after } => rate_limit_delay(
                    *retry_after,
                    attempt,
                    routing.retry_base_delay,
                    routing.max_retry_after,
                ),
                _ => calculate_backoff(attempt, routing.retry_base_delay, routing.max_retry_after),
            };
            let next_attempt = Instant::now().checked_add(delay);
            if deadline.is_some_and(|d| next_attempt.map_or(true, |at| at >= d)) {
                debug!(tier = %tier, "No time left for another attempt");
                return Err(err);
            }

            warn!(
                tier = %tier,
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying tier after transient error"
            );
            metrics::counter!("crm_tier_retries_total", "tier" => tier.as_str()).increment(1);
            tokio::time::sleep(delay).await;

            // The breaker may have opened while this call was retrying
            if breaker.check().is_err() {
                return Err(err);
            }
        }
    }
}

fn failure(tier: Tier, err: &AppError) -> TierFailure {
    TierFailure {
        tier,
        category: err.category(),
        message: err.to_string(),
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

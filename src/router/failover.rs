//! Failover orchestration: drives attempts across the instances of a
//! logical model (or alias pool) and then across its fallback chain,
//! transparently to the caller. Success returns a single response; the
//! only observable effect of retries is elapsed time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::instance::Instance;
use super::registry::ModelRegistry;
use super::strategy::RoutingStrategy;
use crate::config::RouterConfig;
use crate::error::GatewayError;
use crate::latency::LatencyTracker;
use crate::llm::providers::{CallContext, UpstreamError, UpstreamErrorKind};

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub enable_failover: bool,
    pub instance_retry_attempts: u32,
    pub enable_model_fallback: bool,
    pub timeout_multiplier: f64,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            enable_failover: true,
            instance_retry_attempts: 3,
            enable_model_fallback: true,
            timeout_multiplier: 1.5,
            base_timeout: Duration::from_secs(120),
            max_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&RouterConfig> for FailoverPolicy {
    fn from(config: &RouterConfig) -> Self {
        Self {
            enable_failover: config.enable_failover,
            instance_retry_attempts: config.instance_retry_attempts,
            enable_model_fallback: config.enable_model_fallback,
            timeout_multiplier: config.failover_timeout_multiple,
            base_timeout: config.base_timeout(),
            max_timeout: config.max_timeout(),
        }
    }
}

/// Everything an attempt callback needs to make one upstream call.
pub struct Attempt {
    pub instance: Arc<Instance>,
    pub logical_model: String,
    pub ctx: CallContext,
}

/// One failed try, kept on the internal trace. The client never sees this.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub instance_id: String,
    pub logical_model: String,
    pub kind: UpstreamErrorKind,
    pub error: String,
    pub latency: Duration,
}

pub struct FailoverOutcome<T> {
    pub value: T,
    pub instance: Arc<Instance>,
    pub logical_model: String,
    pub latency: Duration,
    /// Failed attempts that preceded the success.
    pub failovers: Vec<AttemptRecord>,
}

pub struct FailoverOrchestrator {
    registry: Arc<ModelRegistry>,
    latency: Arc<LatencyTracker>,
    strategy: RoutingStrategy,
    policy: FailoverPolicy,
}

impl FailoverOrchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        latency: Arc<LatencyTracker>,
        strategy: RoutingStrategy,
        policy: FailoverPolicy,
    ) -> Self {
        Self {
            registry,
            latency,
            strategy,
            policy,
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Compounded deadline for the next attempt.
    fn attempt_deadline(&self, base: Duration, failed_attempts: u32) -> Duration {
        let factor = self.policy.timeout_multiplier.max(1.0).powi(failed_attempts as i32);
        let scaled = base.mul_f64(factor);
        scaled.min(self.policy.max_timeout)
    }

    /// Run `attempt_fn` against instances of `model` until one succeeds,
    /// walking the fallback chain when the primary pool is exhausted.
    pub async fn execute<T, F>(
        &self,
        model: &str,
        cancel: CancellationToken,
        mut attempt_fn: F,
    ) -> Result<FailoverOutcome<T>, GatewayError>
    where
        F: FnMut(Attempt) -> BoxFuture<'static, Result<T, UpstreamError>>,
    {
        let snapshot = self.registry.load();
        // Resolution errors (unknown model) surface before any attempt.
        let primary_pool = snapshot.resolve(model)?;

        let mut pools: Vec<Vec<Arc<Instance>>> = vec![primary_pool];
        if self.policy.enable_model_fallback {
            for fallback in snapshot.fallback_chain(model) {
                let pool: Vec<Arc<Instance>> = snapshot
                    .instances_of(&fallback)
                    .into_iter()
                    .filter(|instance| instance.enabled)
                    .collect();
                if !pool.is_empty() {
                    pools.push(pool);
                }
            }
        }

        let mut tried: HashSet<String> = HashSet::new();
        let mut failed_attempts: u32 = 0;
        let mut failovers: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<UpstreamError> = None;

        'pools: for pool in pools {
            let latencies = self.pool_latencies(&pool).await;

            for _ in 0..self.policy.instance_retry_attempts.max(1) {
                if cancel.is_cancelled() {
                    return Err(GatewayError::Canceled);
                }

                let candidates: Vec<Arc<Instance>> = pool
                    .iter()
                    .filter(|instance| !tried.contains(&instance.id))
                    .filter(|instance| instance.is_candidate())
                    .cloned()
                    .collect();
                let Some(instance) = self.strategy.select(&candidates, &latencies) else {
                    break;
                };

                if !instance.breaker.can_request() {
                    debug!(instance = %instance.id, "breaker refused admission");
                    tried.insert(instance.id.clone());
                    continue;
                }

                let deadline = self.attempt_deadline(instance.timeout, failed_attempts);
                let attempt = Attempt {
                    instance: Arc::clone(&instance),
                    logical_model: instance.logical_model.clone(),
                    ctx: CallContext::new(deadline, cancel.child_token()),
                };

                // The guard releases `active_requests` even if the future
                // is dropped mid-flight.
                let guard = instance.begin_request();
                let started = Instant::now();
                let result = attempt_fn(attempt).await;
                let elapsed = started.elapsed();
                drop(guard);

                match result {
                    Ok(value) => {
                        instance.breaker.record_success(elapsed);
                        instance.health.record_success();
                        self.latency
                            .record(&instance.logical_model, elapsed)
                            .await;
                        if !failovers.is_empty() {
                            debug!(
                                model,
                                instance = %instance.id,
                                failovers = failovers.len(),
                                "request succeeded after failover"
                            );
                        }
                        return Ok(FailoverOutcome {
                            value,
                            logical_model: instance.logical_model.clone(),
                            instance,
                            latency: elapsed,
                            failovers,
                        });
                    }
                    Err(err) => {
                        if cancel.is_cancelled() || err.kind == UpstreamErrorKind::Canceled {
                            return Err(GatewayError::Canceled);
                        }
                        match err.kind {
                            UpstreamErrorKind::Timeout => {
                                instance.breaker.record_timeout();
                                tried.insert(instance.id.clone());
                            }
                            UpstreamErrorKind::Transient | UpstreamErrorKind::RateLimited => {
                                instance.breaker.record_failure();
                                tried.insert(instance.id.clone());
                            }
                            UpstreamErrorKind::Permanent => {
                                // 4xx from the backend: failing over cannot
                                // change the outcome.
                                instance.breaker.record_failure();
                                instance.health.record_failure(&err.message);
                                return Err(GatewayError::Upstream(err));
                            }
                            UpstreamErrorKind::Canceled => unreachable!("handled above"),
                        }
                        instance.health.record_failure(&err.message);
                        failed_attempts += 1;
                        warn!(
                            model,
                            instance = %instance.id,
                            kind = ?err.kind,
                            error = %err.message,
                            "attempt failed"
                        );
                        failovers.push(AttemptRecord {
                            instance_id: instance.id.clone(),
                            logical_model: instance.logical_model.clone(),
                            kind: err.kind,
                            error: err.message.clone(),
                            latency: elapsed,
                        });
                        last_error = Some(err);

                        if !self.policy.enable_failover {
                            break 'pools;
                        }
                    }
                }
            }
        }

        let (last_kind, last_message, retry_after) = match &last_error {
            Some(err) => (err.kind, err.message.clone(), err.retry_after),
            None => (
                UpstreamErrorKind::Transient,
                "no routable instance".to_string(),
                None,
            ),
        };
        Err(GatewayError::AllInstancesFailed {
            attempts: failed_attempts,
            last_error: last_message,
            last_kind,
            retry_after,
        })
    }

    async fn pool_latencies(&self, pool: &[Arc<Instance>]) -> HashMap<String, f64> {
        if self.strategy != RoutingStrategy::LeastLatency {
            return HashMap::new();
        }
        let mut models: Vec<String> = pool
            .iter()
            .map(|instance| instance.logical_model.clone())
            .collect();
        models.sort();
        models.dedup();
        self.latency.averages(&models).await
    }
}

//! Budget and rate enforcement.
//!
//! Two paths, per the concurrency contract: a hot path against the shared
//! store's cached budget snapshots and sliding-window counters (bounded by
//! a 1 s timeout), and a cold authoritative path against the durable store
//! that also rolls budget periods forward and repopulates the cache. Store
//! trouble degrades to the authoritative path; it never fails open and
//! never takes the request down with it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BudgetGuardConfig;
use crate::error::GatewayError;
use crate::models::ApiKey;
use crate::store::{BudgetSnapshot, CoordStore, GatewayStore, ScopeKind, StoreError};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// One budget/rate scope to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub id: Uuid,
}

impl ScopeRef {
    pub fn cache_key(&self) -> String {
        format!("budget:{}:{}", self.kind, self.id)
    }

    fn rate_key(&self, counter: &str) -> String {
        format!("rate:{}:{}:{}", self.kind, self.id, counter)
    }
}

/// Derived, never stored. Returned to the caller on denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub remaining_budget: Option<f64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl BudgetDecision {
    pub fn into_result(self) -> Result<BudgetDecision, GatewayError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(GatewayError::BudgetDenied(self.message))
        }
    }
}

/// Published on the alert channel when spend crosses a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub scope: ScopeKind,
    pub id: Uuid,
    pub threshold: f64,
    pub current_spend: f64,
    pub max_budget: f64,
    pub timestamp: DateTime<Utc>,
}

/// RAII permit covering the rpm admission and the per-key parallel slot.
pub struct RatePermit {
    parallel: Option<Arc<AtomicU32>>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(counter) = &self.parallel {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        }
    }
}

pub struct BudgetGuard {
    coord: Arc<dyn CoordStore>,
    store: Arc<dyn GatewayStore>,
    cfg: BudgetGuardConfig,
    /// Highest alert threshold already fired per scope, for hysteresis.
    alerted: DashMap<String, f64>,
    /// Process-local in-flight counters for max_parallel.
    parallel: DashMap<Uuid, Arc<AtomicU32>>,
}

impl BudgetGuard {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        store: Arc<dyn GatewayStore>,
        cfg: BudgetGuardConfig,
    ) -> Self {
        Self {
            coord,
            store,
            cfg,
            alerted: DashMap::new(),
            parallel: DashMap::new(),
        }
    }

    fn scopes_for(key: &ApiKey) -> Vec<ScopeRef> {
        let mut scopes = vec![ScopeRef {
            kind: ScopeKind::Key,
            id: key.id,
        }];
        if let Some(team_id) = key.team_id {
            scopes.push(ScopeRef {
                kind: ScopeKind::Team,
                id: team_id,
            });
        }
        if let Some(user_id) = key.user_id {
            scopes.push(ScopeRef {
                kind: ScopeKind::User,
                id: user_id,
            });
        }
        scopes
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.cfg.check_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout("budget store operation".into())),
        }
    }

    /// Cached-then-authoritative snapshot read for one scope. `None` means
    /// the scope record does not exist (e.g. a dangling team id).
    async fn snapshot(&self, scope: ScopeRef) -> Result<Option<BudgetSnapshot>, GatewayError> {
        let cached = self
            .with_timeout(self.coord.get(&scope.cache_key()))
            .await
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<BudgetSnapshot>(&raw).ok());
        if let Some(snapshot) = cached {
            return Ok(Some(snapshot));
        }
        self.authoritative_snapshot(scope).await
    }

    /// Cold path: durable read, period rollover, cache repopulation.
    async fn authoritative_snapshot(
        &self,
        scope: ScopeRef,
    ) -> Result<Option<BudgetSnapshot>, GatewayError> {
        let Some(mut snapshot) = self.store.budget_snapshot(scope.kind, scope.id).await? else {
            return Ok(None);
        };

        if let (Some(period), Some(reset_at)) = (snapshot.budget_period, snapshot.budget_reset_at) {
            let now = Utc::now();
            if reset_at <= now {
                let mut next = reset_at;
                while next <= now {
                    next = period.advance(next);
                }
                self.store.reset_budget(scope.kind, scope.id, next).await?;
                snapshot.current_spend = 0.0;
                snapshot.budget_reset_at = Some(next);
                // Period rolled: alert hysteresis starts over.
                self.alerted.remove(&scope.cache_key());
                debug!(scope = %scope.kind, id = %scope.id, "budget period rolled over");
            }
        }

        self.cache_snapshot(scope, &snapshot).await;
        Ok(Some(snapshot))
    }

    async fn cache_snapshot(&self, scope: ScopeRef, snapshot: &BudgetSnapshot) {
        let Ok(raw) = serde_json::to_string(snapshot) else {
            return;
        };
        if let Err(err) = self
            .with_timeout(
                self.coord
                    .set_with_ttl(&scope.cache_key(), &raw, self.cfg.cache_ttl()),
            )
            .await
        {
            debug!(%err, "budget cache write skipped");
        }
    }

    /// Pre-flight budget check across Key, then Team, then User. All
    /// applicable scopes must allow.
    pub async fn check_budget(
        &self,
        key: &ApiKey,
        estimated_cost: f64,
    ) -> Result<BudgetDecision, GatewayError> {
        let mut tightest_remaining: Option<f64> = None;
        let mut earliest_reset: Option<DateTime<Utc>> = None;

        for scope in Self::scopes_for(key) {
            let Some(snapshot) = self.snapshot(scope).await? else {
                continue;
            };
            let Some(max_budget) = snapshot.max_budget else {
                continue;
            };
            let remaining = max_budget - snapshot.current_spend - estimated_cost;
            if remaining < 0.0 {
                return Ok(BudgetDecision {
                    allowed: false,
                    remaining_budget: Some(remaining),
                    reset_at: snapshot.budget_reset_at,
                    message: format!(
                        "{} budget would exceed: spent {:.4} of {:.4}",
                        scope.kind, snapshot.current_spend, max_budget
                    ),
                });
            }
            if tightest_remaining.map(|tight| remaining < tight).unwrap_or(true) {
                tightest_remaining = Some(remaining);
            }
            if let Some(reset) = snapshot.budget_reset_at {
                if earliest_reset.map(|soonest| reset < soonest).unwrap_or(true) {
                    earliest_reset = Some(reset);
                }
            }
        }

        Ok(BudgetDecision {
            allowed: true,
            remaining_budget: tightest_remaining,
            reset_at: earliest_reset,
            message: String::new(),
        })
    }

    /// Model access across all scopes: key, then team, then user; the
    /// tightest restriction wins.
    pub async fn check_model_access(
        &self,
        key: &ApiKey,
        model: &str,
    ) -> Result<(), GatewayError> {
        if !key.allows_model(model) {
            return Err(GatewayError::Forbidden(format!(
                "model '{model}' is not allowed for this key"
            )));
        }
        for scope in Self::scopes_for(key).into_iter().skip(1) {
            if let Some(snapshot) = self.snapshot(scope).await? {
                let blocked = snapshot.blocked_models.contains(model)
                    || (!snapshot.allowed_models.is_empty()
                        && !snapshot.allowed_models.contains(model));
                if blocked {
                    return Err(GatewayError::Forbidden(format!(
                        "model '{model}' is not allowed for this {}",
                        scope.kind
                    )));
                }
            }
        }
        Ok(())
    }

    /// Admit against rpm/tpm windows and the per-key parallel ceiling.
    /// Counter unavailability degrades open with a warning; budget checks
    /// have the durable fallback, rate counters have no second authority.
    pub async fn acquire_rate(&self, key: &ApiKey) -> Result<RatePermit, GatewayError> {
        for scope in Self::scopes_for(key) {
            let snapshot = self.snapshot(scope).await?;
            let (rpm, tpm) = match (scope.kind, &snapshot) {
                (ScopeKind::Key, _) => (key.rpm, key.tpm),
                (_, Some(snapshot)) => (snapshot.rpm, snapshot.tpm),
                (_, None) => continue,
            };

            if rpm > 0 {
                match self
                    .with_timeout(self.coord.window_try_incr(
                        &scope.rate_key("rpm"),
                        1,
                        RATE_WINDOW,
                        rpm as u64,
                    ))
                    .await
                {
                    Ok(decision) if !decision.allowed => {
                        return Err(GatewayError::RateDenied {
                            message: format!(
                                "{} request rate limit of {rpm}/min reached",
                                scope.kind
                            ),
                            retry_after: Some(RATE_WINDOW.as_secs()),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "rpm counter unavailable, skipping"),
                }
            }
            if tpm > 0 {
                match self
                    .with_timeout(self.coord.window_count(&scope.rate_key("tpm"), RATE_WINDOW))
                    .await
                {
                    Ok(current) if current >= tpm as u64 => {
                        return Err(GatewayError::RateDenied {
                            message: format!(
                                "{} token rate limit of {tpm}/min reached",
                                scope.kind
                            ),
                            retry_after: Some(RATE_WINDOW.as_secs()),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "tpm counter unavailable, skipping"),
                }
            }
        }

        let parallel = if key.max_parallel > 0 {
            let counter = self
                .parallel
                .entry(key.id)
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .clone();
            let previous = counter.fetch_add(1, Ordering::SeqCst);
            if previous >= key.max_parallel {
                counter.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::RateDenied {
                    message: format!(
                        "parallel request limit of {} reached for this key",
                        key.max_parallel
                    ),
                    retry_after: Some(1),
                });
            }
            Some(counter)
        } else {
            None
        };

        Ok(RatePermit { parallel })
    }

    /// Record consumed tokens into the tpm windows after the response.
    pub async fn record_tokens(&self, key: &ApiKey, tokens: u32) {
        if tokens == 0 {
            return;
        }
        for scope in Self::scopes_for(key) {
            let result = self
                .with_timeout(self.coord.window_try_incr(
                    &scope.rate_key("tpm"),
                    tokens as u64,
                    RATE_WINDOW,
                    0,
                ))
                .await;
            if let Err(err) = result {
                debug!(%err, "tpm sample dropped");
            }
        }
    }

    /// Monotonic spend settlement for one scope: durable store first, then
    /// the cache, then alert events for any newly crossed thresholds.
    pub async fn update_spending(
        &self,
        scope: ScopeRef,
        amount: f64,
    ) -> Result<f64, GatewayError> {
        let new_spend = self.store.add_spend(scope.kind, scope.id, amount).await?;

        // Cache after store, so admission can under-count but never
        // over-count.
        if let Ok(Some(snapshot)) = self.store.budget_snapshot(scope.kind, scope.id).await {
            self.cache_snapshot(scope, &snapshot).await;
            if let Some(max_budget) = snapshot.max_budget {
                self.publish_alerts(scope, new_spend, max_budget).await;
            }
        }
        Ok(new_spend)
    }

    async fn publish_alerts(&self, scope: ScopeRef, spend: f64, max_budget: f64) {
        if max_budget <= 0.0 {
            return;
        }
        let fraction = spend / max_budget;
        let already = self
            .alerted
            .get(&scope.cache_key())
            .map(|entry| *entry)
            .unwrap_or(0.0);

        let mut highest = already;
        let mut thresholds = self.cfg.alert_thresholds.clone();
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for threshold in thresholds {
            if fraction >= threshold && already < threshold {
                let alert = BudgetAlert {
                    scope: scope.kind,
                    id: scope.id,
                    threshold,
                    current_spend: spend,
                    max_budget,
                    timestamp: Utc::now(),
                };
                let Ok(payload) = serde_json::to_string(&alert) else {
                    continue;
                };
                if let Err(err) = self
                    .with_timeout(self.coord.publish(&self.cfg.alert_channel, &payload))
                    .await
                {
                    warn!(%err, "budget alert publish failed");
                }
                highest = threshold;
            }
        }
        if highest > already {
            self.alerted.insert(scope.cache_key(), highest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::key::KeyKind;
    use crate::store::{MemoryCoordStore, MemoryGatewayStore};
    use std::collections::HashSet;

    fn key_with_budget(max_budget: Option<f64>, spend: f64) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            hash: "h".into(),
            prefix: "sg-t".into(),
            kind: KeyKind::Api,
            user_id: None,
            team_id: None,
            enabled: true,
            allowed_models: HashSet::new(),
            blocked_models: HashSet::new(),
            tpm: 0,
            rpm: 0,
            max_parallel: 0,
            max_budget,
            budget_period: None,
            expires_at: None,
            current_spend: spend,
            usage_count: 0,
            last_used_at: None,
            budget_reset_at: None,
            revoked_at: None,
        }
    }

    struct Fixture {
        coord: Arc<MemoryCoordStore>,
        store: Arc<MemoryGatewayStore>,
        guard: BudgetGuard,
    }

    fn fixture() -> Fixture {
        let coord = Arc::new(MemoryCoordStore::new());
        let store = Arc::new(MemoryGatewayStore::new());
        let guard = BudgetGuard::new(
            coord.clone() as Arc<dyn CoordStore>,
            store.clone() as Arc<dyn GatewayStore>,
            BudgetGuardConfig::default(),
        );
        Fixture {
            coord,
            store,
            guard,
        }
    }

    #[tokio::test]
    async fn under_budget_is_admitted() {
        let f = fixture();
        let key = key_with_budget(Some(50.0), 45.0);
        f.store.upsert_key(key.clone());
        let decision = f.guard.check_budget(&key, 0.0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_budget, Some(5.0));
    }

    #[tokio::test]
    async fn over_budget_is_denied_with_negative_remaining() {
        let f = fixture();
        let key = key_with_budget(Some(50.0), 45.0);
        f.store.upsert_key(key.clone());

        // Upstream settles a cost of 6: spend becomes 51.
        let scope = ScopeRef {
            kind: ScopeKind::Key,
            id: key.id,
        };
        f.guard.update_spending(scope, 6.0).await.unwrap();

        let decision = f.guard.check_budget(&key, 0.0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_budget, Some(-1.0));
        assert!(decision.message.contains("would exceed"));
        assert!(decision.into_result().is_err());
    }

    #[tokio::test]
    async fn raising_the_budget_readmits_after_cache_expiry() {
        let coord = Arc::new(MemoryCoordStore::new());
        let store = Arc::new(MemoryGatewayStore::new());
        // Zero TTL models an expired cache, so the authoritative record is
        // re-read on every check.
        let guard = BudgetGuard::new(
            coord as Arc<dyn CoordStore>,
            store.clone() as Arc<dyn GatewayStore>,
            BudgetGuardConfig {
                cache_ttl: 0,
                ..Default::default()
            },
        );

        let mut key = key_with_budget(Some(50.0), 51.0);
        store.upsert_key(key.clone());
        assert!(!guard.check_budget(&key, 0.0).await.unwrap().allowed);

        key.max_budget = Some(100.0);
        store.upsert_key(key.clone());
        assert!(guard.check_budget(&key, 0.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn coord_outage_falls_back_to_authoritative_path() {
        let f = fixture();
        let key = key_with_budget(Some(10.0), 11.0);
        f.store.upsert_key(key.clone());
        f.coord.set_unavailable(true);

        // Still denied: the durable store is consulted directly.
        let decision = f.guard.check_budget(&key, 0.0).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn rpm_window_denies_over_limit() {
        let f = fixture();
        let mut key = key_with_budget(None, 0.0);
        key.rpm = 2;
        f.store.upsert_key(key.clone());

        assert!(f.guard.acquire_rate(&key).await.is_ok());
        assert!(f.guard.acquire_rate(&key).await.is_ok());
        match f.guard.acquire_rate(&key).await {
            Err(GatewayError::RateDenied { retry_after, .. }) => {
                assert_eq!(retry_after, Some(60));
            }
            other => panic!("expected rate denial, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn parallel_ceiling_is_released_on_drop() {
        let f = fixture();
        let mut key = key_with_budget(None, 0.0);
        key.max_parallel = 1;
        f.store.upsert_key(key.clone());

        let permit = f.guard.acquire_rate(&key).await.unwrap();
        assert!(matches!(
            f.guard.acquire_rate(&key).await,
            Err(GatewayError::RateDenied { .. })
        ));
        drop(permit);
        assert!(f.guard.acquire_rate(&key).await.is_ok());
    }

    #[tokio::test]
    async fn spending_updates_publish_threshold_alerts_once() {
        let f = fixture();
        let key = key_with_budget(Some(100.0), 0.0);
        f.store.upsert_key(key.clone());
        let mut alerts = f.coord.subscribe("budget:alerts").await.unwrap();

        let scope = ScopeRef {
            kind: ScopeKind::Key,
            id: key.id,
        };
        f.guard.update_spending(scope, 85.0).await.unwrap();
        let alert: BudgetAlert =
            serde_json::from_str(&alerts.recv().await.unwrap()).unwrap();
        assert_eq!(alert.threshold, 0.8);

        // A further bump below the next threshold stays quiet.
        f.guard.update_spending(scope, 5.0).await.unwrap();
        f.guard.update_spending(scope, 15.0).await.unwrap();
        let alert: BudgetAlert =
            serde_json::from_str(&alerts.recv().await.unwrap()).unwrap();
        assert_eq!(alert.threshold, 1.0);
    }

    #[tokio::test]
    async fn team_scope_can_block_a_model() {
        use crate::models::Team;
        let f = fixture();
        let team_id = Uuid::new_v4();
        let mut blocked = HashSet::new();
        blocked.insert("gpt-4".to_string());
        f.store.upsert_team(Team {
            id: team_id,
            name: "t".into(),
            enabled: true,
            allowed_models: HashSet::new(),
            blocked_models: blocked,
            tpm: 0,
            rpm: 0,
            max_budget: None,
            budget_period: None,
            current_spend: 0.0,
            budget_reset_at: None,
        });
        let mut key = key_with_budget(None, 0.0);
        key.team_id = Some(team_id);
        f.store.upsert_key(key.clone());

        assert!(matches!(
            f.guard.check_model_access(&key, "gpt-4").await,
            Err(GatewayError::Forbidden(_))
        ));
        assert!(f.guard.check_model_access(&key, "gpt-35").await.is_ok());
    }
}

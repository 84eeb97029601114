//! Usage settlement worker.
//!
//! Drains the usage stream in batches (size or interval triggered,
//! whichever first), applies each batch idempotently in one durable-store
//! transaction, settles spend per scope, and acknowledges. A named lock
//! keeps one worker active per batch across replicas; poisoned or
//! repeatedly failing entries go to the dead-letter stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::UsageConfig;
use crate::guard::{BudgetGuard, ScopeRef};
use crate::models::UsageEvent;
use crate::store::{CoordStore, GatewayStore, QueueEntry, ScopeKind};

const CONSUMER_GROUP: &str = "usage-workers";
const LOCK_NAME: &str = "usage:worker";

#[derive(Debug, Clone)]
pub struct UsageWorkerConfig {
    pub batch_size: usize,
    pub interval: Duration,
    pub max_retries: u32,
    pub stream: String,
    pub consumer: String,
}

impl From<&UsageConfig> for UsageWorkerConfig {
    fn from(config: &UsageConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            interval: config.interval(),
            max_retries: config.max_retries,
            stream: config.stream.clone(),
            consumer: format!("worker-{}", Uuid::new_v4().simple()),
        }
    }
}

pub struct UsageWorker {
    coord: Arc<dyn CoordStore>,
    store: Arc<dyn GatewayStore>,
    guard: Arc<BudgetGuard>,
    cfg: UsageWorkerConfig,
}

impl UsageWorker {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        store: Arc<dyn GatewayStore>,
        guard: Arc<BudgetGuard>,
        cfg: UsageWorkerConfig,
    ) -> Self {
        Self {
            coord,
            store,
            guard,
            cfg,
        }
    }

    /// Long-lived loop, stopped through the shared cancellation token. On
    /// shutdown the queue is drained one final time without blocking.
    pub async fn run(self, cancel: CancellationToken) {
        info!(stream = %self.cfg.stream, "usage worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let flushed = self.drain_once(Duration::ZERO).await;
                    info!(flushed, "usage worker stopped");
                    return;
                }
                _ = self.drain_once(self.cfg.interval) => {}
            }
        }
    }

    /// One guarded drain cycle. Returns how many events were settled.
    pub async fn drain_once(&self, block: Duration) -> usize {
        let lock = match self
            .coord
            .lock_acquire(LOCK_NAME, self.cfg.interval.max(Duration::from_secs(1)) * 2)
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                // Another replica holds the batch; wait out the cycle.
                tokio::time::sleep(block.min(Duration::from_secs(1))).await;
                return 0;
            }
            Err(err) => {
                warn!(%err, "usage worker could not reach the coordination store");
                tokio::time::sleep(block.min(Duration::from_secs(1))).await;
                return 0;
            }
        };

        let processed = match self
            .coord
            .queue_read(
                &self.cfg.stream,
                CONSUMER_GROUP,
                &self.cfg.consumer,
                self.cfg.batch_size,
                block,
            )
            .await
        {
            Ok(entries) if entries.is_empty() => 0,
            Ok(entries) => self.process_batch(entries).await,
            Err(err) => {
                warn!(%err, "usage queue read failed");
                0
            }
        };

        if let Err(err) = self.coord.lock_release(&lock).await {
            warn!(%err, fencing = lock.fencing, "usage worker lock release failed");
        }
        processed
    }

    async fn process_batch(&self, entries: Vec<QueueEntry>) -> usize {
        let mut events: Vec<(QueueEntry, UsageEvent)> = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.delivery_count > self.cfg.max_retries {
                warn!(id = %entry.id, deliveries = entry.delivery_count, "dead-lettering usage entry");
                if let Err(err) = self
                    .coord
                    .queue_dead_letter(&self.cfg.stream, CONSUMER_GROUP, &entry)
                    .await
                {
                    warn!(%err, "dead-letter failed, entry will be retried");
                }
                continue;
            }
            match UsageEvent::from_json(&entry.payload) {
                Some(event) => events.push((entry, event)),
                None => {
                    // Unparseable payloads can never succeed; straight to
                    // the dead-letter stream.
                    warn!(id = %entry.id, "poisoned usage entry");
                    let _ = self
                        .coord
                        .queue_dead_letter(&self.cfg.stream, CONSUMER_GROUP, &entry)
                        .await;
                }
            }
        }
        if events.is_empty() {
            return 0;
        }

        // One transaction per batch; `request_id` keeps replays idempotent.
        let batch: Vec<UsageEvent> = events.iter().map(|(_, event)| event.clone()).collect();
        let inserted = match self.store.insert_usage(&batch).await {
            Ok(inserted) => inserted,
            Err(err) => {
                // NACK by not acking: the batch redelivers and retries.
                error!(%err, "usage batch insert failed, batch will retry");
                return 0;
            }
        };
        debug!(
            batch = batch.len(),
            inserted = inserted.len(),
            "usage batch committed"
        );

        // Aggregate settled cost per scope, but only for rows that landed
        // just now. Redelivered events dedup to nothing here, so a nacked
        // or replayed batch can never charge a scope twice.
        let mut per_scope: HashMap<ScopeRef, f64> = HashMap::new();
        let mut per_key_events: HashMap<Uuid, u64> = HashMap::new();
        for event in batch
            .iter()
            .filter(|event| inserted.contains(&event.request_id))
        {
            *per_scope
                .entry(ScopeRef {
                    kind: ScopeKind::Key,
                    id: event.key_id,
                })
                .or_default() += event.cost;
            if let Some(team_id) = event.team_id {
                *per_scope
                    .entry(ScopeRef {
                        kind: ScopeKind::Team,
                        id: team_id,
                    })
                    .or_default() += event.cost;
            }
            if let Some(user_id) = event.user_id {
                *per_scope
                    .entry(ScopeRef {
                        kind: ScopeKind::User,
                        id: user_id,
                    })
                    .or_default() += event.cost;
            }
            *per_key_events.entry(event.key_id).or_default() += 1;
        }

        for (scope, cost) in per_scope {
            if cost <= 0.0 {
                continue;
            }
            if let Err(err) = self.guard.update_spending(scope, cost).await {
                error!(%err, scope = %scope.kind, id = %scope.id, "spend update failed, batch will retry");
                return 0;
            }
        }
        for (key_id, _) in per_key_events {
            if let Err(err) = self.store.touch_key_usage(key_id, chrono::Utc::now()).await {
                debug!(%err, "key usage touch skipped");
            }
        }

        let ids: Vec<String> = events.iter().map(|(entry, _)| entry.id.clone()).collect();
        if let Err(err) = self
            .coord
            .queue_ack(&self.cfg.stream, CONSUMER_GROUP, &ids)
            .await
        {
            warn!(%err, "usage ack failed; idempotent replay will clean up");
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetGuardConfig;
    use crate::llm::providers::ProviderKind;
    use crate::models::key::KeyKind;
    use crate::models::ApiKey;
    use crate::store::{MemoryCoordStore, MemoryGatewayStore};
    use crate::usage::UsageQueue;
    use std::collections::HashSet;

    struct Fixture {
        coord: Arc<MemoryCoordStore>,
        store: Arc<MemoryGatewayStore>,
        queue: UsageQueue,
        worker: UsageWorker,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let coord = Arc::new(MemoryCoordStore::with_visibility(Duration::from_millis(10)));
        let store = Arc::new(MemoryGatewayStore::new());
        let guard = Arc::new(BudgetGuard::new(
            coord.clone() as Arc<dyn CoordStore>,
            store.clone() as Arc<dyn GatewayStore>,
            BudgetGuardConfig::default(),
        ));
        let worker = UsageWorker::new(
            coord.clone() as Arc<dyn CoordStore>,
            store.clone() as Arc<dyn GatewayStore>,
            guard,
            UsageWorkerConfig {
                batch_size: 100,
                interval: Duration::from_millis(50),
                max_retries,
                stream: "usage:stream".into(),
                consumer: "test-worker".into(),
            },
        );
        let queue = UsageQueue::new(coord.clone() as Arc<dyn CoordStore>, "usage:stream");
        Fixture {
            coord,
            store,
            queue,
            worker,
        }
    }

    fn seeded_key(store: &MemoryGatewayStore, max_budget: f64) -> ApiKey {
        let key = ApiKey {
            id: Uuid::new_v4(),
            hash: "h".into(),
            prefix: "sg-w".into(),
            kind: KeyKind::Api,
            user_id: None,
            team_id: None,
            enabled: true,
            allowed_models: HashSet::new(),
            blocked_models: HashSet::new(),
            tpm: 0,
            rpm: 0,
            max_parallel: 0,
            max_budget: Some(max_budget),
            budget_period: None,
            expires_at: None,
            current_spend: 0.0,
            usage_count: 0,
            last_used_at: None,
            budget_reset_at: None,
            revoked_at: None,
        };
        store.upsert_key(key.clone());
        key
    }

    fn event(key: &ApiKey, request_id: &str, cost: f64) -> UsageEvent {
        UsageEvent {
            request_id: request_id.into(),
            timestamp: chrono::Utc::now(),
            key_id: key.id,
            user_id: key.user_id,
            team_id: key.team_id,
            model: "gpt-4".into(),
            provider: ProviderKind::OpenAi,
            instance_id: "gpt-4:openai:0".into(),
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            cost,
            latency_ms: 320,
            status_code: 200,
            cache_hit: false,
            error_code: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn settles_a_batch_into_store_and_spend() {
        let f = fixture(3);
        let key = seeded_key(&f.store, 100.0);
        f.queue.publish(&event(&key, "req-1", 1.5)).await;
        f.queue.publish(&event(&key, "req-2", 2.5)).await;

        let processed = f.worker.drain_once(Duration::ZERO).await;
        assert_eq!(processed, 2);
        assert_eq!(f.store.usage_rows().len(), 2);
        let updated = f.store.key(key.id).unwrap();
        assert!((updated.current_spend - 4.0).abs() < 1e-9);
        assert_eq!(updated.usage_count, 2);
    }

    #[tokio::test]
    async fn duplicate_request_ids_settle_once() {
        let f = fixture(3);
        let key = seeded_key(&f.store, 100.0);
        f.queue.publish(&event(&key, "req-dup", 1.0)).await;
        f.worker.drain_once(Duration::ZERO).await;
        f.queue.publish(&event(&key, "req-dup", 1.0)).await;
        f.worker.drain_once(Duration::ZERO).await;

        assert_eq!(f.store.usage_rows().len(), 1);
        // The replay must not charge the scope a second time.
        let settled = f.store.key(key.id).unwrap();
        assert!((settled.current_spend - 1.0).abs() < 1e-9);
        assert_eq!(settled.usage_count, 1);
    }

    #[tokio::test]
    async fn poisoned_entries_go_to_dead_letter() {
        let f = fixture(3);
        f.coord
            .queue_push("usage:stream", "this is not json")
            .await
            .unwrap();
        let processed = f.worker.drain_once(Duration::ZERO).await;
        assert_eq!(processed, 0);
        assert_eq!(f.coord.dead_letters("usage:stream").len(), 1);
    }

    #[tokio::test]
    async fn repeatedly_failing_entries_dead_letter() {
        let f = fixture(1);
        let key = seeded_key(&f.store, 100.0);
        // Valid event for a key the store does not know: the spend update
        // fails, the batch nacks, and retries run out.
        let mut ghost = event(&key, "req-ghost", 1.0);
        ghost.key_id = Uuid::new_v4();
        f.queue.publish(&ghost).await;

        // First delivery fails at the spend step and is not acked.
        assert_eq!(f.worker.drain_once(Duration::ZERO).await, 0);
        assert!(f.coord.dead_letters("usage:stream").is_empty());

        // The redelivery exceeds max_retries and dead-letters.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.worker.drain_once(Duration::ZERO).await, 0);
        assert_eq!(f.coord.dead_letters("usage:stream").len(), 1);
    }

    #[tokio::test]
    async fn failed_requests_with_no_tokens_never_reach_the_store() {
        let f = fixture(3);
        let _key = seeded_key(&f.store, 100.0);
        // The proxy only enqueues events for billable outcomes, so an
        // all-instances-failed request produces nothing to drain.
        assert_eq!(f.worker.drain_once(Duration::ZERO).await, 0);
        assert!(f.store.usage_rows().is_empty());
    }
}

//! In-process store implementations.
//!
//! These back the test suite and single-replica deployments that run
//! without redis or PostgreSQL. Semantics mirror the production backends,
//! including queue redelivery and lock expiry; [`MemoryCoordStore`] can
//! also simulate a full outage so degradation paths are testable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    BudgetSnapshot, CoordStore, GatewayStore, LockToken, QueueEntry, ScopeKind, StoreError,
    StoreResult, WindowDecision,
};
use crate::models::{ApiKey, Team, UsageEvent, User};

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

struct PendingEntry {
    payload: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct MemoryQueue {
    next_id: u64,
    ready: VecDeque<QueueEntry>,
    pending: HashMap<String, PendingEntry>,
    dead: Vec<QueueEntry>,
}

pub struct MemoryCoordStore {
    unavailable: AtomicBool,
    visibility: Duration,
    zsets: Mutex<HashMap<String, Vec<(f64, String)>>>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    windows: Mutex<HashMap<String, Vec<(Instant, u64)>>>,
    locks: Mutex<HashMap<String, (String, Instant)>>,
    lock_seq: AtomicU64,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::with_visibility(DEFAULT_VISIBILITY)
    }
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `visibility` controls how long an unacked queue delivery stays
    /// invisible before redelivery.
    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            unavailable: AtomicBool::new(false),
            visibility,
            zsets: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            lock_seq: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate an outage: every operation fails until flipped back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    pub fn dead_letters(&self, stream: &str) -> Vec<QueueEntry> {
        self.queues
            .lock()
            .get(stream)
            .map(|queue| queue.dead.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.check()?;
        let mut zsets = self.zsets.lock();
        let set = zsets.entry(key.to_string()).or_default();
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn ztrim(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()> {
        self.check()?;
        let mut zsets = self.zsets.lock();
        if let Some(set) = zsets.get_mut(key) {
            set.retain(|(score, _)| *score >= min_score);
            if set.len() > max_len {
                let excess = set.len() - max_len;
                set.drain(..excess);
            }
        }
        Ok(())
    }

    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .zsets
            .lock()
            .get(key)
            .map(|set| set.iter().map(|(_, member)| member.clone()).collect())
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.cache
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn window_try_incr(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
        limit: u64,
    ) -> StoreResult<WindowDecision> {
        self.check()?;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|(at, _)| now.duration_since(*at) < window);
        let current: u64 = entries.iter().map(|(_, amount)| amount).sum();

        if limit > 0 && current + amount.max(1) > limit {
            return Ok(WindowDecision {
                allowed: false,
                current,
            });
        }
        if amount > 0 {
            entries.push((now, amount));
        }
        Ok(WindowDecision {
            allowed: true,
            current: current + amount,
        })
    }

    async fn window_count(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.check()?;
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|(at, _)| now.duration_since(*at) < window);
        Ok(entries.iter().map(|(_, amount)| amount).sum())
    }

    async fn lock_acquire(&self, name: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        self.check()?;
        let now = Instant::now();
        let mut locks = self.locks.lock();
        match locks.get(name) {
            Some((_, expiry)) if *expiry > now => Ok(None),
            _ => {
                let token = Uuid::new_v4().to_string();
                locks.insert(name.to_string(), (token.clone(), now + ttl));
                Ok(Some(LockToken {
                    name: name.to_string(),
                    fencing: self.lock_seq.fetch_add(1, Ordering::SeqCst) + 1,
                    token,
                }))
            }
        }
    }

    async fn lock_release(&self, token: &LockToken) -> StoreResult<bool> {
        self.check()?;
        let mut locks = self.locks.lock();
        match locks.get(&token.name) {
            Some((held, _)) if *held == token.token => {
                locks.remove(&token.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check()?;
        if let Some(sender) = self.channels.lock().get(channel) {
            // Nobody listening is fine.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        self.check()?;
        let mut receiver = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(message) = receiver.recv().await {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn queue_push(&self, stream: &str, payload: &str) -> StoreResult<String> {
        self.check()?;
        let mut queues = self.queues.lock();
        let queue = queues.entry(stream.to_string()).or_default();
        queue.next_id += 1;
        let id = format!("{}-0", queue.next_id);
        queue.ready.push_back(QueueEntry {
            id: id.clone(),
            payload: payload.to_string(),
            delivery_count: 0,
        });
        Ok(id)
    }

    async fn queue_read(
        &self,
        stream: &str,
        _group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<QueueEntry>> {
        let deadline = Instant::now() + block;
        loop {
            self.check()?;
            let mut delivered = Vec::new();
            {
                let mut queues = self.queues.lock();
                let queue = queues.entry(stream.to_string()).or_default();
                let now = Instant::now();

                // Redeliver entries whose visibility window lapsed.
                let expired: Vec<String> = queue
                    .pending
                    .iter()
                    .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= self.visibility)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if delivered.len() >= count {
                        break;
                    }
                    if let Some(pending) = queue.pending.get_mut(&id) {
                        pending.delivered_at = now;
                        pending.delivery_count += 1;
                        delivered.push(QueueEntry {
                            id: id.clone(),
                            payload: pending.payload.clone(),
                            delivery_count: pending.delivery_count,
                        });
                    }
                }

                while delivered.len() < count {
                    let Some(entry) = queue.ready.pop_front() else {
                        break;
                    };
                    queue.pending.insert(
                        entry.id.clone(),
                        PendingEntry {
                            payload: entry.payload.clone(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                    delivered.push(QueueEntry {
                        delivery_count: 1,
                        ..entry
                    });
                }
            }

            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn queue_ack(&self, stream: &str, _group: &str, ids: &[String]) -> StoreResult<()> {
        self.check()?;
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(stream) {
            for id in ids {
                queue.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn queue_dead_letter(
        &self,
        stream: &str,
        _group: &str,
        entry: &QueueEntry,
    ) -> StoreResult<()> {
        self.check()?;
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(stream) {
            queue.pending.remove(&entry.id);
            queue.dead.push(entry.clone());
        }
        Ok(())
    }
}

/// In-memory durable store. Only tests and store-less dev deployments use
/// it; nothing here survives a restart.
#[derive(Default)]
pub struct MemoryGatewayStore {
    keys: Mutex<HashMap<Uuid, ApiKey>>,
    users: Mutex<HashMap<Uuid, User>>,
    teams: Mutex<HashMap<Uuid, Team>>,
    usage: Mutex<Vec<UsageEvent>>,
    seen_requests: Mutex<HashSet<String>>,
}

impl MemoryGatewayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_key(&self, key: ApiKey) {
        self.keys.lock().insert(key.id, key);
    }

    pub fn upsert_user(&self, user: User) {
        self.users.lock().insert(user.id, user);
    }

    pub fn upsert_team(&self, team: Team) {
        self.teams.lock().insert(team.id, team);
    }

    pub fn usage_rows(&self) -> Vec<UsageEvent> {
        self.usage.lock().clone()
    }

    pub fn key(&self, id: Uuid) -> Option<ApiKey> {
        self.keys.lock().get(&id).cloned()
    }
}

#[async_trait]
impl GatewayStore for MemoryGatewayStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn key_by_hash(&self, hash: &str) -> StoreResult<Option<ApiKey>> {
        Ok(self
            .keys
            .lock()
            .values()
            .find(|key| key.hash == hash)
            .cloned())
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.lock().get(&id).cloned())
    }

    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>> {
        Ok(self.teams.lock().get(&id).cloned())
    }

    async fn budget_snapshot(
        &self,
        scope: ScopeKind,
        id: Uuid,
    ) -> StoreResult<Option<BudgetSnapshot>> {
        let snapshot = match scope {
            ScopeKind::Key => self.keys.lock().get(&id).map(|key| BudgetSnapshot {
                max_budget: key.max_budget,
                current_spend: key.current_spend,
                budget_period: key.budget_period,
                budget_reset_at: key.budget_reset_at,
                tpm: key.tpm,
                rpm: key.rpm,
                max_parallel: key.max_parallel,
                allowed_models: key.allowed_models.clone(),
                blocked_models: key.blocked_models.clone(),
            }),
            ScopeKind::Team => self.teams.lock().get(&id).map(|team| BudgetSnapshot {
                max_budget: team.max_budget,
                current_spend: team.current_spend,
                budget_period: team.budget_period,
                budget_reset_at: team.budget_reset_at,
                tpm: team.tpm,
                rpm: team.rpm,
                max_parallel: 0,
                allowed_models: team.allowed_models.clone(),
                blocked_models: team.blocked_models.clone(),
            }),
            ScopeKind::User => self.users.lock().get(&id).map(|user| BudgetSnapshot {
                max_budget: user.max_budget,
                current_spend: user.current_spend,
                budget_period: user.budget_period,
                budget_reset_at: user.budget_reset_at,
                tpm: user.tpm,
                rpm: user.rpm,
                max_parallel: 0,
                allowed_models: user.allowed_models.clone(),
                blocked_models: user.blocked_models.clone(),
            }),
        };
        Ok(snapshot)
    }

    async fn reset_budget(
        &self,
        scope: ScopeKind,
        id: Uuid,
        next_reset: DateTime<Utc>,
    ) -> StoreResult<()> {
        match scope {
            ScopeKind::Key => {
                if let Some(key) = self.keys.lock().get_mut(&id) {
                    key.current_spend = 0.0;
                    key.budget_reset_at = Some(next_reset);
                }
            }
            ScopeKind::Team => {
                if let Some(team) = self.teams.lock().get_mut(&id) {
                    team.current_spend = 0.0;
                    team.budget_reset_at = Some(next_reset);
                }
            }
            ScopeKind::User => {
                if let Some(user) = self.users.lock().get_mut(&id) {
                    user.current_spend = 0.0;
                    user.budget_reset_at = Some(next_reset);
                }
            }
        }
        Ok(())
    }

    async fn add_spend(&self, scope: ScopeKind, id: Uuid, amount: f64) -> StoreResult<f64> {
        let new_total = match scope {
            ScopeKind::Key => self.keys.lock().get_mut(&id).map(|key| {
                key.current_spend += amount;
                key.current_spend
            }),
            ScopeKind::Team => self.teams.lock().get_mut(&id).map(|team| {
                team.current_spend += amount;
                team.current_spend
            }),
            ScopeKind::User => self.users.lock().get_mut(&id).map(|user| {
                user.current_spend += amount;
                user.current_spend
            }),
        };
        new_total.ok_or_else(|| StoreError::Unavailable(format!("{scope} {id} not found")))
    }

    async fn insert_usage(&self, events: &[UsageEvent]) -> StoreResult<HashSet<String>> {
        let mut seen = self.seen_requests.lock();
        let mut usage = self.usage.lock();
        let mut inserted = HashSet::new();
        for event in events {
            if seen.insert(event.request_id.clone()) {
                usage.push(event.clone());
                inserted.insert(event.request_id.clone());
            }
        }
        Ok(inserted)
    }

    async fn touch_key_usage(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(key) = self.keys.lock().get_mut(&key_id) {
            key.usage_count += 1;
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

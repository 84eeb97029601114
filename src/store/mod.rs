//! Storage abstractions.
//!
//! Two backends with distinct roles: the coordination store
//! ([`CoordStore`], redis-backed in production) holds the cross-replica
//! state — latency windows, rate counters, cached budgets, named locks,
//! pub/sub and the usage stream — while the durable store
//! ([`GatewayStore`], PostgreSQL) is authoritative for principals, spend
//! and usage logs. In-memory implementations back tests and single-replica
//! deployments without external services.

pub mod memory;
pub mod postgres;
pub mod redis;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::key::BudgetPeriod;
use crate::models::{ApiKey, Team, UsageEvent, User};

pub use memory::{MemoryCoordStore, MemoryGatewayStore};
pub use postgres::PgStore;
pub use redis::RedisCoordStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation timed out: {0}")]
    Timeout(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store serialization failed: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Held proof of a named lock. The fencing number increases monotonically
/// per lock name, so a stale holder can always be detected downstream.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub name: String,
    pub fencing: u64,
    pub token: String,
}

/// One delivery from the usage queue. `delivery_count` starts at 1 and
/// grows on redelivery; the worker dead-letters entries that exceed its
/// retry budget.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub payload: String,
    pub delivery_count: u32,
}

/// Outcome of an atomic check-and-increment on a sliding-window counter.
#[derive(Debug, Clone, Copy)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Count inside the window after the call.
    pub current: u64,
}

/// Cross-replica coordination primitives.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    // Sorted-set operations backing the latency tracker.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    /// Drop members scoring below `min_score`, then trim the set down to
    /// `max_len` newest members.
    async fn ztrim(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()>;
    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>>;

    // Short-TTL string cache (cached budgets, latency averages).
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically admit-and-count against a sliding window. `limit` 0 means
    /// uncapped; `amount` 0 performs a pure check.
    async fn window_try_incr(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
        limit: u64,
    ) -> StoreResult<WindowDecision>;
    async fn window_count(&self, key: &str, window: Duration) -> StoreResult<u64>;

    // Named TTL locks with fencing tokens.
    async fn lock_acquire(&self, name: &str, ttl: Duration) -> StoreResult<Option<LockToken>>;
    /// Returns false when the lock was already lost (expired or stolen).
    async fn lock_release(&self, token: &LockToken) -> StoreResult<bool>;

    // Pub/sub. Subscribers that miss messages re-read authoritative state.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn subscribe(&self, channel: &str)
        -> StoreResult<tokio::sync::mpsc::Receiver<String>>;

    // Durable at-least-once FIFO.
    async fn queue_push(&self, stream: &str, payload: &str) -> StoreResult<String>;
    async fn queue_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<QueueEntry>>;
    async fn queue_ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<()>;
    async fn queue_dead_letter(
        &self,
        stream: &str,
        group: &str,
        entry: &QueueEntry,
    ) -> StoreResult<()>;
}

/// Budget/rate scopes, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Key,
    Team,
    User,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeKind::Key => write!(f, "key"),
            ScopeKind::Team => write!(f, "team"),
            ScopeKind::User => write!(f, "user"),
        }
    }
}

/// Authoritative budget/rate state for one scope, as read from the durable
/// store. The guard caches these with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_budget: Option<f64>,
    pub current_spend: f64,
    pub budget_period: Option<BudgetPeriod>,
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub tpm: u32,
    pub rpm: u32,
    pub max_parallel: u32,
    pub allowed_models: HashSet<String>,
    pub blocked_models: HashSet<String>,
}

/// Durable storage for principals, spend and usage settlement.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    async fn key_by_hash(&self, hash: &str) -> StoreResult<Option<ApiKey>>;
    async fn user(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>>;

    async fn budget_snapshot(
        &self,
        scope: ScopeKind,
        id: Uuid,
    ) -> StoreResult<Option<BudgetSnapshot>>;

    /// Roll the budget period forward: zero the spend and advance the reset
    /// timestamp.
    async fn reset_budget(
        &self,
        scope: ScopeKind,
        id: Uuid,
        next_reset: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Monotonic spend increase; returns the new total.
    async fn add_spend(&self, scope: ScopeKind, id: Uuid, amount: f64) -> StoreResult<f64>;

    /// Insert a batch of usage events in one transaction, idempotent on
    /// `request_id`. Returns the request ids that were newly inserted, so
    /// callers settle spend only for rows that actually landed.
    async fn insert_usage(&self, events: &[UsageEvent]) -> StoreResult<HashSet<String>>;

    async fn touch_key_usage(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

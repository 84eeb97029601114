//! PostgreSQL durable store. Schema lives under `migrations/`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{BudgetSnapshot, GatewayStore, ScopeKind, StoreError, StoreResult};
use crate::models::key::{ApiKey, BudgetPeriod, KeyKind};
use crate::models::{Team, UsageEvent, User};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(scope: ScopeKind) -> &'static str {
        match scope {
            ScopeKind::Key => "api_keys",
            ScopeKind::Team => "teams",
            ScopeKind::User => "users",
        }
    }
}

fn parse_period(raw: Option<String>) -> Option<BudgetPeriod> {
    match raw.as_deref() {
        Some("daily") => Some(BudgetPeriod::Daily),
        Some("weekly") => Some(BudgetPeriod::Weekly),
        Some("monthly") => Some(BudgetPeriod::Monthly),
        Some("yearly") => Some(BudgetPeriod::Yearly),
        _ => None,
    }
}

fn parse_kind(raw: &str) -> KeyKind {
    match raw {
        "virtual" => KeyKind::Virtual,
        "master" => KeyKind::Master,
        _ => KeyKind::Api,
    }
}

fn string_set(row: &PgRow, column: &str) -> Result<HashSet<String>, sqlx::Error> {
    let values: Option<Vec<String>> = row.try_get(column)?;
    Ok(values.unwrap_or_default().into_iter().collect())
}

fn key_from_row(row: &PgRow) -> Result<ApiKey, sqlx::Error> {
    Ok(ApiKey {
        id: row.try_get("id")?,
        hash: row.try_get("key_hash")?,
        prefix: row.try_get("key_prefix")?,
        kind: parse_kind(&row.try_get::<String, _>("kind")?),
        user_id: row.try_get("user_id")?,
        team_id: row.try_get("team_id")?,
        enabled: row.try_get("enabled")?,
        allowed_models: string_set(row, "allowed_models")?,
        blocked_models: string_set(row, "blocked_models")?,
        tpm: row.try_get::<i32, _>("tpm")? as u32,
        rpm: row.try_get::<i32, _>("rpm")? as u32,
        max_parallel: row.try_get::<i32, _>("max_parallel")? as u32,
        max_budget: row.try_get("max_budget")?,
        budget_period: parse_period(row.try_get("budget_period")?),
        expires_at: row.try_get("expires_at")?,
        current_spend: row.try_get("current_spend")?,
        usage_count: row.try_get::<i64, _>("usage_count")? as u64,
        last_used_at: row.try_get("last_used_at")?,
        budget_reset_at: row.try_get("budget_reset_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        enabled: row.try_get("enabled")?,
        allowed_models: string_set(row, "allowed_models")?,
        blocked_models: string_set(row, "blocked_models")?,
        tpm: row.try_get::<i32, _>("tpm")? as u32,
        rpm: row.try_get::<i32, _>("rpm")? as u32,
        max_budget: row.try_get("max_budget")?,
        budget_period: parse_period(row.try_get("budget_period")?),
        current_spend: row.try_get("current_spend")?,
        budget_reset_at: row.try_get("budget_reset_at")?,
    })
}

fn team_from_row(row: &PgRow) -> Result<Team, sqlx::Error> {
    Ok(Team {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        allowed_models: string_set(row, "allowed_models")?,
        blocked_models: string_set(row, "blocked_models")?,
        tpm: row.try_get::<i32, _>("tpm")? as u32,
        rpm: row.try_get::<i32, _>("rpm")? as u32,
        max_budget: row.try_get("max_budget")?,
        budget_period: parse_period(row.try_get("budget_period")?),
        current_spend: row.try_get("current_spend")?,
        budget_reset_at: row.try_get("budget_reset_at")?,
    })
}

#[async_trait]
impl GatewayStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn key_by_hash(&self, hash: &str) -> StoreResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(key_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>> {
        let row = sqlx::query("SELECT * FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(team_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn budget_snapshot(
        &self,
        scope: ScopeKind,
        id: Uuid,
    ) -> StoreResult<Option<BudgetSnapshot>> {
        let query = format!(
            "SELECT max_budget, current_spend, budget_period, budget_reset_at, \
             tpm, rpm, {} AS max_parallel, allowed_models, blocked_models \
             FROM {} WHERE id = $1",
            if scope == ScopeKind::Key { "max_parallel" } else { "0" },
            Self::table(scope),
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BudgetSnapshot {
            max_budget: row.try_get("max_budget").map_err(StoreError::from)?,
            current_spend: row.try_get("current_spend").map_err(StoreError::from)?,
            budget_period: parse_period(row.try_get("budget_period").map_err(StoreError::from)?),
            budget_reset_at: row.try_get("budget_reset_at").map_err(StoreError::from)?,
            tpm: row.try_get::<i32, _>("tpm").map_err(StoreError::from)? as u32,
            rpm: row.try_get::<i32, _>("rpm").map_err(StoreError::from)? as u32,
            max_parallel: row
                .try_get::<i32, _>("max_parallel")
                .map_err(StoreError::from)? as u32,
            allowed_models: string_set(&row, "allowed_models").map_err(StoreError::from)?,
            blocked_models: string_set(&row, "blocked_models").map_err(StoreError::from)?,
        }))
    }

    async fn reset_budget(
        &self,
        scope: ScopeKind,
        id: Uuid,
        next_reset: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = format!(
            "UPDATE {} SET current_spend = 0, budget_reset_at = $2 WHERE id = $1",
            Self::table(scope)
        );
        sqlx::query(&query)
            .bind(id)
            .bind(next_reset)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_spend(&self, scope: ScopeKind, id: Uuid, amount: f64) -> StoreResult<f64> {
        let query = format!(
            "UPDATE {} SET current_spend = current_spend + $2 WHERE id = $1 RETURNING current_spend",
            Self::table(scope)
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.try_get(0).map_err(StoreError::from),
            None => Err(StoreError::Unavailable(format!("{scope} {id} not found"))),
        }
    }

    async fn insert_usage(&self, events: &[UsageEvent]) -> StoreResult<HashSet<String>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = HashSet::new();
        for event in events {
            let result = sqlx::query(
                "INSERT INTO usage_logs (request_id, ts, key_id, user_id, team_id, model, \
                 provider, instance_id, input_tokens, output_tokens, total_tokens, cost, \
                 latency_ms, status_code, cache_hit, error_code, error_message) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
                 ON CONFLICT (request_id) DO NOTHING",
            )
            .bind(&event.request_id)
            .bind(event.timestamp)
            .bind(event.key_id)
            .bind(event.user_id)
            .bind(event.team_id)
            .bind(&event.model)
            .bind(event.provider.to_string())
            .bind(&event.instance_id)
            .bind(event.input_tokens as i32)
            .bind(event.output_tokens as i32)
            .bind(event.total_tokens as i32)
            .bind(event.cost)
            .bind(event.latency_ms as i64)
            .bind(event.status_code as i32)
            .bind(event.cache_hit)
            .bind(&event.error_code)
            .bind(&event.error_message)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted.insert(event.request_id.clone());
                // Aggregated roll-ups ride in the same transaction.
                for (table, bucket) in [
                    ("usage_rollup_hourly", "hour"),
                    ("usage_rollup_daily", "day"),
                ] {
                    let rollup = format!(
                        "INSERT INTO {table} (bucket, model, key_id, requests, total_tokens, cost) \
                         VALUES (date_trunc('{bucket}', $1), $2, $3, 1, $4, $5) \
                         ON CONFLICT (bucket, model, key_id) DO UPDATE SET \
                         requests = {table}.requests + 1, \
                         total_tokens = {table}.total_tokens + EXCLUDED.total_tokens, \
                         cost = {table}.cost + EXCLUDED.cost"
                    );
                    sqlx::query(&rollup)
                        .bind(event.timestamp)
                        .bind(&event.model)
                        .bind(event.key_id)
                        .bind(event.total_tokens as i64)
                        .bind(event.cost)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn touch_key_usage(&self, key_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET usage_count = usage_count + 1, last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

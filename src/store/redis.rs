//! Redis-backed coordination store.
//!
//! Key layout: `latency:{model}` sorted sets, `rate:{scope}:{id}:{rpm|tpm}`
//! sliding windows, `budget:{scope}:{id}` cached snapshots,
//! `lock:{name}` + `lock:seq:{name}` named locks, and the `usage:stream`
//! consumer-group queue with a `:dead` suffix for dead letters.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CoordStore, LockToken, QueueEntry, StoreError, StoreResult, WindowDecision};

/// How long a delivered-but-unacked stream entry stays invisible before
/// another consumer may claim it.
const PENDING_VISIBILITY: Duration = Duration::from_secs(30);

const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local amount = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local member = ARGV[5]
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local total = 0
for _, m in ipairs(redis.call('ZRANGE', key, 0, -1)) do
  local sep = string.find(m, ':')
  total = total + tonumber(string.sub(m, 1, sep - 1))
end
local probe = amount
if probe == 0 then probe = 1 end
if limit > 0 and total + probe > limit then
  return {0, total}
end
if amount > 0 then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  total = total + amount
end
return {1, total}
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisCoordStore {
    client: redis::Client,
    manager: ConnectionManager,
    window_script: Script,
    unlock_script: Script,
}

impl RedisCoordStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(StoreError::from)?;
        Ok(Self {
            client,
            manager,
            window_script: Script::new(WINDOW_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let result: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delivery_counts(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> StoreResult<std::collections::HashMap<String, u32>> {
        if ids.is_empty() {
            return Ok(Default::default());
        }
        let mut conn = self.conn();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", ids.len() as i64 * 4)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|pending| (pending.id, pending.times_delivered as u32))
            .collect())
    }
}

fn entry_payload(map: &std::collections::HashMap<String, redis::Value>) -> Option<String> {
    map.get("data")
        .and_then(|value| redis::from_redis_value::<String>(value).ok())
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::from)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(StoreError::from)
    }

    async fn ztrim(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::pipe()
            .zrembyscore(key, "-inf", format!("({min_score}"))
            .ignore()
            .zremrangebyrank(key, 0, -(max_len as isize) - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::from)
    }

    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.zrange(key, 0, -1).await.map_err(StoreError::from)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(StoreError::from)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(StoreError::from)
    }

    async fn window_try_incr(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
        limit: u64,
    ) -> StoreResult<WindowDecision> {
        let mut conn = self.conn();
        let member = format!("{amount}:{}", Uuid::new_v4().simple());
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (allowed, current): (i64, i64) = self
            .window_script
            .key(key)
            .arg(now_ms)
            .arg(window.as_millis() as i64)
            .arg(amount as i64)
            .arg(limit as i64)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowDecision {
            allowed: allowed == 1,
            current: current.max(0) as u64,
        })
    }

    async fn window_count(&self, key: &str, window: Duration) -> StoreResult<u64> {
        // A zero-amount, zero-limit call is a pure count.
        Ok(self.window_try_incr(key, 0, window, 0).await?.current)
    }

    async fn lock_acquire(&self, name: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let mut conn = self.conn();
        let token = Uuid::new_v4().to_string();
        let key = format!("lock:{name}");
        let acquired: bool = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !acquired {
            return Ok(None);
        }
        let fencing: u64 = conn.incr(format!("lock:seq:{name}"), 1u64).await?;
        Ok(Some(LockToken {
            name: name.to_string(),
            fencing,
            token,
        }))
    }

    async fn lock_release(&self, token: &LockToken) -> StoreResult<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .unlock_script
            .key(format!("lock:{}", token.name))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(StoreError::from)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(StoreError::from)?;
        pubsub.subscribe(channel).await.map_err(StoreError::from)?;

        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let Ok(payload) = message.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel, "pubsub forwarder stopped");
        });
        Ok(rx)
    }

    async fn queue_push(&self, stream: &str, payload: &str) -> StoreResult<String> {
        let mut conn = self.conn();
        conn.xadd(stream, "*", &[("data", payload)])
            .await
            .map_err(StoreError::from)
    }

    async fn queue_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<QueueEntry>> {
        self.ensure_group(stream, group).await?;
        let mut conn = self.conn();

        // First recover entries another worker delivered but never acked.
        let claim: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                PENDING_VISIBILITY.as_millis() as usize,
                "0-0",
                StreamAutoClaimOptions::default().count(count),
            )
            .await?;
        if !claim.claimed.is_empty() {
            let ids: Vec<String> = claim.claimed.iter().map(|entry| entry.id.clone()).collect();
            let counts = self.delivery_counts(stream, group, &ids).await?;
            let entries = claim
                .claimed
                .into_iter()
                .filter_map(|entry| {
                    let payload = entry_payload(&entry.map)?;
                    let delivery_count = counts.get(&entry.id).copied().unwrap_or(2);
                    Some(QueueEntry {
                        id: entry.id,
                        payload,
                        delivery_count,
                    })
                })
                .collect();
            return Ok(entries);
        }

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                match entry_payload(&id.map) {
                    Some(payload) => entries.push(QueueEntry {
                        id: id.id,
                        payload,
                        delivery_count: 1,
                    }),
                    None => warn!(id = %id.id, "stream entry without data field, skipping"),
                }
            }
        }
        Ok(entries)
    }

    async fn queue_ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.xack::<_, _, _, ()>(stream, group, ids)
            .await
            .map_err(StoreError::from)
    }

    async fn queue_dead_letter(
        &self,
        stream: &str,
        group: &str,
        entry: &QueueEntry,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::pipe()
            .xadd(
                format!("{stream}:dead"),
                "*",
                &[("data", entry.payload.as_str()), ("origin", entry.id.as_str())],
            )
            .ignore()
            .xack(stream, group, &[entry.id.as_str()])
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::from)
    }
}

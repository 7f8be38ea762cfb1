//! Redis job queue.
//!
//! Layout under a key prefix (default `queue`):
//!
//! | Key                          | Type   | Contents                               |
//! |------------------------------|--------|----------------------------------------|
//! | `{prefix}:{topic}`           | list   | ready entries, `RPUSH` / `LMOVE LEFT`  |
//! | `{prefix}:{topic}:processing:{consumer}` | list | delivered to `consumer`, not yet acknowledged |
//! | `{prefix}:consumers`         | set    | consumer ids that may hold entries     |
//! | `{prefix}:consumer:{consumer}` | string | heartbeat, expires after the lease   |
//! | `{prefix}:delayed`           | zset   | `{topic}\|{job}` scored by `not_before` ms |
//! | `{prefix}:scheduled:{key}`   | string | zset member for a dedupe key           |
//!
//! A consumer only reclaims processing lists whose owner's heartbeat has
//! lapsed, plus its own. The scheduled pointer is deleted when its member
//! is promoted and otherwise expires a day after `not_before`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use super::{Delivery, JobQueue};
use crate::domain::{Clock, Job, JobTopic};
use crate::error::GatewayError;
use crate::persistence::RedisHandle;

/// How often an idle consumer polls the topic lists.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Upper bound on jobs promoted per call.
const PROMOTE_BATCH: usize = 500;

/// Heartbeat lifetime in milliseconds; a consumer silent for longer is
/// presumed dead.
const CONSUMER_LEASE_MS: u64 = 60_000;

/// How long a scheduled pointer outlives its `not_before`.
const POINTER_GRACE: chrono::Duration = chrono::Duration::days(1);

/// Moves due zset members onto their topic lists atomically and drops the
/// dedupe pointer that still names each promoted member.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local sep = string.find(member, '|', 1, true)
  if sep then
    local raw = string.sub(member, sep + 1)
    redis.call('RPUSH', ARGV[3] .. string.sub(member, 1, sep - 1), raw)
    local ok, job = pcall(cjson.decode, raw)
    if ok and type(job) == 'table' and type(job['dedupe_key']) == 'string' then
      local pointer = ARGV[3] .. 'scheduled:' .. job['dedupe_key']
      if redis.call('GET', pointer) == member then
        redis.call('DEL', pointer)
      end
    end
  end
end
return #due
";

/// Milliseconds a scheduled pointer is kept: until `not_before` plus a
/// grace day, and never less than the grace day.
fn pointer_ttl_ms(not_before: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let until_due = (not_before - now).max(chrono::Duration::zero());
    (until_due + POINTER_GRACE).num_milliseconds()
}

/// [`JobQueue`] on Redis lists and a sorted set.
#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    redis: Arc<RedisHandle>,
    clock: Arc<dyn Clock>,
    prefix: String,
    consumer_id: String,
}

impl RedisJobQueue {
    /// Creates a queue using the default `queue` key prefix and a fresh
    /// consumer id.
    #[must_use]
    pub fn new(redis: Arc<RedisHandle>, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis,
            clock,
            prefix: "queue".to_string(),
            consumer_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Uses a stable consumer id so a restarted process reclaims its own
    /// in-flight entries immediately instead of after the lease.
    #[must_use]
    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    /// Id under which this queue holds in-flight entries.
    #[must_use]
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Overrides the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn ready_key(&self, topic: JobTopic) -> String {
        format!("{}:{topic}", self.prefix)
    }

    fn processing_key(&self, topic: JobTopic) -> String {
        self.processing_key_of(topic, &self.consumer_id)
    }

    fn processing_key_of(&self, topic: JobTopic, consumer: &str) -> String {
        format!("{}:{topic}:processing:{consumer}", self.prefix)
    }

    fn consumers_key(&self) -> String {
        format!("{}:consumers", self.prefix)
    }

    fn heartbeat_key(&self, consumer: &str) -> String {
        format!("{}:consumer:{consumer}", self.prefix)
    }

    /// Whether `consumer`'s processing lists may be drained by this queue.
    fn may_reclaim(&self, consumer: &str, heartbeat_alive: bool) -> bool {
        consumer == self.consumer_id || !heartbeat_alive
    }

    async fn heartbeat(&self, conn: &mut ConnectionManager) -> Result<(), GatewayError> {
        let _: () = redis::pipe()
            .cmd("SADD")
            .arg(self.consumers_key())
            .arg(&self.consumer_id)
            .ignore()
            .cmd("SET")
            .arg(self.heartbeat_key(&self.consumer_id))
            .arg(1)
            .arg("PX")
            .arg(CONSUMER_LEASE_MS)
            .ignore()
            .query_async(conn)
            .await?;
        Ok(())
    }

    async fn drain_processing(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
    ) -> Result<usize, GatewayError> {
        let mut recovered = 0;
        for topic in JobTopic::ALL {
            loop {
                let moved: Option<String> = redis::cmd("LMOVE")
                    .arg(self.processing_key_of(topic, consumer))
                    .arg(self.ready_key(topic))
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query_async(conn)
                    .await?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn scheduled_key(&self, dedupe_key: &str) -> String {
        format!("{}:scheduled:{dedupe_key}", self.prefix)
    }

    async fn try_take(
        &self,
        conn: &mut ConnectionManager,
        topics: &[JobTopic],
    ) -> Result<Option<Delivery>, GatewayError> {
        for topic in topics {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.ready_key(*topic))
                .arg(self.processing_key(*topic))
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(conn)
                .await?;
            if let Some(raw) = raw {
                // the raw entry doubles as receipt for LREM on ack
                return Ok(Some(Delivery::decode(*topic, raw.clone(), &raw)));
            }
        }
        Ok(None)
    }

    async fn remove_schedule(
        &self,
        conn: &mut ConnectionManager,
        dedupe_key: &str,
    ) -> Result<bool, GatewayError> {
        let pointer = self.scheduled_key(dedupe_key);
        let member: Option<String> = redis::cmd("GET")
            .arg(&pointer)
            .query_async(conn)
            .await?;
        let Some(member) = member else {
            return Ok(false);
        };
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.delayed_key())
            .arg(&member)
            .query_async(conn)
            .await?;
        let _: i64 = redis::cmd("DEL").arg(&pointer).query_async(conn).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), GatewayError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.redis.connection().await?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.ready_key(job.topic()))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(topic = %job.topic(), job_id = %job.id, "job enqueued");
        Ok(())
    }

    async fn enqueue_at(&self, job: &Job, not_before: DateTime<Utc>) -> Result<(), GatewayError> {
        let member = format!("{}|{}", job.topic(), serde_json::to_string(job)?);
        let mut conn = self.redis.connection().await?;
        if let Some(key) = &job.dedupe_key {
            self.remove_schedule(&mut conn, key).await?;
        }
        let _: i64 = redis::cmd("ZADD")
            .arg(self.delayed_key())
            .arg(not_before.timestamp_millis())
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        if let Some(key) = &job.dedupe_key {
            let _: () = redis::cmd("SET")
                .arg(self.scheduled_key(key))
                .arg(&member)
                .arg("PX")
                .arg(pointer_ttl_ms(not_before, self.clock.now()))
                .query_async(&mut conn)
                .await?;
        }
        tracing::debug!(
            topic = %job.topic(),
            job_id = %job.id,
            not_before = %not_before,
            "job scheduled"
        );
        Ok(())
    }

    async fn cancel_scheduled(&self, dedupe_key: &str) -> Result<bool, GatewayError> {
        let mut conn = self.redis.connection().await?;
        self.remove_schedule(&mut conn, dedupe_key).await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, GatewayError> {
        let mut conn = self.redis.connection().await?;
        let promoted: i64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(self.delayed_key())
            .arg(now.timestamp_millis())
            .arg(PROMOTE_BATCH)
            .arg(format!("{}:", self.prefix))
            .invoke_async(&mut conn)
            .await?;
        Ok(usize::try_from(promoted).unwrap_or(0))
    }

    async fn dequeue(
        &self,
        topics: &[JobTopic],
        timeout: Duration,
    ) -> Result<Option<Delivery>, GatewayError> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.redis.connection().await?;
        loop {
            self.heartbeat(&mut conn).await?;
            self.promote_due(self.clock.now()).await?;
            if let Some(delivery) = self.try_take(&mut conn, topics).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(IDLE_POLL)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), GatewayError> {
        let mut conn = self.redis.connection().await?;
        let _: i64 = redis::cmd("LREM")
            .arg(self.processing_key(delivery.topic))
            .arg(1)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), GatewayError> {
        let mut conn = self.redis.connection().await?;
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(delivery.topic))
            .arg(1)
            .arg(&delivery.receipt)
            .cmd("LPUSH")
            .arg(self.ready_key(delivery.topic))
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            // already reclaimed by recovery; undo the push
            let _: i64 = redis::cmd("LREM")
                .arg(self.ready_key(delivery.topic))
                .arg(1)
                .arg(&delivery.receipt)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize, GatewayError> {
        let mut conn = self.redis.connection().await?;
        self.heartbeat(&mut conn).await?;
        let consumers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.consumers_key())
            .query_async(&mut conn)
            .await?;

        let mut recovered = 0;
        for consumer in consumers {
            let alive: bool = redis::cmd("EXISTS")
                .arg(self.heartbeat_key(&consumer))
                .query_async(&mut conn)
                .await?;
            if !self.may_reclaim(&consumer, alive) {
                continue;
            }
            let drained = self.drain_processing(&mut conn, &consumer).await?;
            if consumer != self.consumer_id {
                let _: i64 = redis::cmd("SREM")
                    .arg(self.consumers_key())
                    .arg(&consumer)
                    .query_async(&mut conn)
                    .await?;
                if drained > 0 {
                    tracing::warn!(consumer, drained, "reclaimed entries of a dead consumer");
                }
            }
            recovered += drained;
        }
        Ok(recovered)
    }

    async fn depth(&self, topic: JobTopic) -> Result<usize, GatewayError> {
        let mut conn = self.redis.connection().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(self.ready_key(topic))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

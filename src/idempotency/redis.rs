//! Redis-backed idempotency store with an optional durable fallback.
//!
//! The create step is a single `SET key value NX EX ttl`, so two
//! concurrent requests can never both observe "absent". When a durable
//! fallback is configured it is written through and consulted on first
//! sight, so a Redis flush cannot resurrect an already-completed key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BeginOutcome, IdempotencyStore};
use crate::domain::{CachedResponse, IdempotencyRecord, IdempotencyStatus, ScopedKey};
use crate::error::GatewayError;
use crate::persistence::RedisHandle;

/// [`IdempotencyStore`] on Redis `SET NX EX`.
#[derive(Debug, Clone)]
pub struct RedisIdempotencyStore {
    redis: Arc<RedisHandle>,
    ttl: chrono::Duration,
    fallback: Option<Arc<dyn IdempotencyStore>>,
}

impl RedisIdempotencyStore {
    /// Creates a store without a durable fallback.
    #[must_use]
    pub fn new(redis: Arc<RedisHandle>, ttl: chrono::Duration) -> Self {
        Self {
            redis,
            ttl,
            fallback: None,
        }
    }

    /// Adds a durable store that is written through and consulted when
    /// Redis has no record.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn IdempotencyStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn ttl_secs(&self) -> u64 {
        u64::try_from(self.ttl.num_seconds()).unwrap_or(1).max(1)
    }

    async fn fetch(&self, key: &ScopedKey) -> Result<Option<IdempotencyRecord>, GatewayError> {
        let mut conn = self.redis.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(GatewayError::from)
    }

    async fn delete(&self, key: &ScopedKey) -> Result<(), GatewayError> {
        let mut conn = self.redis.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn overwrite(&self, record: &IdempotencyRecord) -> Result<(), GatewayError> {
        let mut conn = self.redis.connection().await?;
        let value = serde_json::to_string(record)?;
        let _: () = redis::cmd("SET")
            .arg(record.key.as_str())
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn outcome_of(record: &IdempotencyRecord) -> BeginOutcome {
    match (&record.status, &record.cached_response) {
        (IdempotencyStatus::Completed, Some(response)) => BeginOutcome::Completed(response.clone()),
        _ => BeginOutcome::InFlight,
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn begin(
        &self,
        key: &ScopedKey,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GatewayError> {
        let record = IdempotencyRecord::processing(key.clone(), now, self.ttl);
        let value = serde_json::to_string(&record)?;
        let mut conn = self.redis.connection().await?;
        let created: Option<String> = redis::cmd("SET")
            .arg(key.as_str())
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;

        if created.is_none() {
            return Ok(match self.fetch(key).await? {
                Some(existing) => outcome_of(&existing),
                // expired between SET and GET; treat as busy and let the client retry
                None => BeginOutcome::InFlight,
            });
        }

        let Some(fallback) = &self.fallback else {
            return Ok(BeginOutcome::Started);
        };
        let durable = match fallback.begin(key, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.delete(key).await?;
                return Err(err);
            }
        };
        match durable {
            BeginOutcome::Started => Ok(BeginOutcome::Started),
            BeginOutcome::Completed(response) => {
                tracing::info!(key = %key, "restored completed idempotency record from durable store");
                self.overwrite(&record.complete(response.clone())).await?;
                Ok(BeginOutcome::Completed(response))
            }
            BeginOutcome::InFlight => Ok(BeginOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        key: &ScopedKey,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let current = self.fetch(key).await?;
        if current
            .as_ref()
            .is_some_and(|r| r.status == IdempotencyStatus::Completed)
        {
            return Ok(());
        }
        let record = current
            .unwrap_or_else(|| IdempotencyRecord::processing(key.clone(), now, self.ttl))
            .complete(response.clone());
        self.overwrite(&record).await?;
        if let Some(fallback) = &self.fallback {
            fallback.complete(key, response, now).await?;
        }
        Ok(())
    }

    async fn abandon(&self, key: &ScopedKey) -> Result<(), GatewayError> {
        if self
            .fetch(key)
            .await?
            .is_some_and(|r| r.status == IdempotencyStatus::Processing)
        {
            self.delete(key).await?;
        }
        if let Some(fallback) = &self.fallback {
            fallback.abandon(key).await?;
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        // Redis expires keys on its own
        match &self.fallback {
            Some(fallback) => fallback.purge_expired(now).await,
            None => Ok(0),
        }
    }
}

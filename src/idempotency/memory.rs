//! In-memory idempotency store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{BeginOutcome, IdempotencyStore};
use crate::domain::{CachedResponse, IdempotencyRecord, IdempotencyStatus, ScopedKey};
use crate::error::GatewayError;

/// Process-local [`IdempotencyStore`].
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    ttl: chrono::Duration,
    records: Mutex<HashMap<ScopedKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store whose records live for `ttl`.
    #[must_use]
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stored record, expired or not.
    pub async fn record(&self, key: &ScopedKey) -> Option<IdempotencyRecord> {
        self.records.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &ScopedKey,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GatewayError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(key).filter(|r| !r.is_expired(now)) {
            return Ok(match (&existing.status, &existing.cached_response) {
                (IdempotencyStatus::Completed, Some(response)) => {
                    BeginOutcome::Completed(response.clone())
                }
                _ => BeginOutcome::InFlight,
            });
        }
        records.insert(
            key.clone(),
            IdempotencyRecord::processing(key.clone(), now, self.ttl),
        );
        Ok(BeginOutcome::Started)
    }

    async fn complete(
        &self,
        key: &ScopedKey,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let mut records = self.records.lock().await;
        let record = records
            .remove(key)
            .unwrap_or_else(|| IdempotencyRecord::processing(key.clone(), now, self.ttl));
        if record.status == IdempotencyStatus::Completed {
            // first completion wins
            records.insert(key.clone(), record);
            return Ok(());
        }
        records.insert(key.clone(), record.complete(response.clone()));
        Ok(())
    }

    async fn abandon(&self, key: &ScopedKey) -> Result<(), GatewayError> {
        let mut records = self.records.lock().await;
        if records
            .get(key)
            .is_some_and(|r| r.status == IdempotencyStatus::Processing)
        {
            records.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

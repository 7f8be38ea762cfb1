//! Dead Letter Store: durable record of jobs that exhausted retries.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DeadLetterEntry, DeadLetterId, JobTopic};
use crate::error::GatewayError;

/// Storage for [`DeadLetterEntry`] records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + Debug {
    /// Persists an entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn insert(&self, entry: &DeadLetterEntry) -> Result<(), GatewayError>;

    /// Most recent entries first, optionally for one topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn list(
        &self,
        topic: Option<JobTopic>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, GatewayError>;

    /// Fetches one entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeadLetterNotFound`] if absent.
    async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, GatewayError>;

    /// Deletes an entry; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn remove(&self, id: DeadLetterId) -> Result<bool, GatewayError>;
}

/// Process-local [`DeadLetterStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<HashMap<DeadLetterId, DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, entry: &DeadLetterEntry) -> Result<(), GatewayError> {
        self.entries.lock().await.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn list(
        &self,
        topic: Option<JobTopic>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, GatewayError> {
        let entries = self.entries.lock().await;
        let mut matching: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| topic.is_none_or(|t| e.original_topic == t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, GatewayError> {
        self.entries
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(GatewayError::DeadLetterNotFound(*id.as_uuid()))
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool, GatewayError> {
        Ok(self.entries.lock().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn list_filters_by_topic() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let a = DeadLetterEntry::malformed(JobTopic::Moderation, "x", "bad", now);
        let b = DeadLetterEntry::malformed(JobTopic::Verification, "y", "bad", now);
        assert!(store.insert(&a).await.is_ok());
        assert!(store.insert(&b).await.is_ok());

        let all = store.list(None, 10).await.ok().map(|v| v.len());
        assert_eq!(all, Some(2));
        let only = store.list(Some(JobTopic::Moderation), 10).await.ok();
        assert_eq!(only.map(|v| v.into_iter().map(|e| e.id).collect::<Vec<_>>()), Some(vec![a.id]));

        assert_eq!(store.remove(a.id).await.ok(), Some(true));
        assert!(matches!(
            store.get(a.id).await,
            Err(GatewayError::DeadLetterNotFound(_))
        ));
    }
}

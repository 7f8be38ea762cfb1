//! Durable multi-topic job queue with at-least-once delivery.
//!
//! Each topic is a FIFO list. A dequeued entry moves to an in-flight set
//! until it is acknowledged or handed back with [`JobQueue::nack`]; entries
//! still in flight when a worker dies are put back by
//! [`JobQueue::recover_in_flight`]. Delayed entries wait in a
//! schedule and are promoted once their `not_before` instant has passed.

pub mod memory;
pub mod redis;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, JobTopic};
use crate::error::GatewayError;

pub use memory::InMemoryJobQueue;
pub use redis::RedisJobQueue;

/// Decoded content of a dequeued entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryContent {
    /// A well-formed job.
    Job(Job),
    /// Raw text that failed to decode.
    Malformed {
        /// The entry as stored.
        raw: String,
        /// Decoder error.
        error: String,
    },
}

/// One entry handed to a consumer; must be passed back to [`JobQueue::ack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the entry was taken from.
    pub topic: JobTopic,
    /// Opaque receipt identifying the in-flight entry.
    pub receipt: String,
    /// Decoded job, or the raw text if decoding failed.
    pub content: DeliveryContent,
}

impl Delivery {
    /// Decodes a raw entry taken from `topic`.
    #[must_use]
    pub fn decode(topic: JobTopic, receipt: String, raw: &str) -> Self {
        let content = match serde_json::from_str::<Job>(raw) {
            Ok(job) if job.topic() == topic => DeliveryContent::Job(job),
            Ok(job) => DeliveryContent::Malformed {
                raw: raw.to_string(),
                error: format!("job for topic {} found on {topic}", job.topic()),
            },
            Err(err) => DeliveryContent::Malformed {
                raw: raw.to_string(),
                error: err.to_string(),
            },
        };
        Self {
            topic,
            receipt,
            content,
        }
    }
}

/// Queue consumed by the worker loop.
#[async_trait]
pub trait JobQueue: Send + Sync + Debug {
    /// Appends a job to its topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn enqueue(&self, job: &Job) -> Result<(), GatewayError>;

    /// Schedules a job that must not be dequeued before `not_before`.
    /// A job with a dedupe key replaces any schedule under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn enqueue_at(&self, job: &Job, not_before: DateTime<Utc>) -> Result<(), GatewayError>;

    /// Removes a scheduled job by dedupe key. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn cancel_scheduled(&self, dedupe_key: &str) -> Result<bool, GatewayError>;

    /// Moves scheduled jobs that are due onto their topics.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, GatewayError>;

    /// Waits up to `timeout` for an entry on any of `topics`, checking them
    /// in order. Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn dequeue(
        &self,
        topics: &[JobTopic],
        timeout: Duration,
    ) -> Result<Option<Delivery>, GatewayError>;

    /// Drops a delivered entry from the in-flight set.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn ack(&self, delivery: &Delivery) -> Result<(), GatewayError>;

    /// Puts a delivered entry back at the head of its topic, unchanged.
    /// Used when the outcome of an attempt could not be recorded.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn nack(&self, delivery: &Delivery) -> Result<(), GatewayError>;

    /// Puts in-flight entries abandoned by dead consumers, and this
    /// consumer's own leftovers from a previous run, back at the head of
    /// their topics. Entries held by live peers are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn recover_in_flight(&self) -> Result<usize, GatewayError>;

    /// Number of ready entries on a topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue is unreachable.
    async fn depth(&self, topic: JobTopic) -> Result<usize, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionId;

    #[test]
    fn decode_flags_garbage_and_wrong_topic() {
        let bad = Delivery::decode(JobTopic::Moderation, "r1".to_string(), "{not json");
        assert!(matches!(bad.content, DeliveryContent::Malformed { .. }));

        let now = Utc::now();
        let job = Job::escrow_release(TransactionId::new(), now, now);
        let raw = serde_json::to_string(&job).unwrap_or_default();
        let misplaced = Delivery::decode(JobTopic::Verification, "r2".to_string(), &raw);
        assert!(matches!(misplaced.content, DeliveryContent::Malformed { .. }));

        let ok = Delivery::decode(JobTopic::EscrowRelease, "r3".to_string(), &raw);
        assert_eq!(ok.content, DeliveryContent::Job(job));
    }
}

//! Retry/DLQ Engine: wraps a handler invocation with backoff and the
//! dead-letter path.
//!
//! Retries are durable requeues with a `not_before` delay, so one job's
//! backoff never blocks a consumer that could serve other topics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{BackoffPolicy, DeadLetterStore, JobHandler};
use crate::domain::{Clock, DeadLetterEntry, EventBus, Job, JobTopic, LedgerEvent};
use crate::error::GatewayError;
use crate::queue::JobQueue;

/// What happened to a job after one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Handler succeeded.
    Completed,
    /// Non-retryable failure; logged and dropped without consuming budget.
    Discarded {
        /// Error that ended the job.
        error: String,
    },
    /// Retryable failure; requeued with a delay.
    Requeued {
        /// Failed attempts so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Retry budget exhausted; persisted to the Dead Letter Store.
    DeadLettered(DeadLetterEntry),
}

/// Runs handlers under a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: BackoffPolicy,
    queue: Arc<dyn JobQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl RetryEngine {
    /// Creates an engine that requeues on `queue` and dead-letters into
    /// `dead_letters`.
    #[must_use]
    pub fn new(
        policy: BackoffPolicy,
        queue: Arc<dyn JobQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            queue,
            dead_letters,
            event_bus,
            clock,
        }
    }

    /// Returns the backoff policy.
    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Invokes `handler` once for `job` and applies the retry policy to the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns a queue or storage error if the job could neither be requeued
    /// nor dead-lettered; the caller must then leave the delivery
    /// unacknowledged so it is redelivered.
    pub async fn run(&self, handler: &dyn JobHandler, mut job: Job) -> Result<JobOutcome, GatewayError> {
        let topic = job.topic();
        let err = match handler.handle(&job).await {
            Ok(()) => {
                tracing::info!(topic = %topic, job_id = %job.id, "job completed");
                return Ok(JobOutcome::Completed);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            tracing::warn!(
                topic = %topic,
                job_id = %job.id,
                code = err.error_code(),
                error = %err,
                "non-retryable job failure, discarding"
            );
            return Ok(JobOutcome::Discarded {
                error: err.to_string(),
            });
        }

        let previous = job.attempt_count;
        job.attempt_count = previous.saturating_add(1);
        let now = self.clock.now();

        if self.policy.is_exhausted(job.attempt_count) {
            let entry = DeadLetterEntry::from_job(&job, err.to_string(), now)?;
            self.dead_letter(&entry, now).await?;
            return Ok(JobOutcome::DeadLettered(entry));
        }

        let delay = self.policy.delay(previous);
        let not_before = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.queue.enqueue_at(&job, not_before).await?;
        tracing::warn!(
            topic = %topic,
            job_id = %job.id,
            attempt = job.attempt_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "job failed, retry scheduled"
        );
        Ok(JobOutcome::Requeued {
            attempt: job.attempt_count,
            delay,
        })
    }

    /// Dead-letters a queue entry that could not be decoded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the entry could not be persisted.
    pub async fn reject_malformed(
        &self,
        topic: JobTopic,
        raw: &str,
        error: &str,
    ) -> Result<JobOutcome, GatewayError> {
        let now = self.clock.now();
        let entry = DeadLetterEntry::malformed(topic, raw, format!("malformed payload: {error}"), now);
        self.dead_letter(&entry, now).await?;
        Ok(JobOutcome::DeadLettered(entry))
    }

    async fn dead_letter(&self, entry: &DeadLetterEntry, now: DateTime<Utc>) -> Result<(), GatewayError> {
        self.dead_letters.insert(entry).await?;
        tracing::error!(
            topic = %entry.original_topic,
            entry_id = %entry.id,
            attempt = entry.attempt_count,
            error = %entry.error_message,
            "job dead-lettered"
        );
        let _ = self.event_bus.publish(LedgerEvent::JobDeadLettered {
            entry_id: entry.id,
            topic: entry.original_topic,
            attempt_count: entry.attempt_count,
            timestamp: now,
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, ManualClock, UserId, VerificationJob};
    use crate::queue::InMemoryJobQueue;
    use crate::retry::InMemoryDeadLetterStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Failing {
        error: fn() -> GatewayError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Failing {
        async fn handle(&self, _job: &Job) -> Result<(), GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    fn job(now: DateTime<Utc>) -> Job {
        Job::new(
            JobPayload::Verification(VerificationJob {
                user_id: UserId::new(),
                proof_id: uuid::Uuid::new_v4(),
                proof_url: "https://cdn.example/p.jpg".to_string(),
            }),
            now,
        )
    }

    fn engine() -> (RetryEngine, Arc<InMemoryJobQueue>, Arc<InMemoryDeadLetterStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(InMemoryJobQueue::new(Arc::clone(&clock)));
        let dlq = Arc::new(InMemoryDeadLetterStore::new());
        let engine = RetryEngine::new(
            BackoffPolicy::default(),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&dlq) as Arc<dyn DeadLetterStore>,
            EventBus::new(16),
            clock,
        );
        (engine, queue, dlq)
    }

    #[tokio::test]
    async fn non_retryable_error_is_discarded_without_dlq() {
        let (engine, queue, dlq) = engine();
        let handler = Failing {
            error: || GatewayError::InvalidRequest("bad proof".to_string()),
            calls: AtomicUsize::new(0),
        };
        let outcome = engine.run(&handler, job(Utc::now())).await;
        assert!(matches!(outcome, Ok(JobOutcome::Discarded { .. })));
        assert_eq!(queue.scheduled_len().await, 0);
        assert_eq!(dlq.list(None, 10).await.ok().map(|v| v.len()), Some(0));
    }

    #[tokio::test]
    async fn retryable_error_is_requeued_with_delay() {
        let (engine, queue, _) = engine();
        let handler = Failing {
            error: || GatewayError::ExternalTimeout("classifier".to_string()),
            calls: AtomicUsize::new(0),
        };
        let Ok(JobOutcome::Requeued { attempt, delay }) = engine.run(&handler, job(Utc::now())).await
        else {
            panic!("expected requeue");
        };
        assert_eq!(attempt, 1);
        assert!(delay >= Duration::from_millis(1_000) && delay < Duration::from_millis(1_300));
        assert_eq!(queue.scheduled_len().await, 1);
    }

    #[tokio::test]
    async fn exhausted_job_goes_to_dead_letters() {
        let (engine, _, dlq) = engine();
        let handler = Failing {
            error: || GatewayError::ExternalService {
                status: Some(503),
                message: "unavailable".to_string(),
            },
            calls: AtomicUsize::new(0),
        };
        let mut exhausted = job(Utc::now());
        exhausted.attempt_count = 5;
        let Ok(JobOutcome::DeadLettered(entry)) = engine.run(&handler, exhausted).await else {
            panic!("expected dead letter");
        };
        assert_eq!(entry.attempt_count, 6);
        assert_eq!(entry.original_topic, JobTopic::Verification);
        assert_eq!(dlq.list(None, 10).await.ok().map(|v| v.len()), Some(1));
    }

    #[tokio::test]
    async fn malformed_entry_is_dead_lettered_with_raw_text() {
        let (engine, _, dlq) = engine();
        let outcome = engine
            .reject_malformed(JobTopic::Moderation, "{oops", "expected value")
            .await;
        assert!(matches!(outcome, Ok(JobOutcome::DeadLettered(_))));
        let entries = dlq.list(Some(JobTopic::Moderation), 10).await.unwrap_or_default();
        assert_eq!(
            entries.first().map(|e| e.payload.clone()),
            Some(serde_json::Value::String("{oops".to_string()))
        );
    }
}

//! Job submission and Dead Letter Store administration.

use std::sync::Arc;

use crate::domain::{
    Clock, DeadLetterEntry, DeadLetterId, EmbeddingJob, Job, JobPayload, JobTopic, ModerationJob,
    UserId, VerificationJob,
};
use crate::error::GatewayError;
use crate::queue::JobQueue;
use crate::retry::DeadLetterStore;

/// Producer-side entry point to the job queue.
#[derive(Debug, Clone)]
pub struct JobService {
    queue: Arc<dyn JobQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
}

impl JobService {
    /// Creates a new `JobService`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            clock,
        }
    }

    /// Enqueues a job for immediate processing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue rejects it.
    pub async fn submit(&self, task: JobPayload) -> Result<Job, GatewayError> {
        let job = Job::new(task, self.clock.now());
        self.queue.enqueue(&job).await?;
        tracing::info!(topic = %job.topic(), job_id = %job.id, "job submitted");
        Ok(job)
    }

    /// Queues OCR verification of a student proof.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an empty proof URL.
    pub async fn request_verification(
        &self,
        user_id: UserId,
        proof_id: uuid::Uuid,
        proof_url: impl Into<String>,
    ) -> Result<Job, GatewayError> {
        let proof_url = proof_url.into();
        if proof_url.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "proof_url must not be empty".to_string(),
            ));
        }
        self.submit(JobPayload::Verification(VerificationJob {
            user_id,
            proof_id,
            proof_url,
        }))
        .await
    }

    /// Queues moderation of a post or material.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue rejects it.
    pub async fn request_moderation(&self, job: ModerationJob) -> Result<Job, GatewayError> {
        self.submit(JobPayload::Moderation(job)).await
    }

    /// Queues embedding generation.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the queue rejects it.
    pub async fn request_embedding(&self, job: EmbeddingJob) -> Result<Job, GatewayError> {
        self.submit(JobPayload::Recommendation(job)).await
    }

    /// Ready-list depth per topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] on queue failure.
    pub async fn depths(&self) -> Result<Vec<(JobTopic, usize)>, GatewayError> {
        let mut depths = Vec::with_capacity(JobTopic::ALL.len());
        for topic in JobTopic::ALL {
            depths.push((topic, self.queue.depth(topic).await?));
        }
        Ok(depths)
    }

    /// Lists dead letters, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    pub async fn dead_letters(
        &self,
        topic: Option<JobTopic>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, GatewayError> {
        self.dead_letters.list(topic, limit).await
    }

    /// Re-enqueues a dead letter with a fresh retry budget, then deletes it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeadLetterNotFound`], or
    /// [`GatewayError::InvalidRequest`] when the stored payload cannot be
    /// decoded into a job.
    pub async fn retry_dead_letter(&self, id: DeadLetterId) -> Result<Job, GatewayError> {
        let entry = self.dead_letters.get(id).await?;
        let task: JobPayload = serde_json::from_value(entry.payload.clone()).map_err(|e| {
            GatewayError::InvalidRequest(format!("dead letter {id} cannot be replayed: {e}"))
        })?;
        if task.topic() != entry.original_topic {
            return Err(GatewayError::InvalidRequest(format!(
                "dead letter {id} payload does not match topic {}",
                entry.original_topic
            )));
        }
        let job = self.submit(task).await?;
        self.dead_letters.remove(id).await?;
        tracing::info!(entry_id = %id, job_id = %job.id, "dead letter re-enqueued");
        Ok(job)
    }

    /// Deletes a dead letter without replaying it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeadLetterNotFound`] if it does not exist.
    pub async fn discard_dead_letter(&self, id: DeadLetterId) -> Result<(), GatewayError> {
        if !self.dead_letters.remove(id).await? {
            return Err(GatewayError::DeadLetterNotFound(*id.as_uuid()));
        }
        tracing::info!(entry_id = %id, "dead letter discarded");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::SystemClock;
    use crate::queue::InMemoryJobQueue;
    use crate::retry::InMemoryDeadLetterStore;
    use chrono::Utc;

    fn service() -> (JobService, Arc<InMemoryJobQueue>, Arc<InMemoryDeadLetterStore>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(InMemoryJobQueue::new(Arc::clone(&clock)));
        let dlq = Arc::new(InMemoryDeadLetterStore::new());
        let service = JobService::new(
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&dlq) as Arc<dyn DeadLetterStore>,
            clock,
        );
        (service, queue, dlq)
    }

    #[tokio::test]
    async fn retry_requeues_with_fresh_budget_and_deletes_entry() {
        let (service, queue, dlq) = service();
        let mut job = Job::new(
            JobPayload::Moderation(ModerationJob::Post {
                post_id: uuid::Uuid::new_v4(),
                content: "hello".to_string(),
            }),
            Utc::now(),
        );
        job.attempt_count = 6;
        let Ok(entry) = DeadLetterEntry::from_job(&job, "classifier down", Utc::now()) else {
            panic!("entry");
        };
        assert!(dlq.insert(&entry).await.is_ok());

        let Ok(replayed) = service.retry_dead_letter(entry.id).await else {
            panic!("retry failed");
        };
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.task, job.task);
        assert_eq!(queue.depth(JobTopic::Moderation).await.ok(), Some(1));
        assert!(matches!(
            dlq.get(entry.id).await,
            Err(GatewayError::DeadLetterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_entry_cannot_be_replayed() {
        let (service, _, dlq) = service();
        let entry = DeadLetterEntry::malformed(JobTopic::Verification, "{not json", "bad", Utc::now());
        assert!(dlq.insert(&entry).await.is_ok());
        assert!(matches!(
            service.retry_dead_letter(entry.id).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(service.discard_dead_letter(entry.id).await.is_ok());
        assert!(matches!(
            service.discard_dead_letter(entry.id).await,
            Err(GatewayError::DeadLetterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_proof_url_is_rejected() {
        let (service, _, _) = service();
        let result = service
            .request_verification(UserId::new(), uuid::Uuid::new_v4(), "  ")
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }
}

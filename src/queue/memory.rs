//! In-process job queue with the same delivery semantics as the Redis one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Delivery, JobQueue};
use crate::domain::{Clock, Job, JobTopic};
use crate::error::GatewayError;

/// How often a waiting consumer re-checks the schedule.
const SCHEDULE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Scheduled {
    not_before: DateTime<Utc>,
    topic: JobTopic,
    raw: String,
    dedupe_key: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: HashMap<JobTopic, VecDeque<String>>,
    scheduled: Vec<Scheduled>,
    in_flight: HashMap<String, (JobTopic, String)>,
}

/// Process-local [`JobQueue`] backed by in-memory lists.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    /// Creates an empty queue reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Appends raw text to a topic, bypassing encoding.
    pub async fn push_raw(&self, topic: JobTopic, raw: impl Into<String>) {
        self.state
            .lock()
            .await
            .ready
            .entry(topic)
            .or_default()
            .push_back(raw.into());
        self.notify.notify_one();
    }

    /// Number of jobs waiting in the schedule.
    pub async fn scheduled_len(&self) -> usize {
        self.state.lock().await.scheduled.len()
    }

    /// Earliest `not_before` among scheduled jobs for `dedupe_key`.
    pub async fn scheduled_at(&self, dedupe_key: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .scheduled
            .iter()
            .filter(|s| s.dedupe_key.as_deref() == Some(dedupe_key))
            .map(|s| s.not_before)
            .min()
    }

    /// Number of delivered but unacknowledged entries.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn try_take(&self, topics: &[JobTopic]) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        for topic in topics {
            let Some(raw) = state.ready.get_mut(topic).and_then(VecDeque::pop_front) else {
                continue;
            };
            let receipt = uuid::Uuid::new_v4().to_string();
            let delivery = Delivery::decode(*topic, receipt.clone(), &raw);
            state.in_flight.insert(receipt, (*topic, raw));
            return Some(delivery);
        }
        None
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), GatewayError> {
        let raw = serde_json::to_string(job)?;
        self.push_raw(job.topic(), raw).await;
        Ok(())
    }

    async fn enqueue_at(&self, job: &Job, not_before: DateTime<Utc>) -> Result<(), GatewayError> {
        let raw = serde_json::to_string(job)?;
        let mut state = self.state.lock().await;
        if let Some(key) = &job.dedupe_key {
            state
                .scheduled
                .retain(|s| s.dedupe_key.as_ref() != Some(key));
        }
        state.scheduled.push(Scheduled {
            not_before,
            topic: job.topic(),
            raw,
            dedupe_key: job.dedupe_key.clone(),
        });
        Ok(())
    }

    async fn cancel_scheduled(&self, dedupe_key: &str) -> Result<bool, GatewayError> {
        let mut state = self.state.lock().await;
        let before = state.scheduled.len();
        state
            .scheduled
            .retain(|s| s.dedupe_key.as_deref() != Some(dedupe_key));
        Ok(state.scheduled.len() != before)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, GatewayError> {
        let mut state = self.state.lock().await;
        let (mut due, waiting): (Vec<Scheduled>, Vec<Scheduled>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|s| s.not_before <= now);
        state.scheduled = waiting;
        due.sort_by_key(|s| s.not_before);
        let promoted = due.len();
        for entry in due {
            state
                .ready
                .entry(entry.topic)
                .or_default()
                .push_back(entry.raw);
        }
        drop(state);
        if promoted > 0 {
            self.notify.notify_one();
        }
        Ok(promoted)
    }

    async fn dequeue(
        &self,
        topics: &[JobTopic],
        timeout: Duration,
    ) -> Result<Option<Delivery>, GatewayError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.promote_due(self.clock.now()).await?;
            if let Some(delivery) = self.try_take(topics).await {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(SCHEDULE_POLL);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), GatewayError> {
        self.state.lock().await.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let Some((topic, raw)) = state.in_flight.remove(&delivery.receipt) else {
            return Ok(());
        };
        state.ready.entry(topic).or_default().push_front(raw);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    // An in-process queue has a single worker, so everything in flight is
    // its own.
    async fn recover_in_flight(&self) -> Result<usize, GatewayError> {
        let mut state = self.state.lock().await;
        let entries: Vec<(JobTopic, String)> = state.in_flight.drain().map(|(_, e)| e).collect();
        let recovered = entries.len();
        for (topic, raw) in entries {
            state.ready.entry(topic).or_default().push_front(raw);
        }
        drop(state);
        if recovered > 0 {
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn depth(&self, topic: JobTopic) -> Result<usize, GatewayError> {
        Ok(self
            .state
            .lock()
            .await
            .ready
            .get(&topic)
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, ManualClock, TransactionId, VerificationJob, UserId};
    use crate::queue::DeliveryContent;

    fn verification_job(now: DateTime<Utc>) -> Job {
        Job::new(
            JobPayload::Verification(VerificationJob {
                user_id: UserId::new(),
                proof_id: uuid::Uuid::new_v4(),
                proof_url: "https://cdn.example/proof.jpg".to_string(),
            }),
            now,
        )
    }

    fn queue() -> (Arc<ManualClock>, InMemoryJobQueue) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = InMemoryJobQueue::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, queue)
    }

    #[tokio::test]
    async fn fifo_within_topic() {
        let (clock, queue) = queue();
        let first = verification_job(clock.now());
        let second = verification_job(clock.now());
        assert!(queue.enqueue(&first).await.is_ok());
        assert!(queue.enqueue(&second).await.is_ok());

        for expected in [first, second] {
            let Ok(Some(delivery)) = queue
                .dequeue(&[JobTopic::Verification], Duration::from_millis(10))
                .await
            else {
                panic!("expected a delivery");
            };
            assert_eq!(delivery.content, DeliveryContent::Job(expected));
        }
    }

    #[tokio::test]
    async fn delayed_job_waits_for_not_before() {
        let (clock, queue) = queue();
        let now = clock.now();
        let job = Job::escrow_release(TransactionId::new(), now, now);
        assert!(
            queue
                .enqueue_at(&job, now + chrono::Duration::days(3))
                .await
                .is_ok()
        );

        let early = queue
            .dequeue(&[JobTopic::EscrowRelease], Duration::from_millis(20))
            .await;
        assert!(matches!(early, Ok(None)));

        clock.advance(chrono::Duration::days(3));
        let due = queue
            .dequeue(&[JobTopic::EscrowRelease], Duration::from_millis(20))
            .await;
        assert!(matches!(due, Ok(Some(_))));
    }

    #[tokio::test]
    async fn cancel_removes_schedule_by_key() {
        let (clock, queue) = queue();
        let now = clock.now();
        let tx = TransactionId::new();
        let job = Job::escrow_release(tx, now, now);
        assert!(queue.enqueue_at(&job, now).await.is_ok());
        // rescheduling replaces rather than duplicates
        assert!(queue.enqueue_at(&job, now).await.is_ok());
        assert_eq!(queue.scheduled_len().await, 1);

        let key = crate::domain::escrow_release_key(tx);
        assert_eq!(queue.cancel_scheduled(&key).await.ok(), Some(true));
        assert_eq!(queue.cancel_scheduled(&key).await.ok(), Some(false));
        assert_eq!(queue.promote_due(now).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered_after_recovery() {
        let (clock, queue) = queue();
        let job = verification_job(clock.now());
        assert!(queue.enqueue(&job).await.is_ok());

        let taken = queue
            .dequeue(&[JobTopic::Verification], Duration::from_millis(10))
            .await;
        assert!(matches!(taken, Ok(Some(_))));
        assert_eq!(queue.depth(JobTopic::Verification).await.ok(), Some(0));

        assert_eq!(queue.recover_in_flight().await.ok(), Some(1));
        let Ok(Some(again)) = queue
            .dequeue(&[JobTopic::Verification], Duration::from_millis(10))
            .await
        else {
            panic!("entry should be redelivered");
        };
        assert!(queue.ack(&again).await.is_ok());
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(queue.recover_in_flight().await.ok(), Some(0));
    }

    #[tokio::test]
    async fn nacked_entry_returns_to_the_head_of_its_topic() {
        let (clock, queue) = queue();
        let first = verification_job(clock.now());
        let second = verification_job(clock.now());
        assert!(queue.enqueue(&first).await.is_ok());
        assert!(queue.enqueue(&second).await.is_ok());

        let Ok(Some(taken)) = queue
            .dequeue(&[JobTopic::Verification], Duration::from_millis(10))
            .await
        else {
            panic!("expected a delivery");
        };
        assert!(queue.nack(&taken).await.is_ok());
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(queue.depth(JobTopic::Verification).await.ok(), Some(2));

        let Ok(Some(again)) = queue
            .dequeue(&[JobTopic::Verification], Duration::from_millis(10))
            .await
        else {
            panic!("nacked entry should be redelivered");
        };
        assert_eq!(again.content, DeliveryContent::Job(first));
        // a second nack of a stale receipt is a no-op
        assert!(queue.nack(&taken).await.is_ok());
        assert_eq!(queue.depth(JobTopic::Verification).await.ok(), Some(1));
    }

    #[tokio::test]
    async fn blocked_consumer_wakes_on_enqueue() {
        let (clock, queue) = queue();
        let queue = Arc::new(queue);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .dequeue(&[JobTopic::Verification], Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.enqueue(&verification_job(clock.now())).await.is_ok());

        let Ok(Ok(Some(_))) = consumer.await else {
            panic!("consumer should receive the job");
        };
    }
}

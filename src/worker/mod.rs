//! Worker Loop: consumes the job queue, rate-limits and dispatches jobs
//! through the Retry/DLQ Engine, and runs the periodic escrow scan and
//! maintenance (expired idempotency records, old verification proofs).

pub mod capability;
pub mod content;
pub mod handlers;
pub mod rate_limit;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Clock, JobTopic};
use crate::error::GatewayError;
use crate::idempotency::IdempotencyStore;
use crate::queue::{DeliveryContent, JobQueue};
use crate::retry::{JobHandler, JobOutcome, RetryEngine};
use crate::service::EscrowService;

pub use capability::{
    Classification, Classifier, Embedder, ExtractedFields, Extractor, HttpCapabilityClient,
    UnconfiguredCapability,
};
pub use content::{ContentStore, InMemoryContentStore, ModerationStatus, VerificationDecision};
pub use handlers::{
    EscrowReleaseHandler, JobDispatcher, ModerationHandler, RecommendationHandler,
    VerificationHandler,
};
pub use rate_limit::JobRateLimiter;

/// Pause after a queue failure before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker loop timing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Consumer tasks pulling from the queue.
    pub concurrency: usize,
    /// Blocking-pop timeout; also bounds shutdown latency.
    pub dequeue_timeout: Duration,
    /// Period of the authoritative escrow release scan.
    pub escrow_poll_interval: Duration,
    /// Maximum releases enqueued per scan.
    pub escrow_poll_batch: u32,
    /// Period of the maintenance purge.
    pub maintenance_interval: Duration,
    /// Age after which verification proofs are deleted.
    pub proof_retention: chrono::Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            dequeue_timeout: Duration::from_secs(5),
            escrow_poll_interval: Duration::from_secs(60),
            escrow_poll_batch: 100,
            maintenance_interval: Duration::from_secs(3_600),
            proof_retention: chrono::Duration::days(30),
        }
    }
}

/// Running totals of job outcomes.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    discarded: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Jobs whose handler succeeded.
    pub completed: u64,
    /// Jobs dropped on a non-retryable error.
    pub discarded: u64,
    /// Retries scheduled.
    pub requeued: u64,
    /// Jobs moved to the Dead Letter Store.
    pub dead_lettered: u64,
}

impl WorkerStats {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::Discarded { .. } => &self.discarded,
            JobOutcome::Requeued { .. } => &self.requeued,
            JobOutcome::DeadLettered(_) => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Single logical consumer of all job topics.
#[derive(Debug)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    engine: RetryEngine,
    handler: Arc<dyn JobHandler>,
    limiter: JobRateLimiter,
    escrow: EscrowService,
    idempotency: Arc<dyn IdempotencyStore>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    stats: WorkerStats,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: RetryEngine,
        handler: Arc<dyn JobHandler>,
        limiter: JobRateLimiter,
        escrow: EscrowService,
        idempotency: Arc<dyn IdempotencyStore>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            engine,
            handler,
            limiter,
            escrow,
            idempotency,
            content,
            clock,
            settings,
            stats: WorkerStats::default(),
        }
    }

    /// Outcome counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Takes one entry off the queue and runs it. Returns `None` when the
    /// dequeue timed out.
    ///
    /// The entry is acknowledged only once its outcome is durable. If the
    /// engine fails to record the outcome, the entry is handed back to its
    /// topic unchanged and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns a queue or storage failure.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, GatewayError> {
        let Some(delivery) = self
            .queue
            .dequeue(&JobTopic::ALL, self.settings.dequeue_timeout)
            .await?
        else {
            return Ok(None);
        };

        let result = match &delivery.content {
            DeliveryContent::Job(job) => {
                self.limiter.acquire().await;
                tracing::debug!(topic = %delivery.topic, job_id = %job.id, attempt = job.attempt_count, "job started");
                self.engine.run(self.handler.as_ref(), job.clone()).await
            }
            DeliveryContent::Malformed { raw, error } => {
                tracing::warn!(topic = %delivery.topic, error, "malformed queue entry");
                self.engine.reject_malformed(delivery.topic, raw, error).await
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(nack_err) = self.queue.nack(&delivery).await {
                    tracing::error!(topic = %delivery.topic, error = %nack_err, "failed to return entry to its topic");
                }
                return Err(err);
            }
        };
        self.queue.ack(&delivery).await?;
        self.stats.record(&outcome);
        Ok(Some(outcome))
    }

    /// Enqueues release jobs for elapsed escrows.
    ///
    /// # Errors
    ///
    /// Returns a ledger or queue failure.
    pub async fn poll_due_escrows(&self) -> Result<usize, GatewayError> {
        self.escrow
            .enqueue_due_releases(self.settings.escrow_poll_batch)
            .await
    }

    /// Purges expired idempotency records and verification proofs older
    /// than the retention period. Returns the two counts in that order.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    pub async fn maintenance(&self) -> Result<(u64, u64), GatewayError> {
        let now = self.clock.now();
        let purged = self.idempotency.purge_expired(now).await?;
        if purged > 0 {
            tracing::info!(purged, "expired idempotency records purged");
        }
        let proofs = self
            .content
            .purge_verification_proofs(now - self.settings.proof_retention)
            .await?;
        if proofs > 0 {
            tracing::info!(proofs, "old verification proofs deleted");
        }
        Ok((purged, proofs))
    }

    /// Puts entries left in flight by a previous run back on their topics.
    ///
    /// # Errors
    ///
    /// Returns a queue failure.
    pub async fn recover(&self) -> Result<usize, GatewayError> {
        let recovered = self.queue.recover_in_flight().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "in-flight jobs re-queued after restart");
        }
        Ok(recovered)
    }

    /// Recovers in-flight jobs, then spawns the consumers, the escrow
    /// poller and the maintenance task. All stop once `shutdown` is `true`.
    ///
    /// # Errors
    ///
    /// Returns a queue failure from recovery.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, GatewayError> {
        self.recover().await?;
        tracing::info!(
            concurrency = self.settings.concurrency,
            rate_per_sec = self.limiter.rate(),
            "worker started"
        );

        let mut handles = Vec::with_capacity(self.settings.concurrency.max(1) + 2);
        for consumer in 0..self.settings.concurrency.max(1) {
            let worker = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.consume(consumer, shutdown).await;
            }));
        }

        let worker = Arc::clone(self);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let period = worker.settings.escrow_poll_interval;
            run_every(period, rx, move || {
                let worker = Arc::clone(&worker);
                async move {
                    if let Err(err) = worker.poll_due_escrows().await {
                        tracing::error!(error = %err, "escrow poll failed");
                    }
                }
            })
            .await;
        }));

        let worker = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let period = worker.settings.maintenance_interval;
            run_every(period, shutdown, move || {
                let worker = Arc::clone(&worker);
                async move {
                    if let Err(err) = worker.maintenance().await {
                        tracing::error!(error = %err, "maintenance failed");
                    }
                }
            })
            .await;
        }));

        Ok(handles)
    }

    async fn consume(&self, consumer: usize, shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            if let Err(err) = self.process_next().await {
                tracing::error!(consumer, error = %err, "job processing failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
        tracing::info!(consumer, "consumer stopped");
    }
}

async fn run_every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

//! Topic-specific job handlers and the dispatcher routing jobs to them.
//!
//! Each handler writes absolute final state, so processing the same
//! payload twice converges on the same result.

use std::sync::Arc;

use async_trait::async_trait;

use super::capability::{Classifier, Embedder, ExtractedFields, Extractor};
use super::content::{ContentStore, ModerationStatus, VerificationDecision};
use crate::domain::{
    Clock, EmbeddingJob, EscrowReleaseJob, EventBus, Job, JobPayload, LedgerEvent, ModerationJob,
    VerificationJob,
};
use crate::error::GatewayError;
use crate::ledger::ReleaseOutcome;
use crate::retry::JobHandler;
use crate::service::EscrowService;

/// Toxicity above which content is rejected.
pub const TOXICITY_THRESHOLD: f64 = 0.5;

/// Reason stored on proofs whose fields could not be validated.
pub const REJECTION_REASON: &str = "could not extract valid student information";

/// Whether `code` matches `^[A-Za-z0-9]{6,12}$`.
#[must_use]
pub fn is_valid_student_code(code: &str) -> bool {
    (6..=12).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Approves when the code is well formed and a name was read.
#[must_use]
pub fn decide(job: &VerificationJob, fields: ExtractedFields) -> VerificationDecision {
    let code_ok = fields
        .student_code
        .as_deref()
        .is_some_and(is_valid_student_code);
    let name_ok = fields
        .full_name
        .as_deref()
        .is_some_and(|n| !n.trim().is_empty());
    if code_ok && name_ok {
        VerificationDecision::Approved {
            user_id: job.user_id,
            proof_id: job.proof_id,
            fields,
        }
    } else {
        VerificationDecision::Rejected {
            user_id: job.user_id,
            proof_id: job.proof_id,
            reason: REJECTION_REASON.to_string(),
            fields,
        }
    }
}

/// `verification`: OCR the proof, validate, update the user.
#[derive(Debug, Clone)]
pub struct VerificationHandler {
    extractor: Arc<dyn Extractor>,
    content: Arc<dyn ContentStore>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl VerificationHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        extractor: Arc<dyn Extractor>,
        content: Arc<dyn ContentStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            extractor,
            content,
            event_bus,
            clock,
        }
    }

    /// Processes one proof.
    ///
    /// # Errors
    ///
    /// Propagates extractor and storage failures.
    pub async fn handle(&self, job: &VerificationJob) -> Result<(), GatewayError> {
        let fields = self.extractor.extract(&job.proof_url).await?;
        let decision = decide(job, fields);
        let now = self.clock.now();
        self.content.apply_verification(&decision, now).await?;

        let event = match &decision {
            VerificationDecision::Approved { .. } => {
                tracing::info!(user_id = %job.user_id, proof_id = %job.proof_id, "verification approved");
                LedgerEvent::VerificationApproved {
                    user_id: job.user_id,
                    proof_id: job.proof_id,
                    timestamp: now,
                }
            }
            VerificationDecision::Rejected { reason, .. } => {
                tracing::info!(user_id = %job.user_id, proof_id = %job.proof_id, reason, "verification rejected");
                LedgerEvent::VerificationRejected {
                    user_id: job.user_id,
                    proof_id: job.proof_id,
                    reason: reason.clone(),
                    timestamp: now,
                }
            }
        };
        let _ = self.event_bus.publish(event);
        Ok(())
    }
}

/// `moderation`: classify text and set `ai_status`.
#[derive(Debug, Clone)]
pub struct ModerationHandler {
    classifier: Arc<dyn Classifier>,
    content: Arc<dyn ContentStore>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl ModerationHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        content: Arc<dyn ContentStore>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            classifier,
            content,
            event_bus,
            clock,
        }
    }

    /// Processes one moderation request.
    ///
    /// # Errors
    ///
    /// Propagates classifier and storage failures;
    /// [`GatewayError::MalformedExternalResponse`] for scores outside `[0, 1]`.
    pub async fn handle(&self, job: &ModerationJob) -> Result<(), GatewayError> {
        let verdict = self.classifier.classify(job.content()).await?;
        if !(0.0..=1.0).contains(&verdict.toxicity) {
            return Err(GatewayError::MalformedExternalResponse(format!(
                "toxicity {} out of range",
                verdict.toxicity
            )));
        }
        let approved = verdict.toxicity <= TOXICITY_THRESHOLD;
        let status = if approved {
            ModerationStatus::Approved
        } else {
            ModerationStatus::Rejected
        };
        let target = job.target();
        let now = self.clock.now();
        let owner_id = self.content.set_moderation(target, status, now).await?;
        tracing::info!(content = %target, toxicity = verdict.toxicity, status = status.as_str(), "content moderated");
        let _ = self.event_bus.publish(LedgerEvent::ContentModerated {
            content: target,
            owner_id,
            approved,
            timestamp: now,
        });
        Ok(())
    }
}

/// `recommendation`: compute and store an embedding.
#[derive(Debug, Clone)]
pub struct RecommendationHandler {
    embedder: Arc<dyn Embedder>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
}

impl RecommendationHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            embedder,
            content,
            clock,
        }
    }

    /// Processes one embedding request.
    ///
    /// # Errors
    ///
    /// Propagates embedder and storage failures.
    pub async fn handle(&self, job: &EmbeddingJob) -> Result<(), GatewayError> {
        let vector = self.embedder.embed(job.content()).await?;
        let target = job.target();
        self.content
            .store_embedding(target, &vector, self.clock.now())
            .await?;
        tracing::info!(content = %target, dimensions = vector.len(), "embedding stored");
        Ok(())
    }
}

/// `escrow_release`: delegate to the Escrow Manager.
#[derive(Debug, Clone)]
pub struct EscrowReleaseHandler {
    escrow: EscrowService,
}

impl EscrowReleaseHandler {
    /// Creates the handler.
    #[must_use]
    pub const fn new(escrow: EscrowService) -> Self {
        Self { escrow }
    }

    /// Releases one transaction. Settled or not-yet-due transactions are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ActiveDisputeBlocksRelease`] while a dispute
    /// is open, or a ledger failure.
    pub async fn handle(&self, job: &EscrowReleaseJob) -> Result<(), GatewayError> {
        match self.escrow.release_escrow(job.transaction_id).await? {
            ReleaseOutcome::Released(_) | ReleaseOutcome::AlreadySettled(_) => Ok(()),
            ReleaseOutcome::NotYetDue(at) => {
                tracing::debug!(
                    transaction_id = %job.transaction_id,
                    release_at = %at,
                    "release job fired early, poller will pick it up"
                );
                Ok(())
            }
        }
    }
}

/// Routes a [`Job`] to its topic's handler.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    verification: VerificationHandler,
    moderation: ModerationHandler,
    recommendation: RecommendationHandler,
    escrow_release: EscrowReleaseHandler,
}

impl JobDispatcher {
    /// Creates a dispatcher over the four handlers.
    #[must_use]
    pub const fn new(
        verification: VerificationHandler,
        moderation: ModerationHandler,
        recommendation: RecommendationHandler,
        escrow_release: EscrowReleaseHandler,
    ) -> Self {
        Self {
            verification,
            moderation,
            recommendation,
            escrow_release,
        }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &Job) -> Result<(), GatewayError> {
        match &job.task {
            JobPayload::Verification(task) => self.verification.handle(task).await,
            JobPayload::Moderation(task) => self.moderation.handle(task).await,
            JobPayload::Recommendation(task) => self.recommendation.handle(task).await,
            JobPayload::EscrowRelease(task) => self.escrow_release.handle(task).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{ContentRef, SystemClock, UserId};
    use crate::worker::capability::Classification;
    use crate::worker::content::InMemoryContentStore;

    #[derive(Debug)]
    struct FixedClassifier(f64);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _content: &str) -> Result<Classification, GatewayError> {
            Ok(Classification {
                toxicity: self.0,
                labels: Vec::new(),
            })
        }
    }

    fn job() -> VerificationJob {
        VerificationJob {
            user_id: UserId::new(),
            proof_id: uuid::Uuid::new_v4(),
            proof_url: "https://cdn.example/card.jpg".to_string(),
        }
    }

    #[test]
    fn student_code_format() {
        assert!(is_valid_student_code("SV2024"));
        assert!(is_valid_student_code("abcDEF123456"));
        assert!(!is_valid_student_code("SV202"));
        assert!(!is_valid_student_code("abcDEF1234567"));
        assert!(!is_valid_student_code("SV-2024"));
        assert!(!is_valid_student_code("SV2024é"));
    }

    #[test]
    fn missing_name_rejects() {
        let decision = decide(
            &job(),
            ExtractedFields {
                student_code: Some("20123456".to_string()),
                full_name: Some("   ".to_string()),
                school: None,
            },
        );
        assert!(matches!(decision, VerificationDecision::Rejected { .. }));
    }

    #[test]
    fn valid_fields_approve() {
        let decision = decide(
            &job(),
            ExtractedFields {
                student_code: Some("20123456".to_string()),
                full_name: Some("Nguyen Van A".to_string()),
                school: Some("HUST".to_string()),
            },
        );
        assert!(matches!(decision, VerificationDecision::Approved { .. }));
    }

    #[tokio::test]
    async fn toxicity_threshold_is_exclusive() {
        let store = Arc::new(InMemoryContentStore::new());
        for (score, expected) in [
            (0.5, ModerationStatus::Approved),
            (0.51, ModerationStatus::Rejected),
        ] {
            let handler = ModerationHandler::new(
                Arc::new(FixedClassifier(score)),
                Arc::clone(&store) as Arc<dyn ContentStore>,
                EventBus::new(4),
                Arc::new(SystemClock),
            );
            let post_id = uuid::Uuid::new_v4();
            let task = ModerationJob::Post {
                post_id,
                content: "text".to_string(),
            };
            assert!(handler.handle(&task).await.is_ok());
            assert_eq!(store.moderation(ContentRef::Post(post_id)).await, expected);
        }
    }

    #[tokio::test]
    async fn out_of_range_score_is_malformed() {
        let handler = ModerationHandler::new(
            Arc::new(FixedClassifier(1.7)),
            Arc::new(InMemoryContentStore::new()),
            EventBus::new(4),
            Arc::new(SystemClock),
        );
        let task = ModerationJob::Material {
            material_id: uuid::Uuid::new_v4(),
            content: "text".to_string(),
        };
        assert!(matches!(
            handler.handle(&task).await,
            Err(GatewayError::MalformedExternalResponse(_))
        ));
    }

    #[tokio::test]
    async fn missing_capability_service_discards_instead_of_dead_lettering() {
        use crate::domain::JobTopic;
        use crate::ledger::InMemoryLedger;
        use crate::queue::{InMemoryJobQueue, JobQueue};
        use crate::retry::{BackoffPolicy, DeadLetterStore, InMemoryDeadLetterStore, JobOutcome, RetryEngine};
        use crate::service::EscrowSettings;
        use crate::worker::capability::UnconfiguredCapability;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(Arc::clone(&clock)));
        let dlq = Arc::new(InMemoryDeadLetterStore::new());
        let store: Arc<dyn ContentStore> = Arc::new(InMemoryContentStore::new());
        let bus = EventBus::new(4);
        let escrow = EscrowService::new(
            Arc::new(InMemoryLedger::new()),
            Arc::clone(&queue),
            bus.clone(),
            Arc::clone(&clock),
            EscrowSettings::default(),
        );
        let capability = Arc::new(UnconfiguredCapability);
        let dispatcher = JobDispatcher::new(
            VerificationHandler::new(
                Arc::clone(&capability) as Arc<dyn Extractor>,
                Arc::clone(&store),
                bus.clone(),
                Arc::clone(&clock),
            ),
            ModerationHandler::new(
                Arc::clone(&capability) as Arc<dyn Classifier>,
                Arc::clone(&store),
                bus.clone(),
                Arc::clone(&clock),
            ),
            RecommendationHandler::new(capability, store, Arc::clone(&clock)),
            EscrowReleaseHandler::new(escrow),
        );
        let engine = RetryEngine::new(
            BackoffPolicy::default(),
            Arc::clone(&queue),
            Arc::clone(&dlq) as Arc<dyn DeadLetterStore>,
            bus,
            Arc::clone(&clock),
        );

        let job = Job::new(
            JobPayload::Moderation(ModerationJob::Post {
                post_id: uuid::Uuid::new_v4(),
                content: "text".to_string(),
            }),
            clock.now(),
        );
        let outcome = engine.run(&dispatcher, job).await;
        assert!(matches!(outcome, Ok(JobOutcome::Discarded { .. })));
        assert_eq!(dlq.list(None, 10).await.ok().map(|v| v.len()), Some(0));
        assert_eq!(queue.depth(JobTopic::Moderation).await.ok(), Some(0));
    }
}

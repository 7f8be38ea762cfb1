//! Units of deferred work and their per-topic payloads.
//!
//! Each topic owns one variant of the closed [`JobPayload`] sum type, so
//! handler dispatch is a `match` rather than field probing on raw JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{JobId, TransactionId, UserId};
use crate::error::GatewayError;

/// Named queue a job travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobTopic {
    /// Student-proof extraction and trust update.
    Verification,
    /// Toxicity classification of posts and materials.
    Moderation,
    /// Embedding generation for recommendations.
    Recommendation,
    /// Delayed escrow release.
    EscrowRelease,
}

impl JobTopic {
    /// Every topic, in the order the worker polls them.
    pub const ALL: [Self; 4] = [
        Self::EscrowRelease,
        Self::Verification,
        Self::Moderation,
        Self::Recommendation,
    ];

    /// Queue name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Moderation => "moderation",
            Self::Recommendation => "recommendation",
            Self::EscrowRelease => "escrow_release",
        }
    }
}

impl fmt::Display for JobTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTopic {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verification" => Ok(Self::Verification),
            "moderation" => Ok(Self::Moderation),
            "recommendation" => Ok(Self::Recommendation),
            "escrow_release" => Ok(Self::EscrowRelease),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown job topic: {other}"
            ))),
        }
    }
}

/// Content a moderation or embedding job refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ContentRef {
    /// Marketplace material.
    Material(uuid::Uuid),
    /// Feed post.
    Post(uuid::Uuid),
    /// Job listing.
    Job(uuid::Uuid),
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Material(id) => write!(f, "material:{id}"),
            Self::Post(id) => write!(f, "post:{id}"),
            Self::Job(id) => write!(f, "job:{id}"),
        }
    }
}

/// `verification` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VerificationJob {
    /// User whose proof is checked.
    pub user_id: UserId,
    /// Uploaded proof record.
    pub proof_id: uuid::Uuid,
    /// Where the proof image can be fetched.
    pub proof_url: String,
}

/// `moderation` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModerationJob {
    /// Check a material description.
    Material {
        /// Material identifier.
        material_id: uuid::Uuid,
        /// Text to classify.
        content: String,
    },
    /// Check a post body.
    Post {
        /// Post identifier.
        post_id: uuid::Uuid,
        /// Text to classify.
        content: String,
    },
}

impl ModerationJob {
    /// Entity receiving the verdict.
    #[must_use]
    pub const fn target(&self) -> ContentRef {
        match self {
            Self::Material { material_id, .. } => ContentRef::Material(*material_id),
            Self::Post { post_id, .. } => ContentRef::Post(*post_id),
        }
    }

    /// Text to classify.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Material { content, .. } | Self::Post { content, .. } => content,
        }
    }
}

/// `recommendation` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingJob {
    /// Embed a material.
    MaterialEmbedding {
        /// Material identifier.
        material_id: uuid::Uuid,
        /// Text to embed.
        content: String,
    },
    /// Embed a job listing.
    JobEmbedding {
        /// Job listing identifier.
        job_id: uuid::Uuid,
        /// Text to embed.
        content: String,
    },
    /// Embed a post.
    PostEmbedding {
        /// Post identifier.
        post_id: uuid::Uuid,
        /// Text to embed.
        content: String,
    },
}

impl EmbeddingJob {
    /// Entity the vector is stored on.
    #[must_use]
    pub const fn target(&self) -> ContentRef {
        match self {
            Self::MaterialEmbedding { material_id, .. } => ContentRef::Material(*material_id),
            Self::JobEmbedding { job_id, .. } => ContentRef::Job(*job_id),
            Self::PostEmbedding { post_id, .. } => ContentRef::Post(*post_id),
        }
    }

    /// Text to embed.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::MaterialEmbedding { content, .. }
            | Self::JobEmbedding { content, .. }
            | Self::PostEmbedding { content, .. } => content,
        }
    }
}

/// `escrow_release` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EscrowReleaseJob {
    /// Transaction to release.
    pub transaction_id: TransactionId,
    /// Release instant the job was scheduled for.
    pub scheduled_at: DateTime<Utc>,
}

/// Topic-tagged payload: `{"topic": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    /// See [`VerificationJob`].
    Verification(VerificationJob),
    /// See [`ModerationJob`].
    Moderation(ModerationJob),
    /// See [`EmbeddingJob`].
    Recommendation(EmbeddingJob),
    /// See [`EscrowReleaseJob`].
    EscrowRelease(EscrowReleaseJob),
}

impl JobPayload {
    /// Topic this payload belongs to.
    #[must_use]
    pub const fn topic(&self) -> JobTopic {
        match self {
            Self::Verification(_) => JobTopic::Verification,
            Self::Moderation(_) => JobTopic::Moderation,
            Self::Recommendation(_) => JobTopic::Recommendation,
            Self::EscrowRelease(_) => JobTopic::EscrowRelease,
        }
    }
}

/// One unit of deferred work as stored on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Job {
    /// Distinguishes jobs with identical payloads.
    pub id: JobId,
    /// Topic and payload.
    pub task: JobPayload,
    /// When the job was first produced.
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Key under which a delayed copy can be cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl Job {
    /// A fresh job with no failed attempts.
    #[must_use]
    pub fn new(task: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            task,
            enqueued_at: now,
            attempt_count: 0,
            dedupe_key: None,
        }
    }

    /// Attaches a cancellation key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Topic of the payload.
    #[must_use]
    pub const fn topic(&self) -> JobTopic {
        self.task.topic()
    }

    /// Escrow release job for `transaction_id`, cancellable by transaction.
    #[must_use]
    pub fn escrow_release(
        transaction_id: TransactionId,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            JobPayload::EscrowRelease(EscrowReleaseJob {
                transaction_id,
                scheduled_at,
            }),
            now,
        )
        .with_dedupe_key(escrow_release_key(transaction_id))
    }
}

/// Dedupe key of the delayed release job for a transaction.
#[must_use]
pub fn escrow_release_key(transaction_id: TransactionId) -> String {
    format!("escrow_release:{transaction_id}")
}

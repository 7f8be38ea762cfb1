//! Write side of the entities the worker updates: user verification state,
//! moderation status and embeddings.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::capability::ExtractedFields;
use crate::domain::{ContentRef, UserId};
use crate::error::GatewayError;

/// Trust score granted on successful verification.
pub const VERIFIED_TRUST_SCORE: i32 = 50;

/// `ai_status` of a post or material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    /// Not yet classified.
    Pending,
    /// Passed moderation.
    Approved,
    /// Flagged as toxic.
    Rejected,
}

impl ModerationStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Result of checking a student proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationDecision {
    /// Fields valid; the user becomes verified.
    Approved {
        /// Verified user.
        user_id: UserId,
        /// Accepted proof.
        proof_id: uuid::Uuid,
        /// What the extractor read.
        fields: ExtractedFields,
    },
    /// Fields missing or malformed.
    Rejected {
        /// User whose proof failed.
        user_id: UserId,
        /// Rejected proof.
        proof_id: uuid::Uuid,
        /// Why.
        reason: String,
        /// What the extractor read.
        fields: ExtractedFields,
    },
}

/// Verification state of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserVerification {
    /// Whether the user is verified.
    pub is_verified: bool,
    /// `pending`, `approved` or `rejected`.
    pub status: String,
    /// Trust score.
    pub trust_score: i32,
    /// Extracted student code.
    pub student_code: Option<String>,
    /// Extracted full name.
    pub full_name: Option<String>,
}

/// Stored outcome for one proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRecord {
    /// Owning user.
    pub user_id: UserId,
    /// `approved` or `rejected`.
    pub status: String,
    /// Extracted fields.
    pub extracted: ExtractedFields,
    /// Rejection reason.
    pub rejected_reason: Option<String>,
    /// First time the proof was recorded.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Storage for job handler results. Writes are absolute, so replays
/// converge on the same final state.
#[async_trait]
pub trait ContentStore: Send + Sync + Debug {
    /// Applies a verification decision to the user and proof.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn apply_verification(
        &self,
        decision: &VerificationDecision,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    /// Sets the moderation status; returns the owner to notify, if known.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn set_moderation(
        &self,
        target: ContentRef,
        status: ModerationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, GatewayError>;

    /// Stores an embedding vector.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn store_embedding(
        &self,
        target: ContentRef,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    /// Hard-deletes proofs first recorded before `older_than`; returns how
    /// many.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn purge_verification_proofs(&self, older_than: DateTime<Utc>) -> Result<u64, GatewayError>;
}

#[derive(Debug, Default)]
struct ContentState {
    users: HashMap<UserId, UserVerification>,
    proofs: HashMap<uuid::Uuid, ProofRecord>,
    owners: HashMap<ContentRef, UserId>,
    moderation: HashMap<ContentRef, ModerationStatus>,
    embeddings: HashMap<ContentRef, Vec<f32>>,
}

impl ContentState {
    fn proof_created_at(&self, proof_id: uuid::Uuid, now: DateTime<Utc>) -> DateTime<Utc> {
        self.proofs.get(&proof_id).map_or(now, |p| p.created_at)
    }
}

/// Process-local [`ContentStore`].
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    state: Mutex<ContentState>,
}

impl InMemoryContentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records who owns a piece of content.
    pub async fn register_owner(&self, target: ContentRef, owner: UserId) {
        self.state.lock().await.owners.insert(target, owner);
    }

    /// Verification state of a user.
    pub async fn user(&self, user_id: UserId) -> Option<UserVerification> {
        self.state.lock().await.users.get(&user_id).cloned()
    }

    /// Stored outcome of a proof.
    pub async fn proof(&self, proof_id: uuid::Uuid) -> Option<ProofRecord> {
        self.state.lock().await.proofs.get(&proof_id).cloned()
    }

    /// Moderation status of a piece of content.
    pub async fn moderation(&self, target: ContentRef) -> ModerationStatus {
        self.state
            .lock()
            .await
            .moderation
            .get(&target)
            .copied()
            .unwrap_or(ModerationStatus::Pending)
    }

    /// Number of stored proofs.
    pub async fn proof_count(&self) -> usize {
        self.state.lock().await.proofs.len()
    }

    /// Stored embedding of a piece of content.
    pub async fn embedding(&self, target: ContentRef) -> Option<Vec<f32>> {
        self.state.lock().await.embeddings.get(&target).cloned()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn apply_verification(
        &self,
        decision: &VerificationDecision,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        match decision {
            VerificationDecision::Approved {
                user_id,
                proof_id,
                fields,
            } => {
                let user = state.users.entry(*user_id).or_default();
                user.is_verified = true;
                user.status = "approved".to_string();
                user.trust_score = VERIFIED_TRUST_SCORE;
                user.student_code.clone_from(&fields.student_code);
                user.full_name.clone_from(&fields.full_name);
                let created_at = state.proof_created_at(*proof_id, now);
                state.proofs.insert(
                    *proof_id,
                    ProofRecord {
                        user_id: *user_id,
                        status: "approved".to_string(),
                        extracted: fields.clone(),
                        rejected_reason: None,
                        created_at,
                        updated_at: now,
                    },
                );
            }
            VerificationDecision::Rejected {
                user_id,
                proof_id,
                reason,
                fields,
            } => {
                let user = state.users.entry(*user_id).or_default();
                if !user.is_verified {
                    user.status = "rejected".to_string();
                }
                let created_at = state.proof_created_at(*proof_id, now);
                state.proofs.insert(
                    *proof_id,
                    ProofRecord {
                        user_id: *user_id,
                        status: "rejected".to_string(),
                        extracted: fields.clone(),
                        rejected_reason: Some(reason.clone()),
                        created_at,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_moderation(
        &self,
        target: ContentRef,
        status: ModerationStatus,
        _now: DateTime<Utc>,
    ) -> Result<Option<UserId>, GatewayError> {
        let mut state = self.state.lock().await;
        state.moderation.insert(target, status);
        Ok(state.owners.get(&target).copied())
    }

    async fn store_embedding(
        &self,
        target: ContentRef,
        embedding: &[f32],
        _now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.state
            .lock()
            .await
            .embeddings
            .insert(target, embedding.to_vec());
        Ok(())
    }

    async fn purge_verification_proofs(&self, older_than: DateTime<Utc>) -> Result<u64, GatewayError> {
        let mut state = self.state.lock().await;
        let before = state.proofs.len();
        state.proofs.retain(|_, p| p.created_at >= older_than);
        Ok((before - state.proofs.len()) as u64)
    }
}

//! PostgreSQL implementations of the idempotency, dead-letter and content
//! stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{DEAD_LETTER_COLUMNS, DeadLetterRow, dead_letter_from_row};
use crate::domain::{
    CachedResponse, ContentRef, DeadLetterEntry, DeadLetterId, IdempotencyStatus, JobTopic,
    ScopedKey, UserId,
};
use crate::error::GatewayError;
use crate::idempotency::{BeginOutcome, IdempotencyStore};
use crate::retry::DeadLetterStore;
use crate::worker::content::{ContentStore, ModerationStatus, VERIFIED_TRUST_SCORE, VerificationDecision};

/// Marks a key completed. A record that is already completed keeps its
/// first response.
const COMPLETE_SQL: &str = "INSERT INTO idempotency_keys (key, status, status_code, response_body, created_at, expires_at) \
     VALUES ($1, 'completed', $2, $3, $4, $5) \
     ON CONFLICT (key) DO UPDATE SET \
       status = 'completed', status_code = EXCLUDED.status_code, \
       response_body = EXCLUDED.response_body \
     WHERE idempotency_keys.status = 'processing'";

/// Durable [`IdempotencyStore`] on the `idempotency_keys` table.
///
/// Used on its own, or as the write-through fallback behind the Redis
/// store.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    ttl: chrono::Duration,
}

impl PostgresIdempotencyStore {
    /// Creates a store whose records live for `ttl`.
    #[must_use]
    pub fn new(pool: PgPool, ttl: chrono::Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn begin(
        &self,
        key: &ScopedKey,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GatewayError> {
        // inserts, or takes over a record whose TTL has elapsed
        let claimed = sqlx::query_scalar::<_, String>(
            "INSERT INTO idempotency_keys (key, status, created_at, expires_at) \
             VALUES ($1, 'processing', $2, $3) \
             ON CONFLICT (key) DO UPDATE SET \
               status = 'processing', status_code = NULL, response_body = NULL, \
               created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at \
             WHERE idempotency_keys.expires_at <= EXCLUDED.created_at \
             RETURNING key",
        )
        .bind(key.as_str())
        .bind(now)
        .bind(now + self.ttl)
        .fetch_optional(&self.pool)
        .await?;
        if claimed.is_some() {
            return Ok(BeginOutcome::Started);
        }

        let existing = sqlx::query_as::<_, (String, Option<i32>, Option<serde_json::Value>)>(
            "SELECT status, status_code, response_body FROM idempotency_keys WHERE key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some((status, code, body)) = existing else {
            // abandoned between the two statements; the client retries
            return Ok(BeginOutcome::InFlight);
        };
        match (status.parse::<IdempotencyStatus>()?, code, body) {
            (IdempotencyStatus::Completed, Some(code), Some(body)) => {
                let status_code = u16::try_from(code)
                    .map_err(|_| GatewayError::Internal(format!("bad cached status {code}")))?;
                Ok(BeginOutcome::Completed(CachedResponse { status_code, body }))
            }
            _ => Ok(BeginOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        key: &ScopedKey,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        sqlx::query(COMPLETE_SQL)
        .bind(key.as_str())
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .bind(now)
        .bind(now + self.ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon(&self, key: &ScopedKey) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND status = 'processing'")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        let purged = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}

/// Durable [`DeadLetterStore`] on the `dead_letter_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn insert(&self, entry: &DeadLetterEntry) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO dead_letter_jobs (id, original_topic, payload, error_message, attempt_count, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
        )
        .bind(entry.id.as_uuid())
        .bind(entry.original_topic.as_str())
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .bind(i32::try_from(entry.attempt_count).unwrap_or(i32::MAX))
        .bind(entry.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        topic: Option<JobTopic>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, GatewayError> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs \
             WHERE ($1::TEXT IS NULL OR original_topic = $1) \
             ORDER BY failed_at DESC LIMIT $2"
        );
        sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(topic.map(|t| t.as_str()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(dead_letter_from_row)
            .collect()
    }

    async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, GatewayError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GatewayError::DeadLetterNotFound(*id.as_uuid()))?;
        dead_letter_from_row(row)
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool, GatewayError> {
        let removed = sqlx::query("DELETE FROM dead_letter_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}

fn content_key(target: ContentRef) -> (&'static str, Uuid) {
    match target {
        ContentRef::Material(id) => ("material", id),
        ContentRef::Post(id) => ("post", id),
        ContentRef::Job(id) => ("job", id),
    }
}

/// [`ContentStore`] on the `user_verifications`, `verification_proofs` and
/// `content_items` tables.
///
/// `content_items.owner_id` is written by the services that own posts and
/// materials; this store only reads it back.
#[derive(Debug, Clone)]
pub struct PostgresContentStore {
    pool: PgPool,
}

impl PostgresContentStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    async fn apply_verification(
        &self,
        decision: &VerificationDecision,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;
        let (user_id, proof_id, status, reason, fields) = match decision {
            VerificationDecision::Approved {
                user_id,
                proof_id,
                fields,
            } => {
                sqlx::query(
                    "INSERT INTO user_verifications \
                       (user_id, is_verified, verification_status, trust_score, student_code, full_name, updated_at) \
                     VALUES ($1, TRUE, 'approved', $2, $3, $4, $5) \
                     ON CONFLICT (user_id) DO UPDATE SET \
                       is_verified = TRUE, verification_status = 'approved', \
                       trust_score = EXCLUDED.trust_score, student_code = EXCLUDED.student_code, \
                       full_name = EXCLUDED.full_name, updated_at = EXCLUDED.updated_at",
                )
                .bind(user_id.as_uuid())
                .bind(VERIFIED_TRUST_SCORE)
                .bind(fields.student_code.as_deref())
                .bind(fields.full_name.as_deref())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (*user_id, *proof_id, "approved", None, fields)
            }
            VerificationDecision::Rejected {
                user_id,
                proof_id,
                reason,
                fields,
            } => {
                // a late rejection never unverifies an approved user
                sqlx::query(
                    "INSERT INTO user_verifications (user_id, verification_status, updated_at) \
                     VALUES ($1, 'rejected', $2) \
                     ON CONFLICT (user_id) DO UPDATE SET \
                       verification_status = CASE WHEN user_verifications.is_verified \
                         THEN user_verifications.verification_status ELSE 'rejected' END, \
                       updated_at = EXCLUDED.updated_at",
                )
                .bind(user_id.as_uuid())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (*user_id, *proof_id, "rejected", Some(reason.as_str()), fields)
            }
        };

        sqlx::query(
            "INSERT INTO verification_proofs \
               (id, user_id, status, extracted_data, rejected_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6) \
             ON CONFLICT (id) DO UPDATE SET \
               status = EXCLUDED.status, extracted_data = EXCLUDED.extracted_data, \
               rejected_reason = EXCLUDED.rejected_reason, updated_at = EXCLUDED.updated_at",
        )
        .bind(proof_id)
        .bind(user_id.as_uuid())
        .bind(status)
        .bind(serde_json::to_value(fields)?)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_moderation(
        &self,
        target: ContentRef,
        status: ModerationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, GatewayError> {
        let (kind, id) = content_key(target);
        let owner = sqlx::query_scalar::<_, Option<Uuid>>(
            "INSERT INTO content_items (content_kind, content_id, ai_status, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (content_kind, content_id) DO UPDATE SET \
               ai_status = EXCLUDED.ai_status, updated_at = EXCLUDED.updated_at \
             RETURNING owner_id",
        )
        .bind(kind)
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(owner.map(UserId::from))
    }

    async fn store_embedding(
        &self,
        target: ContentRef,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let (kind, id) = content_key(target);
        sqlx::query(
            "INSERT INTO content_items (content_kind, content_id, embedding, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (content_kind, content_id) DO UPDATE SET \
               embedding = EXCLUDED.embedding, updated_at = EXCLUDED.updated_at",
        )
        .bind(kind)
        .bind(id)
        .bind(embedding)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_verification_proofs(&self, older_than: DateTime<Utc>) -> Result<u64, GatewayError> {
        let purged = sqlx::query("DELETE FROM verification_proofs WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}

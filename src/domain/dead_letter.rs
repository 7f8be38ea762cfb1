//! Jobs that exhausted their retry budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{DeadLetterId, Job, JobTopic};

/// A permanently failed job retained for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeadLetterEntry {
    /// Entry identifier.
    pub id: DeadLetterId,
    /// Topic the job was consumed from.
    pub original_topic: JobTopic,
    /// Topic-tagged payload, or the raw text when it could not be decoded.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Last error observed.
    pub error_message: String,
    /// Attempts made before giving up.
    pub attempt_count: u32,
    /// When the job was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Captures a decoded job that ran out of retries.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn from_job(
        job: &Job,
        error_message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: DeadLetterId::new(),
            original_topic: job.topic(),
            payload: serde_json::to_value(&job.task)?,
            error_message: error_message.into(),
            attempt_count: job.attempt_count,
            failed_at: now,
        })
    }

    /// Captures a queue entry that could not be decoded at all.
    #[must_use]
    pub fn malformed(
        topic: JobTopic,
        raw: impl Into<String>,
        error_message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_topic: topic,
            payload: serde_json::Value::String(raw.into()),
            error_message: error_message.into(),
            attempt_count: 0,
            failed_at: now,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, TransactionId};

    #[test]
    fn payload_keeps_topic_tag() {
        let now = Utc::now();
        let mut job = Job::escrow_release(TransactionId::new(), now, now);
        job.attempt_count = 6;
        let Ok(entry) = DeadLetterEntry::from_job(&job, "timeout", now) else {
            panic!("entry should encode");
        };
        assert_eq!(entry.original_topic, JobTopic::EscrowRelease);
        assert_eq!(entry.attempt_count, 6);
        let decoded: Result<JobPayload, _> = serde_json::from_value(entry.payload);
        assert_eq!(decoded.ok(), Some(job.task));
    }

    #[test]
    fn malformed_keeps_raw_text() {
        let entry = DeadLetterEntry::malformed(JobTopic::Moderation, "{oops", "bad json", Utc::now());
        assert_eq!(entry.payload, serde_json::Value::String("{oops".to_string()));
        assert_eq!(entry.attempt_count, 0);
    }
}

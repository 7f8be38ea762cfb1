//! Row shapes returned by the PostgreSQL queries and their conversion into
//! domain types.
//!
//! Queries select columns in the exact order of these tuples; enum columns
//! are stored as their `as_str` text and parsed back on read.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    DeadLetterEntry, Dispute, DisputeStatus, JobTopic, Listing, SubjectKind, SubjectRef,
    Transaction, TransactionStatus, TransactionType,
};
use crate::error::GatewayError;

/// Column list matching [`TransactionRow`].
pub const TRANSACTION_COLUMNS: &str = "id, buyer_id, seller_id, subject_kind, subject_id, amount, \
     platform_fee, net_amount, tx_type, status, escrow_release_at, idempotency_key, created_at";

/// Column list matching [`DisputeRow`].
pub const DISPUTE_COLUMNS: &str = "id, transaction_id, reporter_id, reason, evidence_url, status, \
     resolved_by, resolved_at, created_at";

/// Column list matching [`ListingRow`].
pub const LISTING_COLUMNS: &str = "subject_kind, subject_id, seller_id, price, available, file_key";

/// Column list matching [`DeadLetterRow`].
pub const DEAD_LETTER_COLUMNS: &str =
    "id, original_topic, payload, error_message, attempt_count, failed_at";

/// A row of the `transactions` table.
pub type TransactionRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Uuid,
    i64,
    i64,
    i64,
    String,
    String,
    Option<DateTime<Utc>>,
    Option<String>,
    DateTime<Utc>,
);

/// A row of the `disputes` table.
pub type DisputeRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Option<String>,
    String,
    Option<Uuid>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

/// A row of the `listings` table.
pub type ListingRow = (String, Uuid, Uuid, Option<i64>, bool, Option<String>);

/// A row of the `dead_letter_jobs` table.
pub type DeadLetterRow = (
    Uuid,
    String,
    serde_json::Value,
    String,
    i32,
    DateTime<Utc>,
);

/// Converts a `transactions` row.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if an enum column holds unknown text.
pub fn transaction_from_row(row: TransactionRow) -> Result<Transaction, GatewayError> {
    let (
        id,
        buyer_id,
        seller_id,
        subject_kind,
        subject_id,
        amount,
        platform_fee,
        net_amount,
        tx_type,
        status,
        escrow_release_at,
        idempotency_key,
        created_at,
    ) = row;
    Ok(Transaction {
        id: id.into(),
        buyer_id: buyer_id.into(),
        seller_id: seller_id.into(),
        subject: SubjectRef {
            kind: subject_kind.parse::<SubjectKind>()?,
            id: subject_id,
        },
        amount,
        platform_fee,
        net_amount,
        tx_type: tx_type.parse::<TransactionType>()?,
        status: status.parse::<TransactionStatus>()?,
        escrow_release_at,
        idempotency_key,
        created_at,
    })
}

/// Converts a `disputes` row.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the status column holds unknown text.
pub fn dispute_from_row(row: DisputeRow) -> Result<Dispute, GatewayError> {
    let (
        id,
        transaction_id,
        reporter_id,
        reason,
        evidence_url,
        status,
        resolved_by,
        resolved_at,
        created_at,
    ) = row;
    Ok(Dispute {
        id: id.into(),
        transaction_id: transaction_id.into(),
        reporter_id: reporter_id.into(),
        reason,
        evidence_url,
        status: status.parse::<DisputeStatus>()?,
        resolved_by: resolved_by.map(Into::into),
        resolved_at,
        created_at,
    })
}

/// Converts a `listings` row.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the kind column holds unknown text.
pub fn listing_from_row(row: ListingRow) -> Result<Listing, GatewayError> {
    let (kind, id, seller_id, price, available, file_key) = row;
    Ok(Listing {
        subject: SubjectRef {
            kind: kind.parse::<SubjectKind>()?,
            id,
        },
        seller_id: seller_id.into(),
        price,
        available,
        file_key,
    })
}

/// Converts a `dead_letter_jobs` row.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] if the topic column holds unknown text.
pub fn dead_letter_from_row(row: DeadLetterRow) -> Result<DeadLetterEntry, GatewayError> {
    let (id, topic, payload, error_message, attempt_count, failed_at) = row;
    let original_topic = topic
        .parse::<JobTopic>()
        .map_err(|_| GatewayError::Internal(format!("unknown dead letter topic: {topic}")))?;
    Ok(DeadLetterEntry {
        id: id.into(),
        original_topic,
        payload,
        error_message,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        failed_at,
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn transaction_row_round_trips_enum_text() {
        let now = Utc::now();
        let row: TransactionRow = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "stream".to_string(),
            Uuid::new_v4(),
            50_000,
            5_000,
            45_000,
            "donation".to_string(),
            "escrow_hold".to_string(),
            Some(now),
            Some("k".to_string()),
            now,
        );
        let Ok(tx) = transaction_from_row(row) else {
            panic!("row should convert");
        };
        assert_eq!(tx.subject.kind, SubjectKind::Stream);
        assert_eq!(tx.tx_type, TransactionType::Donation);
        assert_eq!(tx.status, TransactionStatus::EscrowHold);
        assert!(tx.is_balanced());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let now = Utc::now();
        let row: DisputeRow = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "broken".to_string(),
            None,
            "closed".to_string(),
            None,
            None,
            now,
        );
        assert!(matches!(
            dispute_from_row(row),
            Err(GatewayError::Internal(_))
        ));
    }

    #[test]
    fn negative_attempt_count_clamps_to_zero() {
        let row: DeadLetterRow = (
            Uuid::new_v4(),
            "moderation".to_string(),
            serde_json::Value::Null,
            "boom".to_string(),
            -1,
            Utc::now(),
        );
        let Ok(entry) = dead_letter_from_row(row) else {
            panic!("row should convert");
        };
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.original_topic, JobTopic::Moderation);
    }
}

//! Domain events reflecting ledger and worker state changes.
//!
//! Every state change emits a [`LedgerEvent`] through the
//! [`super::EventBus`]. Subscribers forward them to the notification
//! service; amounts are integer minor units.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{
    ContentRef, DeadLetterId, DisputeId, DisputeStatus, JobTopic, TransactionId, TransactionType,
    UserId,
};

/// Domain event emitted after every state mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A purchase, donation or ticket buy entered escrow.
    PurchaseCompleted {
        /// Transaction identifier.
        transaction_id: TransactionId,
        /// Paying user.
        buyer_id: UserId,
        /// Receiving user.
        seller_id: UserId,
        /// Gross amount.
        amount: i64,
        /// Kind of transfer.
        tx_type: TransactionType,
        /// When escrow will be released.
        escrow_release_at: Option<DateTime<Utc>>,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A buyer filed a dispute.
    DisputeFiled {
        /// Dispute identifier.
        dispute_id: DisputeId,
        /// Disputed transaction.
        transaction_id: TransactionId,
        /// Buyer who filed it.
        reporter_id: UserId,
        /// Seller being disputed.
        seller_id: UserId,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// An administrator resolved a dispute.
    DisputeResolved {
        /// Dispute identifier.
        dispute_id: DisputeId,
        /// Disputed transaction.
        transaction_id: TransactionId,
        /// Buyer who filed it.
        reporter_id: UserId,
        /// Final dispute status.
        status: DisputeStatus,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Escrowed funds were returned to the buyer.
    EscrowRefunded {
        /// Transaction identifier.
        transaction_id: TransactionId,
        /// Refunded buyer.
        buyer_id: UserId,
        /// Amount returned.
        amount: i64,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Escrowed funds were credited to the seller.
    EscrowReleased {
        /// Transaction identifier.
        transaction_id: TransactionId,
        /// Credited seller.
        seller_id: UserId,
        /// Amount credited.
        net_amount: i64,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A post or material received a moderation verdict.
    ContentModerated {
        /// Moderated content.
        content: ContentRef,
        /// Owner to notify, when known.
        owner_id: Option<UserId>,
        /// Whether the content passed.
        approved: bool,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A student proof was accepted.
    VerificationApproved {
        /// Verified user.
        user_id: UserId,
        /// Accepted proof.
        proof_id: uuid::Uuid,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A student proof was rejected.
    VerificationRejected {
        /// User whose proof failed.
        user_id: UserId,
        /// Rejected proof.
        proof_id: uuid::Uuid,
        /// Why it was rejected.
        reason: String,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },

    /// A job exhausted its retries.
    JobDeadLettered {
        /// Dead-letter entry identifier.
        entry_id: DeadLetterId,
        /// Topic of the failed job.
        topic: JobTopic,
        /// Attempts made.
        attempt_count: u32,
        /// Event timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        match self {
            Self::PurchaseCompleted { .. } => "purchase_completed",
            Self::DisputeFiled { .. } => "dispute_filed",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::EscrowRefunded { .. } => "escrow_refunded",
            Self::EscrowReleased { .. } => "escrow_released",
            Self::ContentModerated { .. } => "content_moderated",
            Self::VerificationApproved { .. } => "verification_approved",
            Self::VerificationRejected { .. } => "verification_rejected",
            Self::JobDeadLettered { .. } => "job_dead_lettered",
        }
    }

    /// User the notification is addressed to; `None` means administrators.
    #[must_use]
    pub const fn recipient(&self) -> Option<UserId> {
        match self {
            Self::PurchaseCompleted { seller_id, .. }
            | Self::DisputeFiled { seller_id, .. }
            | Self::EscrowReleased { seller_id, .. } => Some(*seller_id),
            Self::DisputeResolved { reporter_id, .. } => Some(*reporter_id),
            Self::EscrowRefunded { buyer_id, .. } => Some(*buyer_id),
            Self::ContentModerated { owner_id, .. } => *owner_id,
            Self::VerificationApproved { user_id, .. }
            | Self::VerificationRejected { user_id, .. } => Some(*user_id),
            Self::JobDeadLettered { .. } => None,
        }
    }

    /// Transaction the event concerns, if any.
    #[must_use]
    pub const fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::PurchaseCompleted { transaction_id, .. }
            | Self::DisputeFiled { transaction_id, .. }
            | Self::DisputeResolved { transaction_id, .. }
            | Self::EscrowRefunded { transaction_id, .. }
            | Self::EscrowReleased { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn released_event_addresses_seller() {
        let seller = UserId::new();
        let tx = TransactionId::new();
        let event = LedgerEvent::EscrowReleased {
            transaction_id: tx,
            seller_id: seller,
            net_amount: 90_000,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type_str(), "escrow_released");
        assert_eq!(event.recipient(), Some(seller));
        assert_eq!(event.transaction_id(), Some(tx));
    }

    #[test]
    fn serializes_with_event_type_tag() {
        let event = LedgerEvent::JobDeadLettered {
            entry_id: DeadLetterId::new(),
            topic: JobTopic::Moderation,
            attempt_count: 6,
            timestamp: Utc::now(),
        };
        let Ok(json) = serde_json::to_string(&event) else {
            panic!("event should serialize");
        };
        assert!(json.contains("\"event_type\":\"job_dead_lettered\""));
        assert!(json.contains("\"topic\":\"moderation\""));
        assert!(event.recipient().is_none());
    }
}

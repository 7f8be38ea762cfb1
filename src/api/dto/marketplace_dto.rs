//! Purchase, donation and ticket DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::Transaction;
use crate::ledger::PurchaseRecord;
use crate::service::EscrowService;

/// Body of `POST /marketplace/purchase`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PurchaseRequest {
    /// Material to buy.
    pub material_id: uuid::Uuid,
}

/// Body of `POST /streams/donate`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DonationRequest {
    /// Stream receiving the donation.
    pub stream_id: uuid::Uuid,
    /// Donated amount, in the smallest currency unit.
    pub amount: i64,
}

/// Body of `POST /events/tickets`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TicketRequest {
    /// Event whose ticket is bought.
    pub event_id: uuid::Uuid,
}

/// Successful purchase, donation or ticket response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PurchaseResponse {
    /// The escrowed transaction.
    pub transaction: Transaction,
    /// Download URL of the purchased file, when the subject has one.
    pub file_url: Option<String>,
    /// When the seller gets paid unless a dispute is filed.
    pub escrow_release_at: Option<DateTime<Utc>>,
}

impl PurchaseResponse {
    /// Builds the response for a ledger purchase record.
    #[must_use]
    pub fn from_record(record: PurchaseRecord, escrow: &EscrowService) -> Self {
        Self {
            file_url: record.file_key.as_deref().map(|key| escrow.file_url(key)),
            escrow_release_at: record.transaction.escrow_release_at,
            transaction: record.transaction,
        }
    }
}

//! Buyer claims against a transaction in escrow.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{DisputeId, TransactionId, UserId};
use crate::error::GatewayError;

/// Lifecycle state of a [`Dispute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    /// Filed, not yet looked at.
    Pending,
    /// An administrator is reviewing it.
    Investigating,
    /// Resolved in the buyer's favour; funds returned.
    ResolvedRefund,
    /// Resolved in the seller's favour; escrow proceeds normally.
    ResolvedReject,
}

impl DisputeStatus {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Investigating => "investigating",
            Self::ResolvedRefund => "resolved_refund",
            Self::ResolvedReject => "resolved_reject",
        }
    }

    /// Open disputes block escrow release.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Investigating)
    }
}

impl FromStr for DisputeStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "investigating" => Ok(Self::Investigating),
            "resolved_refund" => Ok(Self::ResolvedRefund),
            "resolved_reject" => Ok(Self::ResolvedReject),
            other => Err(GatewayError::Internal(format!(
                "unknown dispute status: {other}"
            ))),
        }
    }
}

/// Administrator decision on a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisputeVerdict {
    /// Refund the buyer.
    ResolvedRefund,
    /// Reject the claim; the seller gets paid.
    ResolvedReject,
}

impl From<DisputeVerdict> for DisputeStatus {
    fn from(verdict: DisputeVerdict) -> Self {
        match verdict {
            DisputeVerdict::ResolvedRefund => Self::ResolvedRefund,
            DisputeVerdict::ResolvedReject => Self::ResolvedReject,
        }
    }
}

/// A claim against a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Dispute {
    /// Dispute identifier.
    pub id: DisputeId,
    /// Disputed transaction.
    pub transaction_id: TransactionId,
    /// Buyer who filed the dispute.
    pub reporter_id: UserId,
    /// Free-text reason.
    pub reason: String,
    /// Optional link to supporting evidence.
    pub evidence_url: Option<String>,
    /// Lifecycle state.
    pub status: DisputeStatus,
    /// Administrator who resolved it.
    pub resolved_by: Option<UserId>,
    /// Resolution timestamp.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Filing timestamp.
    pub created_at: DateTime<Utc>,
}

/// Input for filing a dispute.
#[derive(Debug, Clone)]
pub struct NewDispute {
    /// Transaction being disputed.
    pub transaction_id: TransactionId,
    /// Caller filing the dispute; must be the buyer.
    pub reporter_id: UserId,
    /// Free-text reason.
    pub reason: String,
    /// Optional evidence link.
    pub evidence_url: Option<String>,
}

impl NewDispute {
    /// Trims and validates the free-text fields.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the reason is empty or
    /// unreasonably long.
    pub fn validated(mut self) -> Result<Self, GatewayError> {
        self.reason = self.reason.trim().to_string();
        if self.reason.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "dispute reason is required".to_string(),
            ));
        }
        if self.reason.chars().count() > 2_000 {
            return Err(GatewayError::InvalidRequest(
                "dispute reason exceeds 2000 characters".to_string(),
            ));
        }
        self.evidence_url = self
            .evidence_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Ok(self)
    }
}

//! Dispute filing and resolution DTOs.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{Dispute, DisputeVerdict, Transaction};

/// Body of `POST /disputes`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateDisputeRequest {
    /// Transaction being disputed.
    pub transaction_id: uuid::Uuid,
    /// Why the buyer disputes it.
    pub reason: String,
    /// Optional evidence link.
    #[serde(default)]
    pub evidence_url: Option<String>,
}

/// Body of `PUT /admin/resolve-dispute/{id}`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ResolveDisputeRequest {
    /// `resolved_refund` or `resolved_reject`.
    pub status: DisputeVerdict,
}

/// Resolved dispute with the transaction as it stands afterwards.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DisputeResolutionResponse {
    /// The resolved dispute.
    pub dispute: Dispute,
    /// The disputed transaction.
    pub transaction: Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_body_accepts_only_terminal_verdicts() {
        let refund: Result<ResolveDisputeRequest, _> =
            serde_json::from_str(r#"{"status": "resolved_refund"}"#);
        assert!(matches!(
            refund.map(|r| r.status),
            Ok(DisputeVerdict::ResolvedRefund)
        ));
        let pending: Result<ResolveDisputeRequest, _> =
            serde_json::from_str(r#"{"status": "pending"}"#);
        assert!(pending.is_err());
    }
}

//! Wallet DTOs.

use serde::Deserialize;
use utoipa::ToSchema;

/// Body of `POST /wallet/deposit`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DepositRequest {
    /// Amount credited to the available balance.
    pub amount: i64,
}

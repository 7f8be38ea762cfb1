//! Shared DTO types used across multiple endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Upper bound for `limit` query parameters.
pub const MAX_LIMIT: u32 = 200;

/// `?limit=` query parameter for list endpoints.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct LimitParams {
    /// Maximum rows returned (1–200). Defaults to 50.
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

impl LimitParams {
    /// Clamps `limit` to `1..=MAX_LIMIT`.
    #[must_use]
    pub fn clamped(&self) -> u32 {
        self.limit.clamp(1, MAX_LIMIT)
    }
}

/// Generic `{ "data": [...] }` envelope for list responses.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListResponse<T> {
    /// Returned items.
    pub data: Vec<T>,
    /// Number of items returned.
    pub count: usize,
}

impl<T> ListResponse<T> {
    /// Wraps a list.
    #[must_use]
    pub fn new(data: Vec<T>) -> Self {
        Self {
            count: data.len(),
            data,
        }
    }
}

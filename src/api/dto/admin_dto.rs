//! Operator DTOs: dead letters and queue state.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::JobTopic;

/// Query of `GET /admin/dead-letters`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct DeadLetterQuery {
    /// Only entries from this topic.
    #[serde(default)]
    pub topic: Option<JobTopic>,
    /// Maximum rows returned (1–200). Defaults to 50.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Ready-list depth of one topic.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueDepthDto {
    /// Topic name.
    pub topic: JobTopic,
    /// Jobs waiting to be consumed.
    pub depth: usize,
}

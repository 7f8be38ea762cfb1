//! Retry/DLQ Engine: backoff policy, dead-letter storage and the engine
//! that applies them around a [`JobHandler`].

pub mod backoff;
pub mod dead_letter;
pub mod engine;

use std::fmt::Debug;

use async_trait::async_trait;

use crate::domain::Job;
use crate::error::GatewayError;

pub use backoff::BackoffPolicy;
pub use dead_letter::{DeadLetterStore, InMemoryDeadLetterStore};
pub use engine::{JobOutcome, RetryEngine};

/// Executes one job. Must be idempotent with respect to final state:
/// the same job may be delivered more than once.
#[async_trait]
pub trait JobHandler: Send + Sync + Debug {
    /// Processes `job`.
    ///
    /// # Errors
    ///
    /// Returns an error classified by [`GatewayError::is_retryable`].
    async fn handle(&self, job: &Job) -> Result<(), GatewayError>;
}

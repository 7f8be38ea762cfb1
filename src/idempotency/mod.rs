//! Idempotency Guard and its stores.
//!
//! The guard wraps a money-moving operation between two atomic store
//! boundaries: create-if-absent before the operation runs, and finalize
//! (or abandon) once its outcome is known.

pub mod guard;
pub mod memory;
pub mod redis;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{CachedResponse, ScopedKey};
use crate::error::GatewayError;

pub use guard::{GuardedResponse, IdempotencyGuard};
pub use memory::InMemoryIdempotencyStore;
pub use redis::RedisIdempotencyStore;

/// Result of the atomic create-if-absent step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// No live record existed; a `processing` record now does.
    Started,
    /// The operation already finished; replay this response.
    Completed(CachedResponse),
    /// Another request with the same key is still running.
    InFlight,
}

/// Key/value store with TTL behind the [`IdempotencyGuard`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync + Debug {
    /// Atomically creates a `processing` record unless a live one exists.
    /// Expired records count as absent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unreachable.
    async fn begin(&self, key: &ScopedKey, now: DateTime<Utc>)
    -> Result<BeginOutcome, GatewayError>;

    /// Rewrites the record to `completed` with the cached response.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unreachable.
    async fn complete(
        &self,
        key: &ScopedKey,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    /// Deletes a `processing` record so the client may retry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unreachable.
    async fn abandon(&self, key: &ScopedKey) -> Result<(), GatewayError>;

    /// Removes records whose TTL has elapsed; returns how many.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is unreachable.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError>;
}

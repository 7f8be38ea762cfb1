//! Request-path guard giving at-most-once execution per idempotency key.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::{BeginOutcome, IdempotencyStore};
use crate::domain::{CachedResponse, Clock, ScopedKey};
use crate::error::GatewayError;

/// Header set on responses served from the idempotency cache.
pub const REPLAY_HEADER: &str = "x-idempotent-replay";

/// Response produced by [`IdempotencyGuard::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedResponse {
    /// Status and body, identical for the original and every replay.
    pub response: CachedResponse,
    /// Whether the operation was skipped and the cache served instead.
    pub replayed: bool,
}

impl IntoResponse for GuardedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.response.status_code).unwrap_or(StatusCode::OK);
        let mut response = (status, Json(self.response.body)).into_response();
        if self.replayed {
            response
                .headers_mut()
                .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}

/// Deduplicates mutating requests by scoped idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyGuard {
    /// Creates a guard over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Runs `operation` at most once for `key`.
    ///
    /// A completed key replays its cached response without calling
    /// `operation`; a key still processing fails fast. A failed operation
    /// releases the key so the client can retry with the same one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IdempotencyConflict`] while another request
    /// with the same key is running, or the operation's own error.
    pub async fn execute<F, Fut, T>(
        &self,
        key: &ScopedKey,
        operation: F,
    ) -> Result<GuardedResponse, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(StatusCode, T), GatewayError>>,
        T: Serialize,
    {
        match self.store.begin(key, self.clock.now()).await? {
            BeginOutcome::Completed(response) => {
                tracing::debug!(key = %key, "replaying cached response");
                return Ok(GuardedResponse {
                    response,
                    replayed: true,
                });
            }
            BeginOutcome::InFlight => return Err(GatewayError::IdempotencyConflict),
            BeginOutcome::Started => {}
        }

        let (status, body) = match operation().await {
            Ok(result) => result,
            Err(err) => {
                self.release(key).await;
                return Err(err);
            }
        };
        if !status.is_success() {
            self.release(key).await;
            return Err(GatewayError::Internal(format!(
                "guarded operation returned {status}"
            )));
        }

        // The operation took effect; the key must not be released from here on.
        let response = CachedResponse {
            status_code: status.as_u16(),
            body: serde_json::to_value(&body)?,
        };
        if let Err(err) = self
            .store
            .complete(key, &response, self.clock.now())
            .await
        {
            tracing::error!(key = %key, error = %err, "failed to finalize idempotency record");
        }
        Ok(GuardedResponse {
            response,
            replayed: false,
        })
    }

    async fn release(&self, key: &ScopedKey) {
        if let Err(err) = self.store.abandon(key).await {
            tracing::warn!(key = %key, error = %err, "failed to release idempotency key");
        }
    }
}

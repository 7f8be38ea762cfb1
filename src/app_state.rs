//! Shared application state injected into all Axum handlers.

use crate::config::AppRole;
use crate::domain::EventBus;
use crate::idempotency::IdempotencyGuard;
use crate::service::{EscrowService, JobService};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Escrow Manager: purchases, disputes, releases, wallets.
    pub escrow: EscrowService,
    /// Job producer and Dead Letter administration.
    pub jobs: JobService,
    /// Deduplicates money-moving requests.
    pub guard: IdempotencyGuard,
    /// Event bus for notification fan-out.
    pub event_bus: EventBus,
    /// Role this process runs in, reported by `/health`.
    pub role: AppRole,
}

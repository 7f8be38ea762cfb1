//! Service layer: business logic orchestration.
//!
//! [`EscrowService`] is the Escrow Manager: it drives the ledger
//! procedures, schedules release jobs and emits events through the
//! [`super::domain::EventBus`]. [`JobService`] produces jobs and
//! administers the Dead Letter Store.

pub mod escrow_service;
pub mod job_service;
pub mod notifier;

pub use escrow_service::{EscrowService, EscrowSettings};
pub use job_service::JobService;

//! # escrow-gateway
//!
//! Idempotent purchase, escrow and background-job service for a student
//! marketplace.
//!
//! Money-moving requests carry an `x-idempotency-key` and are executed at
//! most once per key. Purchases debit the buyer and hold the seller's net
//! share in escrow until the release window elapses; a buyer dispute blocks
//! release until an administrator refunds or rejects it. Slow work
//! (document verification, moderation, embeddings, escrow release) runs on
//! a background worker with exponential-backoff retries and a Dead Letter
//! Store for jobs that exhaust their budget.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP)
//!     │
//!     ├── REST Handlers (api/) ── IdempotencyGuard (idempotency/)
//!     │
//!     ├── EscrowService, JobService (service/)
//!     ├── EventBus (domain/)
//!     │
//!     ├── Ledger (ledger/, persistence/)      PostgreSQL or in-memory
//!     ├── JobQueue (queue/)                   Redis or in-memory
//!     │
//!     └── Worker (worker/) ── RetryEngine (retry/) ── Dead Letter Store
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod service;
pub mod worker;

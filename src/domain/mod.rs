//! Domain layer: core types, state machines, and event system.
//!
//! This module contains the ledger's data model (transactions, disputes,
//! wallets), idempotency records, queued jobs and dead letters, the clock
//! abstraction and the event bus for broadcasting state changes.

pub mod clock;
pub mod dead_letter;
pub mod dispute;
pub mod event_bus;
pub mod idempotency;
pub mod ids;
pub mod job;
pub mod ledger_event;
pub mod transaction;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::DeadLetterEntry;
pub use dispute::{Dispute, DisputeStatus, DisputeVerdict, NewDispute};
pub use event_bus::EventBus;
pub use idempotency::{
    CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyStatus, ScopedKey,
};
pub use ids::{DeadLetterId, DisputeId, JobId, TransactionId, UserId};
pub use job::{
    ContentRef, EmbeddingJob, EscrowReleaseJob, Job, JobPayload, JobTopic, ModerationJob,
    VerificationJob, escrow_release_key,
};
pub use ledger_event::LedgerEvent;
pub use transaction::{
    FeeSplit, Listing, SubjectKind, SubjectRef, Transaction, TransactionStatus, TransactionType,
    Wallet,
};

//! Transaction Ledger: the only component allowed to move balances.
//!
//! Every balance-affecting change is one named, all-or-nothing ledger
//! procedure (`deposit`, `execute_purchase`, `resolve_dispute`,
//! `release_escrow`). Callers never read a balance, compute a new value and
//! write it back; the checks run inside the procedure that applies them.
//!
//! Two implementations exist: [`InMemoryLedger`] (single mutex) and
//! [`crate::persistence::PostgresLedger`] (SQL transactions with row locks
//! and conditional updates).

pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Dispute, DisputeId, DisputeVerdict, FeeSplit, Listing, NewDispute, SubjectRef, Transaction,
    TransactionId, TransactionStatus, UserId, Wallet,
};
use crate::error::GatewayError;

pub use memory::InMemoryLedger;

/// Input of the `execute_purchase` procedure.
#[derive(Debug, Clone)]
pub struct PurchaseOrder {
    /// Paying user.
    pub buyer_id: UserId,
    /// What is bought.
    pub subject: SubjectRef,
    /// Client-chosen amount; only honoured for listings without a price.
    pub amount: Option<i64>,
    /// Platform fee rate in basis points.
    pub fee_bps: u32,
    /// Length of the escrow window.
    pub escrow_window: chrono::Duration,
    /// Idempotency key carried into the transaction row.
    pub idempotency_key: Option<String>,
    /// Creation instant.
    pub now: DateTime<Utc>,
}

impl PurchaseOrder {
    /// Resolves the gross amount and fee split against the listing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SubjectUnavailable`] for inactive listings,
    /// [`GatewayError::InvalidRequest`] for self-purchases, missing or
    /// non-positive amounts.
    pub fn price_against(&self, listing: &Listing) -> Result<FeeSplit, GatewayError> {
        if !listing.available {
            return Err(GatewayError::SubjectUnavailable(self.subject.to_string()));
        }
        if listing.seller_id == self.buyer_id {
            return Err(GatewayError::InvalidRequest(
                "cannot pay for your own listing".to_string(),
            ));
        }
        let amount = match (listing.price, self.amount) {
            (Some(price), _) => price,
            (None, Some(amount)) => amount,
            (None, None) => {
                return Err(GatewayError::InvalidRequest(
                    "amount is required for this subject".to_string(),
                ));
            }
        };
        FeeSplit::compute(amount, self.fee_bps)
    }

    /// Builds the transaction row this order creates.
    #[must_use]
    pub fn to_transaction(&self, listing: &Listing, split: FeeSplit) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            buyer_id: self.buyer_id,
            seller_id: listing.seller_id,
            subject: self.subject,
            amount: split.amount,
            platform_fee: split.platform_fee,
            net_amount: split.net_amount,
            tx_type: self.subject.kind.transaction_type(),
            status: TransactionStatus::EscrowHold,
            escrow_release_at: Some(self.now + self.escrow_window),
            idempotency_key: self.idempotency_key.clone(),
            created_at: self.now,
        }
    }
}

/// Result of `execute_purchase`.
#[derive(Debug, Clone)]
pub struct PurchaseRecord {
    /// The escrowed transaction.
    pub transaction: Transaction,
    /// Storage key of the purchased file, if the listing has one.
    pub file_key: Option<String>,
    /// `true` when an earlier purchase with the same key was returned.
    pub replayed: bool,
}

/// Result of `resolve_dispute`.
#[derive(Debug, Clone)]
pub struct DisputeResolution {
    /// The resolved dispute.
    pub dispute: Dispute,
    /// The disputed transaction after resolution.
    pub transaction: Transaction,
}

/// Result of `release_escrow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Seller credited; transaction now `completed`.
    Released(Transaction),
    /// Transaction was no longer in escrow; nothing changed.
    AlreadySettled(TransactionStatus),
    /// The escrow window has not elapsed yet; nothing changed.
    NotYetDue(DateTime<Utc>),
}

/// Authoritative store of transactions, disputes, wallets and listings.
#[async_trait]
pub trait Ledger: Send + Sync + Debug {
    /// Creates or replaces a listing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn upsert_listing(&self, listing: Listing) -> Result<Listing, GatewayError>;

    /// Looks up a listing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn listing(&self, subject: SubjectRef) -> Result<Option<Listing>, GatewayError>;

    /// Credits `amount` to a user's available balance.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for non-positive amounts.
    async fn deposit(&self, user_id: UserId, amount: i64) -> Result<Wallet, GatewayError>;

    /// Current balances; an unknown user has an empty wallet.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn wallet(&self, user_id: UserId) -> Result<Wallet, GatewayError>;

    /// Debits the buyer, credits the seller's escrow balance and creates the
    /// transaction in `escrow_hold`, all or nothing. Replays of the same
    /// `(buyer, idempotency_key)` return the existing transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SubjectNotFound`],
    /// [`GatewayError::SubjectUnavailable`] or
    /// [`GatewayError::InsufficientFunds`]; no state changes on error.
    async fn execute_purchase(&self, order: PurchaseOrder) -> Result<PurchaseRecord, GatewayError>;

    /// Fetches a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransactionNotFound`] if it does not exist.
    async fn transaction(&self, id: TransactionId) -> Result<Transaction, GatewayError>;

    /// Files a dispute while the transaction is in its escrow window.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransactionNotEligible`] unless the reporter
    /// is the buyer and the window is still open, and
    /// [`GatewayError::DisputeAlreadyExists`] if one is already open.
    async fn create_dispute(
        &self,
        input: NewDispute,
        now: DateTime<Utc>,
    ) -> Result<(Dispute, Transaction), GatewayError>;

    /// Fetches a dispute.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotFound`] if it does not exist.
    async fn dispute(&self, id: DisputeId) -> Result<Dispute, GatewayError>;

    /// Disputes filed by a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn disputes_by_reporter(&self, reporter_id: UserId) -> Result<Vec<Dispute>, GatewayError>;

    /// Pending and investigating disputes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn open_disputes(&self, limit: u32) -> Result<Vec<Dispute>, GatewayError>;

    /// Moves a dispute from `pending` to `investigating`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotOpen`] unless it is `pending`.
    async fn mark_investigating(&self, id: DisputeId) -> Result<Dispute, GatewayError>;

    /// Resolves an open dispute. A refund atomically returns the gross
    /// amount to the buyer, removes the net amount from the seller's escrow
    /// balance and marks the transaction `refunded`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotOpen`] for resolved disputes and
    /// [`GatewayError::TransactionNotEligible`] when refunding a
    /// transaction that already left escrow.
    async fn resolve_dispute(
        &self,
        id: DisputeId,
        verdict: DisputeVerdict,
        admin_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<DisputeResolution, GatewayError>;

    /// Moves `net_amount` from the seller's escrow to available balance and
    /// marks the transaction `completed`. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ActiveDisputeBlocksRelease`] while a dispute
    /// is open and [`GatewayError::TransactionNotFound`] for unknown IDs.
    async fn release_escrow(
        &self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, GatewayError>;

    /// Escrowed transactions whose window has elapsed and that have no open
    /// dispute, earliest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on storage failure.
    async fn due_releases(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransactionId>, GatewayError>;
}

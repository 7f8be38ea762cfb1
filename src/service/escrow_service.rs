//! Escrow Manager: purchase, dispute and release orchestration.

use std::sync::Arc;

use crate::domain::{
    Clock, Dispute, DisputeId, DisputeVerdict, EventBus, Job, LedgerEvent, Listing, NewDispute,
    SubjectRef, Transaction, TransactionId, TransactionStatus, UserId, Wallet, escrow_release_key,
};
use crate::error::GatewayError;
use crate::ledger::{DisputeResolution, Ledger, PurchaseOrder, PurchaseRecord, ReleaseOutcome};
use crate::queue::JobQueue;

/// Fee and window policy applied to new transactions.
#[derive(Debug, Clone)]
pub struct EscrowSettings {
    /// Platform fee in basis points.
    pub fee_bps: u32,
    /// Time between purchase and automatic release.
    pub escrow_window: chrono::Duration,
    /// Prefix joined with a listing's file key to form its download URL.
    pub file_base_url: String,
}

impl Default for EscrowSettings {
    fn default() -> Self {
        Self {
            fee_bps: 1_000,
            escrow_window: chrono::Duration::days(3),
            file_base_url: "/files".to_string(),
        }
    }
}

/// Orchestrates the purchase → escrow hold → release-or-refund lifecycle.
///
/// Balance changes are delegated to the [`Ledger`]; this layer schedules
/// and cancels the delayed release job and emits [`LedgerEvent`]s.
/// Scheduling is a hint only: the release procedure re-checks state.
#[derive(Debug, Clone)]
pub struct EscrowService {
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn JobQueue>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: EscrowSettings,
}

impl EscrowService {
    /// Creates a new `EscrowService`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        queue: Arc<dyn JobQueue>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        settings: EscrowSettings,
    ) -> Self {
        Self {
            ledger,
            queue,
            event_bus,
            clock,
            settings,
        }
    }

    /// Returns the active settings.
    #[must_use]
    pub const fn settings(&self) -> &EscrowSettings {
        &self.settings
    }

    /// Returns the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Download URL for a purchased file.
    #[must_use]
    pub fn file_url(&self, file_key: &str) -> String {
        format!(
            "{}/{}",
            self.settings.file_base_url.trim_end_matches('/'),
            file_key.trim_start_matches('/')
        )
    }

    /// Debits the buyer and places the amount in escrow, then schedules the
    /// delayed release.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SubjectNotFound`],
    /// [`GatewayError::SubjectUnavailable`],
    /// [`GatewayError::InsufficientFunds`] or a ledger failure.
    pub async fn initiate_purchase(
        &self,
        buyer_id: UserId,
        subject: SubjectRef,
        amount: Option<i64>,
        idempotency_key: Option<String>,
    ) -> Result<PurchaseRecord, GatewayError> {
        let order = PurchaseOrder {
            buyer_id,
            subject,
            amount,
            fee_bps: self.settings.fee_bps,
            escrow_window: self.settings.escrow_window,
            idempotency_key,
            now: self.clock.now(),
        };
        let record = self.ledger.execute_purchase(order).await?;
        if record.replayed {
            tracing::info!(
                transaction_id = %record.transaction.id,
                "purchase replayed from ledger"
            );
            return Ok(record);
        }

        let tx = &record.transaction;
        tracing::info!(
            transaction_id = %tx.id,
            buyer_id = %tx.buyer_id,
            subject = %tx.subject,
            amount = tx.amount,
            "purchase placed in escrow"
        );
        let _ = self.event_bus.publish(LedgerEvent::PurchaseCompleted {
            transaction_id: tx.id,
            buyer_id: tx.buyer_id,
            seller_id: tx.seller_id,
            amount: tx.amount,
            tx_type: tx.tx_type,
            escrow_release_at: tx.escrow_release_at,
            timestamp: tx.created_at,
        });
        self.schedule_release(tx).await;
        Ok(record)
    }

    /// Files a dispute and cancels the scheduled release.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an empty reason,
    /// [`GatewayError::TransactionNotEligible`] or
    /// [`GatewayError::DisputeAlreadyExists`].
    pub async fn file_dispute(&self, input: NewDispute) -> Result<Dispute, GatewayError> {
        let input = input.validated()?;
        let (dispute, tx) = self.ledger.create_dispute(input, self.clock.now()).await?;

        match self.queue.cancel_scheduled(&escrow_release_key(tx.id)).await {
            Ok(cancelled) => {
                tracing::debug!(transaction_id = %tx.id, cancelled, "release schedule cancelled");
            }
            Err(err) => {
                tracing::warn!(transaction_id = %tx.id, error = %err, "could not cancel release schedule");
            }
        }

        tracing::info!(dispute_id = %dispute.id, transaction_id = %tx.id, "dispute filed");
        let _ = self.event_bus.publish(LedgerEvent::DisputeFiled {
            dispute_id: dispute.id,
            transaction_id: tx.id,
            reporter_id: dispute.reporter_id,
            seller_id: tx.seller_id,
            timestamp: dispute.created_at,
        });
        Ok(dispute)
    }

    /// Moves a pending dispute to `investigating`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotFound`] or
    /// [`GatewayError::DisputeNotOpen`].
    pub async fn mark_investigating(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        let dispute = self.ledger.mark_investigating(id).await?;
        tracing::info!(dispute_id = %id, "dispute under investigation");
        Ok(dispute)
    }

    /// Resolves a dispute. A rejection whose window already elapsed is
    /// released immediately; one still inside the window is re-scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotFound`],
    /// [`GatewayError::DisputeNotOpen`] or a ledger failure.
    pub async fn resolve_dispute(
        &self,
        id: DisputeId,
        verdict: DisputeVerdict,
        admin_id: UserId,
    ) -> Result<DisputeResolution, GatewayError> {
        let now = self.clock.now();
        let mut resolution = self.ledger.resolve_dispute(id, verdict, admin_id, now).await?;
        let dispute = &resolution.dispute;
        tracing::info!(
            dispute_id = %dispute.id,
            transaction_id = %dispute.transaction_id,
            status = dispute.status.as_str(),
            "dispute resolved"
        );
        let _ = self.event_bus.publish(LedgerEvent::DisputeResolved {
            dispute_id: dispute.id,
            transaction_id: dispute.transaction_id,
            reporter_id: dispute.reporter_id,
            status: dispute.status,
            timestamp: now,
        });

        match verdict {
            DisputeVerdict::ResolvedRefund => {
                let tx = &resolution.transaction;
                let _ = self.event_bus.publish(LedgerEvent::EscrowRefunded {
                    transaction_id: tx.id,
                    buyer_id: tx.buyer_id,
                    amount: tx.amount,
                    timestamp: now,
                });
            }
            DisputeVerdict::ResolvedReject => {
                if resolution.transaction.status == TransactionStatus::EscrowHold {
                    if resolution.transaction.is_release_due(now) {
                        match self.release_escrow(resolution.transaction.id).await {
                            Ok(ReleaseOutcome::Released(tx)) => resolution.transaction = tx,
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(
                                    transaction_id = %resolution.transaction.id,
                                    error = %err,
                                    "immediate release failed, left to the poller"
                                );
                            }
                        }
                    } else {
                        self.schedule_release(&resolution.transaction).await;
                    }
                }
            }
        }
        Ok(resolution)
    }

    /// Releases escrow to the seller. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ActiveDisputeBlocksRelease`] while a dispute
    /// is open and [`GatewayError::TransactionNotFound`] for unknown IDs.
    pub async fn release_escrow(&self, id: TransactionId) -> Result<ReleaseOutcome, GatewayError> {
        let outcome = self.ledger.release_escrow(id, self.clock.now()).await?;
        match &outcome {
            ReleaseOutcome::Released(tx) => {
                tracing::info!(
                    transaction_id = %tx.id,
                    seller_id = %tx.seller_id,
                    net_amount = tx.net_amount,
                    "escrow released"
                );
                let _ = self.event_bus.publish(LedgerEvent::EscrowReleased {
                    transaction_id: tx.id,
                    seller_id: tx.seller_id,
                    net_amount: tx.net_amount,
                    timestamp: self.clock.now(),
                });
            }
            ReleaseOutcome::AlreadySettled(status) => {
                tracing::debug!(transaction_id = %id, %status, "release skipped, already settled");
            }
            ReleaseOutcome::NotYetDue(at) => {
                tracing::debug!(transaction_id = %id, release_at = %at, "release skipped, not yet due");
            }
        }
        Ok(outcome)
    }

    /// Enqueues a release job for every escrow whose window has elapsed.
    /// This scan is the authoritative release trigger.
    ///
    /// # Errors
    ///
    /// Returns a ledger or queue failure.
    pub async fn enqueue_due_releases(&self, limit: u32) -> Result<usize, GatewayError> {
        let now = self.clock.now();
        let due = self.ledger.due_releases(now, limit).await?;
        for id in &due {
            self.queue.enqueue(&Job::escrow_release(*id, now, now)).await?;
        }
        if !due.is_empty() {
            tracing::info!(count = due.len(), "due escrow releases enqueued");
        }
        Ok(due.len())
    }

    /// Credits a user's available balance.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for non-positive amounts.
    pub async fn deposit(&self, user_id: UserId, amount: i64) -> Result<Wallet, GatewayError> {
        let wallet = self.ledger.deposit(user_id, amount).await?;
        tracing::info!(user_id = %user_id, amount, "wallet deposit");
        Ok(wallet)
    }

    /// Returns a user's balances.
    ///
    /// # Errors
    ///
    /// Returns a ledger failure.
    pub async fn wallet(&self, user_id: UserId) -> Result<Wallet, GatewayError> {
        self.ledger.wallet(user_id).await
    }

    /// Creates or replaces a listing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a non-positive price.
    pub async fn upsert_listing(&self, listing: Listing) -> Result<Listing, GatewayError> {
        if listing.price.is_some_and(|p| p <= 0) {
            return Err(GatewayError::InvalidRequest(
                "price must be positive".to_string(),
            ));
        }
        self.ledger.upsert_listing(listing).await
    }

    /// Fetches a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransactionNotFound`].
    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction, GatewayError> {
        self.ledger.transaction(id).await
    }

    /// Fetches a dispute.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DisputeNotFound`].
    pub async fn dispute(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        self.ledger.dispute(id).await
    }

    /// Disputes filed by `reporter_id`.
    ///
    /// # Errors
    ///
    /// Returns a ledger failure.
    pub async fn disputes_by_reporter(&self, reporter_id: UserId) -> Result<Vec<Dispute>, GatewayError> {
        self.ledger.disputes_by_reporter(reporter_id).await
    }

    /// Pending and investigating disputes.
    ///
    /// # Errors
    ///
    /// Returns a ledger failure.
    pub async fn open_disputes(&self, limit: u32) -> Result<Vec<Dispute>, GatewayError> {
        self.ledger.open_disputes(limit).await
    }

    async fn schedule_release(&self, tx: &Transaction) {
        let Some(release_at) = tx.escrow_release_at else {
            return;
        };
        let job = Job::escrow_release(tx.id, release_at, self.clock.now());
        if let Err(err) = self.queue.enqueue_at(&job, release_at).await {
            tracing::warn!(
                transaction_id = %tx.id,
                error = %err,
                "could not schedule escrow release, left to the poller"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{DisputeStatus, ManualClock};
    use crate::ledger::InMemoryLedger;
    use crate::queue::InMemoryJobQueue;
    use chrono::{Duration, Utc};

    struct Fixture {
        service: EscrowService,
        clock: Arc<ManualClock>,
        queue: Arc<InMemoryJobQueue>,
        events: tokio::sync::broadcast::Receiver<LedgerEvent>,
        buyer: UserId,
        seller: UserId,
        subject: SubjectRef,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dyn_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        let queue = Arc::new(InMemoryJobQueue::new(Arc::clone(&dyn_clock)));
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let service = EscrowService::new(
            Arc::new(InMemoryLedger::new()),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            bus,
            dyn_clock,
            EscrowSettings::default(),
        );
        let buyer = UserId::new();
        let seller = UserId::new();
        let subject = SubjectRef::material(uuid::Uuid::new_v4());
        let listing = Listing {
            subject,
            seller_id: seller,
            price: Some(100_000),
            available: true,
            file_key: Some("materials/notes.pdf".to_string()),
        };
        assert!(service.upsert_listing(listing).await.is_ok());
        assert!(service.deposit(buyer, 150_000).await.is_ok());
        Fixture {
            service,
            clock,
            queue,
            events,
            buyer,
            seller,
            subject,
        }
    }

    async fn buy(f: &Fixture) -> Transaction {
        let Ok(record) = f
            .service
            .initiate_purchase(f.buyer, f.subject, None, Some("k1".to_string()))
            .await
        else {
            panic!("purchase failed");
        };
        record.transaction
    }

    #[tokio::test]
    async fn purchase_schedules_release_and_publishes() {
        let mut f = fixture().await;
        let tx = buy(&f).await;
        assert_eq!(tx.status, TransactionStatus::EscrowHold);
        assert_eq!(
            f.queue.scheduled_at(&escrow_release_key(tx.id)).await,
            tx.escrow_release_at
        );
        let Ok(LedgerEvent::PurchaseCompleted { transaction_id, .. }) = f.events.recv().await else {
            panic!("expected purchase event");
        };
        assert_eq!(transaction_id, tx.id);
    }

    #[tokio::test]
    async fn dispute_cancels_schedule_and_reject_reschedules() {
        let f = fixture().await;
        let tx = buy(&f).await;
        f.clock.advance(Duration::days(1));

        let Ok(dispute) = f
            .service
            .file_dispute(NewDispute {
                transaction_id: tx.id,
                reporter_id: f.buyer,
                reason: "file is empty".to_string(),
                evidence_url: None,
            })
            .await
        else {
            panic!("dispute failed");
        };
        assert_eq!(f.queue.scheduled_len().await, 0);

        let Ok(resolution) = f
            .service
            .resolve_dispute(dispute.id, DisputeVerdict::ResolvedReject, UserId::new())
            .await
        else {
            panic!("resolve failed");
        };
        assert_eq!(resolution.dispute.status, DisputeStatus::ResolvedReject);
        assert_eq!(resolution.transaction.status, TransactionStatus::EscrowHold);
        assert_eq!(f.queue.scheduled_len().await, 1);
    }

    #[tokio::test]
    async fn reject_after_window_releases_immediately() {
        let f = fixture().await;
        let tx = buy(&f).await;
        f.clock.advance(Duration::days(1));
        let Ok(dispute) = f
            .service
            .file_dispute(NewDispute {
                transaction_id: tx.id,
                reporter_id: f.buyer,
                reason: "wrong file".to_string(),
                evidence_url: None,
            })
            .await
        else {
            panic!("dispute failed");
        };
        f.clock.advance(Duration::days(5));

        let Ok(resolution) = f
            .service
            .resolve_dispute(dispute.id, DisputeVerdict::ResolvedReject, UserId::new())
            .await
        else {
            panic!("resolve failed");
        };
        assert_eq!(resolution.transaction.status, TransactionStatus::Completed);
        let seller = f.service.wallet(f.seller).await.ok();
        assert_eq!(seller.map(|w| (w.available, w.escrow)), Some((90_000, 0)));
    }

    #[tokio::test]
    async fn poller_enqueues_only_elapsed_escrows() {
        let f = fixture().await;
        let _ = buy(&f).await;
        assert_eq!(f.service.enqueue_due_releases(10).await.ok(), Some(0));

        f.clock.advance(Duration::days(3));
        assert_eq!(f.service.enqueue_due_releases(10).await.ok(), Some(1));
        assert_eq!(
            f.queue.depth(crate::domain::JobTopic::EscrowRelease).await.ok(),
            Some(1)
        );
    }

    #[test]
    fn file_url_joins_without_double_slash() {
        let settings = EscrowSettings {
            file_base_url: "https://cdn.example/".to_string(),
            ..EscrowSettings::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let service = EscrowService::new(
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryJobQueue::new(Arc::clone(&clock))),
            EventBus::new(1),
            clock,
            settings,
        );
        assert_eq!(service.file_url("/a/b.pdf"), "https://cdn.example/a/b.pdf");
    }
}

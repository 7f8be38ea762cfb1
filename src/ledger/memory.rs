//! In-memory ledger guarded by a single async mutex.
//!
//! The lock is held for exactly one procedure and never across an external
//! call, which gives each procedure the same all-or-nothing semantics as a
//! database transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DisputeResolution, Ledger, PurchaseOrder, PurchaseRecord, ReleaseOutcome};
use crate::domain::{
    Dispute, DisputeId, DisputeStatus, DisputeVerdict, Listing, NewDispute, SubjectRef,
    Transaction, TransactionId, TransactionStatus, UserId, Wallet,
};
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct LedgerState {
    listings: HashMap<SubjectRef, Listing>,
    wallets: HashMap<UserId, Wallet>,
    transactions: HashMap<TransactionId, Transaction>,
    purchase_keys: HashMap<(UserId, String), TransactionId>,
    disputes: HashMap<DisputeId, Dispute>,
}

impl LedgerState {
    fn wallet_mut(&mut self, user_id: UserId) -> &mut Wallet {
        self.wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::empty(user_id))
    }

    fn open_dispute_for(&self, transaction_id: TransactionId) -> Option<&Dispute> {
        self.disputes
            .values()
            .find(|d| d.transaction_id == transaction_id && d.status.is_open())
    }

    fn replayed_purchase(&self, order: &PurchaseOrder) -> Option<PurchaseRecord> {
        let key = order.idempotency_key.clone()?;
        let tx_id = self.purchase_keys.get(&(order.buyer_id, key))?;
        let transaction = self.transactions.get(tx_id)?.clone();
        let file_key = self
            .listings
            .get(&transaction.subject)
            .and_then(|l| l.file_key.clone());
        Some(PurchaseRecord {
            transaction,
            file_key,
            replayed: true,
        })
    }
}

fn add(balance: i64, delta: i64) -> Result<i64, GatewayError> {
    balance
        .checked_add(delta)
        .ok_or_else(|| GatewayError::TransactionFailed("balance overflow".to_string()))
}

fn sub(balance: i64, delta: i64) -> Result<i64, GatewayError> {
    balance
        .checked_sub(delta)
        .filter(|v| *v >= 0)
        .ok_or_else(|| GatewayError::TransactionFailed("balance underflow".to_string()))
}

/// Process-local [`Ledger`] used for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions recorded.
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn upsert_listing(&self, listing: Listing) -> Result<Listing, GatewayError> {
        let mut state = self.state.lock().await;
        state.listings.insert(listing.subject, listing.clone());
        Ok(listing)
    }

    async fn listing(&self, subject: SubjectRef) -> Result<Option<Listing>, GatewayError> {
        Ok(self.state.lock().await.listings.get(&subject).cloned())
    }

    async fn deposit(&self, user_id: UserId, amount: i64) -> Result<Wallet, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "deposit amount must be positive, got {amount}"
            )));
        }
        let mut state = self.state.lock().await;
        let wallet = state.wallet_mut(user_id);
        wallet.available = add(wallet.available, amount)?;
        Ok(*wallet)
    }

    async fn wallet(&self, user_id: UserId) -> Result<Wallet, GatewayError> {
        Ok(self
            .state
            .lock()
            .await
            .wallets
            .get(&user_id)
            .copied()
            .unwrap_or_else(|| Wallet::empty(user_id)))
    }

    async fn execute_purchase(&self, order: PurchaseOrder) -> Result<PurchaseRecord, GatewayError> {
        let mut state = self.state.lock().await;

        if let Some(record) = state.replayed_purchase(&order) {
            return Ok(record);
        }

        let listing = state
            .listings
            .get(&order.subject)
            .cloned()
            .ok_or_else(|| GatewayError::SubjectNotFound(order.subject.to_string()))?;
        let split = order.price_against(&listing)?;

        let buyer_available = state
            .wallets
            .get(&order.buyer_id)
            .map_or(0, |w| w.available);
        if buyer_available < split.amount {
            return Err(GatewayError::InsufficientFunds {
                required: split.amount,
                available: buyer_available,
            });
        }

        let transaction = order.to_transaction(&listing, split);
        let seller_escrow = add(
            state
                .wallets
                .get(&listing.seller_id)
                .map_or(0, |w| w.escrow),
            split.net_amount,
        )?;

        // all checks passed; apply
        state.wallet_mut(order.buyer_id).available = buyer_available - split.amount;
        state.wallet_mut(listing.seller_id).escrow = seller_escrow;
        if let Some(key) = order.idempotency_key.clone() {
            state
                .purchase_keys
                .insert((order.buyer_id, key), transaction.id);
        }
        state
            .transactions
            .insert(transaction.id, transaction.clone());

        Ok(PurchaseRecord {
            transaction,
            file_key: listing.file_key,
            replayed: false,
        })
    }

    async fn transaction(&self, id: TransactionId) -> Result<Transaction, GatewayError> {
        self.state
            .lock()
            .await
            .transactions
            .get(&id)
            .cloned()
            .ok_or(GatewayError::TransactionNotFound(*id.as_uuid()))
    }

    async fn create_dispute(
        &self,
        input: NewDispute,
        now: DateTime<Utc>,
    ) -> Result<(Dispute, Transaction), GatewayError> {
        let mut state = self.state.lock().await;
        let transaction = state
            .transactions
            .get(&input.transaction_id)
            .cloned()
            .ok_or(GatewayError::TransactionNotFound(*input.transaction_id.as_uuid()))?;

        if transaction.buyer_id != input.reporter_id {
            return Err(GatewayError::TransactionNotEligible(
                "only the buyer can dispute this transaction".to_string(),
            ));
        }
        if !transaction.dispute_window_open(now) {
            return Err(GatewayError::TransactionNotEligible(format!(
                "transaction is {} and outside its dispute window",
                transaction.status
            )));
        }
        if let Some(existing) = state.open_dispute_for(transaction.id) {
            return Err(GatewayError::DisputeAlreadyExists(*existing.id.as_uuid()));
        }

        let dispute = Dispute {
            id: DisputeId::new(),
            transaction_id: transaction.id,
            reporter_id: input.reporter_id,
            reason: input.reason,
            evidence_url: input.evidence_url,
            status: DisputeStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        };
        state.disputes.insert(dispute.id, dispute.clone());
        Ok((dispute, transaction))
    }

    async fn dispute(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        self.state
            .lock()
            .await
            .disputes
            .get(&id)
            .cloned()
            .ok_or(GatewayError::DisputeNotFound(*id.as_uuid()))
    }

    async fn disputes_by_reporter(&self, reporter_id: UserId) -> Result<Vec<Dispute>, GatewayError> {
        let state = self.state.lock().await;
        let mut disputes: Vec<Dispute> = state
            .disputes
            .values()
            .filter(|d| d.reporter_id == reporter_id)
            .cloned()
            .collect();
        disputes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(disputes)
    }

    async fn open_disputes(&self, limit: u32) -> Result<Vec<Dispute>, GatewayError> {
        let state = self.state.lock().await;
        let mut disputes: Vec<Dispute> = state
            .disputes
            .values()
            .filter(|d| d.status.is_open())
            .cloned()
            .collect();
        disputes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        disputes.truncate(limit as usize);
        Ok(disputes)
    }

    async fn mark_investigating(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        let mut state = self.state.lock().await;
        let dispute = state
            .disputes
            .get_mut(&id)
            .ok_or(GatewayError::DisputeNotFound(*id.as_uuid()))?;
        if dispute.status != DisputeStatus::Pending {
            return Err(GatewayError::DisputeNotOpen(*id.as_uuid()));
        }
        dispute.status = DisputeStatus::Investigating;
        Ok(dispute.clone())
    }

    async fn resolve_dispute(
        &self,
        id: DisputeId,
        verdict: DisputeVerdict,
        admin_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<DisputeResolution, GatewayError> {
        let mut state = self.state.lock().await;
        let mut dispute = state
            .disputes
            .get(&id)
            .cloned()
            .ok_or(GatewayError::DisputeNotFound(*id.as_uuid()))?;
        if !dispute.status.is_open() {
            return Err(GatewayError::DisputeNotOpen(*id.as_uuid()));
        }
        let mut transaction = state
            .transactions
            .get(&dispute.transaction_id)
            .cloned()
            .ok_or(GatewayError::TransactionNotFound(*dispute.transaction_id.as_uuid()))?;

        if verdict == DisputeVerdict::ResolvedRefund {
            if !transaction
                .status
                .can_transition_to(TransactionStatus::Refunded)
            {
                return Err(GatewayError::TransactionNotEligible(format!(
                    "cannot refund a {} transaction",
                    transaction.status
                )));
            }
            let buyer_available = add(
                state
                    .wallets
                    .get(&transaction.buyer_id)
                    .map_or(0, |w| w.available),
                transaction.amount,
            )?;
            let seller_escrow = sub(
                state
                    .wallets
                    .get(&transaction.seller_id)
                    .map_or(0, |w| w.escrow),
                transaction.net_amount,
            )?;
            state.wallet_mut(transaction.buyer_id).available = buyer_available;
            state.wallet_mut(transaction.seller_id).escrow = seller_escrow;
            transaction.status = TransactionStatus::Refunded;
            state
                .transactions
                .insert(transaction.id, transaction.clone());
        }

        dispute.status = verdict.into();
        dispute.resolved_by = Some(admin_id);
        dispute.resolved_at = Some(now);
        state.disputes.insert(dispute.id, dispute.clone());

        Ok(DisputeResolution {
            dispute,
            transaction,
        })
    }

    async fn release_escrow(
        &self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, GatewayError> {
        let mut state = self.state.lock().await;
        let mut transaction = state
            .transactions
            .get(&id)
            .cloned()
            .ok_or(GatewayError::TransactionNotFound(*id.as_uuid()))?;

        if transaction.status != TransactionStatus::EscrowHold {
            return Ok(ReleaseOutcome::AlreadySettled(transaction.status));
        }
        if state.open_dispute_for(id).is_some() {
            return Err(GatewayError::ActiveDisputeBlocksRelease(*id.as_uuid()));
        }
        if let Some(at) = transaction.escrow_release_at.filter(|at| *at > now) {
            return Ok(ReleaseOutcome::NotYetDue(at));
        }

        let seller = state
            .wallets
            .get(&transaction.seller_id)
            .copied()
            .unwrap_or_else(|| Wallet::empty(transaction.seller_id));
        let escrow = sub(seller.escrow, transaction.net_amount)?;
        let available = add(seller.available, transaction.net_amount)?;
        let wallet = state.wallet_mut(transaction.seller_id);
        wallet.escrow = escrow;
        wallet.available = available;

        transaction.status = TransactionStatus::Completed;
        state
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(ReleaseOutcome::Released(transaction))
    }

    async fn due_releases(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransactionId>, GatewayError> {
        let state = self.state.lock().await;
        let mut due: Vec<&Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.is_release_due(now) && state.open_dispute_for(tx.id).is_none())
            .collect();
        due.sort_by_key(|tx| tx.escrow_release_at);
        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|tx| tx.id)
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Fixture {
        ledger: InMemoryLedger,
        buyer: UserId,
        seller: UserId,
        subject: SubjectRef,
        now: DateTime<Utc>,
    }

    async fn fixture(balance: i64, price: i64) -> Fixture {
        let ledger = InMemoryLedger::new();
        let buyer = UserId::new();
        let seller = UserId::new();
        let subject = SubjectRef::material(uuid::Uuid::new_v4());
        let listed = ledger
            .upsert_listing(Listing {
                subject,
                seller_id: seller,
                price: Some(price),
                available: true,
                file_key: Some("materials/notes.pdf".to_string()),
            })
            .await;
        assert!(listed.is_ok());
        if balance > 0 {
            assert!(ledger.deposit(buyer, balance).await.is_ok());
        }
        Fixture {
            ledger,
            buyer,
            seller,
            subject,
            now: Utc::now(),
        }
    }

    fn order(f: &Fixture, key: Option<&str>) -> PurchaseOrder {
        PurchaseOrder {
            buyer_id: f.buyer,
            subject: f.subject,
            amount: None,
            fee_bps: 1_000,
            escrow_window: Duration::days(3),
            idempotency_key: key.map(str::to_string),
            now: f.now,
        }
    }

    async fn purchase(f: &Fixture) -> Transaction {
        let Ok(record) = f.ledger.execute_purchase(order(f, None)).await else {
            panic!("purchase should succeed");
        };
        record.transaction
    }

    #[tokio::test]
    async fn purchase_moves_funds_into_escrow() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        assert_eq!(tx.status, TransactionStatus::EscrowHold);
        assert_eq!(tx.platform_fee, 10_000);
        assert_eq!(tx.net_amount, 90_000);
        assert_eq!(tx.escrow_release_at, Some(f.now + Duration::days(3)));

        let buyer = f.ledger.wallet(f.buyer).await.ok();
        assert_eq!(buyer.map(|w| w.available), Some(50_000));
        let seller = f.ledger.wallet(f.seller).await.ok();
        assert_eq!(seller.map(|w| (w.available, w.escrow)), Some((0, 90_000)));
    }

    #[tokio::test]
    async fn insufficient_funds_creates_nothing() {
        let f = fixture(50_000, 100_000).await;
        let result = f.ledger.execute_purchase(order(&f, None)).await;
        assert!(matches!(
            result,
            Err(GatewayError::InsufficientFunds {
                required: 100_000,
                available: 50_000
            })
        ));
        assert_eq!(f.ledger.transaction_count().await, 0);
        let buyer = f.ledger.wallet(f.buyer).await.ok();
        assert_eq!(buyer.map(|w| w.available), Some(50_000));
    }

    #[tokio::test]
    async fn same_key_returns_existing_transaction() {
        let f = fixture(300_000, 100_000).await;
        let Ok(first) = f.ledger.execute_purchase(order(&f, Some("k1"))).await else {
            panic!("first purchase");
        };
        let Ok(second) = f.ledger.execute_purchase(order(&f, Some("k1"))).await else {
            panic!("replayed purchase");
        };
        assert!(second.replayed);
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(f.ledger.transaction_count().await, 1);
        let buyer = f.ledger.wallet(f.buyer).await.ok();
        assert_eq!(buyer.map(|w| w.available), Some(200_000));
    }

    #[tokio::test]
    async fn unknown_subject_is_not_found() {
        let f = fixture(100, 10).await;
        let mut o = order(&f, None);
        o.subject = SubjectRef::ticket(uuid::Uuid::new_v4());
        assert!(matches!(
            f.ledger.execute_purchase(o).await,
            Err(GatewayError::SubjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_transaction_reports_its_uuid() {
        let f = fixture(100, 10).await;
        let missing = TransactionId::new();

        let Err(GatewayError::TransactionNotFound(id)) = f.ledger.transaction(missing).await else {
            panic!("lookup of an unknown transaction should fail");
        };
        assert_eq!(&id, missing.as_uuid());

        let released = f.ledger.release_escrow(missing, f.now).await;
        assert!(matches!(
            released,
            Err(GatewayError::TransactionNotFound(id)) if &id == missing.as_uuid()
        ));

        let filed = f
            .ledger
            .create_dispute(
                NewDispute {
                    transaction_id: missing,
                    reporter_id: f.buyer,
                    reason: "never bought".to_string(),
                    evidence_url: None,
                },
                f.now,
            )
            .await;
        assert!(matches!(filed, Err(GatewayError::TransactionNotFound(_))));
    }

    #[tokio::test]
    async fn release_credits_seller_once() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let due = f.now + Duration::days(3);

        let Ok(ReleaseOutcome::Released(done)) = f.ledger.release_escrow(tx.id, due).await else {
            panic!("first release should credit");
        };
        assert_eq!(done.status, TransactionStatus::Completed);

        let again = f.ledger.release_escrow(tx.id, due).await;
        assert!(matches!(
            again,
            Ok(ReleaseOutcome::AlreadySettled(TransactionStatus::Completed))
        ));
        let seller = f.ledger.wallet(f.seller).await.ok();
        assert_eq!(seller.map(|w| (w.available, w.escrow)), Some((90_000, 0)));
    }

    #[tokio::test]
    async fn release_before_window_is_a_no_op() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let outcome = f.ledger.release_escrow(tx.id, f.now).await;
        assert!(matches!(outcome, Ok(ReleaseOutcome::NotYetDue(_))));
    }

    #[tokio::test]
    async fn open_dispute_blocks_release_and_due_scan() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let filed = f
            .ledger
            .create_dispute(
                NewDispute {
                    transaction_id: tx.id,
                    reporter_id: f.buyer,
                    reason: "wrong file".to_string(),
                    evidence_url: None,
                },
                f.now + Duration::days(1),
            )
            .await;
        assert!(filed.is_ok());

        let later = f.now + Duration::days(10);
        assert!(matches!(
            f.ledger.release_escrow(tx.id, later).await,
            Err(GatewayError::ActiveDisputeBlocksRelease(_))
        ));
        assert_eq!(f.ledger.due_releases(later, 10).await.ok(), Some(vec![]));
    }

    #[tokio::test]
    async fn dispute_rules() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let input = |reporter| NewDispute {
            transaction_id: tx.id,
            reporter_id: reporter,
            reason: "missing pages".to_string(),
            evidence_url: None,
        };

        assert!(matches!(
            f.ledger.create_dispute(input(f.seller), f.now).await,
            Err(GatewayError::TransactionNotEligible(_))
        ));
        assert!(matches!(
            f.ledger
                .create_dispute(input(f.buyer), f.now + Duration::days(3))
                .await,
            Err(GatewayError::TransactionNotEligible(_))
        ));
        assert!(f.ledger.create_dispute(input(f.buyer), f.now).await.is_ok());
        assert!(matches!(
            f.ledger.create_dispute(input(f.buyer), f.now).await,
            Err(GatewayError::DisputeAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn refund_restores_buyer_balance() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let Ok((dispute, _)) = f
            .ledger
            .create_dispute(
                NewDispute {
                    transaction_id: tx.id,
                    reporter_id: f.buyer,
                    reason: "not as described".to_string(),
                    evidence_url: None,
                },
                f.now + Duration::days(1),
            )
            .await
        else {
            panic!("dispute should be filed");
        };

        let admin = UserId::new();
        let Ok(resolution) = f
            .ledger
            .resolve_dispute(
                dispute.id,
                DisputeVerdict::ResolvedRefund,
                admin,
                f.now + Duration::days(2),
            )
            .await
        else {
            panic!("refund should succeed");
        };
        assert_eq!(resolution.transaction.status, TransactionStatus::Refunded);
        assert_eq!(resolution.dispute.status, DisputeStatus::ResolvedRefund);
        assert_eq!(resolution.dispute.resolved_by, Some(admin));

        let buyer = f.ledger.wallet(f.buyer).await.ok();
        assert_eq!(buyer.map(|w| w.available), Some(150_000));
        let seller = f.ledger.wallet(f.seller).await.ok();
        assert_eq!(seller.map(|w| w.escrow), Some(0));

        assert!(matches!(
            f.ledger
                .resolve_dispute(dispute.id, DisputeVerdict::ResolvedReject, admin, f.now)
                .await,
            Err(GatewayError::DisputeNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn investigating_only_from_pending() {
        let f = fixture(150_000, 100_000).await;
        let tx = purchase(&f).await;
        let Ok((dispute, _)) = f
            .ledger
            .create_dispute(
                NewDispute {
                    transaction_id: tx.id,
                    reporter_id: f.buyer,
                    reason: "late".to_string(),
                    evidence_url: None,
                },
                f.now,
            )
            .await
        else {
            panic!("dispute should be filed");
        };
        assert!(f.ledger.mark_investigating(dispute.id).await.is_ok());
        assert!(matches!(
            f.ledger.mark_investigating(dispute.id).await,
            Err(GatewayError::DisputeNotOpen(_))
        ));
        assert_eq!(
            f.ledger.open_disputes(10).await.ok().map(|d| d.len()),
            Some(1)
        );
    }
}

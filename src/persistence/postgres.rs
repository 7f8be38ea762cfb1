//! PostgreSQL implementation of the [`Ledger`].
//!
//! Every procedure runs inside one database transaction. Rows that a
//! procedure reads and then changes are locked with `FOR UPDATE`, and every
//! balance change is a conditional `UPDATE ... WHERE balance >= amount` so
//! the database itself refuses to drive a balance negative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::models::{
    DISPUTE_COLUMNS, DisputeRow, LISTING_COLUMNS, ListingRow, TRANSACTION_COLUMNS,
    TransactionRow, dispute_from_row, listing_from_row, transaction_from_row,
};
use crate::domain::{
    Dispute, DisputeId, DisputeStatus, DisputeVerdict, Listing, NewDispute, SubjectRef,
    Transaction, TransactionId, TransactionStatus, UserId, Wallet,
};
use crate::error::GatewayError;
use crate::ledger::{DisputeResolution, Ledger, PurchaseOrder, PurchaseRecord, ReleaseOutcome};

const OPEN_DISPUTE_FILTER: &str = "status IN ('pending', 'investigating')";

/// Whether `err` is a unique constraint violation (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().is_some_and(|code| code.as_ref() == "23505");
    }
    false
}

type WalletRow = (Uuid, i64, i64);

fn wallet_from_row((user_id, available, escrow): WalletRow) -> Wallet {
    Wallet {
        user_id: user_id.into(),
        available,
        escrow,
    }
}

async fn fetch_transaction(
    conn: &mut PgConnection,
    id: TransactionId,
    for_update: bool,
) -> Result<Transaction, GatewayError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1{lock}");
    let row = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(GatewayError::TransactionNotFound(*id.as_uuid()))?;
    transaction_from_row(row)
}

async fn fetch_dispute(
    conn: &mut PgConnection,
    id: DisputeId,
    for_update: bool,
) -> Result<Dispute, GatewayError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = $1{lock}");
    let row = sqlx::query_as::<_, DisputeRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(GatewayError::DisputeNotFound(*id.as_uuid()))?;
    dispute_from_row(row)
}

async fn open_dispute_id(
    conn: &mut PgConnection,
    transaction_id: TransactionId,
) -> Result<Option<Uuid>, GatewayError> {
    let sql = format!(
        "SELECT id FROM disputes WHERE transaction_id = $1 AND {OPEN_DISPUTE_FILTER} LIMIT 1"
    );
    let id = sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(transaction_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

async fn listing_file_key(
    conn: &mut PgConnection,
    subject: SubjectRef,
) -> Result<Option<String>, GatewayError> {
    let key = sqlx::query_scalar::<_, Option<String>>(
        "SELECT file_key FROM listings WHERE subject_kind = $1 AND subject_id = $2",
    )
    .bind(subject.kind.as_str())
    .bind(subject.id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(key.flatten())
}

async fn find_replay(
    conn: &mut PgConnection,
    buyer_id: UserId,
    key: &str,
) -> Result<Option<PurchaseRecord>, GatewayError> {
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE buyer_id = $1 AND idempotency_key = $2"
    );
    let Some(row) = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(buyer_id.as_uuid())
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let transaction = transaction_from_row(row)?;
    let file_key = listing_file_key(conn, transaction.subject).await?;
    Ok(Some(PurchaseRecord {
        transaction,
        file_key,
        replayed: true,
    }))
}

async fn credit_available(
    conn: &mut PgConnection,
    user_id: UserId,
    amount: i64,
) -> Result<Wallet, GatewayError> {
    let row = sqlx::query_as::<_, WalletRow>(
        "INSERT INTO wallets (user_id, available) VALUES ($1, $2) \
         ON CONFLICT (user_id) DO UPDATE \
         SET available = wallets.available + EXCLUDED.available, updated_at = NOW() \
         RETURNING user_id, available, escrow",
    )
    .bind(user_id.as_uuid())
    .bind(amount)
    .fetch_one(&mut *conn)
    .await?;
    Ok(wallet_from_row(row))
}

async fn credit_escrow(
    conn: &mut PgConnection,
    user_id: UserId,
    amount: i64,
) -> Result<(), GatewayError> {
    sqlx::query(
        "INSERT INTO wallets (user_id, escrow) VALUES ($1, $2) \
         ON CONFLICT (user_id) DO UPDATE \
         SET escrow = wallets.escrow + EXCLUDED.escrow, updated_at = NOW()",
    )
    .bind(user_id.as_uuid())
    .bind(amount)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Debits `amount` from escrow, optionally crediting it to available.
async fn debit_escrow(
    conn: &mut PgConnection,
    user_id: UserId,
    amount: i64,
    to_available: bool,
) -> Result<(), GatewayError> {
    let credit = if to_available { amount } else { 0 };
    let updated = sqlx::query(
        "UPDATE wallets SET escrow = escrow - $2, available = available + $3, updated_at = NOW() \
         WHERE user_id = $1 AND escrow >= $2",
    )
    .bind(user_id.as_uuid())
    .bind(amount)
    .bind(credit)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(GatewayError::TransactionFailed(format!(
            "escrow balance of {user_id} is below {amount}"
        )));
    }
    Ok(())
}

async fn set_transaction_status(
    conn: &mut PgConnection,
    id: TransactionId,
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<(), GatewayError> {
    let updated = sqlx::query(
        "UPDATE transactions SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
    )
    .bind(id.as_uuid())
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(GatewayError::TransactionFailed(format!(
            "transaction {id} left {from} concurrently"
        )));
    }
    Ok(())
}

/// PostgreSQL-backed [`Ledger`] using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Creates a ledger over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn replay_after_conflict(
        &self,
        buyer_id: UserId,
        key: &str,
    ) -> Result<PurchaseRecord, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        find_replay(&mut conn, buyer_id, key).await?.ok_or_else(|| {
            GatewayError::TransactionFailed("conflicting purchase vanished".to_string())
        })
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn upsert_listing(&self, listing: Listing) -> Result<Listing, GatewayError> {
        sqlx::query(
            "INSERT INTO listings (subject_kind, subject_id, seller_id, price, available, file_key) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (subject_kind, subject_id) DO UPDATE SET \
               seller_id = EXCLUDED.seller_id, price = EXCLUDED.price, \
               available = EXCLUDED.available, file_key = EXCLUDED.file_key, updated_at = NOW()",
        )
        .bind(listing.subject.kind.as_str())
        .bind(listing.subject.id)
        .bind(listing.seller_id.as_uuid())
        .bind(listing.price)
        .bind(listing.available)
        .bind(listing.file_key.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(listing)
    }

    async fn listing(&self, subject: SubjectRef) -> Result<Option<Listing>, GatewayError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE subject_kind = $1 AND subject_id = $2"
        );
        sqlx::query_as::<_, ListingRow>(&sql)
            .bind(subject.kind.as_str())
            .bind(subject.id)
            .fetch_optional(&self.pool)
            .await?
            .map(listing_from_row)
            .transpose()
    }

    async fn deposit(&self, user_id: UserId, amount: i64) -> Result<Wallet, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "deposit amount must be positive, got {amount}"
            )));
        }
        let mut conn = self.pool.acquire().await?;
        credit_available(&mut conn, user_id, amount).await
    }

    async fn wallet(&self, user_id: UserId) -> Result<Wallet, GatewayError> {
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT user_id, available, escrow FROM wallets WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map_or_else(|| Wallet::empty(user_id), wallet_from_row))
    }

    async fn execute_purchase(&self, order: PurchaseOrder) -> Result<PurchaseRecord, GatewayError> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = order.idempotency_key.as_deref() {
            if let Some(record) = find_replay(&mut tx, order.buyer_id, key).await? {
                return Ok(record);
            }
        }

        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE subject_kind = $1 AND subject_id = $2 FOR SHARE"
        );
        let listing = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(order.subject.kind.as_str())
            .bind(order.subject.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(listing_from_row)
            .transpose()?
            .ok_or_else(|| GatewayError::SubjectNotFound(order.subject.to_string()))?;
        let split = order.price_against(&listing)?;
        let transaction = order.to_transaction(&listing, split);

        // the row starts pending and only reaches escrow_hold once money moved
        let inserted = sqlx::query(
            "INSERT INTO transactions (id, buyer_id, seller_id, subject_kind, subject_id, amount, \
               platform_fee, net_amount, tx_type, status, escrow_release_at, idempotency_key, \
               created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(transaction.id.as_uuid())
        .bind(transaction.buyer_id.as_uuid())
        .bind(transaction.seller_id.as_uuid())
        .bind(transaction.subject.kind.as_str())
        .bind(transaction.subject.id)
        .bind(transaction.amount)
        .bind(transaction.platform_fee)
        .bind(transaction.net_amount)
        .bind(transaction.tx_type.as_str())
        .bind(TransactionStatus::Pending.as_str())
        .bind(transaction.escrow_release_at)
        .bind(transaction.idempotency_key.as_deref())
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if let (true, Some(key)) = (is_unique_violation(&err), order.idempotency_key.as_deref()) {
                drop(tx);
                tracing::debug!(buyer_id = %order.buyer_id, "concurrent purchase with same key, replaying");
                return self.replay_after_conflict(order.buyer_id, key).await;
            }
            return Err(err.into());
        }

        let debited = sqlx::query_scalar::<_, i64>(
            "UPDATE wallets SET available = available - $2, updated_at = NOW() \
             WHERE user_id = $1 AND available >= $2 RETURNING available",
        )
        .bind(order.buyer_id.as_uuid())
        .bind(split.amount)
        .fetch_optional(&mut *tx)
        .await?;
        if debited.is_none() {
            let available =
                sqlx::query_scalar::<_, i64>("SELECT available FROM wallets WHERE user_id = $1")
                    .bind(order.buyer_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?
                    .unwrap_or(0);
            return Err(GatewayError::InsufficientFunds {
                required: split.amount,
                available,
            });
        }

        credit_escrow(&mut tx, listing.seller_id, split.net_amount).await?;
        set_transaction_status(
            &mut tx,
            transaction.id,
            TransactionStatus::Pending,
            TransactionStatus::EscrowHold,
        )
        .await?;
        tx.commit().await?;

        Ok(PurchaseRecord {
            transaction,
            file_key: listing.file_key,
            replayed: false,
        })
    }

    async fn transaction(&self, id: TransactionId) -> Result<Transaction, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, id, false).await
    }

    async fn create_dispute(
        &self,
        input: NewDispute,
        now: DateTime<Utc>,
    ) -> Result<(Dispute, Transaction), GatewayError> {
        let mut tx = self.pool.begin().await?;
        let transaction = fetch_transaction(&mut tx, input.transaction_id, true).await?;

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
        if let Some(existing) = open_dispute_id(&mut tx, transaction.id).await? {
            return Err(GatewayError::DisputeAlreadyExists(existing));
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
        sqlx::query(
            "INSERT INTO disputes (id, transaction_id, reporter_id, reason, evidence_url, status, \
               created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(dispute.id.as_uuid())
        .bind(dispute.transaction_id.as_uuid())
        .bind(dispute.reporter_id.as_uuid())
        .bind(&dispute.reason)
        .bind(dispute.evidence_url.as_deref())
        .bind(dispute.status.as_str())
        .bind(dispute.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GatewayError::DisputeAlreadyExists(*transaction.id.as_uuid())
            } else {
                GatewayError::from(e)
            }
        })?;
        tx.commit().await?;

        Ok((dispute, transaction))
    }

    async fn dispute(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        fetch_dispute(&mut conn, id, false).await
    }

    async fn disputes_by_reporter(&self, reporter_id: UserId) -> Result<Vec<Dispute>, GatewayError> {
        let sql = format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE reporter_id = $1 ORDER BY created_at DESC"
        );
        sqlx::query_as::<_, DisputeRow>(&sql)
            .bind(reporter_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(dispute_from_row)
            .collect()
    }

    async fn open_disputes(&self, limit: u32) -> Result<Vec<Dispute>, GatewayError> {
        let sql = format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE {OPEN_DISPUTE_FILTER} \
             ORDER BY created_at ASC LIMIT $1"
        );
        sqlx::query_as::<_, DisputeRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(dispute_from_row)
            .collect()
    }

    async fn mark_investigating(&self, id: DisputeId) -> Result<Dispute, GatewayError> {
        let sql = format!(
            "UPDATE disputes SET status = 'investigating' WHERE id = $1 AND status = 'pending' \
             RETURNING {DISPUTE_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, DisputeRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match updated {
            Some(row) => dispute_from_row(row),
            None => {
                // distinguishes a missing dispute from one that is not pending
                self.dispute(id).await?;
                Err(GatewayError::DisputeNotOpen(*id.as_uuid()))
            }
        }
    }

    async fn resolve_dispute(
        &self,
        id: DisputeId,
        verdict: DisputeVerdict,
        admin_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<DisputeResolution, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let mut dispute = fetch_dispute(&mut tx, id, true).await?;
        if !dispute.status.is_open() {
            return Err(GatewayError::DisputeNotOpen(*id.as_uuid()));
        }
        let mut transaction = fetch_transaction(&mut tx, dispute.transaction_id, true).await?;

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
            credit_available(&mut tx, transaction.buyer_id, transaction.amount).await?;
            debit_escrow(&mut tx, transaction.seller_id, transaction.net_amount, false).await?;
            set_transaction_status(
                &mut tx,
                transaction.id,
                TransactionStatus::EscrowHold,
                TransactionStatus::Refunded,
            )
            .await?;
            transaction.status = TransactionStatus::Refunded;
        }

        dispute.status = verdict.into();
        dispute.resolved_by = Some(admin_id);
        dispute.resolved_at = Some(now);
        sqlx::query("UPDATE disputes SET status = $2, resolved_by = $3, resolved_at = $4 WHERE id = $1")
            .bind(dispute.id.as_uuid())
            .bind(dispute.status.as_str())
            .bind(admin_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;
        let mut transaction = fetch_transaction(&mut tx, id, true).await?;

        if transaction.status != TransactionStatus::EscrowHold {
            return Ok(ReleaseOutcome::AlreadySettled(transaction.status));
        }
        if open_dispute_id(&mut tx, id).await?.is_some() {
            return Err(GatewayError::ActiveDisputeBlocksRelease(*id.as_uuid()));
        }
        if let Some(at) = transaction.escrow_release_at.filter(|at| *at > now) {
            return Ok(ReleaseOutcome::NotYetDue(at));
        }

        debit_escrow(&mut tx, transaction.seller_id, transaction.net_amount, true).await?;
        set_transaction_status(
            &mut tx,
            id,
            TransactionStatus::EscrowHold,
            TransactionStatus::Completed,
        )
        .await?;
        tx.commit().await?;

        transaction.status = TransactionStatus::Completed;
        Ok(ReleaseOutcome::Released(transaction))
    }

    async fn due_releases(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransactionId>, GatewayError> {
        let sql = format!(
            "SELECT t.id FROM transactions t \
             WHERE t.status = 'escrow_hold' AND t.escrow_release_at <= $1 \
               AND NOT EXISTS ( \
                 SELECT 1 FROM disputes d WHERE d.transaction_id = t.id AND d.{OPEN_DISPUTE_FILTER}) \
             ORDER BY t.escrow_release_at ASC LIMIT $2"
        );
        let ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(TransactionId::from).collect())
    }
}

//! Value transfers, their state machine and the fee policy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{TransactionId, UserId};
use crate::error::GatewayError;

/// Basis-point denominator (100 % = 10 000 bps).
const BPS_DENOMINATOR: i128 = 10_000;

/// What kind of value transfer a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Marketplace material purchase.
    Purchase,
    /// Donation to a live stream.
    Donation,
    /// Event ticket purchase.
    TicketBuy,
}

impl TransactionType {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Donation => "donation",
            Self::TicketBuy => "ticket_buy",
        }
    }
}

impl FromStr for TransactionType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "donation" => Ok(Self::Donation),
            "ticket_buy" => Ok(Self::TicketBuy),
            other => Err(GatewayError::Internal(format!(
                "unknown transaction type: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a [`Transaction`].
///
/// ```text
/// pending ──► escrow_hold ──► completed
///    │             └────────► refunded
///    └──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, funds not yet moved.
    Pending,
    /// Buyer debited, seller not yet credited.
    EscrowHold,
    /// Seller credited. Terminal.
    Completed,
    /// Never reached escrow. Terminal.
    Failed,
    /// Buyer credited back after a dispute. Terminal.
    Refunded,
}

impl TransactionStatus {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::EscrowHold => "escrow_hold",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Whether the state machine allows `self → next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::EscrowHold)
                | (Self::Pending, Self::Failed)
                | (Self::EscrowHold, Self::Completed)
                | (Self::EscrowHold, Self::Refunded)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Refunded)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "escrow_hold" => Ok(Self::EscrowHold),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(GatewayError::Internal(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

/// Kind of purchasable subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// Study material sold on the marketplace.
    Material,
    /// Live stream receiving donations.
    Stream,
    /// Event whose tickets are sold.
    Ticket,
}

impl SubjectKind {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Material => "material",
            Self::Stream => "stream",
            Self::Ticket => "ticket",
        }
    }

    /// Transaction type created when this kind of subject is bought.
    #[must_use]
    pub const fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Material => TransactionType::Purchase,
            Self::Stream => TransactionType::Donation,
            Self::Ticket => TransactionType::TicketBuy,
        }
    }
}

impl FromStr for SubjectKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "material" => Ok(Self::Material),
            "stream" => Ok(Self::Stream),
            "ticket" => Ok(Self::Ticket),
            other => Err(GatewayError::Internal(format!(
                "unknown subject kind: {other}"
            ))),
        }
    }
}

/// Reference to the thing a transaction pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SubjectRef {
    /// Subject kind.
    pub kind: SubjectKind,
    /// Material, stream or event ID.
    pub id: uuid::Uuid,
}

impl SubjectRef {
    /// Reference to a marketplace material.
    #[must_use]
    pub const fn material(id: uuid::Uuid) -> Self {
        Self {
            kind: SubjectKind::Material,
            id,
        }
    }

    /// Reference to a live stream.
    #[must_use]
    pub const fn stream(id: uuid::Uuid) -> Self {
        Self {
            kind: SubjectKind::Stream,
            id,
        }
    }

    /// Reference to an event's tickets.
    #[must_use]
    pub const fn ticket(id: uuid::Uuid) -> Self {
        Self {
            kind: SubjectKind::Ticket,
            id,
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Split of a gross amount into platform fee and seller net.
///
/// Computed exactly once, when the transaction is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    /// Gross amount paid by the buyer.
    pub amount: i64,
    /// Platform share, `round(amount * rate)`.
    pub platform_fee: i64,
    /// Seller share, `amount - platform_fee`.
    pub net_amount: i64,
}

impl FeeSplit {
    /// Splits `amount` using a fee rate in basis points, rounding half up.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if `amount` is not positive
    /// or the rate exceeds 100 %.
    pub fn compute(amount: i64, fee_bps: u32) -> Result<Self, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "amount must be positive, got {amount}"
            )));
        }
        if i128::from(fee_bps) > BPS_DENOMINATOR {
            return Err(GatewayError::InvalidRequest(format!(
                "fee rate {fee_bps} bps exceeds 100%"
            )));
        }
        let scaled = i128::from(amount) * i128::from(fee_bps) + BPS_DENOMINATOR / 2;
        let platform_fee = i64::try_from(scaled / BPS_DENOMINATOR)
            .map_err(|_| GatewayError::InvalidRequest("amount too large".to_string()))?;
        Ok(Self {
            amount,
            platform_fee,
            net_amount: amount - platform_fee,
        })
    }
}

/// One value transfer between a buyer and a seller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Paying user.
    pub buyer_id: UserId,
    /// Receiving user.
    pub seller_id: UserId,
    /// What is being paid for.
    pub subject: SubjectRef,
    /// Gross amount.
    pub amount: i64,
    /// Platform fee.
    pub platform_fee: i64,
    /// Seller net amount.
    pub net_amount: i64,
    /// Kind of transfer.
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Lifecycle state.
    pub status: TransactionStatus,
    /// When escrow may be released; `None` outside escrow.
    pub escrow_release_at: Option<DateTime<Utc>>,
    /// Idempotency key the purchase was made with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether the escrow window has elapsed at `now`.
    #[must_use]
    pub fn is_release_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::EscrowHold
            && self.escrow_release_at.is_some_and(|at| at <= now)
    }

    /// Whether a dispute may still be filed at `now`.
    #[must_use]
    pub fn dispute_window_open(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::EscrowHold
            && self.escrow_release_at.is_some_and(|at| at > now)
    }

    /// Checks `amount == platform_fee + net_amount`.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.amount == self.platform_fee + self.net_amount
    }
}

/// The ledger's view of something that can be bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Listing {
    /// The subject this listing sells.
    pub subject: SubjectRef,
    /// Who receives the proceeds.
    pub seller_id: UserId,
    /// Fixed price; `None` means the buyer chooses the amount (donations).
    pub price: Option<i64>,
    /// Whether the subject can currently be bought.
    pub available: bool,
    /// Storage key of the purchased file, if any.
    #[serde(default)]
    pub file_key: Option<String>,
}

/// Balances of a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Wallet {
    /// Owner.
    pub user_id: UserId,
    /// Spendable balance.
    pub available: i64,
    /// Seller proceeds still held in escrow.
    pub escrow: i64,
}

impl Wallet {
    /// An empty wallet.
    #[must_use]
    pub const fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            available: 0,
            escrow: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ten_percent_fee_on_round_amount() {
        let Ok(split) = FeeSplit::compute(100_000, 1_000) else {
            panic!("valid split");
        };
        assert_eq!(split.platform_fee, 10_000);
        assert_eq!(split.net_amount, 90_000);
    }

    #[test]
    fn fee_rounds_half_up() {
        let Ok(split) = FeeSplit::compute(15, 1_000) else {
            panic!("valid split");
        };
        // 1.5 rounds to 2
        assert_eq!(split.platform_fee, 2);
        assert_eq!(split.net_amount, 13);

        let Ok(split) = FeeSplit::compute(14, 1_000) else {
            panic!("valid split");
        };
        assert_eq!(split.platform_fee, 1);
    }

    #[test]
    fn fee_split_always_balances() {
        for amount in [1_i64, 7, 99, 1_234, 100_000, 987_654_321] {
            let Ok(split) = FeeSplit::compute(amount, 1_000) else {
                panic!("valid split");
            };
            assert_eq!(split.amount, split.platform_fee + split.net_amount);
        }
    }

    #[test]
    fn non_positive_amount_rejected() {
        assert!(FeeSplit::compute(0, 1_000).is_err());
        assert!(FeeSplit::compute(-5, 1_000).is_err());
        assert!(FeeSplit::compute(10, 10_001).is_err());
    }

    #[test]
    fn state_machine_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(EscrowHold));
        assert!(Pending.can_transition_to(Failed));
        assert!(EscrowHold.can_transition_to(Completed));
        assert!(EscrowHold.can_transition_to(Refunded));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!EscrowHold.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(EscrowHold));
        assert!(Completed.is_terminal() && Refunded.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::EscrowHold,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().ok(), Some(status));
        }
    }

    #[test]
    fn release_and_dispute_windows() {
        let now = Utc::now();
        let tx = Transaction {
            id: TransactionId::new(),
            buyer_id: UserId::new(),
            seller_id: UserId::new(),
            subject: SubjectRef::material(uuid::Uuid::new_v4()),
            amount: 100,
            platform_fee: 10,
            net_amount: 90,
            tx_type: TransactionType::Purchase,
            status: TransactionStatus::EscrowHold,
            escrow_release_at: Some(now + Duration::days(3)),
            idempotency_key: None,
            created_at: now,
        };
        assert!(tx.dispute_window_open(now));
        assert!(!tx.is_release_due(now));
        let later = now + Duration::days(3);
        assert!(!tx.dispute_window_open(later));
        assert!(tx.is_release_due(later));
        assert!(tx.is_balanced());
    }

    #[test]
    fn subject_kind_maps_to_transaction_type() {
        assert_eq!(SubjectKind::Material.transaction_type(), TransactionType::Purchase);
        assert_eq!(SubjectKind::Stream.transaction_type(), TransactionType::Donation);
        assert_eq!(SubjectKind::Ticket.transaction_type(), TransactionType::TicketBuy);
    }
}

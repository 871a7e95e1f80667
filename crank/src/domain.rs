//! Entities consumed or owned by the CORE (spec Sec. 3).
//!
//! `Order` and `TradingPair` are observed from the `Ledger` collaborator and
//! never mutated here. `SettlementRequest` and friends are owned by the
//! CORE and persisted through the operational store.

use serde::{Deserialize, Serialize};

/// A 16-byte hash-based order identifier, matching the on-chain program's
/// V2 order-id scheme (no sequential correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub [u8; 16]);

impl OrderId {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A base58-encoded on-chain address (wallet, mint, or program pubkey).
/// Kept as an opaque newtype rather than a full pubkey type since the CORE
/// never does curve arithmetic on it -- it only round-trips through the
/// Ledger and the relayer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Address(bs58::encode(bytes).into_string())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Active,
    Matching,
    Inactive,
    Cancelled,
    Expired,
}

/// An order as observed from the Ledger. Immutable between successive reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner: Address,
    pub pair_id: Address,
    pub side: Side,
    pub status: OrderStatus,
    pub filled: bool,
    /// All-zero when there is no pending match request.
    pub pending_match_request: [u8; 32],
    pub is_matching: bool,
}

impl Order {
    pub const NO_PENDING_REQUEST: [u8; 32] = [0u8; 32];

    pub fn has_pending_match_request(&self) -> bool {
        self.pending_match_request != Self::NO_PENDING_REQUEST
    }

    /// An order is "matched but unsettled" per spec Sec 4.5 step 1 iff it is
    /// Inactive, filled, and carries a non-default pending match request.
    pub fn is_matched_unsettled(&self) -> bool {
        self.status == OrderStatus::Inactive
            && self.filled
            && self.has_pending_match_request()
    }

    /// Maps this order's on-chain status onto the order-state cache's
    /// coarser status vocabulary (spec Sec 4 C1 OrderStateCache).
    pub fn cached_status(&self) -> CachedOrderStatus {
        match self.status {
            OrderStatus::Active => CachedOrderStatus::Open,
            OrderStatus::Matching => CachedOrderStatus::Matching,
            OrderStatus::Inactive if self.filled => CachedOrderStatus::Filled,
            OrderStatus::Inactive | OrderStatus::Cancelled | OrderStatus::Expired => {
                CachedOrderStatus::Cancelled
            }
        }
    }

    pub fn cached_side(&self) -> CachedSide {
        match self.side {
            Side::Buy => CachedSide::Buy,
            Side::Sell => CachedSide::Sell,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingPair {
    pub pair_id: Address,
    pub base_asset: Address,
    pub quote_asset: Address,
}

/// One page of order activity observed since a given slot, as surfaced by
/// the Ledger's subscribe-to-new-blocks operation (spec Sec 1/6). A
/// concrete Ledger backs this with a chain subscription and buffers
/// account changes behind this pull cursor, so the CORE never needs its
/// own websocket plumbing; `since_slot = 0` means "everything observed so
/// far".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderActivityPage {
    pub orders: Vec<Order>,
    pub newest_slot: u64,
}

/// Canonical lock key for an order pair: lexicographically ordered so both
/// observers of the same match compute the same key regardless of which
/// side (buy/sell) they read first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey(pub OrderId, pub OrderId);

impl PairKey {
    pub fn new(buy: OrderId, sell: OrderId) -> Self {
        if buy <= sell {
            PairKey(buy, sell)
        } else {
            PairKey(sell, buy)
        }
    }

    pub fn as_lock_name(&self) -> String {
        format!("settlement:{}:{}", self.0, self.1)
    }
}

/// Settlement id: derived deterministically from the order pair so
/// `initiate` is naturally idempotent on repeated observation of the same
/// match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SettlementId(pub String);

impl SettlementId {
    pub fn derive(buy: OrderId, sell: OrderId) -> Self {
        SettlementId(format!("{}:{}", buy, sell))
    }
}

impl std::fmt::Display for SettlementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementMethod {
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Pending,
    BaseTransferred,
    QuoteTransferred,
    Completed,
    Failed,
    Expired,
    RollingBack,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SettlementStatus::Completed | SettlementStatus::Failed | SettlementStatus::Expired
        )
    }

    /// Position in the linear progression, used to enforce the "status never
    /// regresses" invariant (spec Sec 3, Sec 8 property 2). RollingBack is
    /// deliberately ordered after QuoteTransferred: it is reached only from
    /// BaseTransferred/QuoteTransferred and leads only to Failed.
    pub fn order_index(self) -> u8 {
        match self {
            SettlementStatus::Pending => 0,
            SettlementStatus::BaseTransferred => 1,
            SettlementStatus::QuoteTransferred => 2,
            SettlementStatus::RollingBack => 3,
            SettlementStatus::Completed => 4,
            SettlementStatus::Failed => 4,
            SettlementStatus::Expired => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub id: SettlementId,
    pub buy_order: OrderId,
    pub sell_order: OrderId,
    pub buy_owner: Address,
    pub sell_owner: Address,
    pub base_asset: Address,
    pub quote_asset: Address,
    pub method: SettlementMethod,
    pub status: SettlementStatus,
    pub base_transfer_id: Option<String>,
    pub quote_transfer_id: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub failure_reason: Option<String>,
}

impl SettlementRequest {
    /// Invariant from spec Sec 3/8: BaseTransferred-or-later implies
    /// base_transfer_id is set; QuoteTransferred-or-Completed implies both
    /// transfer ids are set.
    pub fn check_leg_invariant(&self) -> bool {
        let base_ok = !matches!(
            self.status,
            SettlementStatus::BaseTransferred
                | SettlementStatus::QuoteTransferred
                | SettlementStatus::Completed
                | SettlementStatus::RollingBack
        ) || self.base_transfer_id.is_some();

        let quote_ok = !matches!(
            self.status,
            SettlementStatus::QuoteTransferred | SettlementStatus::Completed
        ) || self.quote_transfer_id.is_some();

        base_ok && quote_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Match,
    Settlement,
    Rollback,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionHistoryEntry {
    pub signature: String,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub buy_order: Option<OrderId>,
    pub sell_order: Option<OrderId>,
    pub slot: Option<u64>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOpStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: i64,
    pub op_type: String,
    pub natural_key: String,
    pub payload: serde_json::Value,
    pub status: PendingOpStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<u64>,
    pub not_before: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedLockRow {
    pub name: String,
    pub owner: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedOrderStatus {
    Open,
    Matching,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStateCacheEntry {
    pub order: OrderId,
    pub pair: Address,
    pub side: CachedSide,
    pub status: CachedOrderStatus,
    pub owner: Address,
    pub slot: u64,
    pub updated_at: u64,
}

/// Payload of a rollback `PendingOperation`, per spec Sec 4.4 rollback
/// protocol: the settlement id and the original base-leg transfer id to
/// reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPayload {
    pub settlement_id: SettlementId,
    pub original_base_transfer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        let a = OrderId([1u8; 16]);
        let b = OrderId([2u8; 16]);
        assert_eq!(PairKey::new(a, b), PairKey::new(b, a));
    }

    #[test]
    fn settlement_status_ordering_never_lets_completed_look_earlier_than_pending() {
        assert!(SettlementStatus::Completed.order_index() > SettlementStatus::Pending.order_index());
        assert!(
            SettlementStatus::QuoteTransferred.order_index()
                > SettlementStatus::BaseTransferred.order_index()
        );
    }

    #[test]
    fn leg_invariant_requires_base_transfer_id_once_base_transferred() {
        let mut req = SettlementRequest {
            id: SettlementId::derive(OrderId([1; 16]), OrderId([2; 16])),
            buy_order: OrderId([1; 16]),
            sell_order: OrderId([2; 16]),
            buy_owner: Address("buyer".into()),
            sell_owner: Address("seller".into()),
            base_asset: Address("base".into()),
            quote_asset: Address("quote".into()),
            method: SettlementMethod::Private,
            status: SettlementStatus::BaseTransferred,
            base_transfer_id: None,
            quote_transfer_id: None,
            created_at: 0,
            expires_at: 300,
            failure_reason: None,
        };
        assert!(!req.check_leg_invariant());
        req.base_transfer_id = Some("t1".into());
        assert!(req.check_leg_invariant());
    }
}

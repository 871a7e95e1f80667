//! Ledger collaborator: the abstract on-chain data source the orchestrator
//! polls for filled orders and through which it submits/confirms
//! transactions. Per spec Sec 6, decoding on-chain account bytes is the
//! Ledger's responsibility -- the CORE never hard-codes byte offsets, it
//! only receives decoded [`Order`]/[`TradingPair`] records.
//!
//! No concrete implementation ships here: a real Ledger talking to a
//! specific chain's RPC is out of scope (see spec Non-goals).

use crate::domain::{Address, Order, OrderActivityPage, TradingPair};
use crate::error::CrankResult;

/// Observed on-chain state, read-only from the CORE's perspective.
pub trait Ledger: Send + Sync {
    /// Orders currently matched and awaiting settlement for a pair.
    fn fetch_matched_orders(
        &self,
        pair: &Address,
    ) -> impl std::future::Future<Output = CrankResult<Vec<Order>>> + Send;

    /// Subscribe-to-new-blocks, exposed as a pull cursor: returns every
    /// order that changed on or after `since_slot` plus the newest slot
    /// observed, so the orchestrator can keep the order-state cache fresh
    /// without rescanning the whole exchange every iteration.
    fn fetch_order_activity(
        &self,
        since_slot: u64,
    ) -> impl std::future::Future<Output = CrankResult<OrderActivityPage>> + Send;

    fn fetch_trading_pair(
        &self,
        pair: &Address,
    ) -> impl std::future::Future<Output = CrankResult<TradingPair>> + Send;

    fn fetch_balance(
        &self,
        owner: &Address,
        mint: &Address,
    ) -> impl std::future::Future<Output = CrankResult<u64>> + Send;

    /// Submits a transaction and returns its signature.
    fn submit_transaction(
        &self,
        payload: &[u8],
    ) -> impl std::future::Future<Output = CrankResult<String>> + Send;

    /// Polls for confirmation of a previously submitted signature.
    fn confirm_signature(
        &self,
        signature: &str,
    ) -> impl std::future::Future<Output = CrankResult<bool>> + Send;

    fn current_slot(&self) -> impl std::future::Future<Output = CrankResult<u64>> + Send;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Hand-written fake used by orchestrator tests: no network, state
    /// lives in memory and is set up directly by the test.
    #[derive(Default)]
    pub struct FakeLedger {
        pub matched_orders: Mutex<HashMap<String, Vec<Order>>>,
        pub balances: Mutex<HashMap<(String, String), u64>>,
        pub confirmed_signatures: Mutex<std::collections::HashSet<String>>,
        pub slot: Mutex<u64>,
    }

    impl FakeLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_matched_orders(&self, pair: &Address, orders: Vec<Order>) {
            self.matched_orders.lock().unwrap().insert(pair.0.clone(), orders);
        }
    }

    impl Ledger for FakeLedger {
        async fn fetch_matched_orders(&self, pair: &Address) -> CrankResult<Vec<Order>> {
            Ok(self
                .matched_orders
                .lock()
                .unwrap()
                .get(&pair.0)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_trading_pair(&self, pair: &Address) -> CrankResult<TradingPair> {
            // Real relayer-supported mints (wSOL/USDC) so orchestrator tests
            // exercise the private-settlement path rather than the
            // unsupported-pair rejection.
            Ok(TradingPair {
                pair_id: pair.clone(),
                base_asset: Address("So11111111111111111111111111111111111111112".into()),
                quote_asset: Address("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into()),
            })
        }

        async fn fetch_order_activity(&self, _since_slot: u64) -> CrankResult<OrderActivityPage> {
            let orders: Vec<Order> = self
                .matched_orders
                .lock()
                .unwrap()
                .values()
                .flatten()
                .cloned()
                .collect();
            Ok(OrderActivityPage {
                orders,
                newest_slot: *self.slot.lock().unwrap(),
            })
        }

        async fn fetch_balance(&self, owner: &Address, mint: &Address) -> CrankResult<u64> {
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(&(owner.0.clone(), mint.0.clone()))
                .copied()
                .unwrap_or(0))
        }

        async fn submit_transaction(&self, _payload: &[u8]) -> CrankResult<String> {
            Ok(format!("fake-sig-{}", uuid_like()))
        }

        async fn confirm_signature(&self, signature: &str) -> CrankResult<bool> {
            Ok(self.confirmed_signatures.lock().unwrap().contains(signature))
        }

        async fn current_slot(&self) -> CrankResult<u64> {
            Ok(*self.slot.lock().unwrap())
        }
    }

    fn uuid_like() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        format!("{:x}", SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos())
    }
}

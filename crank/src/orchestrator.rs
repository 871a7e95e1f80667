//! Settlement orchestrator (C5): the top-level poll loop tying the store,
//! lock manager, relayer client, state machine, circuit breaker, and
//! Ledger/MPC collaborators together (spec Sec 4.5).
//!
//! Grounded on the teacher's `main.rs` poll loop: reconcile, scan, act,
//! sleep, repeat -- with periodic secondary tasks (there: backoff/state
//! persistence; here: rollback drain, expiry sweep, stale-lock reclaim)
//! folded into the same loop on their own cadence rather than separate
//! tasks, since the whole loop is already cooperatively scheduled.

use crate::breaker::CircuitBreaker;
use crate::callback::{CallbackPayload, SignatureVerifier, ValidatedCallback};
use crate::config::Config;
use crate::domain::{Address, Order, PairKey, SettlementId, SettlementMethod, SettlementStatus, Side};
use crate::error::{now_unix, CrankError, CrankResult, Severity};
use crate::ledger::Ledger;
use crate::lock::LockManager;
use crate::mpc::{CallbackSink, Mpc};
use crate::observer::Observer;
use crate::settlement::FailureReason;
use crate::store::Store;
use crate::transfer::{RelayerClient, RelayerToken, TransferKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const LOCK_TIMEOUT_SEC: u64 = 30;

#[derive(Debug, Clone, Default)]
pub struct OrchestratorStatus {
    pub polls: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_errors: u32,
    pub paused: bool,
}

/// In-memory per-pair cooldown after a failed settlement attempt (spec
/// Sec 4.4). Reset on restart by design: the durable state machine, not
/// this map, is the source of truth for whether a settlement already
/// happened.
#[derive(Default)]
struct CooldownTracker {
    until: Mutex<HashMap<String, u64>>,
}

impl CooldownTracker {
    fn is_active(&self, key: &str) -> bool {
        self.until.lock().unwrap().get(key).is_some_and(|&t| t > now_unix())
    }

    fn set(&self, key: &str, duration: Duration) {
        self.until
            .lock()
            .unwrap()
            .insert(key.to_string(), now_unix() + duration.as_secs());
    }
}

/// The fill amounts an MPC `calculate_fill` callback supplies for a
/// settlement: base-asset amount and quote-asset value, kept separately
/// since the two legs move different assets.
#[derive(Debug, Clone, Copy)]
struct FillAmounts {
    base: u64,
    quote: u64,
}

pub struct Orchestrator<L: Ledger, M: Mpc, V: SignatureVerifier> {
    store: Store,
    locks: LockManager,
    relayer: RelayerClient,
    ledger: L,
    mpc: M,
    validator: crate::callback::CallbackValidator<V>,
    observer: Box<dyn Observer>,
    breaker: CircuitBreaker,
    cooldown: CooldownTracker,
    cfg: Config,
    shutdown: AtomicBool,
    iteration: AtomicU64,
    polls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Pending `calculate_fill` requests, keyed by the id the Mpc
    /// collaborator returned at submission time, so an inbound callback can
    /// be routed back to the settlement that asked for it.
    mpc_requests: Mutex<HashMap<[u8; 32], SettlementId>>,
    fill_amounts: Mutex<HashMap<SettlementId, FillAmounts>>,
    /// High-water mark for [`Self::refresh_order_cache`]'s pull cursor over
    /// `Ledger::fetch_order_activity`.
    last_synced_slot: AtomicU64,
}

impl<L: Ledger, M: Mpc, V: SignatureVerifier> Orchestrator<L, M, V> {
    pub fn new(
        store: Store,
        ledger: L,
        mpc: M,
        verifier: V,
        observer: Box<dyn Observer>,
        cfg: Config,
    ) -> Self {
        let locks = LockManager::new("crank-primary").with_distributed(store.distributed_locks());
        let relayer = RelayerClient::new(crate::transfer::RelayerClientConfig {
            base_url: cfg.shadowwire_api_url.clone(),
            api_key: cfg.shadowwire_api_key.clone(),
            max_retries: cfg.shadowwire_max_retries,
            retry_delay: cfg.shadowwire_retry_delay,
            timeout: cfg.shadowwire_timeout,
        })
        .expect("relayer client config is always valid");

        Self {
            store,
            locks,
            relayer,
            ledger,
            mpc,
            validator: crate::callback::CallbackValidator::new(verifier),
            observer,
            breaker: CircuitBreaker::new(cfg.error_threshold, cfg.pause_duration.as_secs()),
            cooldown: CooldownTracker::default(),
            cfg,
            shutdown: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            mpc_requests: Mutex::new(HashMap::new()),
            fill_amounts: Mutex::new(HashMap::new()),
            last_synced_slot: AtomicU64::new(0),
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.breaker.pause();
    }

    pub fn resume(&self) {
        self.breaker.resume();
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            polls: self.polls.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            consecutive_errors: self.breaker.consecutive_errors(),
            paused: self.breaker.state() == crate::breaker::BreakerState::Paused,
        }
    }

    /// Runs the poll loop until [`Self::stop`] is called. Mirrors the
    /// teacher's `loop { ...; sleep(interval).await }` shape.
    pub async fn run(&self) -> CrankResult<()> {
        let mut last_periodic = now_unix();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if self.breaker.allows_iteration() {
                let n = self.iteration.fetch_add(1, Ordering::SeqCst);
                self.observer.on_poll_start(n);
                self.polls.fetch_add(1, Ordering::SeqCst);

                match self.run_iteration().await {
                    Ok(()) => {
                        self.successes.fetch_add(1, Ordering::SeqCst);
                        self.breaker.record_success();
                    }
                    Err(e) => {
                        self.failures.fetch_add(1, Ordering::SeqCst);
                        tracing::error!(error = %e, "poll iteration failed");
                        if self.breaker.record_error() {
                            self.observer
                                .on_alert(Severity::Critical, "circuit breaker tripped after consecutive failures");
                        }
                    }
                }

                if now_unix().saturating_sub(last_periodic) >= self.cfg.rollback_sweep_interval.as_secs() {
                    if let Err(e) = self.run_periodic_tasks().await {
                        tracing::warn!(error = %e, "periodic maintenance tasks failed");
                    }
                    last_periodic = now_unix();
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
        Ok(())
    }

    /// Settles every discovered pair, bounded to `max_concurrent_matches` in
    /// flight at once -- the same `buffer_unordered` shape the teacher's
    /// `collect_due` uses to cap concurrent submissions.
    async fn run_iteration(&self) -> CrankResult<()> {
        use futures::stream::{self, StreamExt};

        self.refresh_order_cache().await?;

        let pairs = self.discover_matched_pairs().await?;
        stream::iter(pairs)
            .for_each_concurrent(self.cfg.max_concurrent_matches, |(buy, sell, pair_addr)| async move {
                if let Err(e) = self.settle_pair(buy, sell, &pair_addr).await {
                    tracing::warn!(error = %e, "settlement attempt failed");
                }
            })
            .await;
        Ok(())
    }

    /// Keeps the local order-state cache fresh via the Ledger's
    /// subscribe-to-new-blocks operation (spec Sec 1/6), so
    /// [`Self::discover_matched_pairs`] has a real set of candidate pairs
    /// to poll instead of depending on a cache nothing in production ever
    /// populates.
    async fn refresh_order_cache(&self) -> CrankResult<()> {
        let since = self.last_synced_slot.load(Ordering::SeqCst);
        let page = self.ledger.fetch_order_activity(since).await?;
        let cache = self.store.order_state_cache();

        for order in &page.orders {
            cache
                .upsert(&crate::domain::OrderStateCacheEntry {
                    order: order.id,
                    pair: order.pair_id.clone(),
                    side: order.cached_side(),
                    status: order.cached_status(),
                    owner: order.owner.clone(),
                    slot: page.newest_slot,
                    updated_at: now_unix(),
                })
                .await?;
        }

        if page.newest_slot > since {
            self.last_synced_slot.store(page.newest_slot, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Step 1 of the per-iteration algorithm: ask the Ledger for matched
    /// but unsettled orders on every pair the cache currently knows about,
    /// grouping same-`pending_match_request` buy/sell orders together.
    async fn discover_matched_pairs(&self) -> CrankResult<Vec<(Order, Order, Address)>> {
        let pair_ids = self.store.order_state_cache().known_pairs().await?;
        let mut result = Vec::new();

        for pair_addr in pair_ids {
            let orders = self.ledger.fetch_matched_orders(&pair_addr).await?;
            let mut by_request: HashMap<[u8; 32], (Option<Order>, Option<Order>)> = HashMap::new();
            for order in orders.into_iter().filter(Order::is_matched_unsettled) {
                let entry = by_request.entry(order.pending_match_request).or_default();
                match order.side {
                    Side::Buy => entry.0 = Some(order),
                    Side::Sell => entry.1 = Some(order),
                }
            }
            for (_, (buy, sell)) in by_request {
                if let (Some(b), Some(s)) = (buy, sell) {
                    result.push((b, s, pair_addr.clone()));
                }
            }
        }
        Ok(result)
    }

    async fn settle_pair(&self, buy: Order, sell: Order, pair_addr: &Address) -> CrankResult<()> {
        let pair_key = PairKey::new(buy.id, sell.id);
        let lock_name = pair_key.as_lock_name();

        if self.cooldown.is_active(&lock_name) {
            return Ok(());
        }

        // Cheap pre-lock check: skip pairs already settled to completion
        // without paying for a lock acquisition.
        if matches!(
            self.store.settlements().get(&SettlementId::derive(buy.id, sell.id)).await?,
            Some(existing) if existing.status == SettlementStatus::Completed
        ) {
            return Ok(());
        }

        if !self.locks.acquire_with_ttl(&lock_name, Duration::from_secs(LOCK_TIMEOUT_SEC)).await? {
            return Ok(());
        }

        let result = self.settle_pair_locked(buy, sell, pair_addr, &pair_key).await;
        self.locks.release(&lock_name).await?;

        if result.is_err() {
            self.cooldown.set(&lock_name, self.cfg.cooldown);
        }
        result
    }

    async fn settle_pair_locked(
        &self,
        buy: Order,
        sell: Order,
        pair_addr: &Address,
        pair_key: &PairKey,
    ) -> CrankResult<()> {
        let trading_pair = self.ledger.fetch_trading_pair(pair_addr).await?;
        let settlements = self.store.settlements();

        // "fall back to public only if both sides are publicly
        // transferable, else reject and alert" -- the Open Question
        // resolution recorded in DESIGN.md.
        let method = if RelayerToken::pair_supported(&trading_pair.base_asset, &trading_pair.quote_asset) {
            SettlementMethod::Private
        } else {
            self.observer.on_alert(
                Severity::Warning,
                &format!("pair {} is not supported by the relayer; settlement rejected", pair_addr),
            );
            return Ok(());
        };

        let fresh = crate::domain::SettlementRequest::initiate(
            buy.id,
            sell.id,
            buy.owner.clone(),
            sell.owner.clone(),
            trading_pair.base_asset.clone(),
            trading_pair.quote_asset.clone(),
            method,
            self.cfg.expiry_window.as_secs(),
        );
        let mut req = settlements.create_if_absent(&fresh).await?;
        if req.status.is_terminal() || req.status == SettlementStatus::RollingBack {
            // Terminal, or already handed off to the rollback worker -- the
            // main settlement path has nothing left to do here.
            return Ok(());
        }

        let fill = match self.fill_amount_for(&req).await? {
            Some(f) => f,
            None => return Ok(()),
        };

        let base_token = RelayerToken::from_mint(&req.base_asset)
            .ok_or_else(|| CrankError::validation(30, "base asset not supported by relayer"))?;
        let quote_token = RelayerToken::from_mint(&req.quote_asset)
            .ok_or_else(|| CrankError::validation(31, "quote asset not supported by relayer"))?;

        if req.status == SettlementStatus::Pending {
            if !self.relayer.has_enough_balance(&req.sell_owner, base_token, fill.base).await? {
                self.observer.on_alert(
                    Severity::Warning,
                    &format!("insufficient pool balance for base leg of settlement {}", req.id),
                );
                return Ok(());
            }
            match self
                .relayer
                .transfer(&req.sell_owner, &req.buy_owner, base_token, fill.base, TransferKind::Internal)
                .await
            {
                Ok(outcome) => {
                    self.record_transfer_history(&req, &outcome.transfer_id).await?;
                    req.record_base_transfer(outcome.transfer_id)
                        .map_err(|e| CrankError::settlement(1, e.to_string()))?;
                    settlements.save(&req).await?;
                    self.observer.on_settlement_transition(pair_key, SettlementStatus::Pending, req.status);
                }
                Err(e) => return self.handle_transfer_failure(&mut req, e, false).await,
            }
        }

        if req.status == SettlementStatus::BaseTransferred {
            if !self.relayer.has_enough_balance(&req.buy_owner, quote_token, fill.quote).await? {
                self.observer.on_alert(
                    Severity::Warning,
                    &format!("insufficient pool balance for quote leg of settlement {}", req.id),
                );
                return Ok(());
            }
            match self
                .relayer
                .transfer(&req.buy_owner, &req.sell_owner, quote_token, fill.quote, TransferKind::Internal)
                .await
            {
                Ok(outcome) => {
                    self.record_transfer_history(&req, &outcome.transfer_id).await?;
                    req.record_quote_transfer(outcome.transfer_id)
                        .map_err(|e| CrankError::settlement(2, e.to_string()))?;
                    req.complete().map_err(|e| CrankError::settlement(3, e.to_string()))?;
                    settlements.save(&req).await?;
                    self.observer.on_settlement_transition(pair_key, SettlementStatus::BaseTransferred, req.status);
                }
                Err(e) => return self.handle_transfer_failure(&mut req, e, true).await,
            }
        }

        Ok(())
    }

    /// Returns the validated fill amounts for `req`, submitting (and
    /// deduplicating) an MPC `calculate_fill` request if they are not yet
    /// known. `None` means the caller should skip this settlement for now
    /// and try again once a callback has arrived.
    async fn fill_amount_for(&self, req: &crate::domain::SettlementRequest) -> CrankResult<Option<FillAmounts>> {
        if let Some(f) = self.fill_amounts.lock().unwrap().get(&req.id).copied() {
            return Ok(Some(f));
        }

        let ops = self.store.pending_operations();
        let natural_key = format!("mpc_wait:{}", req.id);
        if ops.exists(&natural_key).await? {
            return Ok(None);
        }

        let payload = serde_json::json!({
            "buy_order": req.buy_order.to_hex(),
            "sell_order": req.sell_order.to_hex(),
        });
        let request_id = self.mpc.submit_request("calculate_fill", &payload).await?;
        self.mpc_requests.lock().unwrap().insert(request_id, req.id.clone());
        ops.create("mpc_wait", &natural_key, &payload, 1, None).await?;
        Ok(None)
    }

    /// Records a confirmed `TransactionHistory` row for a landed transfer
    /// leg, keyed by the relayer's own transfer id (spec §4.1: unique on
    /// signature).
    async fn record_transfer_history(
        &self,
        req: &crate::domain::SettlementRequest,
        transfer_id: &str,
    ) -> CrankResult<()> {
        use crate::domain::{TransactionHistoryEntry, TxStatus, TxType};
        self.store
            .tx_history()
            .create(&TransactionHistoryEntry {
                signature: transfer_id.to_string(),
                tx_type: TxType::Settlement,
                status: TxStatus::Confirmed,
                buy_order: Some(req.buy_order),
                sell_order: Some(req.sell_order),
                slot: None,
                created_at: now_unix(),
            })
            .await?;
        Ok(())
    }

    async fn handle_transfer_failure(
        &self,
        req: &mut crate::domain::SettlementRequest,
        err: CrankError,
        base_already_moved: bool,
    ) -> CrankResult<()> {
        let reason = if err.retryable {
            FailureReason::Timeout
        } else {
            FailureReason::TransferFailed
        };

        let settlements = self.store.settlements();
        if base_already_moved {
            let payload = req
                .begin_rollback()
                .map_err(|e| CrankError::settlement(4, e.to_string()))?;
            settlements.save(req).await?;
            self.enqueue_rollback(payload).await?;
        } else {
            req.mark_failed(reason).map_err(|e| CrankError::settlement(5, e.to_string()))?;
            settlements.save(req).await?;
        }
        Err(err)
    }

    async fn enqueue_rollback(&self, payload: crate::domain::RollbackPayload) -> CrankResult<()> {
        let ops = self.store.pending_operations();
        let natural_key = format!("rollback:{}", payload.settlement_id);
        if ops.exists(&natural_key).await? {
            return Ok(());
        }
        let json = serde_json::to_value(&payload)
            .map_err(|e| CrankError::internal(30, format!("failed to serialize rollback payload: {e}")))?;
        ops.create("rollback", &natural_key, &json, 3, None).await?;
        Ok(())
    }

    /// Drains the rollback queue: spec Sec 4.4 rollback worker.
    pub async fn process_rollback_queue(&self) -> CrankResult<u64> {
        let ops = self.store.pending_operations();
        let ready = ops.find_ready_to_process(Some("rollback")).await?;
        let mut processed = 0;
        for op in ready {
            let payload: crate::domain::RollbackPayload = match serde_json::from_value(op.payload.clone()) {
                Ok(p) => p,
                Err(_) => {
                    ops.mark_failed(op.id, "malformed rollback payload").await?;
                    continue;
                }
            };

            if !ops.mark_in_progress(op.id, "crank-primary").await? {
                continue;
            }

            match self.run_rollback(&payload).await {
                Ok(()) => {
                    ops.mark_completed(op.id).await?;
                    processed += 1;
                }
                Err(e) => {
                    ops.mark_failed(op.id, &e.message).await?;
                    if op.retry_count + 1 >= op.max_retries {
                        self.observer.on_alert(
                            Severity::Critical,
                            &format!("rollback for {} exhausted retries: {e}", payload.settlement_id),
                        );
                    }
                }
            }
        }
        Ok(processed)
    }

    async fn run_rollback(&self, payload: &crate::domain::RollbackPayload) -> CrankResult<()> {
        let settlements = self.store.settlements();
        let Some(req) = settlements.get(&payload.settlement_id).await? else {
            return Err(CrankError::settlement(11, "settlement not found for rollback"));
        };
        // Same lock `settle_pair` takes for this pair, so a rollback can
        // never run alongside a settlement attempt for the same K.
        let lock_name = PairKey::new(req.buy_order, req.sell_order).as_lock_name();
        if !self.locks.acquire_with_ttl(&lock_name, Duration::from_secs(LOCK_TIMEOUT_SEC)).await? {
            return Err(CrankError::settlement(10, "could not acquire rollback lock"));
        }
        let result = self.run_rollback_locked(&payload.settlement_id).await;
        self.locks.release(&lock_name).await?;
        result
    }

    async fn run_rollback_locked(&self, settlement_id: &SettlementId) -> CrankResult<()> {
        let settlements = self.store.settlements();
        let Some(mut req) = settlements.get(settlement_id).await? else {
            return Err(CrankError::settlement(11, "settlement not found for rollback"));
        };
        if req.status != SettlementStatus::RollingBack {
            return Ok(());
        }

        let base_token = RelayerToken::from_mint(&req.base_asset)
            .ok_or_else(|| CrankError::validation(32, "base asset not supported by relayer"))?;
        let fill = self.fill_amounts.lock().unwrap().get(&req.id).copied();
        let base_amount = fill.map(|f| f.base).unwrap_or(0);

        // Reverses the base leg: it moved seller -> buyer originally, so the
        // compensating transfer moves buyer -> seller.
        self.relayer
            .transfer(&req.buy_owner.clone(), &req.sell_owner.clone(), base_token, base_amount, TransferKind::Internal)
            .await?;

        req.finish_rollback().map_err(|e| CrankError::settlement(12, e.to_string()))?;
        settlements.save(&req).await
    }

    /// Scans non-terminal settlements and expires those past their window
    /// (spec Sec 4.4 expiry sweep). A settlement that never moved its base
    /// leg simply expires; one that already moved it has no direct path to
    /// `Expired` -- it is handed to the rollback worker instead (spec
    /// scenario S4).
    pub async fn expire_stale_settlements(&self) -> CrankResult<u64> {
        let expired = self.store.settlements().find_expired(now_unix()).await?;
        let mut count = 0;
        for req in expired {
            // Same per-pair lock `settle_pair`/`run_rollback` take, so the
            // sweep can never clobber a row a live settlement attempt is
            // mid-transition on.
            let lock_name = PairKey::new(req.buy_order, req.sell_order).as_lock_name();
            if !self.locks.acquire_with_ttl(&lock_name, Duration::from_secs(LOCK_TIMEOUT_SEC)).await? {
                continue;
            }
            let result = self.expire_one_locked(&req.id).await;
            self.locks.release(&lock_name).await?;
            if result? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Re-fetches and re-checks expiry under the pair lock before mutating,
    /// guarding against a row that another worker advanced past expiry
    /// eligibility while this sweep waited for the lock.
    async fn expire_one_locked(&self, id: &SettlementId) -> CrankResult<bool> {
        let settlements = self.store.settlements();
        let Some(mut req) = settlements.get(id).await? else {
            return Ok(false);
        };
        if !req.is_expired(now_unix()) {
            return Ok(false);
        }
        if req.base_transfer_id.is_some() {
            let Ok(payload) = req.begin_rollback() else { return Ok(false) };
            settlements.save(&req).await?;
            self.enqueue_rollback(payload).await?;
        } else {
            if req.expire().is_err() {
                return Ok(false);
            }
            settlements.save(&req).await?;
        }
        Ok(true)
    }

    /// `skipPendingMpcComputations`: marks every pending MPC-waiting row as
    /// failed, per spec Sec 4.5's admin surface.
    pub async fn skip_pending_mpc_computations(&self) -> CrankResult<u64> {
        let ops = self.store.pending_operations();
        let pending = ops.find_ready_to_process(Some("mpc_wait")).await?;
        let count = pending.len() as u64;
        for op in pending {
            ops.mark_failed(op.id, "skipped by operator").await?;
        }
        Ok(count)
    }

    async fn run_periodic_tasks(&self) -> CrankResult<()> {
        self.process_rollback_queue().await?;
        self.expire_stale_settlements().await?;
        self.store.pending_operations().release_stale_locks(LOCK_TIMEOUT_SEC).await?;
        Ok(())
    }

    /// Entry point for whatever delivers raw MPC callbacks (out of scope to
    /// implement a transport for -- see spec Non-goals on HTTP routes):
    /// validates the envelope, then routes the payload through
    /// [`CallbackSink::accept`].
    pub async fn handle_raw_callback(&self, raw: crate::callback::RawCallback) -> CrankResult<()> {
        let validated = self.validator.validate(raw)?;
        self.accept(validated).await
    }
}

impl<L: Ledger, M: Mpc, V: SignatureVerifier> CallbackSink for Orchestrator<L, M, V> {
    /// Routes a validated `calculate_fill` callback back to the settlement
    /// that requested it. Any other payload variant, or an error callback,
    /// is logged and dropped -- the orchestrator only asks the MPC cluster
    /// for fills today.
    async fn accept(&self, callback: ValidatedCallback) -> CrankResult<()> {
        if let Some(err) = &callback.error {
            tracing::warn!(code = %err.code, message = %err.message, "mpc callback reported an error");
            return Ok(());
        }

        let CallbackPayload::CalculateFill { fill_amount, fill_value } = callback.payload else {
            return Ok(());
        };

        let Some(settlement_id) = self.mpc_requests.lock().unwrap().remove(&callback.request_id) else {
            tracing::warn!("calculate_fill callback for an unknown or already-handled request id");
            return Ok(());
        };

        let base: u64 = fill_amount
            .parse()
            .map_err(|_| CrankError::validation(40, "fillAmount does not fit in u64"))?;
        let quote: u64 = fill_value
            .parse()
            .map_err(|_| CrankError::validation(41, "fillValue does not fit in u64"))?;

        self.fill_amounts
            .lock()
            .unwrap()
            .insert(settlement_id.clone(), FillAmounts { base, quote });

        let ops = self.store.pending_operations();
        let natural_key = format!("mpc_wait:{settlement_id}");
        for op in ops.find_ready_to_process(Some("mpc_wait")).await?.into_iter() {
            if op.natural_key == natural_key {
                ops.mark_completed(op.id).await?;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::DevSignatureVerifier;
    use crate::domain::{CachedOrderStatus, CachedSide, OrderId, OrderStateCacheEntry, OrderStatus};
    use crate::ledger::fake::FakeLedger;
    use crate::mpc::fake::FakeMpc;

    fn order(id: u8, side: Side, owner: &str, pair: &str) -> Order {
        Order {
            id: OrderId([id; 16]),
            owner: Address(owner.into()),
            pair_id: Address(pair.into()),
            side,
            status: OrderStatus::Inactive,
            filled: true,
            pending_match_request: [id; 32],
            is_matching: false,
        }
    }

    async fn seeded_orchestrator() -> (
        Orchestrator<FakeLedger, FakeMpc, DevSignatureVerifier>,
        Address,
    ) {
        let store = Store::open_in_memory().await.unwrap();
        let pair = Address("SOL/USDC".to_string());

        store
            .order_state_cache()
            .upsert(&OrderStateCacheEntry {
                order: OrderId([1; 16]),
                pair: pair.clone(),
                side: CachedSide::Buy,
                status: CachedOrderStatus::Matching,
                owner: Address("buyer".into()),
                slot: 1,
                updated_at: now_unix(),
            })
            .await
            .unwrap();

        let ledger = FakeLedger::new();
        ledger.set_matched_orders(
            &pair,
            vec![
                order(1, Side::Buy, "buyer", "SOL/USDC"),
                order(2, Side::Sell, "seller", "SOL/USDC"),
            ],
        );

        let mut cfg = test_config();
        cfg.shadowwire_api_url = "http://127.0.0.1:1".to_string();

        let orch = Orchestrator::new(
            store,
            ledger,
            FakeMpc::new(),
            DevSignatureVerifier,
            Box::new(crate::observer::NullObserver),
            cfg,
        );
        (orch, pair)
    }

    fn test_config() -> Config {
        Config {
            enabled: true,
            poll_interval: Duration::from_millis(10),
            max_concurrent_matches: 10,
            wallet_path: "/tmp/wallet.json".into(),
            min_sol_balance: 0.0,
            error_threshold: 10,
            pause_duration: Duration::from_secs(60),
            shadowwire_enabled: true,
            shadowwire_api_key: None,
            shadowwire_api_url: "http://127.0.0.1:1".into(),
            shadowwire_max_retries: 0,
            shadowwire_retry_delay: Duration::from_millis(1),
            shadowwire_timeout: Duration::from_millis(50),
            db_path: "/tmp/crank-test.db".into(),
            lock_ttl: Duration::from_secs(30),
            expiry_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(60),
            rollback_sweep_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn first_iteration_requests_a_fill_and_creates_a_pending_settlement() {
        let (orch, _pair) = seeded_orchestrator().await;
        orch.run_iteration().await.unwrap();

        let id = SettlementId::derive(OrderId([1; 16]), OrderId([2; 16]));
        let row = orch.store.settlements().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SettlementStatus::Pending);

        let mpc_ops = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("mpc_wait"))
            .await
            .unwrap();
        assert_eq!(mpc_ops.len(), 1);
    }

    #[tokio::test]
    async fn skip_pending_mpc_computations_fails_every_waiting_row() {
        let (orch, _pair) = seeded_orchestrator().await;
        orch.run_iteration().await.unwrap();

        let skipped = orch.skip_pending_mpc_computations().await.unwrap();
        assert_eq!(skipped, 1);

        let still_pending = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("mpc_wait"))
            .await
            .unwrap();
        assert!(still_pending.is_empty());
    }

    #[tokio::test]
    async fn a_settlement_past_its_expiry_window_with_no_transfers_is_expired_without_a_rollback() {
        let (orch, _pair) = seeded_orchestrator().await;
        let id = SettlementId::derive(OrderId([1; 16]), OrderId([2; 16]));
        let mut req = crate::domain::SettlementRequest::initiate(
            OrderId([1; 16]),
            OrderId([2; 16]),
            Address("buyer".into()),
            Address("seller".into()),
            Address("base".into()),
            Address("quote".into()),
            SettlementMethod::Private,
            0,
        );
        req.expires_at = 0;
        orch.store.settlements().create_if_absent(&req).await.unwrap();

        let expired = orch.expire_stale_settlements().await.unwrap();
        assert_eq!(expired, 1);

        let row = orch.store.settlements().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SettlementStatus::Expired);

        let rollback_ops = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("rollback"))
            .await
            .unwrap();
        assert!(rollback_ops.is_empty());
    }

    #[tokio::test]
    async fn a_settlement_that_already_moved_its_base_leg_rolls_back_instead_of_expiring() {
        let (orch, _pair) = seeded_orchestrator().await;
        let mut req = crate::domain::SettlementRequest::initiate(
            OrderId([3; 16]),
            OrderId([4; 16]),
            Address("buyer2".into()),
            Address("seller2".into()),
            Address("base".into()),
            Address("quote".into()),
            SettlementMethod::Private,
            0,
        );
        req.record_base_transfer("t1".into()).unwrap();
        req.expires_at = 0;
        orch.store.settlements().create_if_absent(&req).await.unwrap();

        let expired = orch.expire_stale_settlements().await.unwrap();
        assert_eq!(expired, 1);

        let id = SettlementId::derive(OrderId([3; 16]), OrderId([4; 16]));
        let row = orch.store.settlements().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SettlementStatus::RollingBack);

        let rollback_ops = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("rollback"))
            .await
            .unwrap();
        assert_eq!(rollback_ops.len(), 1);
    }

    #[tokio::test]
    async fn a_transfer_failure_after_the_base_leg_moved_enqueues_a_rollback() {
        let (orch, _pair) = seeded_orchestrator().await;
        let mut req = crate::domain::SettlementRequest::initiate(
            OrderId([5; 16]),
            OrderId([6; 16]),
            Address("buyer3".into()),
            Address("seller3".into()),
            Address("base".into()),
            Address("quote".into()),
            SettlementMethod::Private,
            300,
        );
        orch.store.settlements().create_if_absent(&req).await.unwrap();
        req.record_base_transfer("t1".into()).unwrap();
        orch.store.settlements().save(&req).await.unwrap();

        let err = CrankError::private_transfer(3, "relayer transfer reported failure");
        let result = orch.handle_transfer_failure(&mut req, err, true).await;
        assert!(result.is_err());
        assert_eq!(req.status, SettlementStatus::RollingBack);

        let rollback_ops = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("rollback"))
            .await
            .unwrap();
        assert_eq!(rollback_ops.len(), 1);
    }

    #[tokio::test]
    async fn only_one_of_two_concurrent_attempts_at_the_same_pair_proceeds() {
        let (orch, pair) = seeded_orchestrator().await;
        let buy = order(1, Side::Buy, "buyer", "SOL/USDC");
        let sell = order(2, Side::Sell, "seller", "SOL/USDC");

        let (r1, r2) = tokio::join!(
            orch.settle_pair(buy.clone(), sell.clone(), &pair),
            orch.settle_pair(buy, sell, &pair)
        );
        r1.unwrap();
        r2.unwrap();

        let mpc_ops = orch
            .store
            .pending_operations()
            .find_ready_to_process(Some("mpc_wait"))
            .await
            .unwrap();
        assert_eq!(mpc_ops.len(), 1, "only one concurrent attempt should reach the settlement path");
    }
}

//! Settlement state machine (C4): `valid_transitions`-gated progression
//! through Pending -> BaseTransferred -> QuoteTransferred -> Completed, with
//! Failed/Expired/RollingBack as the recovery states (spec Sec 4.4).
//!
//! The transition-table shape (`valid_transitions`, `can_transition_to`,
//! `transition_to` returning a typed `InvalidTransition` error) is the same
//! pattern the reference settlement protocol uses; the states and recovery
//! rules themselves are this system's own (private-transfer legs, not
//! multi-leg FX settlement).

use crate::domain::{
    Address, OrderId, RollbackPayload, SettlementId, SettlementMethod, SettlementRequest,
    SettlementStatus,
};
use crate::error::now_unix;
use serde::{Deserialize, Serialize};

impl SettlementStatus {
    /// Valid next states from the current one. `RollingBack` is reachable
    /// only from `BaseTransferred`/`QuoteTransferred` (the only states where
    /// a base transfer exists to reverse) and leads only to `Failed`.
    pub fn valid_transitions(self) -> &'static [SettlementStatus] {
        use SettlementStatus::*;
        match self {
            Pending => &[BaseTransferred, Failed, Expired],
            // No direct path to `Expired` once a base transfer has landed --
            // a compensating rollback is owed instead (spec scenario S4).
            BaseTransferred => &[QuoteTransferred, Failed, RollingBack],
            QuoteTransferred => &[Completed, Failed, RollingBack],
            RollingBack => &[Failed],
            Completed | Failed | Expired => &[],
        }
    }

    pub fn can_transition_to(self, next: SettlementStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SettlementStatus,
    pub to: SettlementStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid settlement transition from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Why a settlement failed, classified so the orchestrator can decide
/// whether a rollback is owed (spec Sec 4.4 failure classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    TransferFailed,
    Timeout,
    MpcFailed,
    ManualIntervention,
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::TransferFailed => "transfer_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::MpcFailed => "mpc_failed",
            FailureReason::ManualIntervention => "manual_intervention",
            FailureReason::Unknown => "unknown",
        }
    }
}

impl SettlementRequest {
    /// Starts a new settlement for a just-observed matched order pair.
    /// Idempotent: repeated calls for the same pair produce the same id.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate(
        buy_order: OrderId,
        sell_order: OrderId,
        buy_owner: Address,
        sell_owner: Address,
        base_asset: Address,
        quote_asset: Address,
        method: SettlementMethod,
        expiry_window_secs: u64,
    ) -> Self {
        let now = now_unix();
        SettlementRequest {
            id: SettlementId::derive(buy_order, sell_order),
            buy_order,
            sell_order,
            buy_owner,
            sell_owner,
            base_asset,
            quote_asset,
            method,
            status: SettlementStatus::Pending,
            base_transfer_id: None,
            quote_transfer_id: None,
            created_at: now,
            expires_at: now + expiry_window_secs,
            failure_reason: None,
        }
    }

    fn transition(&mut self, next: SettlementStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn record_base_transfer(&mut self, transfer_id: String) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::BaseTransferred)?;
        self.base_transfer_id = Some(transfer_id);
        debug_assert!(self.check_leg_invariant());
        Ok(())
    }

    pub fn record_quote_transfer(&mut self, transfer_id: String) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::QuoteTransferred)?;
        self.quote_transfer_id = Some(transfer_id);
        debug_assert!(self.check_leg_invariant());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::Completed)
    }

    /// Marks the settlement failed. If a base transfer already landed, the
    /// caller is expected to have routed through [`Self::begin_rollback`]
    /// first rather than calling this directly -- `mark_failed` on its own
    /// only applies when no base transfer exists yet to reverse.
    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::Failed)?;
        self.failure_reason = Some(reason.as_str().to_string());
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::Expired)?;
        self.failure_reason = Some("expired".to_string());
        Ok(())
    }

    /// Begins the rollback protocol: transitions to `RollingBack` and
    /// returns the payload for the durable rollback operation the caller
    /// must enqueue (spec Sec 4.4 rollback protocol). Only valid once a
    /// base transfer exists.
    pub fn begin_rollback(&mut self) -> Result<RollbackPayload, InvalidTransition> {
        let base_transfer_id = self.base_transfer_id.clone().ok_or(InvalidTransition {
            from: self.status,
            to: SettlementStatus::RollingBack,
        })?;
        self.transition(SettlementStatus::RollingBack)?;
        Ok(RollbackPayload {
            settlement_id: self.id.clone(),
            original_base_transfer_id: base_transfer_id,
        })
    }

    /// Finalizes a rollback: the compensating transfer has landed, the
    /// settlement is terminally failed.
    pub fn finish_rollback(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SettlementStatus::Failed)?;
        self.failure_reason = Some(FailureReason::TransferFailed.as_str().to_string());
        Ok(())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.status.is_terminal() && self.status != SettlementStatus::RollingBack && now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> SettlementRequest {
        SettlementRequest::initiate(
            OrderId([1; 16]),
            OrderId([2; 16]),
            Address("buyer".into()),
            Address("seller".into()),
            Address("base".into()),
            Address("quote".into()),
            SettlementMethod::Private,
            300,
        )
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut r = req();
        r.record_base_transfer("t1".into()).unwrap();
        r.record_quote_transfer("t2".into()).unwrap();
        r.complete().unwrap();
        assert_eq!(r.status, SettlementStatus::Completed);
        assert!(r.check_leg_invariant());
    }

    #[test]
    fn cannot_skip_straight_to_completed() {
        let mut r = req();
        assert!(r.complete().is_err());
    }

    #[test]
    fn rollback_requires_a_base_transfer() {
        let mut r = req();
        assert!(r.begin_rollback().is_err());

        r.record_base_transfer("t1".into()).unwrap();
        let payload = r.begin_rollback().unwrap();
        assert_eq!(payload.original_base_transfer_id, "t1");
        assert_eq!(r.status, SettlementStatus::RollingBack);

        r.finish_rollback().unwrap();
        assert_eq!(r.status, SettlementStatus::Failed);
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        let mut r = req();
        r.mark_failed(FailureReason::Timeout).unwrap();
        assert!(r.record_base_transfer("t1".into()).is_err());
    }

    #[test]
    fn is_expired_is_false_once_terminal() {
        let mut r = req();
        r.expires_at = 0;
        r.mark_failed(FailureReason::Timeout).unwrap();
        assert!(!r.is_expired(now_unix()));
    }
}

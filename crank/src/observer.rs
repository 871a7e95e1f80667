//! Observer: the seam between the orchestrator and whatever is watching it
//! (structured logs today; an admin surface or metrics exporter could
//! subscribe the same way). Default implementation uses the ambient
//! `tracing` stack the same way the teacher's poll loop does.

use crate::domain::{PairKey, SettlementStatus};

pub trait Observer: Send + Sync {
    fn on_poll_start(&self, _iteration: u64) {}

    fn on_settlement_transition(&self, _pair: &PairKey, _from: SettlementStatus, _to: SettlementStatus) {}

    fn on_alert(&self, _severity: crate::error::Severity, _message: &str) {}
}

pub struct NullObserver;

impl Observer for NullObserver {}

pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_poll_start(&self, iteration: u64) {
        tracing::debug!(iteration, "poll iteration starting");
    }

    fn on_settlement_transition(&self, pair: &PairKey, from: SettlementStatus, to: SettlementStatus) {
        tracing::info!(pair = %pair.as_lock_name(), ?from, ?to, "settlement transitioned");
    }

    fn on_alert(&self, severity: crate::error::Severity, message: &str) {
        match severity {
            crate::error::Severity::Critical => tracing::error!(%message, "alert"),
            crate::error::Severity::Error => tracing::error!(%message, "alert"),
            crate::error::Severity::Warning => tracing::warn!(%message, "alert"),
        }
    }
}

//! Circuit-breaker supervisor (C6): wraps the orchestrator's poll loop,
//! counting consecutive failures and pausing iteration when the error
//! threshold is crossed (spec Sec 4.6).

use crate::error::now_unix;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;
pub const DEFAULT_PAUSE_DURATION_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Paused,
}

/// Tracks consecutive poll-iteration failures and decides when the
/// orchestrator should stop running iterations. Plain atomics rather than a
/// mutex: every field is independently updated from the single poll-loop
/// task, with `getStatus`-style reads happening from an admin surface.
pub struct CircuitBreaker {
    error_threshold: u32,
    pause_duration_secs: u64,
    consecutive_errors: AtomicU32,
    paused_until: AtomicU64,
    operator_paused: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(error_threshold: u32, pause_duration_secs: u64) -> Self {
        Self {
            error_threshold,
            pause_duration_secs,
            consecutive_errors: AtomicU32::new(0),
            paused_until: AtomicU64::new(0),
            operator_paused: AtomicBool::new(false),
        }
    }

    /// Whether a poll iteration should run right now.
    pub fn allows_iteration(&self) -> bool {
        if self.operator_paused.load(Ordering::SeqCst) {
            return false;
        }
        self.paused_until.load(Ordering::SeqCst) <= now_unix()
    }

    pub fn state(&self) -> BreakerState {
        if self.allows_iteration() {
            BreakerState::Closed
        } else {
            BreakerState::Paused
        }
    }

    /// Resets the counter; called after any successful iteration.
    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Records a failed iteration. Trips the pause once the threshold is
    /// crossed. Returns true iff this call tripped the breaker.
    pub fn record_error(&self) -> bool {
        let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.error_threshold {
            self.paused_until
                .store(now_unix() + self.pause_duration_secs, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Operator override: forces a pause regardless of the error counter.
    pub fn pause(&self) {
        self.operator_paused.store(true, Ordering::SeqCst);
    }

    /// Operator override: clears both the manual pause and the tripped
    /// counter, as if the breaker had never fired.
    pub fn resume(&self) {
        self.operator_paused.store(false, Ordering::SeqCst);
        self.paused_until.store(0, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_at_threshold_and_resets_on_success() {
        let breaker = CircuitBreaker::new(3, 60);
        assert!(breaker.allows_iteration());
        assert!(!breaker.record_error());
        assert!(!breaker.record_error());
        assert!(breaker.record_error());
        assert!(!breaker.allows_iteration());
        assert_eq!(breaker.state(), BreakerState::Paused);
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = CircuitBreaker::new(3, 60);
        breaker.record_error();
        breaker.record_error();
        breaker.record_success();
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[test]
    fn operator_pause_overrides_the_counter() {
        let breaker = CircuitBreaker::new(10, 60);
        breaker.pause();
        assert!(!breaker.allows_iteration());
        breaker.record_success();
        assert!(!breaker.allows_iteration(), "operator pause must not be cleared by a success");
        breaker.resume();
        assert!(breaker.allows_iteration());
    }
}

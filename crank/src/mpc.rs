//! MPC collaborator: the out-of-process computation cluster that answers
//! price-comparison, fill, liquidation, margin, PnL, and funding requests.
//! The CORE only ever sees validated callback results (see [`crate::callback`]);
//! this trait is the narrow surface it uses to dispatch requests and learn
//! when a request should be abandoned.
//!
//! No concrete implementation ships here: talking to a specific MPC cluster
//! is out of scope (see spec Non-goals).

use crate::callback::ValidatedCallback;
use crate::error::CrankResult;

pub trait Mpc: Send + Sync {
    /// Submits a computation request, returning the request id the
    /// eventual callback will carry.
    fn submit_request(
        &self,
        request_type: &str,
        payload: &serde_json::Value,
    ) -> impl std::future::Future<Output = CrankResult<[u8; 32]>> + Send;

    /// Abandons a previously submitted request: used by
    /// `skipPendingMpcComputations` when the orchestrator gives up waiting.
    fn cancel_request(
        &self,
        request_id: [u8; 32],
    ) -> impl std::future::Future<Output = CrankResult<()>> + Send;
}

/// Dispatches a validated callback's result to whatever is awaiting it.
/// Kept distinct from [`Mpc`] because a callback may arrive from an HTTP
/// handler running on a different task than the one that submitted the
/// request.
pub trait CallbackSink: Send + Sync {
    fn accept(
        &self,
        callback: ValidatedCallback,
    ) -> impl std::future::Future<Output = CrankResult<()>> + Send;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeMpc {
        pub cancelled: Mutex<Vec<[u8; 32]>>,
        counter: AtomicU8,
    }

    impl FakeMpc {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Mpc for FakeMpc {
        async fn submit_request(
            &self,
            _request_type: &str,
            _payload: &serde_json::Value,
        ) -> CrankResult<[u8; 32]> {
            let mut id = [0u8; 32];
            id[0] = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(id)
        }

        async fn cancel_request(&self, request_id: [u8; 32]) -> CrankResult<()> {
            self.cancelled.lock().unwrap().push(request_id);
            Ok(())
        }
    }
}

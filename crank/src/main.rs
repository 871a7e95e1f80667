use crank_core::config::Config;
use crank_core::observer::TracingObserver;
use crank_core::orchestrator::Orchestrator;
use crank_core::store::Store;
use eyre::{eyre, Result};
use fs2::FileExt;
use std::fs::OpenOptions;

/// Stand-ins for the two collaborators a concrete deployment supplies.
/// Talking to a specific chain RPC or MPC cluster is out of scope here (see
/// spec Non-goals) -- the CORE only depends on the `Ledger`/`Mpc` traits, so
/// this binary wires the rest of the process (config, store, locking,
/// lifecycle) and refuses to run the poll loop against collaborators that
/// would silently return empty/fabricated data. An operator deployment
/// swaps these for real implementations of `crank_core::ledger::Ledger` and
/// `crank_core::mpc::Mpc`.
mod unwired {
    use crank_core::domain::{Order, TradingPair};
    use crank_core::error::{CrankError, CrankResult};
    use crank_core::ledger::Ledger;
    use crank_core::mpc::Mpc;

    pub struct UnwiredLedger;

    impl Ledger for UnwiredLedger {
        async fn fetch_matched_orders(&self, _pair: &crank_core::domain::Address) -> CrankResult<Vec<Order>> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn fetch_trading_pair(&self, _pair: &crank_core::domain::Address) -> CrankResult<TradingPair> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn fetch_order_activity(
            &self,
            _since_slot: u64,
        ) -> CrankResult<crank_core::domain::OrderActivityPage> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn fetch_balance(
            &self,
            _owner: &crank_core::domain::Address,
            _mint: &crank_core::domain::Address,
        ) -> CrankResult<u64> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn submit_transaction(&self, _payload: &[u8]) -> CrankResult<String> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn confirm_signature(&self, _signature: &str) -> CrankResult<bool> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }

        async fn current_slot(&self) -> CrankResult<u64> {
            Err(CrankError::internal(50, "no Ledger implementation is wired into this binary"))
        }
    }

    pub struct UnwiredMpc;

    impl Mpc for UnwiredMpc {
        async fn submit_request(&self, _request_type: &str, _payload: &serde_json::Value) -> CrankResult<[u8; 32]> {
            Err(CrankError::internal(51, "no Mpc implementation is wired into this binary"))
        }

        async fn cancel_request(&self, _request_id: [u8; 32]) -> CrankResult<()> {
            Err(CrankError::internal(51, "no Mpc implementation is wired into this binary"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if !cfg.enabled {
        tracing::info!("CRANK_ENABLED is false; exiting without starting the poll loop");
        return Ok(());
    }

    // Single-instance guard, alongside the store's db file, the same way the
    // teacher locks next to its state file.
    let lock_path = cfg.db_path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create db directory {}: {e}", parent.display()))?;
        }
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!("crank already running or lock unavailable ({}): {e}", lock_path.display())
    })?;
    let _lock_guard = lock_file;

    let store = match Store::open(&cfg.db_path).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open operational store");
            std::process::exit(2);
        }
    };

    tracing::info!(
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        db_path = %cfg.db_path.display(),
        shadowwire_enabled = cfg.shadowwire_enabled,
        "settlement crank starting"
    );

    let orchestrator = Orchestrator::new(
        store,
        unwired::UnwiredLedger,
        unwired::UnwiredMpc,
        crank_core::callback::UnconfiguredSignatureVerifier,
        Box::new(TracingObserver),
        cfg,
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        result = orchestrator.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "poll loop exited with an error");
                std::process::exit(2);
            }
        }
        _ = shutdown => {
            tracing::info!("received shutdown signal");
            orchestrator.stop();
        }
    }

    Ok(())
}

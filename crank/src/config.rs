//! Runtime configuration, read from the closed environment-variable set in
//! spec Sec 6. Validation happens eagerly in the constructor, the same way
//! the teacher's `KeeperConfig::from_cli_and_deployment` rejects nonsensical
//! values before the poll loop ever starts.

use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_concurrent_matches: usize,
    pub wallet_path: PathBuf,
    pub min_sol_balance: f64,
    pub error_threshold: u32,
    pub pause_duration: Duration,

    pub shadowwire_enabled: bool,
    pub shadowwire_api_key: Option<String>,
    pub shadowwire_api_url: String,
    pub shadowwire_max_retries: u32,
    pub shadowwire_retry_delay: Duration,
    pub shadowwire_timeout: Duration,

    pub db_path: PathBuf,

    // Fixed by spec Sec 5, not independently configurable via env.
    pub lock_ttl: Duration,
    pub expiry_window: Duration,
    pub cooldown: Duration,
    pub rollback_sweep_interval: Duration,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_var(name) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(eyre!("{name} must be a bool, got '{other}'")),
        },
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env_var(name) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| eyre!("{name} must be an integer: {e}")),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    Ok(env_u64(name, default as u64)?.min(u32::MAX as u64) as u32)
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match env_var(name) {
        None => Ok(default),
        Some(v) => v
            .parse::<f64>()
            .map_err(|e| eyre!("{name} must be a decimal: {e}")),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let poll_ms = env_u64("CRANK_POLLING_INTERVAL_MS", 5000)?;
        if poll_ms == 0 {
            return Err(eyre!("CRANK_POLLING_INTERVAL_MS must be > 0"));
        }

        let max_concurrent_matches = env_u64("CRANK_MAX_CONCURRENT_MATCHES", 10)? as usize;
        if max_concurrent_matches == 0 {
            return Err(eyre!("CRANK_MAX_CONCURRENT_MATCHES must be > 0"));
        }

        let error_threshold = env_u32("CRANK_ERROR_THRESHOLD", 10)?;
        if error_threshold == 0 {
            tracing::warn!("CRANK_ERROR_THRESHOLD=0 means the circuit breaker trips on the first error");
        }

        let pause_ms = env_u64("CRANK_PAUSE_DURATION_MS", 60_000)?;
        let shadowwire_enabled = env_bool("SHADOWWIRE_ENABLED", true)?;
        let shadowwire_api_url = env_var("SHADOWWIRE_API_URL")
            .unwrap_or_else(|| "https://relayer.internal".to_string());

        if shadowwire_enabled && env_var("SHADOWWIRE_API_KEY").is_none() {
            tracing::warn!(
                "SHADOWWIRE_ENABLED is true but SHADOWWIRE_API_KEY is unset; requests will be unauthenticated"
            );
        }

        let shadowwire_max_retries = env_u32("SHADOWWIRE_MAX_RETRIES", 3)?;
        let shadowwire_retry_delay_ms = env_u64("SHADOWWIRE_RETRY_DELAY_MS", 1000)?;
        let shadowwire_timeout_ms = env_u64("SHADOWWIRE_TIMEOUT_MS", 30_000)?;

        let wallet_path = env_var("CRANK_WALLET_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| eyre!("CRANK_WALLET_PATH is required"))?;

        let db_path = env_var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/crank.db"));

        let min_sol_balance = env_f64("CRANK_MIN_SOL_BALANCE", 0.05)?;
        if min_sol_balance < 0.0 {
            return Err(eyre!("CRANK_MIN_SOL_BALANCE must be >= 0"));
        }

        Ok(Self {
            enabled: env_bool("CRANK_ENABLED", true)?,
            poll_interval: Duration::from_millis(poll_ms),
            max_concurrent_matches,
            wallet_path,
            min_sol_balance,
            error_threshold,
            pause_duration: Duration::from_millis(pause_ms.max(1)),

            shadowwire_enabled,
            shadowwire_api_key: env_var("SHADOWWIRE_API_KEY"),
            shadowwire_api_url,
            shadowwire_max_retries,
            shadowwire_retry_delay: Duration::from_millis(shadowwire_retry_delay_ms.max(1)),
            shadowwire_timeout: Duration::from_millis(shadowwire_timeout_ms.max(1)),

            db_path,

            lock_ttl: Duration::from_secs(30),
            expiry_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(60),
            rollback_sweep_interval: Duration::from_secs(30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn rejects_zero_poll_interval() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("CRANK_WALLET_PATH", "/tmp/wallet.json");
        std::env::set_var("CRANK_POLLING_INTERVAL_MS", "0");
        let result = Config::from_env();
        std::env::remove_var("CRANK_POLLING_INTERVAL_MS");
        std::env::remove_var("CRANK_WALLET_PATH");
        assert!(result.is_err());
    }

    #[test]
    fn defaults_match_spec() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("CRANK_WALLET_PATH", "/tmp/wallet.json");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("CRANK_WALLET_PATH");
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert_eq!(cfg.expiry_window, Duration::from_secs(300));
        assert_eq!(cfg.cooldown, Duration::from_secs(60));
        assert_eq!(cfg.shadowwire_max_retries, 3);
    }
}

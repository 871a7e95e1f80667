//! Lock manager (C2): a fast in-process mutex map per lock name, backed
//! optionally by the durable `distributed_locks` table so a second crank
//! instance (or the same instance after a crash) cannot run the same
//! settlement concurrently (spec Sec 4.2, Sec 8 property 1).

use crate::error::{now_unix, CrankError, CrankResult};
use crate::store::locks::DistributedLocksRepo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const LOCK_DEFAULT_TTL: Duration = Duration::from_secs(30);

struct LocalLock {
    owner: String,
    expires_at: u64,
}

/// In-process lock table, keyed by lock name. Cheap path for the common case
/// where a single crank instance owns the whole operational store.
#[derive(Clone)]
pub struct LocalLockMap {
    inner: Arc<Mutex<HashMap<String, LocalLock>>>,
}

impl Default for LocalLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLockMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires `name` for `owner`. Succeeds if unheld, expired, or already
    /// held by the same owner.
    pub async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> bool {
        let mut map = self.inner.lock().await;
        let now = now_unix();
        if let Some(existing) = map.get(name) {
            if existing.owner != owner && existing.expires_at > now {
                return false;
            }
        }
        map.insert(
            name.to_string(),
            LocalLock {
                owner: owner.to_string(),
                expires_at: now + ttl.as_secs(),
            },
        );
        true
    }

    pub async fn release(&self, name: &str, owner: &str) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(name) {
            Some(existing) if existing.owner == owner => {
                map.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn is_held(&self, name: &str) -> bool {
        let map = self.inner.lock().await;
        map.get(name)
            .map(|l| l.expires_at > now_unix())
            .unwrap_or(false)
    }
}

/// Lock manager seen by the orchestrator: the local map, plus an optional
/// distributed facade. When the distributed repo is present, a caller must
/// hold BOTH the local lock and the durable row -- losing either means the
/// whole acquisition is rolled back so no caller is left half-locked.
#[derive(Clone)]
pub struct LockManager {
    local: LocalLockMap,
    distributed: Option<DistributedLocksRepo>,
    owner: String,
}

impl LockManager {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            local: LocalLockMap::new(),
            distributed: None,
            owner: owner.into(),
        }
    }

    pub fn with_distributed(mut self, repo: DistributedLocksRepo) -> Self {
        self.distributed = Some(repo);
        self
    }

    pub async fn acquire(&self, name: &str) -> CrankResult<bool> {
        self.acquire_with_ttl(name, LOCK_DEFAULT_TTL).await
    }

    pub async fn acquire_with_ttl(&self, name: &str, ttl: Duration) -> CrankResult<bool> {
        if !self.local.try_acquire(name, &self.owner, ttl).await {
            return Ok(false);
        }

        if let Some(repo) = &self.distributed {
            match repo.acquire(name, &self.owner, ttl.as_secs()).await {
                Ok(true) => Ok(true),
                Ok(false) => {
                    // Another process holds the durable lock; give back the
                    // local one so we don't strand it.
                    self.local.release(name, &self.owner).await;
                    Ok(false)
                }
                Err(e) => {
                    self.local.release(name, &self.owner).await;
                    Err(e)
                }
            }
        } else {
            Ok(true)
        }
    }

    pub async fn release(&self, name: &str) -> CrankResult<()> {
        self.local.release(name, &self.owner).await;
        if let Some(repo) = &self.distributed {
            repo.release(name, &self.owner).await?;
        }
        Ok(())
    }

    pub async fn is_held(&self, name: &str) -> CrankResult<bool> {
        if let Some(repo) = &self.distributed {
            return repo.is_held(name).await;
        }
        Ok(self.local.is_held(name).await)
    }

    /// Runs `f` while holding `name`, releasing unconditionally afterward --
    /// the pattern the orchestrator uses around every settlement attempt so
    /// a panic-free early return can never leak a held lock.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> CrankResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CrankResult<T>>,
    {
        if !self.acquire(name).await? {
            return Ok(None);
        }
        let result = f().await;
        self.release(name).await?;
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn local_map_rejects_concurrent_owner() {
        let map = LocalLockMap::new();
        assert!(map.try_acquire("k1", "a", Duration::from_secs(5)).await);
        assert!(!map.try_acquire("k1", "b", Duration::from_secs(5)).await);
        assert!(map.try_acquire("k1", "a", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn manager_rolls_back_local_lock_if_distributed_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.distributed_locks();
        // Pre-seed the durable lock with a different owner so the distributed
        // acquire call will fail.
        repo.acquire("pair:1", "other-instance", 30).await.unwrap();

        let manager = LockManager::new("this-instance").with_distributed(store.distributed_locks());
        assert!(!manager.acquire("pair:1").await.unwrap());
        // Local lock must not be left held after the distributed step failed.
        assert!(!manager.is_held("pair:1").await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_even_on_error() {
        let manager = LockManager::new("this-instance");
        let result = manager
            .with_lock("pair:2", || async { Err::<(), _>(CrankError::internal(1, "boom")) })
            .await;
        assert!(result.is_err());
        assert!(!manager.is_held("pair:2").await.unwrap());
    }
}

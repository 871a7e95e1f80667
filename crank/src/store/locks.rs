use crate::error::{now_unix, CrankResult};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct DistributedLocksRepo {
    pool: SqlitePool,
}

impl DistributedLocksRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Acquires `name` for `owner` with the given TTL. Succeeds if the lock
    /// is free, expired, or already held by `owner` (re-entrant renewal);
    /// fails otherwise. This is the durable backstop behind the in-process
    /// lock map in the C2 lock manager.
    pub async fn acquire(&self, name: &str, owner: &str, ttl_sec: u64) -> CrankResult<bool> {
        let now = now_unix() as i64;
        let expires_at = now_unix() as i64 + ttl_sec as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO distributed_locks (name, owner, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
            WHERE distributed_locks.owner = excluded.owner OR distributed_locks.expires_at < ?4
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release(&self, name: &str, owner: &str) -> CrankResult<bool> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE name = ?1 AND owner = ?2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn extend(&self, name: &str, owner: &str, ttl_sec: u64) -> CrankResult<bool> {
        let expires_at = now_unix() as i64 + ttl_sec as i64;
        let result = sqlx::query(
            "UPDATE distributed_locks SET expires_at = ?1 WHERE name = ?2 AND owner = ?3",
        )
        .bind(expires_at)
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_all_by_owner(&self, owner: &str) -> CrankResult<u64> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE owner = ?1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn is_held(&self, name: &str) -> CrankResult<bool> {
        let now = now_unix() as i64;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM distributed_locks WHERE name = ?1 AND expires_at >= ?2",
        )
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn is_held_by(&self, name: &str, owner: &str) -> CrankResult<bool> {
        let now = now_unix() as i64;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM distributed_locks WHERE name = ?1 AND owner = ?2 AND expires_at >= ?3",
        )
        .bind(name)
        .bind(owner)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn second_owner_cannot_acquire_a_live_lock() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.distributed_locks();

        assert!(repo.acquire("pair:1", "owner-a", 30).await.unwrap());
        assert!(!repo.acquire("pair:1", "owner-b", 30).await.unwrap());
        assert!(repo.is_held_by("pair:1", "owner-a").await.unwrap());
    }

    #[tokio::test]
    async fn owner_can_renew_its_own_lock() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.distributed_locks();

        repo.acquire("pair:2", "owner-a", 30).await.unwrap();
        assert!(repo.acquire("pair:2", "owner-a", 60).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.distributed_locks();

        // Acquire already-expired by writing directly.
        sqlx::query(
            "INSERT INTO distributed_locks (name, owner, expires_at) VALUES ('pair:3', 'dead-owner', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert!(repo.acquire("pair:3", "owner-b", 30).await.unwrap());
        assert!(repo.is_held_by("pair:3", "owner-b").await.unwrap());
    }

    #[tokio::test]
    async fn release_only_succeeds_for_the_current_owner() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.distributed_locks();

        repo.acquire("pair:4", "owner-a", 30).await.unwrap();
        assert!(!repo.release("pair:4", "owner-b").await.unwrap());
        assert!(repo.release("pair:4", "owner-a").await.unwrap());
        assert!(!repo.is_held("pair:4").await.unwrap());
    }
}

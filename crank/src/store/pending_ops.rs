use crate::domain::{PendingOpStatus, PendingOperation};
use crate::error::{now_unix, CrankError, CrankResult};
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct PendingOperationsRepo {
    pool: SqlitePool,
}

fn status_str(s: PendingOpStatus) -> &'static str {
    match s {
        PendingOpStatus::Pending => "pending",
        PendingOpStatus::InProgress => "in_progress",
        PendingOpStatus::Completed => "completed",
        PendingOpStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> PendingOpStatus {
    match s {
        "in_progress" => PendingOpStatus::InProgress,
        "completed" => PendingOpStatus::Completed,
        "failed" => PendingOpStatus::Failed,
        _ => PendingOpStatus::Pending,
    }
}

fn op_from_row(row: &sqlx::sqlite::SqliteRow) -> PendingOperation {
    let payload: String = row.get("payload");
    PendingOperation {
        id: row.get("id"),
        op_type: row.get("op_type"),
        natural_key: row.get("natural_key"),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: status_from_str(row.get::<String, _>("status").as_str()),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        last_error: row.get("last_error"),
        locked_by: row.get("locked_by"),
        locked_at: row.get::<Option<i64>, _>("locked_at").map(|v| v as u64),
        not_before: row.get::<Option<i64>, _>("not_before").map(|v| v as u64),
    }
}

impl PendingOperationsRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fails if `natural_key` already exists: this is the dedup guarantee
    /// spec Sec 8 property 4 demands, and the reason rollback enqueue is
    /// safe to call more than once for the same settlement.
    pub async fn create(
        &self,
        op_type: &str,
        natural_key: &str,
        payload: &serde_json::Value,
        max_retries: u32,
        not_before: Option<u64>,
    ) -> CrankResult<i64> {
        if self.exists(natural_key).await? {
            return Err(CrankError::internal(
                20,
                format!("pending operation natural key already exists: {natural_key}"),
            ));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO pending_operations
                (op_type, natural_key, payload, status, retry_count, max_retries, not_before, created_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6)
            "#,
        )
        .bind(op_type)
        .bind(natural_key)
        .bind(payload.to_string())
        .bind(max_retries as i64)
        .bind(not_before.map(|t| t as i64))
        .bind(now_unix() as i64)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    pub async fn exists(&self, natural_key: &str) -> CrankResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM pending_operations WHERE natural_key = ?1")
                .bind(natural_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn find_ready_to_process(
        &self,
        op_type: Option<&str>,
    ) -> CrankResult<Vec<PendingOperation>> {
        let now = now_unix() as i64;
        let rows = if let Some(t) = op_type {
            sqlx::query(
                r#"
                SELECT * FROM pending_operations
                WHERE status = 'pending' AND op_type = ?1
                  AND (not_before IS NULL OR not_before <= ?2)
                ORDER BY created_at ASC
                "#,
            )
            .bind(t)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT * FROM pending_operations
                WHERE status = 'pending'
                  AND (not_before IS NULL OR not_before <= ?1)
                ORDER BY created_at ASC
                "#,
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.iter().map(op_from_row).collect())
    }

    /// Atomically transitions pending -> in_progress, stamping the owner.
    /// Returns false (without mutating anything) if the row is not
    /// currently `pending` -- this is the compare-and-swap that spec Sec 8
    /// property 1 (single worker per key) relies on at the storage layer.
    pub async fn mark_in_progress(&self, id: i64, owner: &str) -> CrankResult<bool> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'in_progress', locked_by = ?1, locked_at = ?2 WHERE id = ?3 AND status = 'pending'",
        )
        .bind(owner)
        .bind(now_unix() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_completed(&self, id: i64) -> CrankResult<()> {
        sqlx::query(
            "UPDATE pending_operations SET status = 'completed', locked_by = NULL, locked_at = NULL WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increments retry_count and records `err`; flips to terminal `failed`
    /// once `retry_count >= max_retries`, otherwise back to `pending` so it
    /// is picked up again by `find_ready_to_process`.
    pub async fn mark_failed(&self, id: i64, err: &str) -> CrankResult<()> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT retry_count, max_retries FROM pending_operations WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((retry_count, max_retries)) = row else {
            return Ok(());
        };
        let next_retry_count = retry_count + 1;
        let next_status = if next_retry_count >= max_retries {
            "failed"
        } else {
            "pending"
        };

        sqlx::query(
            r#"
            UPDATE pending_operations
            SET retry_count = ?1, last_error = ?2, status = ?3, locked_by = NULL, locked_at = NULL
            WHERE id = ?4
            "#,
        )
        .bind(next_retry_count)
        .bind(err)
        .bind(next_status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_for_retry(&self, id: i64) -> CrankResult<()> {
        sqlx::query(
            "UPDATE pending_operations SET status = 'pending', locked_by = NULL, locked_at = NULL WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reclaims rows stuck `in_progress` longer than `timeout_sec` (a worker
    /// crashed mid-operation). Returns the number reclaimed.
    pub async fn release_stale_locks(&self, timeout_sec: u64) -> CrankResult<u64> {
        let cutoff = now_unix().saturating_sub(timeout_sec) as i64;
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'pending', locked_by = NULL, locked_at = NULL WHERE status = 'in_progress' AND locked_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    #[tokio::test]
    async fn create_dedupes_on_natural_key() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.pending_operations();
        repo.create("rollback", "settlement:1", &json!({}), 3, None)
            .await
            .unwrap();
        let err = repo
            .create("rollback", "settlement:1", &json!({}), 3, None)
            .await
            .unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn mark_in_progress_is_a_compare_and_swap() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.pending_operations();
        let id = repo
            .create("rollback", "settlement:2", &json!({}), 3, None)
            .await
            .unwrap();

        assert!(repo.mark_in_progress(id, "worker-a").await.unwrap());
        // Second caller loses the race.
        assert!(!repo.mark_in_progress(id, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn mark_failed_flips_to_terminal_after_max_retries() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.pending_operations();
        let id = repo
            .create("rollback", "settlement:3", &json!({}), 2, None)
            .await
            .unwrap();

        repo.mark_in_progress(id, "worker-a").await.unwrap();
        repo.mark_failed(id, "boom").await.unwrap();
        let ops = repo.find_ready_to_process(None).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].retry_count, 1);

        repo.mark_in_progress(id, "worker-a").await.unwrap();
        repo.mark_failed(id, "boom again").await.unwrap();
        let ops = repo.find_ready_to_process(None).await.unwrap();
        assert_eq!(ops.len(), 0, "row should be terminal `failed`, not ready");
    }

    #[tokio::test]
    async fn release_stale_locks_reclaims_after_timeout() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.pending_operations();
        let id = repo
            .create("rollback", "settlement:4", &json!({}), 3, None)
            .await
            .unwrap();
        repo.mark_in_progress(id, "dead-worker").await.unwrap();

        // Backdate the lock so it looks stale without sleeping in a test.
        sqlx::query("UPDATE pending_operations SET locked_at = 0 WHERE id = ?1")
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();

        let reclaimed = repo.release_stale_locks(30).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(repo.mark_in_progress(id, "new-worker").await.unwrap());
    }
}

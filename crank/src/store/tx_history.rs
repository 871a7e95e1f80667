use crate::domain::{OrderId, TransactionHistoryEntry, TxStatus, TxType};
use crate::error::{now_unix, CrankError, CrankResult};
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct TransactionHistoryRepo {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusCounts {
    pub pending: i64,
    pub confirmed: i64,
    pub failed: i64,
    pub expired: i64,
}

fn tx_type_str(t: TxType) -> &'static str {
    match t {
        TxType::Match => "match",
        TxType::Settlement => "settlement",
        TxType::Rollback => "rollback",
        TxType::Other => "other",
    }
}

fn tx_type_from_str(s: &str) -> TxType {
    match s {
        "match" => TxType::Match,
        "settlement" => TxType::Settlement,
        "rollback" => TxType::Rollback,
        _ => TxType::Other,
    }
}

fn status_str(s: TxStatus) -> &'static str {
    match s {
        TxStatus::Pending => "pending",
        TxStatus::Confirmed => "confirmed",
        TxStatus::Failed => "failed",
        TxStatus::Expired => "expired",
    }
}

fn status_from_str(s: &str) -> TxStatus {
    match s {
        "confirmed" => TxStatus::Confirmed,
        "failed" => TxStatus::Failed,
        "expired" => TxStatus::Expired,
        _ => TxStatus::Pending,
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> TransactionHistoryEntry {
    let buy_order: Option<String> = row.get("buy_order");
    let sell_order: Option<String> = row.get("sell_order");
    TransactionHistoryEntry {
        signature: row.get("signature"),
        tx_type: tx_type_from_str(row.get::<String, _>("tx_type").as_str()),
        status: status_from_str(row.get::<String, _>("status").as_str()),
        buy_order: buy_order.and_then(|s| decode_order_id(&s)),
        sell_order: sell_order.and_then(|s| decode_order_id(&s)),
        slot: row.get::<Option<i64>, _>("slot").map(|v| v as u64),
        created_at: row.get::<i64, _>("created_at") as u64,
    }
}

fn decode_order_id(hex_str: &str) -> Option<OrderId> {
    let bytes = hex::decode(hex_str).ok()?;
    let arr: [u8; 16] = bytes.try_into().ok()?;
    Some(OrderId(arr))
}

impl TransactionHistoryRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fails if `signature` already exists (spec Sec 8 property 4: dedup).
    pub async fn create(&self, entry: &TransactionHistoryEntry) -> CrankResult<i64> {
        if self.find_by_signature(&entry.signature).await?.is_some() {
            return Err(CrankError::internal(
                10,
                format!("transaction history signature already exists: {}", entry.signature),
            ));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO transaction_history
                (signature, tx_type, status, buy_order, sell_order, slot, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.signature)
        .bind(tx_type_str(entry.tx_type))
        .bind(status_str(entry.status))
        .bind(entry.buy_order.map(|o| o.to_hex()))
        .bind(entry.sell_order.map(|o| o.to_hex()))
        .bind(entry.slot.map(|s| s as i64))
        .bind(entry.created_at as i64)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    pub async fn find_by_signature(
        &self,
        signature: &str,
    ) -> CrankResult<Option<TransactionHistoryEntry>> {
        let row = sqlx::query("SELECT * FROM transaction_history WHERE signature = ?1")
            .bind(signature)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| entry_from_row(&r)))
    }

    /// Returns true iff a row actually changed.
    pub async fn update_status(
        &self,
        signature: &str,
        status: TxStatus,
        error_msg: Option<&str>,
        slot: Option<u64>,
    ) -> CrankResult<bool> {
        let _ = error_msg; // reserved: schema keeps only transfer-level errors in pending_operations
        let result = sqlx::query(
            "UPDATE transaction_history SET status = ?1, slot = COALESCE(?2, slot) WHERE signature = ?3",
        )
        .bind(status_str(status))
        .bind(slot.map(|s| s as i64))
        .bind(signature)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_pending_by_type(
        &self,
        tx_type: TxType,
    ) -> CrankResult<Vec<TransactionHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM transaction_history WHERE tx_type = ?1 AND status = 'pending' ORDER BY created_at ASC",
        )
        .bind(tx_type_str(tx_type))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// True iff a confirmed `match` entry for this pair exists within the
    /// trailing `window_sec` seconds.
    pub async fn was_recently_matched(
        &self,
        buy: OrderId,
        sell: OrderId,
        window_sec: u64,
    ) -> CrankResult<bool> {
        let cutoff = now_unix().saturating_sub(window_sec) as i64;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM transaction_history
            WHERE tx_type = 'match' AND status = 'confirmed'
              AND buy_order = ?1 AND sell_order = ?2
              AND created_at >= ?3
            "#,
        )
        .bind(buy.to_hex())
        .bind(sell.to_hex())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(c,)| c > 0).unwrap_or(false))
    }

    pub async fn get_count_by_status(&self) -> CrankResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM transaction_history GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "confirmed" => counts.confirmed = count,
                "failed" => counts.failed = count,
                "expired" => counts.expired = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Removes completed/failed entries older than `days_to_keep`. Never
    /// removes pending rows, regardless of age.
    pub async fn cleanup(&self, days_to_keep: u32) -> CrankResult<u64> {
        let cutoff = now_unix().saturating_sub(days_to_keep as u64 * 86_400) as i64;
        let result = sqlx::query(
            "DELETE FROM transaction_history WHERE status IN ('confirmed', 'failed') AND created_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_recent(&self, limit: u32) -> CrankResult<Vec<TransactionHistoryEntry>> {
        let rows = sqlx::query("SELECT * FROM transaction_history ORDER BY created_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn entry(sig: &str, tx_type: TxType, status: TxStatus) -> TransactionHistoryEntry {
        TransactionHistoryEntry {
            signature: sig.to_string(),
            tx_type,
            status,
            buy_order: Some(OrderId([1; 16])),
            sell_order: Some(OrderId([2; 16])),
            slot: Some(100),
            created_at: now_unix(),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_signature() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.tx_history();
        repo.create(&entry("sig1", TxType::Match, TxStatus::Confirmed))
            .await
            .unwrap();
        let err = repo
            .create(&entry("sig1", TxType::Match, TxStatus::Confirmed))
            .await
            .unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn was_recently_matched_respects_window_and_status() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.tx_history();
        let buy = OrderId([9; 16]);
        let sell = OrderId([8; 16]);

        assert!(!repo.was_recently_matched(buy, sell, 300).await.unwrap());

        repo.create(&TransactionHistoryEntry {
            signature: "m1".into(),
            tx_type: TxType::Match,
            status: TxStatus::Pending,
            buy_order: Some(buy),
            sell_order: Some(sell),
            slot: None,
            created_at: now_unix(),
        })
        .await
        .unwrap();
        // Pending match does not count as "recently matched".
        assert!(!repo.was_recently_matched(buy, sell, 300).await.unwrap());

        repo.update_status("m1", TxStatus::Confirmed, None, Some(5)).await.unwrap();
        assert!(repo.was_recently_matched(buy, sell, 300).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_never_removes_pending() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.tx_history();
        let mut old = entry("old-pending", TxType::Settlement, TxStatus::Pending);
        old.created_at = 0;
        repo.create(&old).await.unwrap();

        let removed = repo.cleanup(0).await.unwrap();
        assert_eq!(removed, 0);
        assert!(repo.find_by_signature("old-pending").await.unwrap().is_some());
    }
}

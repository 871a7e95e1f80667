use crate::domain::{Address, CachedOrderStatus, CachedSide, OrderId, OrderStateCacheEntry};
use crate::error::CrankResult;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct OrderStateCacheRepo {
    pool: SqlitePool,
}

fn side_str(s: CachedSide) -> &'static str {
    match s {
        CachedSide::Buy => "buy",
        CachedSide::Sell => "sell",
    }
}

fn side_from_str(s: &str) -> CachedSide {
    match s {
        "sell" => CachedSide::Sell,
        _ => CachedSide::Buy,
    }
}

fn status_str(s: CachedOrderStatus) -> &'static str {
    match s {
        CachedOrderStatus::Open => "open",
        CachedOrderStatus::Matching => "matching",
        CachedOrderStatus::Filled => "filled",
        CachedOrderStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> CachedOrderStatus {
    match s {
        "matching" => CachedOrderStatus::Matching,
        "filled" => CachedOrderStatus::Filled,
        "cancelled" => CachedOrderStatus::Cancelled,
        _ => CachedOrderStatus::Open,
    }
}

fn decode_order_id(hex_str: &str) -> Option<OrderId> {
    let bytes = hex::decode(hex_str).ok()?;
    let arr: [u8; 16] = bytes.try_into().ok()?;
    Some(OrderId(arr))
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<OrderStateCacheEntry> {
    let order: String = row.get("order_id");
    Some(OrderStateCacheEntry {
        order: decode_order_id(&order)?,
        pair: Address(row.get("pair_id")),
        side: side_from_str(row.get::<String, _>("side").as_str()),
        status: status_from_str(row.get::<String, _>("status").as_str()),
        owner: Address(row.get("owner")),
        slot: row.get::<i64, _>("slot") as u64,
        updated_at: row.get::<i64, _>("updated_at") as u64,
    })
}

impl OrderStateCacheRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or refreshes an entry, but only if `entry.slot` is at least as
    /// new as what's cached -- an out-of-order observation from a lagging
    /// RPC node must never roll the cache backwards (spec Sec 8 property 5).
    pub async fn upsert(&self, entry: &OrderStateCacheEntry) -> CrankResult<bool> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT slot FROM order_state_cache WHERE order_id = ?1")
                .bind(entry.order.to_hex())
                .fetch_optional(&self.pool)
                .await?;

        if let Some((existing_slot,)) = existing {
            if (entry.slot as i64) < existing_slot {
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO order_state_cache (order_id, pair_id, side, status, owner, slot, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(order_id) DO UPDATE SET
                pair_id = excluded.pair_id,
                side = excluded.side,
                status = excluded.status,
                owner = excluded.owner,
                slot = excluded.slot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entry.order.to_hex())
        .bind(&entry.pair.0)
        .bind(side_str(entry.side))
        .bind(status_str(entry.status))
        .bind(&entry.owner.0)
        .bind(entry.slot as i64)
        .bind(entry.updated_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn update_status(
        &self,
        order: OrderId,
        status: CachedOrderStatus,
        slot: u64,
        updated_at: u64,
    ) -> CrankResult<bool> {
        let result = sqlx::query(
            "UPDATE order_state_cache SET status = ?1, slot = ?2, updated_at = ?3 WHERE order_id = ?4 AND slot <= ?2",
        )
        .bind(status_str(status))
        .bind(slot as i64)
        .bind(updated_at as i64)
        .bind(order.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_open_by_trading_pair(
        &self,
        pair: &Address,
    ) -> CrankResult<Vec<OrderStateCacheEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM order_state_cache WHERE pair_id = ?1 AND status IN ('open', 'matching')",
        )
        .bind(&pair.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    pub async fn find_open_buy_orders(&self, pair: &Address) -> CrankResult<Vec<OrderStateCacheEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM order_state_cache WHERE pair_id = ?1 AND side = 'buy' AND status = 'open'",
        )
        .bind(&pair.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    pub async fn find_open_sell_orders(&self, pair: &Address) -> CrankResult<Vec<OrderStateCacheEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM order_state_cache WHERE pair_id = ?1 AND side = 'sell' AND status = 'open'",
        )
        .bind(&pair.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    pub async fn find_by_owner(&self, owner: &Address) -> CrankResult<Vec<OrderStateCacheEntry>> {
        let rows = sqlx::query("SELECT * FROM order_state_cache WHERE owner = ?1")
            .bind(&owner.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    /// Open counter-side orders on the same pair -- the candidate matches a
    /// newly observed order could settle against.
    pub async fn find_matching(
        &self,
        pair: &Address,
        side: CachedSide,
    ) -> CrankResult<Vec<OrderStateCacheEntry>> {
        let opposite = match side {
            CachedSide::Buy => CachedSide::Sell,
            CachedSide::Sell => CachedSide::Buy,
        };
        let rows = sqlx::query(
            "SELECT * FROM order_state_cache WHERE pair_id = ?1 AND side = ?2 AND status = 'open'",
        )
        .bind(&pair.0)
        .bind(side_str(opposite))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    /// Distinct pairs with at least one open or matching order -- the
    /// candidate set the orchestrator polls the Ledger against each cycle.
    pub async fn known_pairs(&self) -> CrankResult<Vec<Address>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT pair_id FROM order_state_cache WHERE status IN ('open', 'matching')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| Address(p)).collect())
    }

    pub async fn delete_finalized(&self) -> CrankResult<u64> {
        let result = sqlx::query(
            "DELETE FROM order_state_cache WHERE status IN ('filled', 'cancelled')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn invalidate_stale(&self, older_than_sec: u64) -> CrankResult<u64> {
        let cutoff = crate::error::now_unix().saturating_sub(older_than_sec) as i64;
        let result = sqlx::query("DELETE FROM order_state_cache WHERE updated_at < ?1")
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

    fn entry(id: u8, pair: &str, side: CachedSide, status: CachedOrderStatus, slot: u64) -> OrderStateCacheEntry {
        OrderStateCacheEntry {
            order: OrderId([id; 16]),
            pair: Address(pair.to_string()),
            side,
            status,
            owner: Address("owner1".into()),
            slot,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn upsert_refuses_to_move_slot_backwards() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.order_state_cache();

        let mut e = entry(1, "pair1", CachedSide::Buy, CachedOrderStatus::Open, 100);
        assert!(repo.upsert(&e).await.unwrap());

        e.slot = 50;
        e.status = CachedOrderStatus::Cancelled;
        assert!(!repo.upsert(&e).await.unwrap());

        let rows = repo.find_open_by_trading_pair(&Address("pair1".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, CachedOrderStatus::Open);
    }

    #[tokio::test]
    async fn find_matching_returns_opposite_side_only() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.order_state_cache();
        let pair = Address("pair2".into());

        repo.upsert(&entry(1, "pair2", CachedSide::Buy, CachedOrderStatus::Open, 1))
            .await
            .unwrap();
        repo.upsert(&entry(2, "pair2", CachedSide::Sell, CachedOrderStatus::Open, 1))
            .await
            .unwrap();

        let matches = repo.find_matching(&pair, CachedSide::Buy).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].side, CachedSide::Sell);
    }

    #[tokio::test]
    async fn delete_finalized_only_removes_terminal_statuses() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.order_state_cache();

        repo.upsert(&entry(1, "pair3", CachedSide::Buy, CachedOrderStatus::Open, 1))
            .await
            .unwrap();
        repo.upsert(&entry(2, "pair3", CachedSide::Sell, CachedOrderStatus::Filled, 1))
            .await
            .unwrap();

        let removed = repo.delete_finalized().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            repo.find_open_by_trading_pair(&Address("pair3".into())).await.unwrap().len(),
            1
        );
    }
}

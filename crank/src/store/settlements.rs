//! Settlement row repository: not one of the four tables spec.md's C1 table
//! names, but C4 "operates on settlement rows via C1" and settlement state
//! must survive a restart, so the row lives here alongside the other four.

use crate::domain::{
    Address, OrderId, SettlementId, SettlementMethod, SettlementRequest, SettlementStatus,
};
use crate::error::CrankResult;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct SettlementsRepo {
    pool: SqlitePool,
}

fn method_str(m: SettlementMethod) -> &'static str {
    match m {
        SettlementMethod::Private => "private",
        SettlementMethod::Public => "public",
    }
}

fn method_from_str(s: &str) -> SettlementMethod {
    match s {
        "public" => SettlementMethod::Public,
        _ => SettlementMethod::Private,
    }
}

fn status_str(s: SettlementStatus) -> &'static str {
    use SettlementStatus::*;
    match s {
        Pending => "pending",
        BaseTransferred => "base_transferred",
        QuoteTransferred => "quote_transferred",
        Completed => "completed",
        Failed => "failed",
        Expired => "expired",
        RollingBack => "rolling_back",
    }
}

fn status_from_str(s: &str) -> SettlementStatus {
    use SettlementStatus::*;
    match s {
        "base_transferred" => BaseTransferred,
        "quote_transferred" => QuoteTransferred,
        "completed" => Completed,
        "failed" => Failed,
        "expired" => Expired,
        "rolling_back" => RollingBack,
        _ => Pending,
    }
}

fn decode_order_id(hex_str: &str) -> Option<OrderId> {
    let bytes = hex::decode(hex_str).ok()?;
    let arr: [u8; 16] = bytes.try_into().ok()?;
    Some(OrderId(arr))
}

fn row_to_settlement(row: &sqlx::sqlite::SqliteRow) -> Option<SettlementRequest> {
    Some(SettlementRequest {
        id: SettlementId(row.get("id")),
        buy_order: decode_order_id(row.get::<String, _>("buy_order").as_str())?,
        sell_order: decode_order_id(row.get::<String, _>("sell_order").as_str())?,
        buy_owner: Address(row.get("buy_owner")),
        sell_owner: Address(row.get("sell_owner")),
        base_asset: Address(row.get("base_asset")),
        quote_asset: Address(row.get("quote_asset")),
        method: method_from_str(row.get::<String, _>("method").as_str()),
        status: status_from_str(row.get::<String, _>("status").as_str()),
        base_transfer_id: row.get("base_transfer_id"),
        quote_transfer_id: row.get("quote_transfer_id"),
        created_at: row.get::<i64, _>("created_at") as u64,
        expires_at: row.get::<i64, _>("expires_at") as u64,
        failure_reason: row.get("failure_reason"),
    })
}

impl SettlementsRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &SettlementId) -> CrankResult<Option<SettlementRequest>> {
        let row = sqlx::query("SELECT * FROM settlements WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| row_to_settlement(&r)))
    }

    /// `initiate`: creates the row if absent, idempotent on settlement id
    /// (spec Sec 4.4). Returns the row that is now current -- the freshly
    /// created one, or the pre-existing one if this is a repeat observation
    /// of the same match.
    pub async fn create_if_absent(
        &self,
        req: &SettlementRequest,
    ) -> CrankResult<SettlementRequest> {
        if let Some(existing) = self.get(&req.id).await? {
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO settlements
                (id, buy_order, sell_order, buy_owner, sell_owner, base_asset, quote_asset,
                 method, status, base_transfer_id, quote_transfer_id, created_at, expires_at, failure_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&req.id.0)
        .bind(req.buy_order.to_hex())
        .bind(req.sell_order.to_hex())
        .bind(&req.buy_owner.0)
        .bind(&req.sell_owner.0)
        .bind(&req.base_asset.0)
        .bind(&req.quote_asset.0)
        .bind(method_str(req.method))
        .bind(status_str(req.status))
        .bind(&req.base_transfer_id)
        .bind(&req.quote_transfer_id)
        .bind(req.created_at as i64)
        .bind(req.expires_at as i64)
        .bind(&req.failure_reason)
        .execute(&self.pool)
        .await?;

        // A concurrent caller may have raced us past the initial `get`; read
        // back whatever row actually landed so both callers observe the
        // same settlement.
        Ok(self.get(&req.id).await?.unwrap_or_else(|| req.clone()))
    }

    /// Persists the full current state of `req` (status, transfer ids,
    /// failure reason). Called after every state-machine transition.
    pub async fn save(&self, req: &SettlementRequest) -> CrankResult<()> {
        sqlx::query(
            r#"
            UPDATE settlements SET
                status = ?1,
                base_transfer_id = ?2,
                quote_transfer_id = ?3,
                failure_reason = ?4
            WHERE id = ?5
            "#,
        )
        .bind(status_str(req.status))
        .bind(&req.base_transfer_id)
        .bind(&req.quote_transfer_id)
        .bind(&req.failure_reason)
        .bind(&req.id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-terminal, non-rolling-back settlements past their expiry window
    /// (spec Sec 4.4 expiry sweep).
    pub async fn find_expired(&self, now: u64) -> CrankResult<Vec<SettlementRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM settlements
            WHERE status IN ('pending', 'base_transferred', 'quote_transferred')
              AND expires_at <= ?1
            "#,
        )
        .bind(now as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_settlement).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SettlementRequest;
    use crate::store::Store;

    fn req(buy: u8, sell: u8) -> SettlementRequest {
        SettlementRequest::initiate(
            OrderId([buy; 16]),
            OrderId([sell; 16]),
            Address("buyer".into()),
            Address("seller".into()),
            Address("base".into()),
            Address("quote".into()),
            SettlementMethod::Private,
            300,
        )
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.settlements();
        let r = req(1, 2);

        let first = repo.create_if_absent(&r).await.unwrap();
        assert_eq!(first.status, SettlementStatus::Pending);

        let mut advanced = first.clone();
        advanced.record_base_transfer("t1".into()).unwrap();
        repo.save(&advanced).await.unwrap();

        // A second "initiate" for the same pair must not reset progress.
        let second = repo.create_if_absent(&r).await.unwrap();
        assert_eq!(second.status, SettlementStatus::BaseTransferred);
        assert_eq!(second.base_transfer_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn find_expired_only_returns_non_terminal_past_window() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = store.settlements();
        let mut r = req(3, 4);
        r.expires_at = 0;
        repo.create_if_absent(&r).await.unwrap();

        let expired = repo.find_expired(crate::error::now_unix()).await.unwrap();
        assert_eq!(expired.len(), 1);

        let mut done = r.clone();
        done.record_base_transfer("t1".into()).unwrap();
        done.record_quote_transfer("t2".into()).unwrap();
        done.complete().unwrap();
        repo.save(&done).await.unwrap();

        let expired = repo.find_expired(crate::error::now_unix()).await.unwrap();
        assert!(expired.is_empty(), "completed settlements must not show up as expired");
    }
}

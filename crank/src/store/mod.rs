//! Operational store (C1): four repositories over one embedded SQLite
//! database, opened with WAL journaling and `synchronous=FULL` per spec
//! Sec 6. Foreign keys stay off -- the model is flat, every invariant is
//! maintained by single-row updates against natural-key uniqueness (spec
//! Sec 5).

pub mod locks;
pub mod order_cache;
pub mod pending_ops;
pub mod settlements;
pub mod tx_history;

use crate::error::{CrankError, CrankResult};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the store at `path`, applying migrations.
    pub async fn open(path: impl AsRef<Path>) -> CrankResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CrankError::internal(2, format!("failed to create db directory: {e}"))
                })?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| CrankError::internal(3, format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(false);

        let pool = Pool::<Sqlite>::connect_with(opts).await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests: same schema, no durability.
    pub async fn open_in_memory() -> CrankResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CrankError::internal(4, format!("invalid memory db url: {e}")))?
            .foreign_keys(false);
        let pool = Pool::<Sqlite>::connect_with(opts).await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> CrankResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature TEXT NOT NULL UNIQUE,
                tx_type TEXT NOT NULL,
                status TEXT NOT NULL,
                buy_order TEXT,
                sell_order TEXT,
                slot INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tx_history_created_at ON transaction_history(created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tx_history_status ON transaction_history(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                op_type TEXT NOT NULL,
                natural_key TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                locked_by TEXT,
                locked_at INTEGER,
                not_before INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_ops_status ON pending_operations(status, not_before)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS distributed_locks (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_state_cache (
                order_id TEXT PRIMARY KEY,
                pair_id TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                owner TEXT NOT NULL,
                slot INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_order_cache_pair ON order_state_cache(pair_id, side)",
        )
        .execute(&self.pool)
        .await?;

        // Not one of the four repositories named in spec.md's C1 table, but
        // spec.md Sec 3 requires settlement rows to persist across restart
        // and C4 to "operate on settlement rows via C1" -- so the settlement
        // row itself lives in the operational store alongside the other
        // four tables. See DESIGN.md.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements (
                id TEXT PRIMARY KEY,
                buy_order TEXT NOT NULL,
                sell_order TEXT NOT NULL,
                buy_owner TEXT NOT NULL,
                sell_owner TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                method TEXT NOT NULL,
                status TEXT NOT NULL,
                base_transfer_id TEXT,
                quote_transfer_id TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                failure_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_settlements_status ON settlements(status, expires_at)",
        )
        .execute(&self.pool)
        .await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_meta WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        if row.is_none() {
            sqlx::query("INSERT INTO schema_meta (id, version) VALUES (0, ?1)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    pub fn tx_history(&self) -> tx_history::TransactionHistoryRepo {
        tx_history::TransactionHistoryRepo::new(self.pool.clone())
    }

    pub fn pending_operations(&self) -> pending_ops::PendingOperationsRepo {
        pending_ops::PendingOperationsRepo::new(self.pool.clone())
    }

    pub fn distributed_locks(&self) -> locks::DistributedLocksRepo {
        locks::DistributedLocksRepo::new(self.pool.clone())
    }

    pub fn order_state_cache(&self) -> order_cache::OrderStateCacheRepo {
        order_cache::OrderStateCacheRepo::new(self.pool.clone())
    }

    pub fn settlements(&self) -> settlements::SettlementsRepo {
        settlements::SettlementsRepo::new(self.pool.clone())
    }
}

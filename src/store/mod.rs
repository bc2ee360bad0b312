//! Durable store.
//!
//! SQLite in WAL mode with foreign keys on, behind a bounded connection pool.
//! Checkouts are capped by a semaphore; a connection that entered a
//! transaction stays out of the pool until the transaction guard resolves it
//! with COMMIT or ROLLBACK.

pub mod repos;
pub mod schema;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Row};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

pub const MAX_POOL_SIZE: usize = 10;

/// Owned, `Send`-able SQL parameters — lets query futures cross an `.await`
/// (and therefore be spawned) without capturing borrowed `dyn ToSql` values
/// that aren't `Sync`. `'a` lets each boxed value still borrow from its
/// caller instead of requiring a copy.
pub type SqlParams<'a> = Vec<Box<dyn rusqlite::ToSql + Send + Sync + 'a>>;

/// Bounded-pool SQLite store.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    idle: Arc<Mutex<Vec<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.idle.lock();
            if idle.len() < MAX_POOL_SIZE {
                idle.push(conn);
            }
        }
    }
}

/// Scoped transaction: `commit()` to keep the writes, dropping without it
/// rolls back.
pub struct StoreTransaction {
    conn: PooledConnection,
    committed: bool,
}

impl StoreTransaction {
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl Deref for StoreTransaction {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "transaction rollback failed");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSize {
    pub total_size_bytes: u64,
    pub total_pages: u64,
    pub page_size_bytes: u64,
}

impl Store {
    /// Open (or create) the database, apply pragmas and run migrations.
    /// Migration failures are fatal to startup.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        info!(db_path = %db_path.display(), "initializing SQLite store");
        let conn = Self::open_connection(db_path)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode, "WAL mode not active");
        }

        Self::migrate(&conn).context("schema migration failed")?;

        let store = Self {
            db_path: db_path.to_path_buf(),
            idle: Arc::new(Mutex::new(vec![conn])),
            permits: Arc::new(Semaphore::new(MAX_POOL_SIZE)),
        };
        info!("store initialized");
        Ok(store)
    }

    fn open_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Apply the schema. If a pre-existing `quotes` table lacks the
    /// `quote_id` column the whole schema is dropped and recreated; online
    /// migration is out of scope.
    fn migrate(conn: &Connection) -> Result<()> {
        let mut has_quotes_table = false;
        let mut has_quote_id = false;
        {
            let mut stmt = conn.prepare("PRAGMA table_info(quotes)")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                has_quotes_table = true;
                let column: String = row.get(1)?;
                if column == "quote_id" {
                    has_quote_id = true;
                }
            }
        }

        if has_quotes_table && !has_quote_id {
            info!("migrating database schema, dropping existing tables");
            for sql in schema::DROP_VIEWS.iter().chain(schema::DROP_TABLES) {
                conn.execute(sql, [])?;
            }
        }

        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(())
    }

    /// Check a connection out of the pool, waiting for a permit if all ten
    /// are in use.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("store is shut down")?;

        let conn = match self.idle.lock().pop() {
            Some(conn) => conn,
            None => Self::open_connection(&self.db_path)?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            idle: self.idle.clone(),
            _permit: permit,
        })
    }

    /// Begin a transaction on a dedicated connection.
    pub async fn transaction(&self) -> Result<StoreTransaction> {
        let conn = self.acquire().await?;
        conn.execute_batch("BEGIN")?;
        Ok(StoreTransaction {
            conn,
            committed: false,
        })
    }

    pub async fn execute(&self, sql: &str, params: SqlParams<'_>) -> Result<usize> {
        let conn = self.acquire().await?;
        conn.execute(sql, rusqlite::params_from_iter(params))
            .with_context(|| format!("execute failed: {sql}"))
    }

    pub async fn execute_many(
        &self,
        sql: &str,
        batches: Vec<Vec<rusqlite::types::Value>>,
    ) -> Result<()> {
        let conn = self.acquire().await?;
        let mut stmt = conn.prepare(sql)?;
        for batch in batches {
            stmt.execute(rusqlite::params_from_iter(batch))?;
        }
        Ok(())
    }

    pub async fn fetch_one<T, F>(&self, sql: &str, params: SqlParams<'_>, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.acquire().await?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        match rows.next()? {
            Some(row) => Ok(Some(f(row)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch_all<T, F>(&self, sql: &str, params: SqlParams<'_>, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.acquire().await?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(f(row)?);
        }
        Ok(out)
    }

    /// Connectivity probe for the health endpoint.
    pub async fn probe(&self) -> Result<()> {
        let conn = self.acquire().await?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub async fn database_size(&self) -> Result<DatabaseSize> {
        let conn = self.acquire().await?;
        let total_pages: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size_bytes: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(DatabaseSize {
            total_size_bytes: total_pages * page_size_bytes,
            total_pages,
            page_size_bytes,
        })
    }

    /// Drop every idle connection. Outstanding checkouts close when their
    /// guards drop.
    pub fn close(&self) {
        let mut idle = self.idle.lock();
        let count = idle.len();
        idle.clear();
        info!(connections = count, "database connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn schema_applies_and_probe_works() {
        let (_dir, store) = temp_store();
        store.probe().await.unwrap();

        let tables = store
            .fetch_all(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get::<_, String>(0),
            )
            .await
            .unwrap();
        for expected in [
            "quotes",
            "orders",
            "fills",
            "positions",
            "account_balances",
            "outbox",
            "trading_sessions",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn transaction_commit_and_rollback() {
        let (_dir, store) = temp_store();

        let tx = store.transaction().await.unwrap();
        tx.execute(
            "INSERT INTO account_balances (asset, available, locked, total, updated_at)
             VALUES ('ADA', '1', '0', '1', 0)",
            [],
        )
        .unwrap();
        tx.commit().unwrap();

        let tx = store.transaction().await.unwrap();
        tx.execute(
            "INSERT INTO account_balances (asset, available, locked, total, updated_at)
             VALUES ('USDM', '2', '0', '2', 0)",
            [],
        )
        .unwrap();
        drop(tx); // rollback

        let count: i64 = store
            .fetch_one("SELECT COUNT(*) FROM account_balances", [], |row| row.get(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn destructive_migration_on_missing_quote_id() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("old.db");

        // Simulate a pre-quote_id schema with data.
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE quotes (id INTEGER PRIMARY KEY, symbol_dst TEXT);
                 INSERT INTO quotes (symbol_dst) VALUES ('ADAUSDM');",
            )
            .unwrap();
        }

        let store = Store::open(&db_path).unwrap();
        let count: i64 = store
            .fetch_one("SELECT COUNT(*) FROM quotes", [], |row| row.get(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 0, "old rows must be gone after recreate");

        // quote_id column now exists.
        store
            .execute(
                "INSERT INTO quotes (quote_id, timestamp, symbol_src, symbol_dst,
                    source_bid_price, source_bid_qty, source_ask_price, source_ask_qty,
                    bid_layers, ask_layers, total_spread_bps, sides_enabled, strategy,
                    status, created_at, updated_at)
                 VALUES ('q1', 0, 'ADAUSDT', 'ADAUSDM', '1', '1', '1', '1',
                    '[]', '[]', 15, '[]', 'market_making', 'persisted', 0, 0)",
                [],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pool_reuses_connections() {
        let (_dir, store) = temp_store();
        for _ in 0..25 {
            let conn = store.acquire().await.unwrap();
            conn.query_row("SELECT 1", [], |_| Ok(())).unwrap();
        }
        assert!(store.idle.lock().len() <= MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn fills_trigger_touches_position() {
        let (_dir, store) = temp_store();
        store
            .execute(
                "INSERT INTO positions (symbol, quantity, avg_entry_price, realized_pnl, last_updated)
                 VALUES ('ADAUSDM', '10', '0.5', '0', 1.0)",
                [],
            )
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO fills (fill_id, order_id, symbol, side, price, quantity,
                    executed_at, created_at)
                 VALUES ('F1', 'O1', 'ADAUSDM', 'buy', '0.5', '10', 42.0, 42.0)",
                [],
            )
            .await
            .unwrap();

        let last_updated: f64 = store
            .fetch_one(
                "SELECT last_updated FROM positions WHERE symbol = 'ADAUSDM'",
                [],
                |row| row.get(0),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last_updated, 42.0);
    }
}

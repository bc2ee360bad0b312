//! Repository layer.
//!
//! Typed data access for the bot's entities. Writes that must be visible to
//! the outbox worker atomically (fill inserted + `fill_created`, quote
//! persisted + `quote_persisted`) run inside one transaction, which is the
//! whole point of the outbox pattern.

use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info};

use crate::account::{Balance, Fill, FillStatus};
use crate::clock::new_uuid;
use crate::oms::{OmsOrder, OrderSide, Position};
use crate::outbox::{OutboxEvent, OutboxStatus};
use crate::pipeline::{PersistentQuote, QuoteStatus, QuoteStrategy};
use crate::store::{SqlParams, Store};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Like `rusqlite::params!`, but boxes each value into an owned, `Send`able
/// trait object so the resulting `SqlParams` can cross an `.await` point.
macro_rules! owned_params {
    ($($e:expr),* $(,)?) => {
        vec![$(Box::new($e) as Box<dyn rusqlite::ToSql + Send + Sync + '_>),*] as SqlParams<'_>
    };
}

fn ts(seconds: Decimal) -> f64 {
    seconds.to_f64().unwrap_or(0.0)
}

fn ts_dec(seconds: f64) -> Decimal {
    Decimal::from_f64(seconds).unwrap_or_default()
}

fn dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_dec_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => Decimal::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// All repositories over one store.
#[derive(Clone)]
pub struct Repositories {
    pub quotes: QuoteRepository,
    pub orders: OrderRepository,
    pub fills: FillRepository,
    pub positions: PositionRepository,
    pub balances: BalanceRepository,
    pub outbox: OutboxRepository,
    pub sessions: SessionRepository,
}

impl Repositories {
    pub fn new(store: Store) -> Self {
        Self {
            quotes: QuoteRepository::new(store.clone()),
            orders: OrderRepository::new(store.clone()),
            fills: FillRepository::new(store.clone()),
            positions: PositionRepository::new(store.clone()),
            balances: BalanceRepository::new(store.clone()),
            outbox: OutboxRepository::new(store.clone()),
            sessions: SessionRepository::new(store),
        }
    }
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QuoteRepository {
    store: Store,
}

const QUOTE_COLUMNS: &str = "id, quote_id, timestamp, symbol_src, symbol_dst, \
     source_bid_price, source_bid_qty, source_ask_price, source_ask_qty, \
     bid_layers, ask_layers, spread_bps, mid_price, total_spread_bps, \
     sides_enabled, strategy, status, created_at, updated_at, expires_at, \
     bid_order_ids, ask_order_ids";

impl QuoteRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert the quote and its `quote_persisted` outbox event in one
    /// transaction. Returns the row id.
    pub async fn save_quote(&self, quote: &PersistentQuote, now: Decimal) -> Result<i64> {
        let tx = self.store.transaction().await?;
        tx.execute(
            "INSERT INTO quotes (
                quote_id, timestamp, symbol_src, symbol_dst,
                source_bid_price, source_bid_qty, source_ask_price, source_ask_qty,
                bid_layers, ask_layers, spread_bps, mid_price, total_spread_bps,
                sides_enabled, strategy, status, created_at, updated_at, expires_at,
                bid_order_ids, ask_order_ids
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                quote.quote_id,
                ts(quote.timestamp),
                quote.symbol_src,
                quote.symbol_dst,
                quote.source_bid_price.to_string(),
                quote.source_bid_qty.to_string(),
                quote.source_ask_price.to_string(),
                quote.source_ask_qty.to_string(),
                serde_json::to_string(&quote.bid_layers)?,
                serde_json::to_string(&quote.ask_layers)?,
                quote.spread_bps.map(|d| d.to_string()),
                quote.mid_price.map(|d| d.to_string()),
                quote.total_spread_bps,
                serde_json::to_string(&quote.sides_enabled)?,
                quote.strategy.as_str(),
                quote.status.as_str(),
                ts(quote.created_at),
                ts(quote.updated_at),
                quote.expires_at.map(ts),
                serde_json::to_string(&quote.bid_order_ids)?,
                serde_json::to_string(&quote.ask_order_ids)?,
            ],
        )?;
        let row_id = tx.last_insert_rowid();

        OutboxRepository::insert_event_on(
            &tx,
            "quote_persisted",
            &quote.quote_id,
            &json!({
                "quote_id": quote.quote_id,
                "symbol_dst": quote.symbol_dst,
                "strategy": quote.strategy.as_str(),
                "bid_price": quote.bid_layers.first().map(|l| l.price.to_string()),
                "ask_price": quote.ask_layers.first().map(|l| l.price.to_string()),
                "timestamp": ts(quote.timestamp),
            }),
            DEFAULT_MAX_RETRIES,
            now,
        )?;

        tx.commit()?;
        debug!(quote_id = %quote.quote_id, db_id = row_id, "quote persisted");
        Ok(row_id)
    }

    pub async fn update_quote_status(
        &self,
        quote_id: &str,
        status: QuoteStatus,
        order_ids: Option<(&[String], &[String])>,
        now: Decimal,
    ) -> Result<()> {
        match order_ids {
            Some((bid_ids, ask_ids)) => {
                self.store
                    .execute(
                        "UPDATE quotes SET status = ?1, updated_at = ?2,
                             bid_order_ids = ?3, ask_order_ids = ?4
                         WHERE quote_id = ?5",
                        owned_params![
                            status.as_str(),
                            ts(now),
                            serde_json::to_string(bid_ids)?,
                            serde_json::to_string(ask_ids)?,
                            quote_id
                        ],
                    )
                    .await?;
            }
            None => {
                self.store
                    .execute(
                        "UPDATE quotes SET status = ?1, updated_at = ?2 WHERE quote_id = ?3",
                        owned_params![status.as_str(), ts(now), quote_id],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_quote(&self, quote_id: &str) -> Result<Option<PersistentQuote>> {
        self.store
            .fetch_one(
                &format!("SELECT {QUOTE_COLUMNS} FROM quotes WHERE quote_id = ?1"),
                owned_params![quote_id],
                row_to_quote,
            )
            .await
    }

    /// Quotes still live for a symbol: persisted/orders_created/
    /// orders_submitted and not yet past expiry.
    pub async fn get_active_quotes(
        &self,
        symbol_dst: &str,
        now: Decimal,
    ) -> Result<Vec<PersistentQuote>> {
        self.store
            .fetch_all(
                &format!(
                    "SELECT {QUOTE_COLUMNS} FROM quotes
                     WHERE symbol_dst = ?1
                       AND status IN ('persisted', 'orders_created', 'orders_submitted')
                       AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY created_at DESC"
                ),
                owned_params![symbol_dst, ts(now)],
                row_to_quote,
            )
            .await
    }

    /// Mark overdue rows expired; returns how many changed.
    pub async fn expire_old_quotes(&self, now: Decimal, symbol_dst: Option<&str>) -> Result<usize> {
        let changed = match symbol_dst {
            Some(symbol) => {
                self.store
                    .execute(
                        "UPDATE quotes SET status = 'expired', updated_at = ?1
                         WHERE expires_at IS NOT NULL AND expires_at <= ?1
                           AND symbol_dst = ?2
                           AND status NOT IN ('expired', 'cancelled')",
                        owned_params![ts(now), symbol],
                    )
                    .await?
            }
            None => {
                self.store
                    .execute(
                        "UPDATE quotes SET status = 'expired', updated_at = ?1
                         WHERE expires_at IS NOT NULL AND expires_at <= ?1
                           AND status NOT IN ('expired', 'cancelled')",
                        owned_params![ts(now)],
                    )
                    .await?
            }
        };
        Ok(changed)
    }

    pub async fn get_recent_quotes(
        &self,
        symbol_dst: &str,
        limit: u32,
    ) -> Result<Vec<PersistentQuote>> {
        self.store
            .fetch_all(
                &format!(
                    "SELECT {QUOTE_COLUMNS} FROM quotes
                     WHERE symbol_dst = ?1 ORDER BY created_at DESC LIMIT ?2"
                ),
                owned_params![symbol_dst, limit],
                row_to_quote,
            )
            .await
    }
}

fn row_to_quote(row: &Row<'_>) -> rusqlite::Result<PersistentQuote> {
    let strategy: String = row.get(15)?;
    let status: String = row.get(16)?;
    let expires_at: Option<f64> = row.get(19)?;
    Ok(PersistentQuote {
        id: Some(row.get(0)?),
        quote_id: row.get(1)?,
        timestamp: ts_dec(row.get(2)?),
        symbol_src: row.get(3)?,
        symbol_dst: row.get(4)?,
        source_bid_price: dec_col(row, 5)?,
        source_bid_qty: dec_col(row, 6)?,
        source_ask_price: dec_col(row, 7)?,
        source_ask_qty: dec_col(row, 8)?,
        bid_layers: json_col(row, 9)?,
        ask_layers: json_col(row, 10)?,
        spread_bps: opt_dec_col(row, 11)?,
        mid_price: opt_dec_col(row, 12)?,
        total_spread_bps: row.get(13)?,
        sides_enabled: json_col(row, 14)?,
        strategy: QuoteStrategy::parse(&strategy).unwrap_or(QuoteStrategy::MarketMaking),
        status: QuoteStatus::parse(&status).unwrap_or(QuoteStatus::Cancelled),
        created_at: ts_dec(row.get(17)?),
        updated_at: ts_dec(row.get(18)?),
        expires_at: expires_at.map(ts_dec),
        bid_order_ids: json_col(row, 20)?,
        ask_order_ids: json_col(row, 21)?,
    })
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Persisted order row. The OMS object is the in-memory truth; this is the
/// durable shadow the reaper and restarts read.
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub order_id: String,
    pub quote_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub status: String,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub external_order_id: Option<String>,
    pub error_message: Option<String>,
}

const ORDER_COLUMNS: &str = "order_id, quote_id, symbol, side, order_type, price, quantity, \
     status, filled_quantity, avg_fill_price, external_order_id, error_message";

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        order_id: row.get(0)?,
        quote_id: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        order_type: row.get(4)?,
        price: opt_dec_col(row, 5)?,
        quantity: dec_col(row, 6)?,
        status: row.get(7)?,
        filled_quantity: dec_col(row, 8)?,
        avg_fill_price: opt_dec_col(row, 9)?,
        external_order_id: row.get(10)?,
        error_message: row.get(11)?,
    })
}

#[derive(Clone)]
pub struct OrderRepository {
    store: Store,
}

impl OrderRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a new order and its `order_created` event atomically.
    pub async fn create_order(
        &self,
        order: &OmsOrder,
        quote_id: Option<&str>,
        now: Decimal,
    ) -> Result<()> {
        let tx = self.store.transaction().await?;
        tx.execute(
            "INSERT INTO orders (
                order_id, quote_id, symbol, side, order_type, price, quantity,
                status, created_at, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                order.order_id,
                quote_id,
                order.symbol,
                order.side.as_str(),
                order.order_type.as_str(),
                order.price.map(|p| p.to_string()),
                order.quantity.to_string(),
                order.state.as_str(),
                ts(now),
            ],
        )?;

        OutboxRepository::insert_event_on(
            &tx,
            "order_created",
            &order.order_id,
            &json!({
                "order_id": order.order_id,
                "quote_id": quote_id,
                "symbol": order.symbol,
                "side": order.side.as_str(),
                "quantity": order.quantity.to_string(),
                "price": order.price.map(|p| p.to_string()),
            }),
            DEFAULT_MAX_RETRIES,
            now,
        )?;
        tx.commit()?;

        info!(order_id = %order.order_id, "created order record");
        Ok(())
    }

    /// Update the durable status and emit `order_status_updated` atomically.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: &str,
        external_order_id: Option<&str>,
        error_message: Option<&str>,
        now: Decimal,
    ) -> Result<()> {
        let tx = self.store.transaction().await?;
        tx.execute(
            "UPDATE orders SET status = ?1, last_updated = ?2,
                 external_order_id = COALESCE(?3, external_order_id),
                 error_message = COALESCE(?4, error_message),
                 submitted_at = CASE WHEN ?1 = 'working' THEN ?2 ELSE submitted_at END
             WHERE order_id = ?5",
            params![status, ts(now), external_order_id, error_message, order_id],
        )?;

        OutboxRepository::insert_event_on(
            &tx,
            "order_status_updated",
            order_id,
            &json!({
                "order_id": order_id,
                "status": status,
                "external_order_id": external_order_id,
                "error_message": error_message,
            }),
            DEFAULT_MAX_RETRIES,
            now,
        )?;
        tx.commit()?;

        info!(order_id, status, external_order_id, "updated order status");
        Ok(())
    }

    /// Record fill progress on the order row, emitting `order_filled`.
    pub async fn update_order_fill(
        &self,
        order_id: &str,
        filled_quantity: Decimal,
        avg_fill_price: Option<Decimal>,
        now: Decimal,
    ) -> Result<()> {
        let tx = self.store.transaction().await?;
        tx.execute(
            "UPDATE orders SET filled_quantity = ?1, avg_fill_price = ?2, last_updated = ?3
             WHERE order_id = ?4",
            params![
                filled_quantity.to_string(),
                avg_fill_price.map(|p| p.to_string()),
                ts(now),
                order_id
            ],
        )?;

        OutboxRepository::insert_event_on(
            &tx,
            "order_filled",
            order_id,
            &json!({
                "order_id": order_id,
                "filled_quantity": filled_quantity.to_string(),
                "avg_fill_price": avg_fill_price.map(|p| p.to_string()),
            }),
            DEFAULT_MAX_RETRIES,
            now,
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderRow>> {
        self.store
            .fetch_one(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"),
                owned_params![order_id],
                row_to_order,
            )
            .await
    }

    /// Orders in `pending`/`working`, via the `v_active_orders` view.
    pub async fn get_active_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderRow>> {
        match symbol {
            Some(symbol) => {
                self.store
                    .fetch_all(
                        &format!(
                            "SELECT {ORDER_COLUMNS} FROM v_active_orders WHERE symbol = ?1"
                        ),
                        owned_params![symbol],
                        row_to_order,
                    )
                    .await
            }
            None => {
                self.store
                    .fetch_all(
                        &format!("SELECT {ORDER_COLUMNS} FROM v_active_orders"),
                        vec![],
                        row_to_order,
                    )
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fills
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FillRepository {
    store: Store,
}

const FILL_COLUMNS: &str = "fill_id, order_id, symbol, side, price, quantity, executed_at, \
     trade_id, commission, commission_asset, is_maker, status";

fn row_to_fill(row: &Row<'_>) -> rusqlite::Result<Fill> {
    let side: String = row.get(3)?;
    let status: String = row.get(11)?;
    Ok(Fill {
        fill_id: row.get(0)?,
        order_id: row.get(1)?,
        symbol: row.get(2)?,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        price: dec_col(row, 4)?,
        quantity: dec_col(row, 5)?,
        executed_at: ts_dec(row.get(6)?),
        trade_id: row.get(7)?,
        commission: dec_col(row, 8)?,
        commission_asset: row.get(9)?,
        is_maker: row.get(10)?,
        status: FillStatus::parse(&status).unwrap_or(FillStatus::Received),
    })
}

impl FillRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Upsert the fill and emit `fill_created` in the same transaction.
    pub async fn insert_fill(&self, fill: &Fill, now: Decimal) -> Result<()> {
        let tx = self.store.transaction().await?;
        tx.execute(
            "INSERT OR REPLACE INTO fills (
                fill_id, order_id, symbol, side, price, quantity, executed_at,
                trade_id, commission, commission_asset, is_maker, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                fill.fill_id,
                fill.order_id,
                fill.symbol,
                fill.side.as_str(),
                fill.price.to_string(),
                fill.quantity.to_string(),
                ts(fill.executed_at),
                fill.trade_id,
                fill.commission.to_string(),
                fill.commission_asset,
                fill.is_maker,
                fill.status.as_str(),
                ts(now),
            ],
        )?;

        OutboxRepository::insert_event_on(
            &tx,
            "fill_created",
            &fill.order_id,
            &json!({
                "fill_id": fill.fill_id,
                "order_id": fill.order_id,
                "symbol": fill.symbol,
                "side": fill.side.as_str(),
                "price": fill.price.to_string(),
                "quantity": fill.quantity.to_string(),
            }),
            DEFAULT_MAX_RETRIES,
            now,
        )?;
        tx.commit()?;

        info!(fill_id = %fill.fill_id, order_id = %fill.order_id, "created fill record");
        Ok(())
    }

    pub async fn update_fill_status(
        &self,
        fill_id: &str,
        status: FillStatus,
        processed_at: Option<Decimal>,
    ) -> Result<()> {
        self.store
            .execute(
                "UPDATE fills SET status = ?1, processed_at = ?2 WHERE fill_id = ?3",
                owned_params![status.as_str(), processed_at.map(ts), fill_id],
            )
            .await?;
        Ok(())
    }

    pub async fn get_fill(&self, fill_id: &str) -> Result<Option<Fill>> {
        self.store
            .fetch_one(
                &format!("SELECT {FILL_COLUMNS} FROM fills WHERE fill_id = ?1"),
                owned_params![fill_id],
                row_to_fill,
            )
            .await
    }

    pub async fn get_fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>> {
        self.store
            .fetch_all(
                &format!(
                    "SELECT {FILL_COLUMNS} FROM fills WHERE order_id = ?1 ORDER BY executed_at"
                ),
                owned_params![order_id],
                row_to_fill,
            )
            .await
    }

    pub async fn get_recent_fills(&self, symbol: Option<&str>, limit: u32) -> Result<Vec<Fill>> {
        match symbol {
            Some(symbol) => {
                self.store
                    .fetch_all(
                        &format!(
                            "SELECT {FILL_COLUMNS} FROM fills WHERE symbol = ?1
                             ORDER BY executed_at DESC LIMIT ?2"
                        ),
                        owned_params![symbol, limit],
                        row_to_fill,
                    )
                    .await
            }
            None => {
                self.store
                    .fetch_all(
                        &format!(
                            "SELECT {FILL_COLUMNS} FROM fills ORDER BY executed_at DESC LIMIT ?1"
                        ),
                        owned_params![limit],
                        row_to_fill,
                    )
                    .await
            }
        }
    }

    /// Fill ids already marked processed, used to rebuild the reconciler's
    /// idempotency set after a restart.
    pub async fn get_processed_fill_ids(&self) -> Result<Vec<String>> {
        self.store
            .fetch_all(
                "SELECT fill_id FROM fills WHERE status = 'processed'",
                vec![],
                |row| row.get(0),
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PositionRepository {
    store: Store,
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: row.get(0)?,
        quantity: dec_col(row, 1)?,
        avg_entry_price: dec_col(row, 2)?,
        realized_pnl: dec_col(row, 3)?,
        unrealized_pnl: dec_col(row, 4)?,
        last_updated: ts_dec(row.get(5)?),
    })
}

const POSITION_COLUMNS: &str =
    "symbol, quantity, avg_entry_price, realized_pnl, unrealized_pnl, last_updated";

impl PositionRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        self.store
            .execute(
                "INSERT OR REPLACE INTO positions (
                    symbol, quantity, avg_entry_price, realized_pnl, unrealized_pnl, last_updated
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                owned_params![
                    position.symbol,
                    position.quantity.to_string(),
                    position.avg_entry_price.to_string(),
                    position.realized_pnl.to_string(),
                    position.unrealized_pnl.to_string(),
                    ts(position.last_updated),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        self.store
            .fetch_one(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = ?1"),
                owned_params![symbol],
                row_to_position,
            )
            .await
    }

    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        self.store
            .fetch_all(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE quantity != '0'"),
                vec![],
                row_to_position,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BalanceRepository {
    store: Store,
}

fn row_to_balance(row: &Row<'_>) -> rusqlite::Result<Balance> {
    Ok(Balance {
        asset: row.get(0)?,
        available: dec_col(row, 1)?,
        locked: dec_col(row, 2)?,
        total: dec_col(row, 3)?,
        updated_at: ts_dec(row.get(4)?),
    })
}

impl BalanceRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn update_balance(&self, balance: &Balance) -> Result<()> {
        self.store
            .execute(
                "INSERT OR REPLACE INTO account_balances (asset, available, locked, total, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                owned_params![
                    balance.asset,
                    balance.available.to_string(),
                    balance.locked.to_string(),
                    balance.total.to_string(),
                    ts(balance.updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_balance(&self, asset: &str) -> Result<Option<Balance>> {
        self.store
            .fetch_one(
                "SELECT asset, available, locked, total, updated_at
                 FROM account_balances WHERE asset = ?1",
                owned_params![asset],
                row_to_balance,
            )
            .await
    }

    pub async fn get_all_balances(&self) -> Result<Vec<Balance>> {
        self.store
            .fetch_all(
                "SELECT asset, available, locked, total, updated_at FROM account_balances",
                vec![],
                row_to_balance,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OutboxRepository {
    store: Store,
}

const OUTBOX_COLUMNS: &str = "id, event_id, event_type, aggregate_id, payload, status, \
     retry_count, max_retries, next_retry_at, error_message, created_at, processed_at";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let status: String = row.get(5)?;
    Ok(OutboxEvent {
        id: row.get(0)?,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        payload: json_col(row, 4)?,
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        next_retry_at: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        processed_at: row.get(11)?,
    })
}

impl OutboxRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert an event on an existing connection, for use inside the
    /// producing transaction.
    pub fn insert_event_on(
        conn: &Connection,
        event_type: &str,
        aggregate_id: &str,
        payload: &serde_json::Value,
        max_retries: u32,
        now: Decimal,
    ) -> Result<String> {
        let event_id = new_uuid();
        conn.execute(
            "INSERT INTO outbox (
                event_id, event_type, aggregate_id, payload, status,
                retry_count, max_retries, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
            params![
                event_id,
                event_type,
                aggregate_id,
                serde_json::to_string(payload)?,
                max_retries,
                ts(now)
            ],
        )
        .context("failed to insert outbox event")?;
        Ok(event_id)
    }

    /// Insert an event on its own connection.
    pub async fn add_event(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: &serde_json::Value,
        now: Decimal,
    ) -> Result<String> {
        let conn = self.store.acquire().await?;
        Self::insert_event_on(&conn, event_type, aggregate_id, payload, DEFAULT_MAX_RETRIES, now)
    }

    /// Events ready for processing: pending, or failed with an elapsed
    /// retry timer. Ordered by creation so aggregates replay in order.
    pub async fn get_pending_events(&self, limit: u32, now: Decimal) -> Result<Vec<OutboxEvent>> {
        self.store
            .fetch_all(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox
                     WHERE status = 'pending'
                        OR (status = 'failed' AND next_retry_at <= ?1)
                     ORDER BY created_at
                     LIMIT ?2"
                ),
                owned_params![ts(now), limit],
                row_to_event,
            )
            .await
    }

    pub async fn mark_processing(&self, event_id: &str) -> Result<()> {
        self.store
            .execute(
                "UPDATE outbox SET status = 'processing' WHERE event_id = ?1",
                owned_params![event_id],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, event_id: &str, now: Decimal) -> Result<()> {
        self.store
            .execute(
                "UPDATE outbox SET status = 'completed', processed_at = ?1 WHERE event_id = ?2",
                owned_params![ts(now), event_id],
            )
            .await?;
        Ok(())
    }

    /// Record a failure. Exhausted events move to the dead-letter queue with
    /// their retry timer cleared; the rest are scheduled for retry.
    pub async fn mark_failed(
        &self,
        event_id: &str,
        error_message: &str,
        retry_delay_secs: f64,
        now: Decimal,
    ) -> Result<()> {
        self.store
            .execute(
                "UPDATE outbox SET
                    status = CASE WHEN retry_count >= max_retries
                                  THEN 'dead_letter' ELSE 'failed' END,
                    retry_count = CASE WHEN retry_count >= max_retries
                                       THEN retry_count ELSE retry_count + 1 END,
                    next_retry_at = CASE WHEN retry_count >= max_retries
                                         THEN NULL ELSE ?1 + ?2 END,
                    error_message = ?3,
                    last_error_at = ?1
                 WHERE event_id = ?4",
                owned_params![ts(now), retry_delay_secs, error_message, event_id],
            )
            .await?;
        Ok(())
    }

    /// Admin operation: put a dead-letter event back in line from scratch.
    pub async fn reset_event(&self, event_id: &str) -> Result<bool> {
        let changed = self
            .store
            .execute(
                "UPDATE outbox SET status = 'pending', retry_count = 0,
                     next_retry_at = NULL, error_message = NULL, processed_at = NULL
                 WHERE event_id = ?1",
                owned_params![event_id],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<OutboxEvent>> {
        self.store
            .fetch_one(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE event_id = ?1"),
                owned_params![event_id],
                row_to_event,
            )
            .await
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let count: i64 = self
            .store
            .fetch_one(
                "SELECT COUNT(*) FROM outbox WHERE status = ?1",
                owned_params![status.as_str()],
                |row| row.get(0),
            )
            .await?
            .unwrap_or(0);
        Ok(count as u64)
    }

    pub async fn oldest_pending_created_at(&self) -> Result<Option<f64>> {
        self.store
            .fetch_one(
                "SELECT MIN(created_at) FROM outbox WHERE status = 'pending'",
                vec![],
                |row| row.get::<_, Option<f64>>(0),
            )
            .await
            .map(|v| v.flatten())
    }

    /// Delete completed events older than the cutoff; returns the count.
    pub async fn cleanup_completed(&self, older_than: Decimal) -> Result<usize> {
        let deleted = self
            .store
            .execute(
                "DELETE FROM outbox WHERE status = 'completed' AND processed_at < ?1",
                owned_params![ts(older_than)],
            )
            .await?;
        if deleted > 0 {
            info!(count = deleted, "cleaned up completed outbox events");
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Trading sessions
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionRepository {
    store: Store,
}

impl SessionRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_session(
        &self,
        session_id: &str,
        config_snapshot: &serde_json::Value,
        now: Decimal,
    ) -> Result<()> {
        self.store
            .execute(
                "INSERT INTO trading_sessions (session_id, started_at, config_snapshot, status)
                 VALUES (?1, ?2, ?3, 'active')",
                owned_params![session_id, ts(now), serde_json::to_string(config_snapshot)?],
            )
            .await?;
        info!(session_id, "created trading session");
        Ok(())
    }

    pub async fn end_session(
        &self,
        session_id: &str,
        status: &str,
        error_message: Option<&str>,
        now: Decimal,
    ) -> Result<()> {
        self.store
            .execute(
                "UPDATE trading_sessions SET ended_at = ?1, status = ?2, error_message = ?3
                 WHERE session_id = ?4",
                owned_params![ts(now), status, error_message, session_id],
            )
            .await?;
        info!(session_id, status, "ended trading session");
        Ok(())
    }

    pub async fn get_active_session(&self) -> Result<Option<(String, f64)>> {
        self.store
            .fetch_one(
                "SELECT session_id, started_at FROM trading_sessions
                 WHERE status = 'active' ORDER BY started_at DESC LIMIT 1",
                vec![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .await
    }
}

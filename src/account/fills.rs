//! Fill reconciliation.
//!
//! Every fill flows through here exactly once: persist, update the order and
//! position through the OMS, derive balance deltas, mark processed, publish
//! the outbox event. `fill_id` is the idempotency key.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::balance::BalanceTracker;
use crate::account::{Balance, BalanceUpdateReason, Fill, FillStatus};
use crate::clock::Clock;
use crate::events::FillEvent;
use crate::oms::{FillParams, Oms, OrderSide};
use crate::store::repos::{FillRepository, OutboxRepository, PositionRepository};

/// Serialises fill processing across all symbols and owns the processed-id
/// set.
pub struct FillReconciler {
    fills: FillRepository,
    positions: PositionRepository,
    outbox: OutboxRepository,
    balance_tracker: Arc<BalanceTracker>,
    oms: Arc<Oms>,
    clock: Arc<dyn Clock>,
    /// Destination symbol and its configured base/quote split.
    symbol_dst: String,
    base_asset: String,
    quote_asset: String,
    processed: Mutex<HashSet<String>>,
    fill_tx: broadcast::Sender<FillEvent>,
}

impl FillReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fills: FillRepository,
        positions: PositionRepository,
        outbox: OutboxRepository,
        balance_tracker: Arc<BalanceTracker>,
        oms: Arc<Oms>,
        clock: Arc<dyn Clock>,
        symbol_dst: String,
        base_asset: String,
        quote_asset: String,
        fill_tx: broadcast::Sender<FillEvent>,
    ) -> Self {
        Self {
            fills,
            positions,
            outbox,
            balance_tracker,
            oms,
            clock,
            symbol_dst,
            base_asset,
            quote_asset,
            processed: Mutex::new(HashSet::new()),
            fill_tx,
        }
    }

    /// Restore the idempotency set from fills already marked processed.
    pub async fn load_processed(&self) -> Result<usize> {
        let ids = self.fills.get_processed_fill_ids().await?;
        let mut processed = self.processed.lock().await;
        for id in ids {
            processed.insert(id);
        }
        Ok(processed.len())
    }

    /// Returns `false` when the fill was a duplicate.
    pub async fn process_fill(&self, mut fill: Fill) -> Result<bool> {
        let mut processed = self.processed.lock().await;
        if processed.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "fill already processed");
            return Ok(false);
        }

        let now = self.clock.now();
        fill.status = FillStatus::Received;

        // Persist first so the fill survives even if a later step fails.
        self.fills.insert_fill(&fill, now).await?;

        // Order state + position through the OMS recurrence.
        let realized_pnl = match self.oms.add_fill(FillParams {
            order_id: fill.order_id.clone(),
            quantity: fill.quantity,
            price: fill.price,
            fill_id: Some(fill.fill_id.clone()),
            trade_id: fill.trade_id.clone(),
            fee: fill.commission,
            symbol: Some(fill.symbol.clone()),
            side: Some(fill.side),
        }) {
            Ok(pnl) => pnl,
            Err(e) => {
                fill.status = FillStatus::Error;
                self.fills
                    .update_fill_status(&fill.fill_id, FillStatus::Error, Some(now))
                    .await?;
                error!(fill_id = %fill.fill_id, error = %e, "fill processing failed");
                return Ok(false);
            }
        };

        // Durable position shadow.
        if let Some(position) = self.oms.get_position(&fill.symbol) {
            self.positions.upsert_position(&position).await?;
        }

        self.apply_balance_deltas(&fill).await;

        fill.status = FillStatus::Processed;
        self.fills
            .update_fill_status(&fill.fill_id, FillStatus::Processed, Some(now))
            .await?;

        self.outbox
            .add_event(
                "fill_processed",
                &fill.fill_id,
                &json!({
                    "fill_id": fill.fill_id,
                    "order_id": fill.order_id,
                    "symbol": fill.symbol,
                    "side": fill.side.as_str(),
                    "price": fill.price.to_string(),
                    "quantity": fill.quantity.to_string(),
                    "commission": fill.commission.to_string(),
                    "realized_pnl": realized_pnl.to_string(),
                }),
                now,
            )
            .await?;

        processed.insert(fill.fill_id.clone());

        info!(
            fill_id = %fill.fill_id,
            order_id = %fill.order_id,
            symbol = %fill.symbol,
            side = fill.side.as_str(),
            quantity = %fill.quantity,
            price = %fill.price,
            "fill processed and reconciled"
        );

        let _ = self.fill_tx.send(FillEvent {
            fill,
            realized_pnl,
        });
        Ok(true)
    }

    /// Move base and quote balances by the fill, charging commission to the
    /// matching asset.
    async fn apply_balance_deltas(&self, fill: &Fill) {
        let (base_asset, quote_asset) = self.split_assets(&fill.symbol);

        let base = self.balance_tracker.get_balance(&base_asset).await;
        let quote = self.balance_tracker.get_balance(&quote_asset).await;
        let (Some(base), Some(quote)) = (base, quote) else {
            warn!(
                fill_id = %fill.fill_id,
                base_asset = %base_asset,
                quote_asset = %quote_asset,
                "missing balance data for fill processing"
            );
            return;
        };

        let notional = fill.quantity * fill.price;
        let (mut base_change, mut quote_change) = match fill.side {
            OrderSide::Buy => (fill.quantity, -notional),
            OrderSide::Sell => (-fill.quantity, notional),
        };

        if fill.commission > Decimal::ZERO {
            if fill.commission_asset == base_asset {
                base_change -= fill.commission;
            } else if fill.commission_asset == quote_asset {
                quote_change -= fill.commission;
            }
        }

        self.balance_tracker
            .update_balance(
                &base_asset,
                base.available + base_change,
                base.locked,
                BalanceUpdateReason::TradeFill,
            )
            .await;
        self.balance_tracker
            .update_balance(
                &quote_asset,
                quote.available + quote_change,
                quote.locked,
                BalanceUpdateReason::TradeFill,
            )
            .await;
    }

    fn split_assets(&self, symbol: &str) -> (String, String) {
        // The configured pair wins for the symbol it was configured for.
        if symbol == self.symbol_dst {
            (self.base_asset.clone(), self.quote_asset.clone())
        } else {
            crate::config::split_symbol(symbol)
        }
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.lock().await.len()
    }

    pub async fn balance_snapshot(&self, asset: &str) -> Option<Balance> {
        self.balance_tracker.get_balance(asset).await
    }
}

//! Account state management.
//!
//! Consumes the venue's account event stream and keeps balances, fills and
//! positions consistent with what actually happened on-venue. Classification
//! is by the message's `sub_type` field with a `type` fallback.

pub mod balance;
pub mod fills;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub use balance::BalanceTracker;
pub use fills::FillReconciler;

use crate::clock::Clock;
use crate::oms::{Oms, OrderSide, OrderState, TransitionFields};
use crate::venue::VenueClient;

/// Processing status of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Received,
    Reconciled,
    Processed,
    Error,
}

impl FillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillStatus::Received => "received",
            FillStatus::Reconciled => "reconciled",
            FillStatus::Processed => "processed",
            FillStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(FillStatus::Received),
            "reconciled" => Some(FillStatus::Reconciled),
            "processed" => Some(FillStatus::Processed),
            "error" => Some(FillStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceUpdateReason {
    TradeFill,
    Deposit,
    Withdrawal,
    Fee,
    Adjustment,
    Initial,
}

impl BalanceUpdateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceUpdateReason::TradeFill => "trade_fill",
            BalanceUpdateReason::Deposit => "deposit",
            BalanceUpdateReason::Withdrawal => "withdrawal",
            BalanceUpdateReason::Fee => "fee",
            BalanceUpdateReason::Adjustment => "adjustment",
            BalanceUpdateReason::Initial => "initial",
        }
    }
}

/// A trade execution reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_at: Decimal,
    pub trade_id: Option<String>,
    pub commission: Decimal,
    pub commission_asset: String,
    pub is_maker: bool,
    pub status: FillStatus,
}

impl Fill {
    /// Build a fill from a raw account message with direct fields
    /// (`fillId`, `orderId`, `price`, `quantity`, …).
    pub fn from_account_message(message: &Value, now: Decimal) -> Result<Self> {
        let fill_id = string_field(message, "fillId")
            .or_else(|| string_field(message, "id"))
            .unwrap_or_default();
        if fill_id.is_empty() {
            bail!("fill message has no fillId/id");
        }

        let side_str = string_field(message, "side").unwrap_or_default();
        let Some(side) = OrderSide::parse(&side_str) else {
            bail!("fill {fill_id} has unknown side {side_str:?}");
        };

        Ok(Self {
            fill_id,
            order_id: string_field(message, "orderId").unwrap_or_default(),
            symbol: string_field(message, "symbol")
                .unwrap_or_default()
                .to_ascii_uppercase(),
            side,
            price: parse_decimal_field(message, "price").unwrap_or(Decimal::ZERO),
            quantity: parse_decimal_field(message, "quantity").unwrap_or(Decimal::ZERO),
            executed_at: parse_decimal_field(message, "timestamp").unwrap_or(now),
            trade_id: string_field(message, "tradeId"),
            commission: parse_decimal_field(message, "commission").unwrap_or(Decimal::ZERO),
            commission_asset: string_field(message, "commissionAsset").unwrap_or_default(),
            is_maker: message
                .get("isMaker")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            status: FillStatus::Received,
        })
    }
}

/// Account balance for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
    pub updated_at: Decimal,
}

/// Decimal from a JSON field that may be a string or a number.
pub(crate) fn parse_decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    use std::str::FromStr;
    match value.get(key)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => {
            use rust_decimal::prelude::FromPrimitive;
            n.as_f64().and_then(Decimal::from_f64)
        }
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Drives the account event stream into the balance tracker, fill
/// reconciler and OMS. Reconnects with exponential backoff, giving up after
/// `max_retries` without taking the trading loop down with it.
pub struct AccountReconciler {
    venue: Arc<dyn VenueClient>,
    balance_tracker: Arc<BalanceTracker>,
    fill_reconciler: Arc<FillReconciler>,
    oms: Arc<Oms>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    max_retries: u32,
}

impl AccountReconciler {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        balance_tracker: Arc<BalanceTracker>,
        fill_reconciler: Arc<FillReconciler>,
        oms: Arc<Oms>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        info!("account reconciler initialized");
        Self {
            venue,
            balance_tracker,
            fill_reconciler,
            oms,
            clock,
            running: AtomicBool::new(false),
            max_retries,
        }
    }

    /// Pull current balances over REST and apply them.
    pub async fn refresh_balances(&self) -> Result<()> {
        let balances = self
            .venue
            .get_balances()
            .await
            .map_err(|e| anyhow::anyhow!("balance refresh failed: {e}"))?;
        for balance in balances {
            self.balance_tracker
                .update_balance(
                    &balance.asset,
                    balance.available,
                    balance.locked,
                    BalanceUpdateReason::Adjustment,
                )
                .await;
        }
        info!("balances refreshed from venue");
        Ok(())
    }

    /// Consume the account stream until stopped or retries are exhausted.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut retry_count: u32 = 0;

        'reconnect: while self.running.load(Ordering::SeqCst) {
            let mut events = self.venue.account_events();
            info!("account event stream attached");

            loop {
                if !self.running.load(Ordering::SeqCst) {
                    break 'reconnect;
                }
                match events.recv().await {
                    Ok(message) => {
                        retry_count = 0;
                        if let Err(e) = self.handle_message(&message).await {
                            error!(error = %e, "error handling account update");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "account stream lagged, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        retry_count += 1;
                        if retry_count > self.max_retries {
                            error!("max account stream retries reached, stopping reconciler");
                            break 'reconnect;
                        }
                        let delay = 2u64.pow(retry_count.min(6)).min(60);
                        warn!(retry_count, delay_secs = delay, "account stream reconnect");
                        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                        continue 'reconnect;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("account reconciler stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Classify and dispatch one raw account message.
    pub async fn handle_message(&self, message: &Value) -> Result<()> {
        let sub_type = message
            .get("sub_type")
            .or_else(|| message.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("");

        match sub_type {
            "balance_update" => {
                if let Some(balances) = message.get("balances") {
                    self.balance_tracker
                        .update_from_snapshot(balances, BalanceUpdateReason::Adjustment)
                        .await;
                }
            }
            "order_update" => {
                self.handle_order_update(message);
            }
            "fill" | "trade" => {
                let fill = Fill::from_account_message(message, self.clock.now())?;
                if !self.fill_reconciler.process_fill(fill).await? {
                    debug!("fill was a duplicate or failed processing");
                }
            }
            "trading_history" => {
                self.handle_trading_history(message).await?;
            }
            "orders_history" | "positions" => {
                debug!(sub_type, "account snapshot received");
            }
            other => {
                debug!(sub_type = other, "unhandled account update type");
            }
        }
        Ok(())
    }

    /// One page of trading history: top-level `order_filling_records[]` plus
    /// fills nested under `orders[]`, which inherit the parent order's
    /// symbol and side when they lack their own.
    async fn handle_trading_history(&self, message: &Value) -> Result<()> {
        let now = self.clock.now();
        let data = message.get("data").unwrap_or(message);
        let mut reconciled = 0usize;

        if let Some(records) = data.get("order_filling_records").and_then(Value::as_array) {
            for record in records {
                match Fill::from_account_message(record, now) {
                    Ok(fill) => {
                        if self.fill_reconciler.process_fill(fill).await? {
                            reconciled += 1;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed history fill"),
                }
            }
        }

        if let Some(orders) = data.get("orders").and_then(Value::as_array) {
            for order in orders {
                let parent_symbol = string_field(order, "symbol");
                let parent_side = string_field(order, "side");
                let Some(fills) = order.get("fills").and_then(Value::as_array) else {
                    continue;
                };
                for raw in fills {
                    let mut merged = raw.clone();
                    if let Some(object) = merged.as_object_mut() {
                        if !object.contains_key("symbol") {
                            if let Some(symbol) = &parent_symbol {
                                object.insert("symbol".to_string(), Value::String(symbol.clone()));
                            }
                        }
                        if !object.contains_key("side") {
                            if let Some(side) = &parent_side {
                                object.insert("side".to_string(), Value::String(side.clone()));
                            }
                        }
                        if !object.contains_key("orderId") {
                            if let Some(order_id) = string_field(order, "orderId")
                                .or_else(|| string_field(order, "id"))
                            {
                                object.insert("orderId".to_string(), Value::String(order_id));
                            }
                        }
                    }
                    match Fill::from_account_message(&merged, now) {
                        Ok(fill) => {
                            if self.fill_reconciler.process_fill(fill).await? {
                                reconciled += 1;
                            }
                        }
                        Err(e) => warn!(error = %e, "skipping malformed nested fill"),
                    }
                }
            }
        }

        if reconciled > 0 {
            info!(reconciled, "trading history page reconciled");
        }
        Ok(())
    }

    /// Pass venue order status changes through to the OMS, matching on the
    /// external order id.
    fn handle_order_update(&self, message: &Value) {
        let Some(external_id) = string_field(message, "orderId") else {
            debug!("order update without orderId");
            return;
        };
        let status = string_field(message, "status").unwrap_or_default();

        let Some(order) = self
            .oms
            .get_all_orders(None, None)
            .into_iter()
            .find(|o| o.external_order_id.as_deref() == Some(external_id.as_str()))
        else {
            debug!(external_id, status, "order update for untracked order");
            return;
        };

        let result = match status.as_str() {
            "working" | "open" | "submitted" if order.state == OrderState::Pending => self
                .oms
                .update_order_state(&order.order_id, OrderState::Working, TransitionFields::default())
                .map(|_| ()),
            "cancelled" | "canceled" => self
                .oms
                .cancel_order(&order.order_id, "cancelled on venue")
                .map(|_| ()),
            "rejected" => self
                .oms
                .update_order_state(
                    &order.order_id,
                    OrderState::Rejected,
                    TransitionFields {
                        external_order_id: None,
                        error_message: string_field(message, "reason"),
                    },
                )
                .map(|_| ()),
            "failed" => self
                .oms
                .update_order_state(
                    &order.order_id,
                    OrderState::Failed,
                    TransitionFields {
                        external_order_id: None,
                        error_message: string_field(message, "reason"),
                    },
                )
                .map(|_| ()),
            // Fills arrive on their own channel; everything else is noise.
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!(external_id, status, error = %e, "order update not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn fill_parses_direct_fields() {
        let message = json!({
            "sub_type": "fill",
            "fillId": "F1",
            "orderId": "O1",
            "symbol": "adausdm",
            "side": "BUY",
            "price": "0.4500",
            "quantity": 50.0,
            "timestamp": "1700000000",
            "tradeId": "T9",
            "commission": "0.05",
            "commissionAsset": "USDM",
            "isMaker": false,
        });
        let fill = Fill::from_account_message(&message, dec!(1)).unwrap();
        assert_eq!(fill.fill_id, "F1");
        assert_eq!(fill.order_id, "O1");
        assert_eq!(fill.symbol, "ADAUSDM");
        assert_eq!(fill.side, OrderSide::Buy);
        assert_eq!(fill.price, dec!(0.4500));
        assert_eq!(fill.quantity, dec!(50));
        assert_eq!(fill.executed_at, dec!(1700000000));
        assert_eq!(fill.trade_id.as_deref(), Some("T9"));
        assert_eq!(fill.commission, dec!(0.05));
        assert!(!fill.is_maker);
    }

    #[test]
    fn fill_falls_back_to_id_and_now() {
        let message = json!({
            "id": 12345,
            "side": "sell",
            "symbol": "ADAUSDM",
            "price": "0.5",
            "quantity": "10",
        });
        let fill = Fill::from_account_message(&message, dec!(777)).unwrap();
        assert_eq!(fill.fill_id, "12345");
        assert_eq!(fill.executed_at, dec!(777));
        assert!(fill.is_maker);
    }

    #[test]
    fn fill_without_id_or_side_is_rejected() {
        assert!(Fill::from_account_message(&json!({"side": "buy"}), dec!(0)).is_err());
        assert!(Fill::from_account_message(&json!({"fillId": "F"}), dec!(0)).is_err());
    }

    #[test]
    fn decimal_field_accepts_strings_and_numbers() {
        let v = json!({"a": "1.25", "b": 2.5, "c": true});
        assert_eq!(parse_decimal_field(&v, "a"), Some(dec!(1.25)));
        assert_eq!(parse_decimal_field(&v, "b"), Some(dec!(2.5)));
        assert_eq!(parse_decimal_field(&v, "c"), None);
        assert_eq!(parse_decimal_field(&v, "missing"), None);
    }
}

//! Order management system.
//!
//! Owns the canonical in-memory order objects and their state machine,
//! position accounting, and the pre-trade risk gates. Everything else reads
//! orders through query methods or receives immutable copies over the order
//! event channel; only this module mutates them.

pub mod risk;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{new_uuid, Clock};
use crate::config::Config;

pub use risk::RiskManager;

/// Order states. `Filled`, `Cancelled`, `Rejected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Idle,
    Pending,
    Working,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Idle => "idle",
            OrderState::Pending => "pending",
            OrderState::Working => "working",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
            OrderState::Failed => "failed",
        }
    }

    /// States a given state may transition into.
    pub fn allowed_transitions(&self) -> &'static [OrderState] {
        match self {
            OrderState::Idle => &[OrderState::Pending, OrderState::Rejected, OrderState::Failed],
            OrderState::Pending => &[
                OrderState::Working,
                OrderState::Cancelled,
                OrderState::Rejected,
                OrderState::Failed,
            ],
            OrderState::Working => &[
                OrderState::Filled,
                OrderState::Cancelled,
                OrderState::Rejected,
                OrderState::Failed,
            ],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// A single execution recorded against an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub fill_id: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub ts: Decimal,
    pub trade_id: Option<String>,
    pub fee: Decimal,
}

/// OMS order with state tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmsOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub external_order_id: Option<String>,
    pub error: Option<String>,
    pub fills: Vec<OrderFill>,
    pub created_at: Decimal,
    pub updated_at: Decimal,
}

impl OmsOrder {
    pub fn new(
        order_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        now: Decimal,
    ) -> Self {
        Self {
            order_id,
            symbol,
            side,
            order_type,
            quantity,
            price,
            state: OrderState::Idle,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            external_order_id: None,
            error: None,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Signed position for one symbol: positive long, negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub last_updated: Decimal,
}

impl Position {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            last_updated: Decimal::ZERO,
        }
    }

    pub fn notional_value(&self) -> Decimal {
        self.quantity.abs() * self.avg_entry_price
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Apply a fill of `quantity` at `price` and return the PnL realised by
    /// this fill.
    ///
    /// Opening sets the entry price; adding blends it by absolute size;
    /// reducing realises `(price − avg) · closed · sign(position)` and keeps
    /// the entry price; flipping realises on the whole old position and
    /// restarts the entry at `price`.
    pub fn apply_fill(
        &mut self,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        now: Decimal,
    ) -> Decimal {
        let delta = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let prev = self.quantity;
        let mut realized = Decimal::ZERO;

        if prev.is_zero() {
            self.avg_entry_price = price;
        } else if prev.signum() == delta.signum() {
            let total = prev.abs() + delta.abs();
            self.avg_entry_price =
                (prev.abs() * self.avg_entry_price + delta.abs() * price) / total;
        } else {
            let closed = delta.abs().min(prev.abs());
            realized = (price - self.avg_entry_price) * closed * prev.signum();
            self.realized_pnl += realized;
            if delta.abs() > prev.abs() {
                self.avg_entry_price = price;
            }
        }

        self.quantity = prev + delta;
        self.last_updated = now;
        realized
    }
}

#[derive(Debug, Error)]
pub enum OmsError {
    #[error("order rejected: {0}")]
    RiskRejected(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("invalid state transition for {order_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
    },
    #[error("fill would exceed order quantity for {order_id}: {attempted} > {quantity}")]
    FillExceedsQuantity {
        order_id: String,
        attempted: Decimal,
        quantity: Decimal,
    },
}

/// Optional fields attached to a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub external_order_id: Option<String>,
    pub error_message: Option<String>,
}

/// Parameters for recording a fill against an order.
#[derive(Debug, Clone)]
pub struct FillParams {
    pub order_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fill_id: Option<String>,
    pub trade_id: Option<String>,
    pub fee: Decimal,
    /// Used only when the order is untracked, to still update the position.
    pub symbol: Option<String>,
    pub side: Option<OrderSide>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub total_positions: usize,
    pub open_orders: usize,
    pub total_notional: Decimal,
    pub total_realized_pnl: Decimal,
    pub daily_pnl: Decimal,
}

/// The order management system.
pub struct Oms {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    orders: Mutex<HashMap<String, OmsOrder>>,
    positions: Mutex<HashMap<String, Position>>,
    pub risk_manager: RiskManager,
    order_tx: broadcast::Sender<OmsOrder>,
    position_tx: broadcast::Sender<Position>,
}

impl Oms {
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        order_tx: broadcast::Sender<OmsOrder>,
        position_tx: broadcast::Sender<Position>,
    ) -> Self {
        let now = clock.now();
        info!("OMS initialized");
        Self {
            config,
            clock,
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            risk_manager: RiskManager::new(now),
            order_tx,
            position_tx,
        }
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<OmsOrder> {
        self.order_tx.subscribe()
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<Position> {
        self.position_tx.subscribe()
    }

    /// Create a new order, run the risk gates, and move it to `Pending`.
    ///
    /// On a gate violation the order is kept in `Rejected` state with the
    /// concatenated reasons and `OmsError::RiskRejected` is returned.
    pub fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OmsOrder, OmsError> {
        let now = self.clock.now();
        let order_id = new_uuid();
        let mut order = OmsOrder::new(
            order_id.clone(),
            symbol.to_string(),
            side,
            order_type,
            quantity,
            price,
            now,
        );

        let violations = {
            let positions = self.positions.lock();
            self.risk_manager
                .check_risk(&self.config, &order, positions.get(symbol), now)
        };

        if !violations.is_empty() {
            let reason = violations.join("; ");
            order.state = OrderState::Rejected;
            order.error = Some(reason.clone());
            self.orders.lock().insert(order_id.clone(), order.clone());

            warn!(order_id = %order_id, reason = %reason, "order rejected by risk management");
            let _ = self.order_tx.send(order);
            return Err(OmsError::RiskRejected(reason));
        }

        order.state = OrderState::Pending;
        order.updated_at = now;
        self.orders.lock().insert(order_id.clone(), order.clone());
        self.risk_manager.increment_open_orders();

        info!(
            order_id = %order_id,
            symbol,
            side = side.as_str(),
            %quantity,
            price = price.map(|p| p.to_string()),
            "order submitted through OMS"
        );
        let _ = self.order_tx.send(order.clone());
        Ok(order)
    }

    /// Validated state transition. Transitions into `Failed`/`Rejected` from
    /// a counted state release the open-order slot.
    pub fn update_order_state(
        &self,
        order_id: &str,
        new_state: OrderState,
        fields: TransitionFields,
    ) -> Result<OmsOrder, OmsError> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| OmsError::UnknownOrder(order_id.to_string()))?;

        if !order.state.allowed_transitions().contains(&new_state) {
            return Err(OmsError::InvalidTransition {
                order_id: order_id.to_string(),
                from: order.state,
                to: new_state,
            });
        }

        let counted = matches!(order.state, OrderState::Pending | OrderState::Working);
        self.apply_transition(order, new_state, fields);
        if counted && matches!(new_state, OrderState::Failed | OrderState::Rejected) {
            self.risk_manager.decrement_open_orders();
        }

        let snapshot = order.clone();
        drop(orders);
        let _ = self.order_tx.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Record a fill and return the PnL it realised. Idempotent on
    /// `fill_id`; rejects over-fills; completes the order and releases its
    /// slot when fully filled; updates the position (also for untracked
    /// orders when symbol and side are given).
    pub fn add_fill(&self, params: FillParams) -> Result<Decimal, OmsError> {
        let now = self.clock.now();
        let mut orders = self.orders.lock();

        let Some(order) = orders.get_mut(&params.order_id) else {
            drop(orders);
            // Fill for an order from a previous run or placed externally.
            if let (Some(symbol), Some(side)) = (params.symbol.clone(), params.side) {
                info!(
                    order_id = %params.order_id,
                    %symbol,
                    side = side.as_str(),
                    "fill for untracked order, updating position anyway"
                );
                let realized =
                    self.update_position(&symbol, side, params.quantity, params.price, params.fee);
                return Ok(realized);
            }
            warn!(order_id = %params.order_id, "fill for unknown order with no symbol/side");
            return Err(OmsError::UnknownOrder(params.order_id));
        };

        if let Some(fill_id) = params.fill_id.as_deref() {
            if order.fills.iter().any(|f| f.fill_id.as_deref() == Some(fill_id)) {
                debug!(order_id = %params.order_id, fill_id, "duplicate fill ignored");
                return Ok(Decimal::ZERO);
            }
        }

        let attempted = order.filled_quantity + params.quantity;
        if attempted > order.quantity {
            return Err(OmsError::FillExceedsQuantity {
                order_id: params.order_id,
                attempted,
                quantity: order.quantity,
            });
        }

        order.fills.push(OrderFill {
            fill_id: params.fill_id.clone(),
            quantity: params.quantity,
            price: params.price,
            ts: now,
            trade_id: params.trade_id.clone(),
            fee: params.fee,
        });

        let old_notional = order.filled_quantity * order.avg_fill_price;
        order.filled_quantity += params.quantity;
        if order.filled_quantity > Decimal::ZERO {
            order.avg_fill_price =
                (old_notional + params.quantity * params.price) / order.filled_quantity;
        }
        order.updated_at = now;

        let symbol = order.symbol.clone();
        let side = order.side;
        let fully_filled = order.filled_quantity >= order.quantity;
        if fully_filled {
            let counted = matches!(order.state, OrderState::Pending | OrderState::Working);
            self.apply_transition(order, OrderState::Filled, TransitionFields::default());
            if counted {
                self.risk_manager.decrement_open_orders();
            }
        }

        info!(
            order_id = %params.order_id,
            fill_quantity = %params.quantity,
            fill_price = %params.price,
            total_filled = %order.filled_quantity,
            trade_id = params.trade_id.as_deref(),
            "fill added to order"
        );

        let snapshot = order.clone();
        drop(orders);

        let realized = self.update_position(&symbol, side, params.quantity, params.price, params.fee);
        let _ = self.order_tx.send(snapshot);
        Ok(realized)
    }

    /// Cancel a non-terminal order.
    pub fn cancel_order(&self, order_id: &str, reason: &str) -> Result<OmsOrder, OmsError> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| OmsError::UnknownOrder(order_id.to_string()))?;

        if order.is_complete() {
            warn!(order_id, state = order.state.as_str(), "attempted to cancel completed order");
            return Err(OmsError::InvalidTransition {
                order_id: order_id.to_string(),
                from: order.state,
                to: OrderState::Cancelled,
            });
        }

        self.apply_transition(
            order,
            OrderState::Cancelled,
            TransitionFields {
                external_order_id: None,
                error_message: Some(reason.to_string()),
            },
        );
        self.risk_manager.decrement_open_orders();

        info!(order_id, reason, "order cancelled");
        let snapshot = order.clone();
        drop(orders);
        let _ = self.order_tx.send(snapshot.clone());
        Ok(snapshot)
    }

    fn apply_transition(&self, order: &mut OmsOrder, new_state: OrderState, fields: TransitionFields) {
        let old_state = order.state;
        order.state = new_state;
        order.updated_at = self.clock.now();
        if let Some(ext) = fields.external_order_id {
            order.external_order_id = Some(ext);
        }
        if let Some(err) = fields.error_message {
            order.error = Some(err);
        }
        debug!(
            order_id = %order.order_id,
            old_state = old_state.as_str(),
            new_state = new_state.as_str(),
            "order state transition"
        );
    }

    fn update_position(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Decimal {
        let now = self.clock.now();
        let mut positions = self.positions.lock();
        let position = positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::new(symbol.to_string()));

        let old_quantity = position.quantity;
        let realized = position.apply_fill(side, quantity, price, now);
        if !realized.is_zero() {
            self.risk_manager.update_pnl(realized - fee);
        }

        info!(
            symbol,
            old_quantity = %old_quantity,
            new_quantity = %position.quantity,
            avg_price = %position.avg_entry_price,
            side = side.as_str(),
            fill_price = %price,
            "position updated"
        );

        let snapshot = position.clone();
        drop(positions);
        let _ = self.position_tx.send(snapshot);
        realized
    }

    pub fn get_order(&self, order_id: &str) -> Option<OmsOrder> {
        self.orders.lock().get(order_id).cloned()
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().get(symbol).cloned()
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.positions.lock().values().cloned().collect()
    }

    pub fn get_all_orders(
        &self,
        symbol: Option<&str>,
        state: Option<OrderState>,
    ) -> Vec<OmsOrder> {
        self.orders
            .lock()
            .values()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .filter(|o| state.map_or(true, |st| o.state == st))
            .cloned()
            .collect()
    }

    /// Orders resting on the venue.
    pub fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OmsOrder> {
        self.get_all_orders(symbol, Some(OrderState::Working))
    }

    /// Orders occupying the open-order budget (not yet terminal).
    pub fn get_active_orders(&self, symbol: Option<&str>) -> Vec<OmsOrder> {
        self.orders
            .lock()
            .values()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .filter(|o| matches!(o.state, OrderState::Pending | OrderState::Working))
            .cloned()
            .collect()
    }

    pub fn open_order_count(&self) -> u32 {
        self.risk_manager.open_order_count()
    }

    pub fn get_actual_open_order_count(&self) -> u32 {
        self.orders
            .lock()
            .values()
            .filter(|o| o.state == OrderState::Working)
            .count() as u32
    }

    /// Repair the risk manager's counter from actual order states. Drift is
    /// logged, never fatal.
    pub fn sync_open_order_count(&self) -> u32 {
        let actual = self.get_actual_open_order_count();
        let old = self.risk_manager.open_order_count();
        self.risk_manager.set_open_order_count(actual);
        if old != actual {
            info!(old_count = old, actual_count = actual, "synchronized open order count");
        }
        actual
    }

    /// Refresh unrealized PnL for a symbol against the given mark price.
    pub fn mark_to_market(&self, symbol: &str, mark_price: Decimal) {
        let mut positions = self.positions.lock();
        if let Some(position) = positions.get_mut(symbol) {
            position.unrealized_pnl =
                (mark_price - position.avg_entry_price) * position.quantity;
        }
    }

    pub fn portfolio_summary(&self) -> PortfolioSummary {
        let positions = self.positions.lock();
        PortfolioSummary {
            total_positions: positions.len(),
            open_orders: self.get_open_orders(None).len(),
            total_notional: positions.values().map(|p| p.notional_value()).sum(),
            total_realized_pnl: positions.values().map(|p| p.realized_pnl).sum(),
            daily_pnl: self.risk_manager.daily_pnl(self.clock.now()),
        }
    }
}

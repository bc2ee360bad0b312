//! Pre-trade risk gates for the OMS.

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::oms::{OmsOrder, OrderSide, Position};

const DAILY_PNL_RESET_SECS: i64 = 86_400;

#[derive(Debug)]
struct PnlState {
    daily_pnl: Decimal,
    reset_at: Decimal,
}

/// Tracks daily PnL and the open-order budget, and evaluates every gate for
/// a candidate order. The open-order counter can drift if a transition is
/// missed; `Oms::sync_open_order_count` repairs it from order states.
#[derive(Debug)]
pub struct RiskManager {
    pnl: Mutex<PnlState>,
    open_orders: Mutex<u32>,
}

impl RiskManager {
    pub fn new(now: Decimal) -> Self {
        Self {
            pnl: Mutex::new(PnlState {
                daily_pnl: Decimal::ZERO,
                reset_at: now,
            }),
            open_orders: Mutex::new(0),
        }
    }

    /// Run every gate; returns the list of violations (empty = pass).
    pub fn check_risk(
        &self,
        config: &Config,
        order: &OmsOrder,
        position: Option<&Position>,
        now: Decimal,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        if config.risk.emergency_stop {
            violations.push("emergency stop is active".to_string());
        }

        if let Some(position) = position {
            let new_position_size = match order.side {
                OrderSide::Buy => position.quantity.abs() + order.quantity,
                OrderSide::Sell => (position.quantity - order.quantity).abs(),
            };
            if new_position_size > config.risk.max_position_size {
                violations.push(format!(
                    "position size would exceed limit: {} > {}",
                    new_position_size, config.risk.max_position_size
                ));
            }

            if position.quantity.abs() > config.risk.max_skew {
                violations.push(format!("position skew too large: {}", position.quantity));
            }
        }

        let daily_pnl = self.daily_pnl(now);
        if daily_pnl <= -config.risk.max_daily_loss {
            violations.push(format!("daily loss limit exceeded: {daily_pnl}"));
        }

        if order.quantity < config.trading.min_quote_size {
            violations.push(format!("order quantity below minimum: {}", order.quantity));
        }

        let open = *self.open_orders.lock();
        if open >= config.risk.max_open_orders {
            violations.push(format!(
                "too many open orders: {}/{}",
                open, config.risk.max_open_orders
            ));
        }

        violations
    }

    /// Daily PnL, resetting the window after 24h.
    pub fn daily_pnl(&self, now: Decimal) -> Decimal {
        let mut pnl = self.pnl.lock();
        if now - pnl.reset_at > Decimal::from(DAILY_PNL_RESET_SECS) {
            pnl.daily_pnl = Decimal::ZERO;
            pnl.reset_at = now;
        }
        pnl.daily_pnl
    }

    pub fn update_pnl(&self, change: Decimal) {
        self.pnl.lock().daily_pnl += change;
    }

    pub fn open_order_count(&self) -> u32 {
        *self.open_orders.lock()
    }

    pub fn increment_open_orders(&self) {
        *self.open_orders.lock() += 1;
    }

    pub fn decrement_open_orders(&self) {
        let mut open = self.open_orders.lock();
        *open = open.saturating_sub(1);
    }

    pub fn set_open_order_count(&self, count: u32) {
        *self.open_orders.lock() = count;
    }
}

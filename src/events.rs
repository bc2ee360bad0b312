//! Event fan-out.
//!
//! Observables publish into bounded broadcast channels instead of holding
//! callback lists; subscribers consume independently and lag is dropped
//! rather than blocking the producer.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::account::{Balance, BalanceUpdateReason, Fill};
use crate::oms::{OmsOrder, Position};

/// Default channel capacity; bursts beyond this drop the oldest events for
/// slow subscribers.
pub const CHANNEL_CAPACITY: usize = 1024;

/// A balance change together with why it happened.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceEvent {
    pub balance: Balance,
    pub reason: BalanceUpdateReason,
}

/// Fill event emitted after reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct FillEvent {
    pub fill: Fill,
    pub realized_pnl: Decimal,
}

/// The broadcast senders wired through the system by the coordinator.
#[derive(Clone)]
pub struct EventBus {
    pub orders: broadcast::Sender<OmsOrder>,
    pub positions: broadcast::Sender<Position>,
    pub fills: broadcast::Sender<FillEvent>,
    pub balances: broadcast::Sender<BalanceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (orders, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (positions, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (fills, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (balances, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            orders,
            positions,
            fills,
            balances,
        }
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<OmsOrder> {
        self.orders.subscribe()
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<Position> {
        self.positions.subscribe()
    }

    pub fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.fills.subscribe()
    }

    pub fn subscribe_balances(&self) -> broadcast::Receiver<BalanceEvent> {
        self.balances.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

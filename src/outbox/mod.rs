//! Transactional outbox.
//!
//! The outbox table is the single source of truth for asynchronous side
//! effects: producers insert events in the same transaction as the state
//! change, and the worker delivers them at least once with retries, circuit
//! breaking and a dead-letter queue.

pub mod circuit_breaker;
pub mod monitor;
pub mod worker;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use monitor::{OutboxAlertConfig, OutboxMonitor, OutboxStats};
pub use worker::{OutboxEventHandler, OutboxWorker, OutboxWorkerConfig};

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "completed" => Some(OutboxStatus::Completed),
            "failed" => Some(OutboxStatus::Failed),
            "dead_letter" => Some(OutboxStatus::DeadLetter),
            _ => None,
        }
    }

    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Completed,
        OutboxStatus::Failed,
        OutboxStatus::DeadLetter,
    ];
}

/// A row of the outbox table. `payload` is opaque to the store; each event
/// type has a declared shape known only to its handler.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: f64,
    pub processed_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedPayload {
    pub order_id: String,
    pub quote_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusUpdatedPayload {
    pub order_id: String,
    pub status: String,
    pub external_order_id: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledPayload {
    pub order_id: String,
    pub filled_quantity: String,
    pub avg_fill_price: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillCreatedPayload {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: String,
    pub quantity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillProcessedPayload {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: String,
    pub quantity: String,
    pub commission: String,
    pub realized_pnl: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotePersistedPayload {
    pub quote_id: String,
    pub symbol_dst: String,
    pub strategy: String,
    pub bid_price: Option<String>,
    pub ask_price: Option<String>,
    pub timestamp: f64,
}

/// Typed view over an event's payload, keyed by `event_type`.
#[derive(Debug, Clone)]
pub enum EventPayload {
    OrderCreated(OrderCreatedPayload),
    OrderStatusUpdated(OrderStatusUpdatedPayload),
    OrderFilled(OrderFilledPayload),
    FillCreated(FillCreatedPayload),
    FillProcessed(FillProcessedPayload),
    QuotePersisted(QuotePersistedPayload),
}

impl EventPayload {
    pub fn decode(event_type: &str, payload: &Value) -> Result<Self> {
        let decoded = match event_type {
            "order_created" => EventPayload::OrderCreated(serde_json::from_value(payload.clone())?),
            "order_status_updated" => {
                EventPayload::OrderStatusUpdated(serde_json::from_value(payload.clone())?)
            }
            "order_filled" => EventPayload::OrderFilled(serde_json::from_value(payload.clone())?),
            "fill_created" => EventPayload::FillCreated(serde_json::from_value(payload.clone())?),
            "fill_processed" => {
                EventPayload::FillProcessed(serde_json::from_value(payload.clone())?)
            }
            "quote_persisted" => {
                EventPayload::QuotePersisted(serde_json::from_value(payload.clone())?)
            }
            other => bail!("unknown event type {other}"),
        };
        Ok(decoded)
    }
}

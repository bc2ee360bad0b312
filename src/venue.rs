//! Destination venue client.
//!
//! The trading core only ever sees the [`VenueClient`] trait: order
//! submission/cancellation, open-order pagination, balances, and the account
//! event stream. Wire formats, signing and credential handling stay behind
//! implementations. `PaperVenue` backs paper mode and tests; `RestVenue` is
//! the HTTP client used for testnet/live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Mode;
use crate::oms::{OrderSide, OrderType};

#[derive(Debug, Error)]
pub enum VenueError {
    /// HTTP 429 and equivalents; callers back off harder.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Network errors and 5xx; safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),
    /// The venue refused the request outright.
    #[error("venue rejected request: {0}")]
    Rejected(String),
}

impl VenueError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, VenueError::RateLimited(_))
    }
}

/// An open order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// As reported by the venue; seconds or milliseconds depending on the
    /// venue. Normalised by the consumer.
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBalance {
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
}

/// Maximum page size the venues accept for open-order queries.
pub const OPEN_ORDERS_PAGE_LIMIT: u32 = 250;

#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<SubmitResult, VenueError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), VenueError>;

    /// One page of open orders; `page` is zero-based.
    async fn get_open_orders(
        &self,
        symbol: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<VenueOrder>, VenueError>;

    async fn get_balances(&self) -> Result<Vec<VenueBalance>, VenueError>;

    /// Live account events (fills, balance updates, order updates) as raw
    /// JSON messages.
    fn account_events(&self) -> broadcast::Receiver<Value>;
}

// ---------------------------------------------------------------------------
// Paper venue
// ---------------------------------------------------------------------------

/// In-memory venue for paper mode and tests. Orders rest until cancelled or
/// explicitly filled; fills are pushed onto the account event stream in the
/// same shape the live feed uses. Failure modes can be scripted.
pub struct PaperVenue {
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    open_orders: Mutex<HashMap<String, VenueOrder>>,
    balances: Mutex<HashMap<String, VenueBalance>>,
    cancelled: Mutex<Vec<String>>,
    account_tx: broadcast::Sender<Value>,
    fail_submits: AtomicBool,
    rate_limited_cancels: AtomicUsize,
}

impl PaperVenue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (account_tx, _) = broadcast::channel(1024);
        Self {
            clock,
            next_id: AtomicU64::new(1),
            open_orders: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            account_tx,
            fail_submits: AtomicBool::new(false),
            rate_limited_cancels: AtomicUsize::new(0),
        }
    }

    pub fn set_balance(&self, asset: &str, available: Decimal, locked: Decimal) {
        self.balances.lock().insert(
            asset.to_string(),
            VenueBalance {
                asset: asset.to_string(),
                available,
                locked,
            },
        );
    }

    /// Make subsequent submissions fail with a transient error.
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` cancels return a rate-limit error.
    pub fn rate_limit_next_cancels(&self, n: usize) {
        self.rate_limited_cancels.store(n, Ordering::SeqCst);
    }

    /// Plant an order on the venue that the bot does not know about.
    pub fn seed_order(
        &self,
        order_id: &str,
        symbol: &str,
        side: &str,
        price: Decimal,
        quantity: Decimal,
        created_at: i64,
    ) {
        self.open_orders.lock().insert(
            order_id.to_string(),
            VenueOrder {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
                side: side.to_string(),
                price: Some(price),
                quantity,
                created_at,
            },
        );
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.open_orders.lock().keys().cloned().collect()
    }

    pub fn cancelled_order_ids(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Push a raw account message to subscribers.
    pub fn emit_account_event(&self, message: Value) {
        let _ = self.account_tx.send(message);
    }

    /// Fill a resting order and emit the matching account `fill` event.
    pub fn fill_order(&self, external_order_id: &str, fill_id: &str) -> Option<Value> {
        let order = self.open_orders.lock().remove(external_order_id)?;
        let message = json!({
            "sub_type": "fill",
            "fillId": fill_id,
            "orderId": external_order_id,
            "symbol": order.symbol,
            "side": order.side,
            "price": order.price.map(|p| p.to_string()),
            "quantity": order.quantity.to_string(),
            "timestamp": self.clock.now().to_string(),
            "isMaker": true,
        });
        self.emit_account_event(message.clone());
        Some(message)
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        _order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<SubmitResult, VenueError> {
        if self.fail_submits.load(Ordering::SeqCst) {
            return Err(VenueError::Transient("scripted submit failure".to_string()));
        }

        let order_id = format!("PV-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.open_orders.lock().insert(
            order_id.clone(),
            VenueOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                price,
                quantity,
                created_at: self.clock.now_ms(),
            },
        );
        debug!(order_id = %order_id, symbol, "paper venue accepted order");
        Ok(SubmitResult { order_id })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), VenueError> {
        let remaining = self.rate_limited_cancels.load(Ordering::SeqCst);
        if remaining > 0 {
            self.rate_limited_cancels.store(remaining - 1, Ordering::SeqCst);
            return Err(VenueError::RateLimited("429 too many requests".to_string()));
        }

        if self.open_orders.lock().remove(order_id).is_none() {
            return Err(VenueError::Rejected(format!("unknown order {order_id}")));
        }
        self.cancelled.lock().push(order_id.to_string());
        debug!(order_id, "paper venue cancelled order");
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<VenueOrder>, VenueError> {
        let page_size = page_size.min(OPEN_ORDERS_PAGE_LIMIT) as usize;
        let mut orders: Vec<VenueOrder> = self
            .open_orders
            .lock()
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(orders
            .into_iter()
            .skip(page as usize * page_size)
            .take(page_size)
            .collect())
    }

    async fn get_balances(&self) -> Result<Vec<VenueBalance>, VenueError> {
        Ok(self.balances.lock().values().cloned().collect())
    }

    fn account_events(&self) -> broadcast::Receiver<Value> {
        self.account_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// REST venue
// ---------------------------------------------------------------------------

/// HTTP client for the destination venue. Transaction signing lives behind
/// the venue's order gateway; this client only needs the API key header.
pub struct RestVenue {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    account_tx: broadcast::Sender<Value>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResponse {
    orders: Vec<VenueOrder>,
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    balances: Vec<VenueBalance>,
}

impl RestVenue {
    pub fn new(mode: Mode, api_key: String) -> Self {
        let base_url = match mode {
            Mode::Live => "https://api.deltadefi.io".to_string(),
            _ => "https://api-staging.deltadefi.io".to_string(),
        };
        let (account_tx, _) = broadcast::channel(1024);
        info!(%base_url, "REST venue client initialized");
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            account_tx,
        }
    }

    /// Sender for the account stream; the transport task feeding it is
    /// wired up by the coordinator.
    pub fn account_sender(&self) -> broadcast::Sender<Value> {
        self.account_tx.clone()
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, VenueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            Err(VenueError::RateLimited(body))
        } else if status.is_server_error() {
            Err(VenueError::Transient(format!("{status}: {body}")))
        } else {
            Err(VenueError::Rejected(format!("{status}: {body}")))
        }
    }

    fn transport(e: reqwest::Error) -> VenueError {
        VenueError::Transient(e.to_string())
    }
}

#[async_trait]
impl VenueClient for RestVenue {
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<SubmitResult, VenueError> {
        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&json!({
                "symbol": symbol,
                "side": side.as_str(),
                "type": order_type.as_str(),
                "quantity": quantity.to_string(),
                "price": price.map(|p| p.to_string()),
            }))
            .send()
            .await
            .map_err(Self::transport)?;

        let parsed: SubmitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(SubmitResult {
            order_id: parsed.order_id,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), VenueError> {
        let response = self
            .http
            .delete(format!("{}/orders/{order_id}", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<VenueOrder>, VenueError> {
        let page_size = page_size.min(OPEN_ORDERS_PAGE_LIMIT);
        let response = self
            .http
            .get(format!("{}/orders/open", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .query(&[
                ("symbol", symbol.to_string()),
                ("page", page.to_string()),
                ("limit", page_size.to_string()),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        let parsed: OpenOrdersResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(parsed.orders)
    }

    async fn get_balances(&self) -> Result<Vec<VenueBalance>, VenueError> {
        let response = self
            .http
            .get(format!("{}/account/balances", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(Self::transport)?;

        let parsed: BalancesResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(parsed.balances)
    }

    fn account_events(&self) -> broadcast::Receiver<Value> {
        self.account_tx.subscribe()
    }
}

/// Fetch every page of open orders up to the venue's page cap.
pub async fn fetch_all_open_orders(
    venue: &dyn VenueClient,
    symbol: &str,
) -> Result<Vec<VenueOrder>, VenueError> {
    let mut all = Vec::new();
    let mut page = 0;
    loop {
        let batch = venue
            .get_open_orders(symbol, page, OPEN_ORDERS_PAGE_LIMIT)
            .await?;
        let batch_len = batch.len();
        all.extend(batch);
        if batch_len < OPEN_ORDERS_PAGE_LIMIT as usize {
            break;
        }
        page += 1;
        if page > 100 {
            warn!(symbol, "open order pagination runaway, stopping");
            break;
        }
    }
    Ok(all)
}

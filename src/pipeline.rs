//! Quote→order pipeline.
//!
//! Order replacement is the core contract: for each destination symbol the
//! previous ladder is cancelled before the new one is persisted, created in
//! the OMS under the open-order budget, and submitted to the venue. At most
//! one persistent quote per symbol is ever active; ticks for a symbol are
//! processed one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{new_uuid, Clock};
use crate::config::Config;
use crate::oms::{Oms, OmsError, OmsOrder, OrderSide, OrderState, OrderType, TransitionFields};
use crate::quote::{LayeredQuote, Quote};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::store::repos::{OrderRepository, QuoteRepository};
use crate::venue::VenueClient;

/// How often the expiry safety net sweeps.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Quote lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Generated,
    Persisted,
    OrdersCreated,
    OrdersSubmitted,
    Expired,
    Cancelled,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Generated => "generated",
            QuoteStatus::Persisted => "persisted",
            QuoteStatus::OrdersCreated => "orders_created",
            QuoteStatus::OrdersSubmitted => "orders_submitted",
            QuoteStatus::Expired => "expired",
            QuoteStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(QuoteStatus::Generated),
            "persisted" => Some(QuoteStatus::Persisted),
            "orders_created" => Some(QuoteStatus::OrdersCreated),
            "orders_submitted" => Some(QuoteStatus::OrdersSubmitted),
            "expired" => Some(QuoteStatus::Expired),
            "cancelled" => Some(QuoteStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses that hold venue-side orders worth cancelling.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            QuoteStatus::Persisted | QuoteStatus::OrdersCreated | QuoteStatus::OrdersSubmitted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStrategy {
    MarketMaking,
    Arbitrage,
    Momentum,
}

impl QuoteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStrategy::MarketMaking => "market_making",
            QuoteStrategy::Arbitrage => "arbitrage",
            QuoteStrategy::Momentum => "momentum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market_making" => Some(QuoteStrategy::MarketMaking),
            "arbitrage" => Some(QuoteStrategy::Arbitrage),
            "momentum" => Some(QuoteStrategy::Momentum),
            _ => None,
        }
    }
}

/// A quote with identity, lifecycle tracking and order references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentQuote {
    pub id: Option<i64>,
    pub quote_id: String,
    pub timestamp: Decimal,
    pub symbol_src: String,
    pub symbol_dst: String,
    pub source_bid_price: Decimal,
    pub source_bid_qty: Decimal,
    pub source_ask_price: Decimal,
    pub source_ask_qty: Decimal,
    pub bid_layers: Vec<LayeredQuote>,
    pub ask_layers: Vec<LayeredQuote>,
    pub spread_bps: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub total_spread_bps: u32,
    pub sides_enabled: Vec<String>,
    pub strategy: QuoteStrategy,
    pub status: QuoteStatus,
    pub created_at: Decimal,
    pub updated_at: Decimal,
    pub expires_at: Option<Decimal>,
    pub bid_order_ids: Vec<String>,
    pub ask_order_ids: Vec<String>,
}

impl PersistentQuote {
    pub fn from_quote(
        quote: &Quote,
        config: &Config,
        strategy: QuoteStrategy,
        now: Decimal,
    ) -> Self {
        let stale_secs = Decimal::from(config.trading.stale_ms) / Decimal::from(1000);
        Self {
            id: None,
            quote_id: new_uuid(),
            timestamp: quote.timestamp,
            symbol_src: quote.source.symbol.clone(),
            symbol_dst: quote.symbol.clone(),
            source_bid_price: quote.source.bid_price,
            source_bid_qty: quote.source.bid_qty,
            source_ask_price: quote.source.ask_price,
            source_ask_qty: quote.source.ask_qty,
            bid_layers: quote.bid_layers.clone(),
            ask_layers: quote.ask_layers.clone(),
            spread_bps: quote.spread_bps(),
            mid_price: quote.mid_price(),
            total_spread_bps: config.total_spread_bps(),
            sides_enabled: config.trading.side_enable.clone(),
            strategy,
            status: QuoteStatus::Generated,
            created_at: now,
            updated_at: now,
            expires_at: Some(now + stale_secs),
            bid_order_ids: Vec::new(),
            ask_order_ids: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: Decimal) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    pub fn has_bid(&self) -> bool {
        self.bid_layers
            .first()
            .map(|l| l.quantity > Decimal::ZERO)
            .unwrap_or(false)
    }

    pub fn has_ask(&self) -> bool {
        self.ask_layers
            .first()
            .map(|l| l.quantity > Decimal::ZERO)
            .unwrap_or(false)
    }

    pub fn order_ids(&self) -> Vec<String> {
        self.bid_order_ids
            .iter()
            .chain(self.ask_order_ids.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,
    #[error(
        "cannot create {requested} new orders: would exceed limit \
         ({current} + {requested} > {max})"
    )]
    BudgetExceeded {
        requested: u32,
        current: u32,
        max: u32,
    },
    #[error(transparent)]
    Oms(#[from] OmsError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub running: bool,
    pub quotes_processed: u64,
    pub quotes_expired: u64,
    pub orders_generated: u64,
    pub orders_submitted: u64,
    pub orders_failed: u64,
    pub active_quotes_count: usize,
    pub active_quotes_by_symbol: HashMap<String, usize>,
}

pub struct QuotePipeline {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    oms: Arc<Oms>,
    venue: Arc<dyn VenueClient>,
    rate_limiter: Arc<TokenBucketRateLimiter>,
    quotes: QuoteRepository,
    orders: OrderRepository,
    /// quote_id → quote; at most one entry per destination symbol.
    active_quotes: Mutex<HashMap<String, PersistentQuote>>,
    quote_tx: broadcast::Sender<PersistentQuote>,
    running: AtomicBool,
    quotes_processed: AtomicU64,
    quotes_expired: AtomicU64,
    orders_generated: AtomicU64,
    orders_submitted: AtomicU64,
    orders_failed: AtomicU64,
}

impl QuotePipeline {
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        oms: Arc<Oms>,
        venue: Arc<dyn VenueClient>,
        rate_limiter: Arc<TokenBucketRateLimiter>,
        quotes: QuoteRepository,
        orders: OrderRepository,
    ) -> Self {
        let (quote_tx, _) = broadcast::channel(256);
        info!("quote-to-order pipeline initialized");
        Self {
            config,
            clock,
            oms,
            venue,
            rate_limiter,
            quotes,
            orders,
            active_quotes: Mutex::new(HashMap::new()),
            quote_tx,
            running: AtomicBool::new(false),
            quotes_processed: AtomicU64::new(0),
            quotes_expired: AtomicU64::new(0),
            orders_generated: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            orders_failed: AtomicU64::new(0),
        }
    }

    pub fn subscribe_quotes(&self) -> broadcast::Receiver<PersistentQuote> {
        self.quote_tx.subscribe()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("quote-to-order pipeline started");
    }

    /// Stop and cancel every active quote and its orders.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let mut active = self.active_quotes.lock().await;
        let quotes: Vec<PersistentQuote> = active.values().cloned().collect();
        for quote in quotes {
            self.cancel_quote_orders(&quote).await;
            active.remove(&quote.quote_id);
        }
        info!("quote-to-order pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the ladder for this quote's symbol as one logical unit:
    /// cancel the previous ladder, check the open-order budget, persist,
    /// create OMS orders, submit to the venue.
    pub async fn process_quote(
        &self,
        quote: &Quote,
        strategy: QuoteStrategy,
    ) -> Result<PersistentQuote, PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }

        let now = self.clock.now();
        let mut persistent = PersistentQuote::from_quote(quote, &self.config, strategy, now);

        // Serialise per-symbol processing (and the ≤1-active invariant) by
        // holding the map for the whole replacement.
        let mut active = self.active_quotes.lock().await;

        // Step 1: cancel the previous ladder for this symbol.
        let cancelled_count = self
            .cancel_active_for_symbol_locked(&mut active, &persistent.symbol_dst)
            .await;

        // Step 2: budget check. The single hard admission gate; never queue.
        let orders_to_create = self
            .config
            .trading
            .side_enable
            .iter()
            .filter(|s| s.as_str() == "bid" || s.as_str() == "ask")
            .count() as u32;
        let current = self.oms.open_order_count();
        let max = self.config.risk.max_open_orders;
        if current + orders_to_create > max {
            return Err(PipelineError::BudgetExceeded {
                requested: orders_to_create,
                current,
                max,
            });
        }

        if cancelled_count > 0 {
            info!(
                symbol = %persistent.symbol_dst,
                cancelled_quotes = cancelled_count,
                new_quote_id = %persistent.quote_id,
                order_count_after_cancel = current,
                "order replacement: cancelled existing quotes"
            );
        }

        // Step 3: persist quote + outbox event in one transaction.
        persistent.status = QuoteStatus::Persisted;
        let result = self.generate_and_submit(&mut persistent).await;

        if let Err(e) = result {
            persistent.status = QuoteStatus::Cancelled;
            if let Err(db_err) = self
                .quotes
                .update_quote_status(&persistent.quote_id, QuoteStatus::Cancelled, None, self.clock.now())
                .await
            {
                warn!(quote_id = %persistent.quote_id, error = %db_err, "failed to mark quote cancelled");
            }
            error!(quote_id = %persistent.quote_id, error = %e, "quote processing failed");
            return Err(e);
        }

        // Track the new quote and check the safety invariant.
        active.insert(persistent.quote_id.clone(), persistent.clone());
        let active_for_symbol = active
            .values()
            .filter(|q| q.symbol_dst == persistent.symbol_dst)
            .count();
        if active_for_symbol > 1 {
            warn!(
                symbol = %persistent.symbol_dst,
                active_count = active_for_symbol,
                "multiple active quotes for symbol after replacement"
            );
        }
        drop(active);

        self.quotes_processed.fetch_add(1, Ordering::Relaxed);
        info!(
            quote_id = %persistent.quote_id,
            symbol = %persistent.symbol_dst,
            has_bid = persistent.has_bid(),
            has_ask = persistent.has_ask(),
            replaced_quotes = cancelled_count,
            "quote processed with order replacement"
        );

        let _ = self.quote_tx.send(persistent.clone());
        Ok(persistent)
    }

    /// Steps 3–5: persist, create OMS orders, submit to the venue.
    async fn generate_and_submit(
        &self,
        quote: &mut PersistentQuote,
    ) -> Result<(), PipelineError> {
        self.quotes.save_quote(quote, self.clock.now()).await?;

        // Step 4: one order per enabled side, at layer 1 of the ladder.
        let mut created: Vec<OmsOrder> = Vec::new();
        let mut requests: Vec<(OrderSide, Decimal, Decimal)> = Vec::new();
        if self.config.is_side_enabled("bid") && quote.has_bid() {
            let top = &quote.bid_layers[0];
            requests.push((OrderSide::Buy, top.price, top.quantity));
        }
        if self.config.is_side_enabled("ask") && quote.has_ask() {
            let top = &quote.ask_layers[0];
            requests.push((OrderSide::Sell, top.price, top.quantity));
        }

        for (side, price, quantity) in requests {
            match self.oms.submit_order(
                &quote.symbol_dst,
                side,
                OrderType::Limit,
                quantity,
                Some(price),
            ) {
                Ok(order) => {
                    if let Err(e) = self
                        .orders
                        .create_order(&order, Some(&quote.quote_id), self.clock.now())
                        .await
                    {
                        warn!(order_id = %order.order_id, error = %e, "failed to persist order row");
                    }
                    match side {
                        OrderSide::Buy => quote.bid_order_ids.push(order.order_id.clone()),
                        OrderSide::Sell => quote.ask_order_ids.push(order.order_id.clone()),
                    }
                    created.push(order);
                }
                Err(e) => {
                    // Risk rejection: unwind the siblings and surface it.
                    for order in &created {
                        if let Err(cancel_err) =
                            self.oms.cancel_order(&order.order_id, "quote processing failed")
                        {
                            debug!(order_id = %order.order_id, error = %cancel_err, "sibling cancel failed");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        if created.is_empty() {
            warn!(
                quote_id = %quote.quote_id,
                has_bid = quote.has_bid(),
                has_ask = quote.has_ask(),
                sides_enabled = ?quote.sides_enabled,
                "no orders generated from quote"
            );
            return Ok(());
        }

        quote.status = QuoteStatus::OrdersCreated;
        self.quotes
            .update_quote_status(
                &quote.quote_id,
                QuoteStatus::OrdersCreated,
                Some((quote.bid_order_ids.as_slice(), quote.ask_order_ids.as_slice())),
                self.clock.now(),
            )
            .await?;
        self.orders_generated
            .fetch_add(created.len() as u64, Ordering::Relaxed);
        info!(
            quote_id = %quote.quote_id,
            orders_count = created.len(),
            "orders generated from quote"
        );

        // Step 5: submit; partial submission is allowed.
        let mut submitted = 0usize;
        for order in &created {
            self.rate_limiter.await_tokens(1.0).await;

            match self
                .venue
                .submit_order(
                    &order.symbol,
                    order.side,
                    order.order_type,
                    order.quantity,
                    order.price,
                )
                .await
            {
                Ok(result) => {
                    self.oms.update_order_state(
                        &order.order_id,
                        OrderState::Working,
                        TransitionFields {
                            external_order_id: Some(result.order_id.clone()),
                            error_message: None,
                        },
                    )?;
                    if let Err(e) = self
                        .orders
                        .update_order_status(
                            &order.order_id,
                            "working",
                            Some(&result.order_id),
                            None,
                            self.clock.now(),
                        )
                        .await
                    {
                        warn!(order_id = %order.order_id, error = %e, "failed to persist order status");
                    }
                    submitted += 1;
                    self.orders_submitted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        order_id = %order.order_id,
                        quote_id = %quote.quote_id,
                        external_order_id = %result.order_id,
                        "order submitted to venue"
                    );
                }
                Err(e) => {
                    self.orders_failed.fetch_add(1, Ordering::Relaxed);
                    if let Err(state_err) = self.oms.update_order_state(
                        &order.order_id,
                        OrderState::Failed,
                        TransitionFields {
                            external_order_id: None,
                            error_message: Some(e.to_string()),
                        },
                    ) {
                        warn!(order_id = %order.order_id, error = %state_err, "failed order state update");
                    }
                    if let Err(db_err) = self
                        .orders
                        .update_order_status(
                            &order.order_id,
                            "failed",
                            None,
                            Some(&e.to_string()),
                            self.clock.now(),
                        )
                        .await
                    {
                        warn!(order_id = %order.order_id, error = %db_err, "failed to persist order failure");
                    }
                    error!(order_id = %order.order_id, quote_id = %quote.quote_id, error = %e, "failed to submit order");
                }
            }
        }

        if submitted > 0 {
            quote.status = QuoteStatus::OrdersSubmitted;
            self.quotes
                .update_quote_status(
                    &quote.quote_id,
                    QuoteStatus::OrdersSubmitted,
                    None,
                    self.clock.now(),
                )
                .await?;
            info!(
                quote_id = %quote.quote_id,
                submitted,
                total = created.len(),
                "orders submitted for quote"
            );
        }

        Ok(())
    }

    /// Cancel every active quote for a symbol; returns how many went.
    pub async fn cancel_active_quotes_for_symbol(&self, symbol_dst: &str) -> usize {
        let mut active = self.active_quotes.lock().await;
        self.cancel_active_for_symbol_locked(&mut active, symbol_dst)
            .await
    }

    async fn cancel_active_for_symbol_locked(
        &self,
        active: &mut HashMap<String, PersistentQuote>,
        symbol_dst: &str,
    ) -> usize {
        let to_cancel: Vec<PersistentQuote> = active
            .values()
            .filter(|q| q.symbol_dst == symbol_dst && q.status.is_active())
            .cloned()
            .collect();

        for quote in &to_cancel {
            self.cancel_quote_orders(quote).await;
            active.remove(&quote.quote_id);
        }
        to_cancel.len()
    }

    /// Cancel one quote's orders, best effort, verifying the open-order
    /// counter moved by as much as expected.
    async fn cancel_quote_orders(&self, quote: &PersistentQuote) {
        let initial_count = self.oms.open_order_count();
        let mut cancelled: Vec<String> = Vec::new();

        for order_id in quote.order_ids() {
            let Some(order) = self.oms.get_order(&order_id) else {
                continue;
            };
            if order.is_complete() {
                continue;
            }

            // Pull the resting order off the venue first.
            if order.state == OrderState::Working {
                if let Some(external_id) = &order.external_order_id {
                    self.rate_limiter.await_tokens(1.0).await;
                    if let Err(e) = self.venue.cancel_order(external_id, &order.symbol).await {
                        warn!(
                            order_id = %order_id,
                            external_order_id = %external_id,
                            error = %e,
                            "venue cancel failed, reaper will reconcile"
                        );
                    }
                }
            }

            match self.oms.cancel_order(&order_id, "quote cancelled") {
                Ok(_) => {
                    cancelled.push(order_id.clone());
                    if let Err(e) = self
                        .orders
                        .update_order_status(&order_id, "cancelled", None, None, self.clock.now())
                        .await
                    {
                        warn!(order_id = %order_id, error = %e, "failed to persist cancel");
                    }
                }
                Err(e) => debug!(order_id = %order_id, error = %e, "order cancel skipped"),
            }
        }

        let final_count = self.oms.open_order_count();
        let expected = cancelled.len() as i64;
        let actual = initial_count as i64 - final_count as i64;
        if actual != expected {
            warn!(
                quote_id = %quote.quote_id,
                expected_decrease = expected,
                actual_decrease = actual,
                "order count mismatch after cancellation"
            );
        }

        if let Err(e) = self
            .quotes
            .update_quote_status(&quote.quote_id, QuoteStatus::Cancelled, None, self.clock.now())
            .await
        {
            warn!(quote_id = %quote.quote_id, error = %e, "failed to persist quote cancel");
        }

        info!(
            quote_id = %quote.quote_id,
            cancelled_orders = ?cancelled,
            "quote cancelled"
        );
    }

    /// Expiry safety net: mark overdue rows and cancel any active quote past
    /// its TTL. Ordinary replacement remains the primary mechanism.
    pub async fn cleanup_expired_quotes(&self) -> usize {
        let now = self.clock.now();
        let db_expired = match self.quotes.expire_old_quotes(now, None).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "failed to expire quotes in store");
                0
            }
        };

        let mut expired = 0usize;
        let mut active = self.active_quotes.lock().await;
        let overdue: Vec<PersistentQuote> = active
            .values()
            .filter(|q| q.is_expired(now))
            .cloned()
            .collect();
        for quote in overdue {
            self.cancel_quote_orders(&quote).await;
            active.remove(&quote.quote_id);
            expired += 1;
        }
        drop(active);

        if expired > 0 || db_expired > 0 {
            self.quotes_expired.fetch_add(expired as u64, Ordering::Relaxed);
            info!(active_expired = expired, db_expired, "cleaned up expired quotes");
        }
        expired + db_expired
    }

    /// Background expiry loop.
    pub async fn run_expiry_sweeps(self: Arc<Self>) {
        while self.is_running() {
            tokio::time::sleep(EXPIRY_SWEEP_INTERVAL).await;
            if !self.is_running() {
                break;
            }
            self.cleanup_expired_quotes().await;
        }
    }

    /// Consume OMS order events; once every order of a quote is terminal the
    /// quote leaves active tracking.
    pub async fn run_order_listener(
        self: Arc<Self>,
        mut orders: broadcast::Receiver<OmsOrder>,
    ) {
        loop {
            match orders.recv().await {
                Ok(order) => self.on_order_update(&order).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "pipeline order listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_order_update(&self, order: &OmsOrder) {
        if !order.is_complete() {
            return;
        }

        let mut active = self.active_quotes.lock().await;
        let Some(quote) = active
            .values()
            .find(|q| q.order_ids().iter().any(|id| id == &order.order_id))
            .cloned()
        else {
            return;
        };

        let all_complete = quote.order_ids().iter().all(|id| {
            self.oms
                .get_order(id)
                .map(|o| o.is_complete())
                .unwrap_or(true)
        });
        if all_complete {
            active.remove(&quote.quote_id);
            debug!(
                quote_id = %quote.quote_id,
                order_id = %order.order_id,
                "quote completed, removed from active tracking"
            );
        }
    }

    /// Snapshot for readers outside the pipeline task.
    pub async fn active_quotes_snapshot(&self) -> Vec<PersistentQuote> {
        self.active_quotes.lock().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> PipelineStats {
        let active = self.active_quotes.lock().await;
        let mut by_symbol: HashMap<String, usize> = HashMap::new();
        for quote in active.values() {
            *by_symbol.entry(quote.symbol_dst.clone()).or_default() += 1;
        }
        PipelineStats {
            running: self.is_running(),
            quotes_processed: self.quotes_processed.load(Ordering::Relaxed),
            quotes_expired: self.quotes_expired.load(Ordering::Relaxed),
            orders_generated: self.orders_generated.load(Ordering::Relaxed),
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            orders_failed: self.orders_failed.load(Ordering::Relaxed),
            active_quotes_count: active.len(),
            active_quotes_by_symbol: by_symbol,
        }
    }
}

//! Unregistered-order reaper.
//!
//! Reconciles on-venue open orders against the local order book: anything
//! resting on the venue that the bot does not know about (and is older than
//! the registration grace window) gets cancelled. Covers orphans from
//! restarts, network failures, and orders placed outside the bot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::oms::Oms;
use crate::rate_limiter::SlidingWindowRateLimiter;
use crate::venue::{fetch_all_open_orders, VenueClient, VenueOrder};

/// Self-imposed pacing between cancels.
pub const CANCEL_SPACING: Duration = Duration::from_millis(500);
/// Extra pause after each batch of cancels.
pub const BATCH_PAUSE: Duration = Duration::from_secs(3);
pub const CANCEL_BATCH_SIZE: usize = 5;
/// Pause after a single rate-limit error.
pub const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(2);
/// Pause once rate-limit errors pile up.
pub const RATE_LIMIT_LONG_PAUSE: Duration = Duration::from_secs(30);
pub const RATE_LIMIT_STREAK_LIMIT: usize = 5;
/// Open-order queries admitted per minute.
pub const QUERY_WINDOW_LIMIT: usize = 10;
pub const QUERY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub cleanup_runs: u64,
    pub orders_found: u64,
    pub orders_cancelled: u64,
    pub cleanup_errors: u64,
    pub last_cleanup_time: Option<f64>,
}

pub struct OrderReaper {
    config: Arc<Config>,
    venue: Arc<dyn VenueClient>,
    oms: Arc<Oms>,
    clock: Arc<dyn Clock>,
    /// Advisory cap on how often we hit the open-orders endpoint.
    query_limiter: SlidingWindowRateLimiter,
    running: AtomicBool,
    cleanup_runs: AtomicU64,
    orders_found: AtomicU64,
    orders_cancelled: AtomicU64,
    cleanup_errors: AtomicU64,
    last_cleanup_time: Mutex<Option<Decimal>>,
}

impl OrderReaper {
    pub fn new(
        config: Arc<Config>,
        venue: Arc<dyn VenueClient>,
        oms: Arc<Oms>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            venue,
            oms,
            clock,
            query_limiter: SlidingWindowRateLimiter::new(QUERY_WINDOW_LIMIT, QUERY_WINDOW),
            running: AtomicBool::new(false),
            cleanup_runs: AtomicU64::new(0),
            orders_found: AtomicU64::new(0),
            orders_cancelled: AtomicU64::new(0),
            cleanup_errors: AtomicU64::new(0),
            last_cleanup_time: Mutex::new(None),
        }
    }

    /// Synchronous sweep before trading starts; the trading loop waits for
    /// this to finish.
    pub async fn run_initial_reap(&self) -> Result<()> {
        if !self.config.system.cleanup_unregistered_orders {
            info!("initial reap disabled in settings, skipping");
            return Ok(());
        }
        info!("running initial reap of unregistered orders");
        self.perform_cleanup().await?;
        info!("initial reap completed");
        Ok(())
    }

    /// Periodic loop; one sweep per `cleanup_check_interval_ms`.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("order reaper already running");
            return;
        }
        info!(
            enabled = self.config.system.cleanup_unregistered_orders,
            interval_ms = self.config.system.cleanup_check_interval_ms,
            "order reaper started"
        );

        let interval = Duration::from_millis(self.config.system.cleanup_check_interval_ms.max(1));
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !self.config.system.cleanup_unregistered_orders {
                continue;
            }
            match self.perform_cleanup().await {
                Ok(()) => {
                    self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
                    *self.last_cleanup_time.lock() = Some(self.clock.now());
                }
                Err(e) => {
                    self.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "error during unregistered order cleanup");
                }
            }
        }
        info!("order reaper stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One full sweep: fetch venue orders, diff against the local active
    /// set, cancel the strangers.
    pub async fn perform_cleanup(&self) -> Result<()> {
        debug!("starting unregistered order cleanup cycle");
        let symbol = self.config.trading.symbol_dst.as_str();

        self.query_limiter.await_slot().await;
        let exchange_orders = fetch_all_open_orders(self.venue.as_ref(), symbol)
            .await
            .map_err(|e| anyhow::anyhow!("failed to fetch open orders: {e}"))?;
        if exchange_orders.is_empty() {
            debug!("no open orders found on venue");
            return Ok(());
        }
        self.orders_found
            .fetch_add(exchange_orders.len() as u64, Ordering::Relaxed);

        let registered = self.registered_external_ids();
        let unregistered = self.find_unregistered(&exchange_orders, &registered);
        if unregistered.is_empty() {
            debug!(
                exchange_orders = exchange_orders.len(),
                registered = registered.len(),
                "all venue orders are registered"
            );
            return Ok(());
        }

        info!(
            unregistered_count = unregistered.len(),
            exchange_total = exchange_orders.len(),
            registered_total = registered.len(),
            "found unregistered orders on venue"
        );

        self.cancel_unregistered(&unregistered).await;
        Ok(())
    }

    /// External ids of local orders still occupying the budget.
    fn registered_external_ids(&self) -> HashSet<String> {
        self.oms
            .get_active_orders(Some(self.config.trading.symbol_dst.as_str()))
            .into_iter()
            .filter_map(|o| o.external_order_id)
            .collect()
    }

    /// On-venue orders that are not ours and past the registration grace
    /// window. The grace window keeps us from reaping an order whose
    /// submission is still in flight.
    fn find_unregistered(
        &self,
        exchange_orders: &[VenueOrder],
        registered: &HashSet<String>,
    ) -> Vec<VenueOrder> {
        let now_ms = self.clock.now_ms();
        let timeout_ms = self.config.system.order_registration_timeout_ms as i64;

        exchange_orders
            .iter()
            .filter(|order| {
                if order.order_id.is_empty() || registered.contains(&order.order_id) {
                    return false;
                }
                let age_ms = now_ms - normalize_created_at_ms(order.created_at);
                if age_ms < timeout_ms {
                    debug!(
                        order_id = %order.order_id,
                        age_ms,
                        timeout_ms,
                        "skipping recent order that may still be registering"
                    );
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Cancel a batch of strangers with the self-imposed cadence: one cancel
    /// per 0.5 s, a longer pause every five, and escalating pauses when the
    /// venue pushes back with rate limits.
    async fn cancel_unregistered(&self, unregistered: &[VenueOrder]) {
        let mut cancelled = 0usize;
        let mut rate_limit_streak = 0usize;

        for (index, order) in unregistered.iter().enumerate() {
            match self
                .venue
                .cancel_order(&order.order_id, &order.symbol)
                .await
            {
                Ok(()) => {
                    cancelled += 1;
                    rate_limit_streak = 0;
                    self.orders_cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(
                        order_id = %order.order_id,
                        symbol = %order.symbol,
                        side = %order.side,
                        "cancelled unregistered order"
                    );
                    tokio::time::sleep(CANCEL_SPACING).await;
                }
                Err(e) if e.is_rate_limit() => {
                    rate_limit_streak += 1;
                    warn!(
                        order_id = %order.order_id,
                        rate_limit_streak,
                        remaining = unregistered.len() - index,
                        "rate limited while cancelling, will retry later"
                    );
                    if rate_limit_streak > RATE_LIMIT_STREAK_LIMIT {
                        info!(
                            cancelled_so_far = cancelled,
                            "multiple rate limits hit, pausing cleanup"
                        );
                        tokio::time::sleep(RATE_LIMIT_LONG_PAUSE).await;
                        rate_limit_streak = 0;
                    } else {
                        tokio::time::sleep(RATE_LIMIT_PAUSE).await;
                    }
                }
                Err(e) => {
                    error!(
                        order_id = %order.order_id,
                        error = %e,
                        "failed to cancel unregistered order"
                    );
                }
            }

            if (index + 1) % CANCEL_BATCH_SIZE == 0 {
                debug!(
                    batch = (index + 1) / CANCEL_BATCH_SIZE,
                    total_cancelled = cancelled,
                    "pausing between cancel batches"
                );
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        if cancelled > 0 {
            info!(
                cancelled_orders = cancelled,
                total_unregistered = unregistered.len(),
                "cleanup cycle completed"
            );
        }
    }

    pub fn stats(&self) -> ReaperStats {
        use rust_decimal::prelude::ToPrimitive;
        ReaperStats {
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            orders_found: self.orders_found.load(Ordering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
            last_cleanup_time: self.last_cleanup_time.lock().and_then(|d| d.to_f64()),
        }
    }
}

/// Venue timestamps arrive in seconds on some paths and milliseconds on
/// others; everything below 10^12 is treated as seconds.
pub fn normalize_created_at_ms(created_at: i64) -> i64 {
    if created_at != 0 && created_at.abs() < 1_000_000_000_000 {
        created_at * 1000
    } else {
        created_at
    }
}

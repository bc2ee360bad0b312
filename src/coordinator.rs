//! Coordinator.
//!
//! Builds every component once, threads them through constructors, wires the
//! feed → engine → pipeline path, supervises the background tasks, and runs
//! the orderly shutdown sequence. Nothing here is global; teardown happens
//! in reverse dependency order.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::account::{AccountReconciler, BalanceTracker, FillReconciler};
use crate::api;
use crate::clock::{new_uuid, Clock, SystemClock, UniformJitter};
use crate::config::{Config, Mode};
use crate::events::EventBus;
use crate::feed::{BinanceFeed, MarketFeed};
use crate::oms::Oms;
use crate::outbox::{OutboxAlertConfig, OutboxMonitor, OutboxWorker, OutboxWorkerConfig};
use crate::pipeline::{PipelineError, QuotePipeline, QuoteStrategy};
use crate::quote::{BookTicker, QuoteEngine};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::ratio::RatioManager;
use crate::reaper::OrderReaper;
use crate::store::repos::Repositories;
use crate::store::Store;
use crate::venue::{PaperVenue, RestVenue, VenueClient};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);
const ACCOUNT_STREAM_MAX_RETRIES: u32 = 5;

/// Everything the trading loop needs, built once.
pub struct Coordinator {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    store: Store,
    repos: Repositories,
    bus: EventBus,
    oms: Arc<Oms>,
    venue: Arc<dyn VenueClient>,
    rate_limiter: Arc<TokenBucketRateLimiter>,
    balance_tracker: Arc<BalanceTracker>,
    fill_reconciler: Arc<FillReconciler>,
    account_reconciler: Arc<AccountReconciler>,
    outbox_worker: Arc<OutboxWorker>,
    outbox_monitor: OutboxMonitor,
    reaper: Arc<OrderReaper>,
    pipeline: Arc<QuotePipeline>,
    ratio: Arc<RatioManager>,
    session_id: String,
    /// Latest reference mid, used to value the base asset for the ratio
    /// manager.
    latest_mid: Arc<RwLock<Option<Decimal>>>,
}

impl Coordinator {
    /// Validate config and construct the component graph. Fatal on
    /// misconfiguration or store/migration failure.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("configuration invalid")?;
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = Store::open(Path::new(&config.system.db_path))?;
        let repos = Repositories::new(store.clone());

        let session_id = new_uuid();
        repos
            .sessions
            .create_session(
                &session_id,
                &serde_json::to_value(config.as_ref())?,
                clock.now(),
            )
            .await?;

        let bus = EventBus::new();
        let oms = Arc::new(Oms::new(
            config.clone(),
            clock.clone(),
            bus.orders.clone(),
            bus.positions.clone(),
        ));

        let venue: Arc<dyn VenueClient> = match config.system.mode {
            Mode::Paper => {
                info!("paper mode: using in-memory venue");
                Arc::new(PaperVenue::new(clock.clone()))
            }
            mode => Arc::new(RestVenue::new(mode, config.exchange.api_key.clone())),
        };

        let rate_limiter = Arc::new(TokenBucketRateLimiter::new(
            config.system.max_orders_per_second,
            config.system.max_orders_per_second,
        ));

        let balance_tracker = Arc::new(BalanceTracker::new(
            repos.balances.clone(),
            clock.clone(),
            bus.balances.clone(),
        ));
        balance_tracker.load_initial().await?;

        let (base_asset, quote_asset) = config.symbol_assets();
        let fill_reconciler = Arc::new(FillReconciler::new(
            repos.fills.clone(),
            repos.positions.clone(),
            repos.outbox.clone(),
            balance_tracker.clone(),
            oms.clone(),
            clock.clone(),
            config.trading.symbol_dst.clone(),
            base_asset,
            quote_asset,
            bus.fills.clone(),
        ));
        fill_reconciler.load_processed().await?;

        let account_reconciler = Arc::new(AccountReconciler::new(
            venue.clone(),
            balance_tracker.clone(),
            fill_reconciler.clone(),
            oms.clone(),
            clock.clone(),
            ACCOUNT_STREAM_MAX_RETRIES,
        ));

        let outbox_worker = Arc::new(OutboxWorker::new(
            repos.outbox.clone(),
            clock.clone(),
            Arc::new(UniformJitter::default()),
            OutboxWorkerConfig::default(),
        ));
        let outbox_monitor = OutboxMonitor::new(repos.outbox.clone(), OutboxAlertConfig::default());

        let reaper = Arc::new(OrderReaper::new(
            config.clone(),
            venue.clone(),
            oms.clone(),
            clock.clone(),
        ));

        let pipeline = Arc::new(QuotePipeline::new(
            config.clone(),
            clock.clone(),
            oms.clone(),
            venue.clone(),
            rate_limiter.clone(),
            repos.quotes.clone(),
            repos.orders.clone(),
        ));

        let ratio = Arc::new(RatioManager::new(config.clone()));

        Ok(Self {
            config,
            clock,
            store,
            repos,
            bus,
            oms,
            venue,
            rate_limiter,
            balance_tracker,
            fill_reconciler,
            account_reconciler,
            outbox_worker,
            outbox_monitor,
            reaper,
            pipeline,
            ratio,
            session_id,
            latest_mid: Arc::new(RwLock::new(None)),
        })
    }

    pub fn venue(&self) -> Arc<dyn VenueClient> {
        self.venue.clone()
    }

    /// Run the bot until `shutdown` resolves or a fatal condition fires.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(session_id = %self.session_id, mode = ?self.config.system.mode, "starting trading session");

        // Health endpoint first so probes pass while we warm up.
        let health_task = {
            let store = self.store.clone();
            let port = self.config.system.health_port;
            tokio::spawn(async move {
                if let Err(e) = api::serve(store, port).await {
                    error!(error = %e, "health server failed");
                }
            })
        };

        let outbox_task = tokio::spawn(self.outbox_worker.clone().run());
        let reconciler_task = tokio::spawn(self.account_reconciler.clone().run());

        if let Err(e) = self.account_reconciler.refresh_balances().await {
            warn!(error = %e, "initial balance refresh failed");
        }

        // Initial reap completes before the market feed starts.
        self.reaper.run_initial_reap().await?;
        let reaper_task = tokio::spawn(self.reaper.clone().run());

        self.pipeline.start();
        let expiry_task = tokio::spawn(self.pipeline.clone().run_expiry_sweeps());
        let listener_task = tokio::spawn(
            self.pipeline
                .clone()
                .run_order_listener(self.bus.subscribe_orders()),
        );

        let mut engine = QuoteEngine::new(self.config.clone(), self.clock.clone());
        let mut feed = BinanceFeed::spawn(&self.config.trading.symbol_src, self.clock.clone());

        info!("all systems active, entering trading loop");
        let outcome = self.trading_loop(&mut engine, &mut feed, shutdown).await;

        // Orderly shutdown: feed, pipeline, outbox, reaper, reconciler,
        // session row, store.
        feed.stop();
        self.pipeline.stop().await;
        self.outbox_worker.stop();
        self.reaper.stop();
        self.account_reconciler.stop();

        for (name, task) in [
            ("outbox", outbox_task),
            ("reaper", reaper_task),
            ("expiry", expiry_task),
        ] {
            join_with_timeout(name, task).await;
        }
        listener_task.abort();
        reconciler_task.abort();
        health_task.abort();

        let (status, error_message) = match &outcome {
            Ok(()) => ("stopped", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .repos
            .sessions
            .end_session(&self.session_id, status, error_message.as_deref(), self.clock.now())
            .await
        {
            warn!(error = %e, "failed to end trading session");
        }

        self.store.close();
        info!(session_id = %self.session_id, status, "trading session ended");
        outcome
    }

    async fn trading_loop(
        &self,
        engine: &mut QuoteEngine,
        feed: &mut BinanceFeed,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        let mut status_interval = tokio::time::interval(STATUS_LOG_INTERVAL);
        status_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        status_interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                ticker = feed.next() => {
                    let Some(ticker) = ticker else {
                        warn!("market feed ended");
                        return Ok(());
                    };
                    self.on_ticker(engine, ticker).await;
                }
                _ = status_interval.tick() => {
                    self.log_status().await;
                    if self.outbox_monitor.dead_letter_saturated().await.unwrap_or(false) {
                        error!("dead letter queue saturated beyond alert threshold");
                        anyhow::bail!("dead letter queue saturated");
                    }
                }
            }
        }
    }

    /// One tick through the whole path: value balances, derive ratio
    /// adjustments, generate the ladder, replace orders.
    async fn on_ticker(&self, engine: &mut QuoteEngine, ticker: BookTicker) {
        let mid = ticker.mid_price();
        *self.latest_mid.write() = Some(mid);
        self.oms.mark_to_market(&self.config.trading.symbol_dst, mid);
        self.update_ratio_balances(mid).await;

        let adjustment = self.ratio.adjustment();
        let allocation = self.ratio.capital_allocation();

        let Some(quote) = engine.generate_quote(&ticker, &adjustment, &allocation) else {
            return;
        };

        match self
            .pipeline
            .process_quote(&quote, QuoteStrategy::MarketMaking)
            .await
        {
            Ok(_) => {}
            Err(PipelineError::BudgetExceeded { .. }) | Err(PipelineError::Oms(_)) => {
                // Tick dropped; the loop continues.
            }
            Err(e) => {
                error!(error = %e, "quote processing failed");
            }
        }
    }

    /// Push current balances into the ratio manager: the quote asset is
    /// valued at par, the base asset at the latest reference mid.
    async fn update_ratio_balances(&self, mid: Decimal) {
        let (base_asset, quote_asset) = self.config.symbol_assets();
        let now = self.clock.now();

        if let Some(balance) = self.balance_tracker.get_balance(&base_asset).await {
            self.ratio
                .update_balance(&base_asset, balance.total, mid, now);
        }
        if let Some(balance) = self.balance_tracker.get_balance(&quote_asset).await {
            self.ratio
                .update_balance(&quote_asset, balance.total, Decimal::ONE, now);
        }
    }

    async fn log_status(&self) {
        let portfolio = self.oms.portfolio_summary();
        let pipeline = self.pipeline.stats().await;
        let limiter = self.rate_limiter.status().await;
        let latest_mid = self.latest_mid.read().map(|mid| mid.to_string());

        info!(
            latest_mid = latest_mid.as_deref(),
            open_orders = portfolio.open_orders,
            positions = portfolio.total_positions,
            realized_pnl = %portfolio.total_realized_pnl,
            daily_pnl = %portfolio.daily_pnl,
            quotes_processed = pipeline.quotes_processed,
            orders_submitted = pipeline.orders_submitted,
            orders_failed = pipeline.orders_failed,
            active_quotes = pipeline.active_quotes_count,
            fills_processed = self.fill_reconciler.processed_count().await,
            rate_limit_utilization = limiter.utilization,
            "trading bot status"
        );

        match self.outbox_monitor.stats(self.clock.now()).await {
            Ok(stats) => {
                info!(
                    outbox_total = stats.total_events,
                    outbox_health = stats.health_score,
                    pending = stats.status_counts.get("pending").copied().unwrap_or(0),
                    dead_letter = stats.status_counts.get("dead_letter").copied().unwrap_or(0),
                    "outbox status"
                );
                let _ = self.outbox_monitor.check_alerts(self.clock.now()).await;
            }
            Err(e) => warn!(error = %e, "failed to read outbox stats"),
        }

        // Repair counter drift while we are at it; never fatal.
        self.oms.sync_open_order_count();
    }
}

async fn join_with_timeout(name: &str, task: JoinHandle<()>) {
    let abort_handle = task.abort_handle();
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "background task panicked"),
        Err(_) => {
            warn!(task = name, "background task did not stop in time, aborting");
            abort_handle.abort();
        }
    }
}

//! Outbox worker.
//!
//! Polls the outbox table, dispatches events to handlers selected by event
//! type prefix through per-prefix circuit breakers, and schedules retries
//! with exponential backoff and jitter. Events that exhaust their retries
//! land in the dead-letter queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, JitterSource};
use crate::outbox::{CircuitBreaker, CircuitBreakerConfig, CircuitState, EventPayload, OutboxEvent};
use crate::store::repos::OutboxRepository;

/// Handles one family of event types.
#[async_trait]
pub trait OutboxEventHandler: Send + Sync {
    async fn handle(&self, event: &OutboxEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    pub batch_size: u32,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// First retry delay, seconds.
    pub base_delay_secs: f64,
    pub backoff_multiplier: f64,
    pub max_delay_secs: f64,
    pub jitter_enabled: bool,
    pub breaker: CircuitBreakerConfig,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 5,
            poll_interval: Duration::from_secs(1),
            base_delay_secs: 60.0,
            backoff_multiplier: 2.0,
            max_delay_secs: 3600.0,
            jitter_enabled: true,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Logs order lifecycle events; the durable side effects already happened in
/// the producing transaction.
pub struct OrderEventHandler;

#[async_trait]
impl OutboxEventHandler for OrderEventHandler {
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        match EventPayload::decode(&event.event_type, &event.payload)? {
            EventPayload::OrderCreated(p) => {
                info!(
                    order_id = %p.order_id,
                    symbol = %p.symbol,
                    side = %p.side,
                    quantity = %p.quantity,
                    "order created"
                );
            }
            EventPayload::OrderStatusUpdated(p) => {
                info!(order_id = %p.order_id, status = %p.status, "order status updated");
                match p.status.as_str() {
                    "rejected" => {
                        warn!(order_id = %p.order_id, error = p.error_message.as_deref(), "order rejected")
                    }
                    "failed" => {
                        error!(order_id = %p.order_id, error = p.error_message.as_deref(), "order failed")
                    }
                    _ => {}
                }
            }
            EventPayload::OrderFilled(p) => {
                info!(
                    order_id = %p.order_id,
                    filled_quantity = %p.filled_quantity,
                    avg_fill_price = p.avg_fill_price.as_deref(),
                    "order filled"
                );
            }
            other => bail!("order handler got unexpected payload {other:?}"),
        }
        Ok(())
    }
}

/// Logs fill events.
pub struct FillEventHandler;

#[async_trait]
impl OutboxEventHandler for FillEventHandler {
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        match EventPayload::decode(&event.event_type, &event.payload)? {
            EventPayload::FillCreated(p) => {
                info!(
                    fill_id = %p.fill_id,
                    order_id = %p.order_id,
                    price = %p.price,
                    quantity = %p.quantity,
                    "fill created"
                );
            }
            EventPayload::FillProcessed(p) => {
                info!(
                    fill_id = %p.fill_id,
                    order_id = %p.order_id,
                    realized_pnl = p.realized_pnl.as_deref(),
                    "fill processed"
                );
            }
            other => bail!("fill handler got unexpected payload {other:?}"),
        }
        Ok(())
    }
}

/// Logs quote lifecycle events.
pub struct QuoteEventHandler;

#[async_trait]
impl OutboxEventHandler for QuoteEventHandler {
    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        match EventPayload::decode(&event.event_type, &event.payload)? {
            EventPayload::QuotePersisted(p) => {
                debug!(
                    quote_id = %p.quote_id,
                    symbol = %p.symbol_dst,
                    bid = p.bid_price.as_deref(),
                    ask = p.ask_price.as_deref(),
                    "quote persisted"
                );
            }
            other => bail!("quote handler got unexpected payload {other:?}"),
        }
        Ok(())
    }
}

pub struct OutboxWorker {
    repo: OutboxRepository,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    config: OutboxWorkerConfig,
    handlers: Vec<(String, Arc<dyn OutboxEventHandler>)>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
}

impl OutboxWorker {
    pub fn new(
        repo: OutboxRepository,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn JitterSource>,
        config: OutboxWorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let mut worker = Self {
            repo,
            clock,
            jitter,
            config,
            handlers: Vec::new(),
            breakers: Mutex::new(HashMap::new()),
            semaphore,
            running: AtomicBool::new(false),
        };
        worker.register_handler("order_", Arc::new(OrderEventHandler));
        worker.register_handler("fill_", Arc::new(FillEventHandler));
        worker.register_handler("quote_", Arc::new(QuoteEventHandler));
        worker
    }

    /// Register (or override) the handler for an event type prefix.
    pub fn register_handler(&mut self, prefix: &str, handler: Arc<dyn OutboxEventHandler>) {
        self.handlers.retain(|(p, _)| p != prefix);
        self.handlers.push((prefix.to_string(), handler));
    }

    /// Poll loop. Returns when `stop` is called; the in-flight batch drains
    /// before exit.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("outbox worker already running");
            return;
        }
        info!(
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting outbox worker"
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.process_batch().await {
                error!(error = %e, "error processing event batch");
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        info!("outbox worker stopped");
    }

    pub fn stop(&self) {
        info!("stopping outbox worker");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Process one batch of due events concurrently (bounded by the
    /// semaphore). Public so tests can drive the worker without the loop.
    pub async fn process_batch(&self) -> Result<()> {
        let now = self.clock.now();
        let events = self.repo.get_pending_events(self.config.batch_size, now).await?;
        if events.is_empty() {
            return Ok(());
        }
        debug!(count = events.len(), "processing event batch");

        let tasks = events.into_iter().map(|event| self.process_event(event));
        futures_util::future::join_all(tasks).await;
        Ok(())
    }

    async fn process_event(&self, event: OutboxEvent) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            // Semaphore closed; worker is shutting down.
            return;
        };
        if let Err(e) = self.handle_event(&event).await {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                retry_count = event.retry_count,
                "event processing failed"
            );
        }
    }

    async fn handle_event(&self, event: &OutboxEvent) -> Result<()> {
        self.repo.mark_processing(&event.event_id).await?;

        let outcome = self.dispatch(event).await;
        match outcome {
            Ok(()) => {
                self.repo
                    .mark_completed(&event.event_id, self.clock.now())
                    .await?;
                debug!(event_id = %event.event_id, event_type = %event.event_type, "event processed");
                Ok(())
            }
            Err(e) => {
                let delay = self.retry_delay(event.retry_count);
                self.repo
                    .mark_failed(&event.event_id, &e.to_string(), delay, self.clock.now())
                    .await?;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &OutboxEvent) -> Result<()> {
        let Some((prefix, handler)) = self
            .handlers
            .iter()
            .find(|(prefix, _)| event.event_type.starts_with(prefix.as_str()))
            .map(|(p, h)| (p.clone(), h.clone()))
        else {
            bail!("no handler found for event type {}", event.event_type);
        };

        let breaker = self.breaker_for(&prefix);
        if !breaker.allow_request() {
            bail!("circuit breaker open for handler prefix {prefix}");
        }

        match handler.handle(event).await {
            Ok(()) => {
                breaker.record_success();
                Ok(())
            }
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    fn breaker_for(&self, prefix: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(prefix.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(prefix, self.config.breaker.clone()))
            })
            .clone()
    }

    /// `min(base · multiplier^retry_count, max)` seconds, with ±20% jitter
    /// when enabled.
    fn retry_delay(&self, retry_count: u32) -> f64 {
        let raw = self.config.base_delay_secs
            * self.config.backoff_multiplier.powi(retry_count as i32);
        let capped = raw.min(self.config.max_delay_secs);
        if self.config.jitter_enabled {
            capped * self.jitter.factor()
        } else {
            capped
        }
    }

    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .lock()
            .iter()
            .map(|(prefix, breaker)| (prefix.clone(), breaker.state()))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, NoJitter};
    use crate::outbox::OutboxStatus;
    use crate::store::repos::{OutboxRepository, Repositories};
    use crate::store::Store;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysFails {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutboxEventHandler for AlwaysFails {
        async fn handle(&self, _event: &OutboxEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("handler always throws")
        }
    }

    fn open_store() -> (tempfile::TempDir, Store, Repositories, ManualClock) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("outbox.db")).unwrap();
        let repos = Repositories::new(store.clone());
        let clock = ManualClock::new(dec!(1000));
        (dir, store, repos, clock)
    }

    #[tokio::test]
    async fn successful_event_completes() {
        let (_dir, _store, repos, clock) = open_store();

        let event_id = repos
            .outbox
            .add_event(
                "order_created",
                "O1",
                &json!({
                    "order_id": "O1", "quote_id": null, "symbol": "ADAUSDM",
                    "side": "buy", "quantity": "10", "price": "0.45"
                }),
                clock.now(),
            )
            .await
            .unwrap();

        let worker = Arc::new(OutboxWorker::new(
            repos.outbox.clone(),
            Arc::new(clock.clone()),
            Arc::new(NoJitter),
            OutboxWorkerConfig::default(),
        ));
        worker.process_batch().await.unwrap();

        let event = repos.outbox.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Completed);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_event_type_fails_and_schedules_retry() {
        let (_dir, _store, repos, clock) = open_store();

        let event_id = repos
            .outbox
            .add_event("mystery_event", "M1", &json!({}), clock.now())
            .await
            .unwrap();

        let worker = Arc::new(OutboxWorker::new(
            repos.outbox.clone(),
            Arc::new(clock.clone()),
            Arc::new(NoJitter),
            OutboxWorkerConfig {
                jitter_enabled: false,
                ..OutboxWorkerConfig::default()
            },
        ));
        worker.process_batch().await.unwrap();

        let event = repos.outbox.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 1);
        assert!(event.next_retry_at.is_some());
        assert!(event.error_message.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn failing_handler_retries_then_dead_letters() {
        let (_dir, store, repos, clock) = open_store();

        // max_retries = 3 via the low-level insert.
        let event_id = {
            let conn = store.acquire().await.unwrap();
            OutboxRepository::insert_event_on(
                &conn,
                "doomed_event",
                "X1",
                &json!({}),
                3,
                clock.now(),
            )
            .unwrap()
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let mut worker = OutboxWorker::new(
            repos.outbox.clone(),
            Arc::new(clock.clone()),
            Arc::new(NoJitter),
            OutboxWorkerConfig {
                base_delay_secs: 10.0,
                jitter_enabled: false,
                // Keep the breaker out of the way so every attempt reaches
                // the handler.
                breaker: CircuitBreakerConfig {
                    failure_threshold: 100,
                    ..CircuitBreakerConfig::default()
                },
                ..OutboxWorkerConfig::default()
            },
        );
        worker.register_handler("doomed_", Arc::new(AlwaysFails { calls: calls.clone() }));
        let worker = Arc::new(worker);

        // Initial attempt + 3 retries.
        for attempt in 0u32..4 {
            worker.process_batch().await.unwrap();
            clock.advance(Decimal::from(10 * 2u32.pow(attempt) + 1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let event = repos.outbox.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::DeadLetter);
        assert_eq!(event.retry_count, 3);
        assert!(event.next_retry_at.is_none());

        // A further pass must not pick it up again.
        worker.process_batch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Admin reset returns it to pending with a fresh budget.
        assert!(repos.outbox.reset_event(&event_id).await.unwrap());
        let event = repos.outbox.get_event(&event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }

    #[tokio::test]
    async fn backoff_delay_grows_and_caps() {
        let (_dir, _store, repos, clock) = open_store();

        let worker = OutboxWorker::new(
            repos.outbox.clone(),
            Arc::new(clock),
            Arc::new(NoJitter),
            OutboxWorkerConfig {
                base_delay_secs: 60.0,
                backoff_multiplier: 2.0,
                max_delay_secs: 3600.0,
                jitter_enabled: false,
                ..OutboxWorkerConfig::default()
            },
        );

        assert_eq!(worker.retry_delay(0), 60.0);
        assert_eq!(worker.retry_delay(1), 120.0);
        assert_eq!(worker.retry_delay(2), 240.0);
        assert_eq!(worker.retry_delay(10), 3600.0);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast() {
        let (_dir, store, repos, clock) = open_store();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut worker = OutboxWorker::new(
            repos.outbox.clone(),
            Arc::new(clock.clone()),
            Arc::new(NoJitter),
            OutboxWorkerConfig {
                base_delay_secs: 1.0,
                jitter_enabled: false,
                // One at a time so breaker state is deterministic.
                max_concurrent: 1,
                breaker: CircuitBreakerConfig {
                    failure_threshold: 2,
                    success_threshold: 1,
                    recovery_timeout: Duration::from_secs(3600),
                },
                ..OutboxWorkerConfig::default()
            },
        );
        worker.register_handler("doomed_", Arc::new(AlwaysFails { calls: calls.clone() }));
        let worker = Arc::new(worker);

        for aggregate in ["A", "B", "C"] {
            let conn = store.acquire().await.unwrap();
            OutboxRepository::insert_event_on(
                &conn,
                "doomed_thing",
                aggregate,
                &json!({}),
                5,
                clock.now(),
            )
            .unwrap();
        }

        worker.process_batch().await.unwrap();
        // Three events, but the breaker opened after two handler failures,
        // so the third failed fast without reaching the handler.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            worker.breaker_states().get("doomed_"),
            Some(&CircuitState::Open)
        );

        // The fast-failed event still counts as an ordinary failure.
        let failed = repos
            .outbox
            .count_by_status(OutboxStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed, 3);
    }
}

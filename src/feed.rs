//! Reference market data feed.
//!
//! `MarketFeed` yields top-of-book snapshots; the Binance implementation
//! rides the combined-stream bookTicker endpoint over a direct WebSocket and
//! reconnects with doubling backoff. Malformed or crossed snapshots are
//! dropped before they reach the quote engine.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::quote::BookTicker;

const BINANCE_STREAM_URL: &str = "wss://stream.binance.com:9443/stream";
const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// A source of book ticker updates. `next` returns `None` when the feed has
/// shut down for good.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn next(&mut self) -> Option<BookTicker>;
    fn stop(&self);
}

/// Binance bookTicker feed for one symbol.
pub struct BinanceFeed {
    rx: mpsc::Receiver<BookTicker>,
    running: Arc<AtomicBool>,
}

impl BinanceFeed {
    /// Connect and start streaming `symbol` (e.g. "ADAUSDT"). The network
    /// task lives until `stop`.
    pub fn spawn(symbol: &str, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let running = Arc::new(AtomicBool::new(true));

        let task_symbol = symbol.to_ascii_lowercase();
        let task_running = running.clone();
        tokio::spawn(async move {
            run_feed_loop(task_symbol, clock, tx, task_running).await;
        });

        Self { rx, running }
    }
}

#[async_trait]
impl MarketFeed for BinanceFeed {
    async fn next(&mut self) -> Option<BookTicker> {
        self.rx.recv().await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn run_feed_loop(
    symbol: String,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<BookTicker>,
    running: Arc<AtomicBool>,
) {
    let mut reconnect_delay = RECONNECT_INITIAL;

    while running.load(Ordering::SeqCst) {
        match connect_and_stream(&symbol, &clock, &tx, &running).await {
            Ok(()) => {
                reconnect_delay = RECONNECT_INITIAL;
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, delay_ms = reconnect_delay.as_millis() as u64, "binance feed reconnecting");
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX);
            }
        }
    }
    info!(symbol, "binance feed stopped");
}

async fn connect_and_stream(
    symbol: &str,
    clock: &Arc<dyn Clock>,
    tx: &mpsc::Sender<BookTicker>,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let url = format!("{BINANCE_STREAM_URL}?streams={symbol}@bookTicker");
    let (ws_stream, _) = connect_async(&url)
        .await
        .context("failed to connect to Binance")?;
    info!(symbol = symbol.to_ascii_uppercase(), "connected to Binance bookTicker stream");

    let (mut write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }

        match message.context("binance stream read error")? {
            Message::Text(text) => {
                if let Some(ticker) = parse_book_ticker(&text, clock.now()) {
                    if tx.send(ticker).await.is_err() {
                        // Consumer is gone; nothing left to feed.
                        return Ok(());
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => {
                anyhow::bail!("binance stream closed");
            }
            _ => {}
        }
    }
    anyhow::bail!("binance stream ended")
}

/// Parse one combined-stream bookTicker payload. Returns `None` for control
/// messages and malformed or crossed snapshots.
pub fn parse_book_ticker(text: &str, now: Decimal) -> Option<BookTicker> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "unparseable feed message");
            return None;
        }
    };

    // Combined streams wrap the payload in {"stream": ..., "data": {...}};
    // raw streams send the payload directly.
    let data = value.get("data").unwrap_or(&value);

    let symbol = data.get("s")?.as_str()?.to_string();
    let bid_price = decimal_str(data.get("b")?)?;
    let bid_qty = decimal_str(data.get("B")?)?;
    let ask_price = decimal_str(data.get("a")?)?;
    let ask_qty = decimal_str(data.get("A")?)?;

    let ticker = BookTicker {
        symbol,
        bid_price,
        bid_qty,
        ask_price,
        ask_qty,
        ts: now,
    };

    if !ticker.is_well_formed() {
        error!(
            symbol = %ticker.symbol,
            bid = %ticker.bid_price,
            ask = %ticker.ask_price,
            "dropping malformed book ticker from feed"
        );
        return None;
    }
    Some(ticker)
}

fn decimal_str(value: &Value) -> Option<Decimal> {
    Decimal::from_str(value.as_str()?).ok()
}

/// Channel-backed feed for tests and paper trading without a network.
pub struct ChannelFeed {
    rx: mpsc::Receiver<BookTicker>,
    running: Arc<AtomicBool>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (mpsc::Sender<BookTicker>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx,
                running: Arc::new(AtomicBool::new(true)),
            },
        )
    }
}

#[async_trait]
impl MarketFeed for ChannelFeed {
    async fn next(&mut self) -> Option<BookTicker> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        self.rx.recv().await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_combined_stream_payload() {
        let text = r#"{
            "stream": "adausdt@bookTicker",
            "data": {
                "u": 400900217,
                "s": "ADAUSDT",
                "b": "0.45010000",
                "B": "31.21000000",
                "a": "0.45030000",
                "A": "40.66000000"
            }
        }"#;
        let ticker = parse_book_ticker(text, dec!(123.5)).unwrap();
        assert_eq!(ticker.symbol, "ADAUSDT");
        assert_eq!(ticker.bid_price, dec!(0.4501));
        assert_eq!(ticker.bid_qty, dec!(31.21));
        assert_eq!(ticker.ask_price, dec!(0.4503));
        assert_eq!(ticker.ask_qty, dec!(40.66));
        assert_eq!(ticker.ts, dec!(123.5));
    }

    #[test]
    fn parses_raw_stream_payload() {
        let text = r#"{"u":1,"s":"ADAUSDT","b":"0.44","B":"1","a":"0.45","A":"2"}"#;
        let ticker = parse_book_ticker(text, dec!(1)).unwrap();
        assert_eq!(ticker.bid_price, dec!(0.44));
    }

    #[test]
    fn drops_crossed_and_malformed_payloads() {
        // Crossed book.
        let crossed = r#"{"s":"ADAUSDT","b":"0.46","B":"1","a":"0.45","A":"2"}"#;
        assert!(parse_book_ticker(crossed, dec!(1)).is_none());

        // Subscription confirmation has none of the fields.
        let control = r#"{"result":null,"id":1}"#;
        assert!(parse_book_ticker(control, dec!(1)).is_none());

        // Not JSON at all.
        assert!(parse_book_ticker("nope", dec!(1)).is_none());
    }

    #[tokio::test]
    async fn channel_feed_delivers_and_stops() {
        let (tx, mut feed) = ChannelFeed::new(4);
        tx.send(BookTicker {
            symbol: "ADAUSDT".to_string(),
            bid_price: dec!(1),
            bid_qty: dec!(1),
            ask_price: dec!(1.001),
            ask_qty: dec!(1),
            ts: dec!(0),
        })
        .await
        .unwrap();

        let ticker = feed.next().await.unwrap();
        assert_eq!(ticker.symbol, "ADAUSDT");

        feed.stop();
        assert!(feed.next().await.is_none());
    }
}

//! Quote generation.
//!
//! Turns reference top-of-book snapshots into a layered ladder of bid/ask
//! quotes. Spreads and sizes are shaped by the ratio manager's multipliers so
//! inventory drifts back toward the target asset ratio.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::ratio::{CapitalAllocation, RatioAdjustment};

const BPS_DENOMINATOR: u32 = 10_000;
const PRICE_DECIMALS: u32 = 6;
const QTY_DECIMALS: u32 = 2;

/// Quote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

/// Immutable top-of-book snapshot from the reference venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    /// Local receive time, seconds.
    pub ts: Decimal,
}

impl BookTicker {
    /// A snapshot is usable when prices are positive and not crossed.
    pub fn is_well_formed(&self) -> bool {
        self.bid_price > Decimal::ZERO
            && self.ask_price > Decimal::ZERO
            && self.bid_price <= self.ask_price
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeredQuote {
    /// 1-based; layer 1 is closest to the reference price.
    pub layer_index: u32,
    pub price: Decimal,
    pub quantity: Decimal,
    pub spread_bps: Decimal,
}

/// Generated ladder for one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid_layers: Vec<LayeredQuote>,
    pub ask_layers: Vec<LayeredQuote>,
    /// Generation time, seconds.
    pub timestamp: Decimal,
    pub source: BookTicker,
}

impl Quote {
    pub fn top_bid(&self) -> Option<&LayeredQuote> {
        self.bid_layers.first()
    }

    pub fn top_ask(&self) -> Option<&LayeredQuote> {
        self.ask_layers.first()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.top_bid(), self.top_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Top-of-ladder spread in basis points.
    pub fn spread_bps(&self) -> Option<Decimal> {
        let (bid, ask) = (self.top_bid()?, self.top_ask()?);
        let mid = (bid.price + ask.price) / Decimal::TWO;
        if mid.is_zero() {
            return None;
        }
        Some((ask.price - bid.price) / mid * Decimal::from(BPS_DENOMINATOR))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteEngineStats {
    pub last_quote_time: Decimal,
    pub has_last_source: bool,
    pub sides_enabled: Vec<String>,
    pub num_layers: u32,
}

/// Turns book tickers into ladders, with requote gating.
pub struct QuoteEngine {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    last_quote_time: Decimal,
    last_source: Option<BookTicker>,
}

impl QuoteEngine {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            last_quote_time: Decimal::ZERO,
            last_source: None,
        }
    }

    /// Produce a ladder for this ticker, or `None` when a gate says to sit
    /// out (too soon, reference barely moved, or data stale).
    pub fn generate_quote(
        &mut self,
        ticker: &BookTicker,
        adjustment: &RatioAdjustment,
        allocation: &CapitalAllocation,
    ) -> Option<Quote> {
        let now = self.clock.now();

        if !ticker.is_well_formed() {
            warn!(
                symbol = %ticker.symbol,
                bid = %ticker.bid_price,
                ask = %ticker.ask_price,
                "dropping malformed book ticker"
            );
            return None;
        }

        if self.should_skip_requote(ticker, now) {
            return None;
        }

        if self.is_stale(ticker, now) {
            warn!(
                age_ms = %((now - ticker.ts) * Decimal::from(1000)),
                "market data is stale, skipping quote generation"
            );
            return None;
        }

        let mut bid_layers = if self.config.is_side_enabled("bid") {
            self.build_side(Side::Bid, ticker, adjustment, allocation)
        } else {
            Vec::new()
        };
        let mut ask_layers = if self.config.is_side_enabled("ask") {
            self.build_side(Side::Ask, ticker, adjustment, allocation)
        } else {
            Vec::new()
        };

        self.uncross(&mut bid_layers, &mut ask_layers);

        if bid_layers.is_empty() && ask_layers.is_empty() {
            return None;
        }

        self.last_quote_time = now;
        self.last_source = Some(ticker.clone());

        let quote = Quote {
            symbol: self.config.trading.symbol_dst.clone(),
            bid_layers,
            ask_layers,
            timestamp: now,
            source: ticker.clone(),
        };

        debug!(
            symbol = %quote.symbol,
            bid = quote.top_bid().map(|l| l.price.to_string()),
            ask = quote.top_ask().map(|l| l.price.to_string()),
            layers = self.config.trading.num_layers,
            "generated quote"
        );

        Some(quote)
    }

    fn build_side(
        &self,
        side: Side,
        ticker: &BookTicker,
        adjustment: &RatioAdjustment,
        allocation: &CapitalAllocation,
    ) -> Vec<LayeredQuote> {
        let trading = &self.config.trading;
        let num_layers = trading.num_layers;
        let bps = Decimal::from(BPS_DENOMINATOR);

        let (reference, spread_mult, liq_mult, capital) = match side {
            Side::Bid => (
                ticker.bid_price,
                adjustment.bid_spread_multiplier,
                adjustment.bid_liquidity_multiplier,
                allocation.bid,
            ),
            Side::Ask => (
                ticker.ask_price,
                adjustment.ask_spread_multiplier,
                adjustment.ask_liquidity_multiplier,
                allocation.ask,
            ),
        };

        let alloc = trading.total_liquidity * capital;
        let base_notional = alloc / Decimal::from(num_layers);

        let mut layers = Vec::with_capacity(num_layers as usize);
        for i in 1..=num_layers {
            let base_spread_bps =
                Decimal::from(trading.base_spread_bps + (i - 1) * trading.tick_spread_bps);
            let adj_spread_bps = base_spread_bps * spread_mult;
            let offset = adj_spread_bps / bps;
            let raw_price = match side {
                Side::Bid => reference * (Decimal::ONE - offset),
                Side::Ask => reference * (Decimal::ONE + offset),
            };
            let price = round_price(raw_price);
            if price <= Decimal::ZERO {
                continue;
            }

            let growth =
                Decimal::ONE + Decimal::from(i - 1) * trading.layer_liquidity_multiplier;
            let raw_qty = (base_notional * growth / price) * liq_mult;
            let quantity = round_qty(raw_qty.max(trading.min_quote_size));

            layers.push(LayeredQuote {
                layer_index: i,
                price,
                quantity,
                spread_bps: adj_spread_bps,
            });
        }
        layers
    }

    /// If the top of our own ladder crosses, recentre both sides around the
    /// mid with the configured total spread and shift the rest of each
    /// ladder by the same amount.
    fn uncross(&self, bids: &mut [LayeredQuote], asks: &mut [LayeredQuote]) {
        let (Some(top_bid), Some(top_ask)) = (bids.first(), asks.first()) else {
            return;
        };
        if top_bid.price < top_ask.price {
            return;
        }

        warn!(
            bid = %top_bid.price,
            ask = %top_ask.price,
            "generated bid >= ask, widening around mid"
        );

        let mid = (top_bid.price + top_ask.price) / Decimal::TWO;
        let half_spread =
            Decimal::from(self.config.total_spread_bps()) / Decimal::from(2 * BPS_DENOMINATOR);
        let new_bid = round_price(mid * (Decimal::ONE - half_spread));
        let new_ask = round_price(mid * (Decimal::ONE + half_spread));

        let bid_shift = new_bid - bids[0].price;
        for layer in bids.iter_mut() {
            layer.price = round_price(layer.price + bid_shift);
        }
        let ask_shift = new_ask - asks[0].price;
        for layer in asks.iter_mut() {
            layer.price = round_price(layer.price + ask_shift);
        }
    }

    fn should_skip_requote(&self, ticker: &BookTicker, now: Decimal) -> bool {
        let elapsed_ms = (now - self.last_quote_time) * Decimal::from(1000);
        if elapsed_ms < Decimal::from(self.config.trading.min_requote_ms) {
            return true;
        }

        if let Some(last) = &self.last_source {
            let bid_change = (ticker.bid_price - last.bid_price).abs();
            let ask_change = (ticker.ask_price - last.ask_price).abs();
            let threshold = Decimal::from(self.config.trading.tick_spread_bps)
                / Decimal::from(2 * BPS_DENOMINATOR);
            if bid_change.max(ask_change) < threshold {
                return true;
            }
        }
        false
    }

    fn is_stale(&self, ticker: &BookTicker, now: Decimal) -> bool {
        let age_ms = (now - ticker.ts) * Decimal::from(1000);
        age_ms > Decimal::from(self.config.trading.stale_ms)
    }

    pub fn stats(&self) -> QuoteEngineStats {
        QuoteEngineStats {
            last_quote_time: self.last_quote_time,
            has_last_source: self.last_source.is_some(),
            sides_enabled: self.config.trading.side_enable.clone(),
            num_layers: self.config.trading.num_layers,
        }
    }
}

pub fn round_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_qty(qty: Decimal) -> Decimal {
    qty.round_dp_with_strategy(QTY_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;

    fn ticker(bid: Decimal, ask: Decimal, ts: Decimal) -> BookTicker {
        BookTicker {
            symbol: "ADAUSDT".to_string(),
            bid_price: bid,
            bid_qty: dec!(1000),
            ask_price: ask,
            ask_qty: dec!(1000),
            ts,
        }
    }

    fn engine(config: Config, clock: ManualClock) -> QuoteEngine {
        QuoteEngine::new(Arc::new(config), Arc::new(clock))
    }

    fn neutral() -> (RatioAdjustment, CapitalAllocation) {
        (RatioAdjustment::neutral(), CapitalAllocation::neutral())
    }

    #[test]
    fn bid_only_single_layer_prices() {
        let mut config = Config::default();
        config.trading.side_enable = vec!["bid".to_string()];
        config.trading.num_layers = 1;
        config.trading.base_spread_bps = 10;
        config.trading.tick_spread_bps = 0;
        config.trading.min_requote_ms = 0;

        let clock = ManualClock::new(dec!(1000));
        let mut engine = engine(config, clock.clone());
        let (adj, alloc) = neutral();

        let quote = engine
            .generate_quote(&ticker(dec!(1.0000), dec!(1.0010), dec!(1000)), &adj, &alloc)
            .unwrap();
        assert_eq!(quote.ask_layers.len(), 0);
        assert_eq!(quote.bid_layers.len(), 1);
        assert_eq!(quote.bid_layers[0].price, dec!(0.999000));

        clock.advance(dec!(1));
        let quote = engine
            .generate_quote(&ticker(dec!(1.0100), dec!(1.0110), dec!(1001)), &adj, &alloc)
            .unwrap();
        assert_eq!(quote.bid_layers[0].price, dec!(1.008990));
    }

    #[test]
    fn three_layer_ladder_matches_formulas() {
        let mut config = Config::default();
        config.trading.num_layers = 3;
        config.trading.base_spread_bps = 8;
        config.trading.tick_spread_bps = 4;
        config.trading.total_liquidity = dec!(3000);
        config.trading.min_quote_size = dec!(10);
        config.trading.min_requote_ms = 0;

        let clock = ManualClock::new(dec!(50));
        let mut engine = engine(config, clock);
        let (adj, alloc) = neutral();

        let quote = engine
            .generate_quote(&ticker(dec!(1.0000), dec!(1.0010), dec!(50)), &adj, &alloc)
            .unwrap();

        let bid_prices: Vec<Decimal> = quote.bid_layers.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(0.999200), dec!(0.998800), dec!(0.998400)]);

        let ask_prices: Vec<Decimal> = quote.ask_layers.iter().map(|l| l.price).collect();
        assert_eq!(ask_prices, vec![dec!(1.001801), dec!(1.002201), dec!(1.002602)]);

        for layer in quote.bid_layers.iter().chain(quote.ask_layers.iter()) {
            assert!(layer.quantity >= dec!(10));
        }

        // Quantities grow with depth.
        assert!(quote.bid_layers[1].quantity > quote.bid_layers[0].quantity);
        assert!(quote.bid_layers[2].quantity > quote.bid_layers[1].quantity);

        // Prices walk away from the reference.
        assert!(bid_prices[0] > bid_prices[1] && bid_prices[1] > bid_prices[2]);
        assert!(ask_prices[0] < ask_prices[1] && ask_prices[1] < ask_prices[2]);
    }

    #[test]
    fn time_gate_blocks_rapid_requotes() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 1000;
        let clock = ManualClock::new(dec!(10));
        let mut engine = engine(config, clock.clone());
        let (adj, alloc) = neutral();

        assert!(engine
            .generate_quote(&ticker(dec!(1.0), dec!(1.001), dec!(10)), &adj, &alloc)
            .is_some());

        clock.advance(dec!(0.5));
        assert!(engine
            .generate_quote(&ticker(dec!(2.0), dec!(2.001), dec!(10.5)), &adj, &alloc)
            .is_none());

        clock.advance(dec!(0.6));
        assert!(engine
            .generate_quote(&ticker(dec!(2.0), dec!(2.001), dec!(11.1)), &adj, &alloc)
            .is_some());
    }

    #[test]
    fn movement_gate_blocks_tiny_moves() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 0;
        config.trading.tick_spread_bps = 4; // threshold = 0.0002
        let clock = ManualClock::new(dec!(10));
        let mut engine = engine(config, clock.clone());
        let (adj, alloc) = neutral();

        assert!(engine
            .generate_quote(&ticker(dec!(1.0000), dec!(1.0010), dec!(10)), &adj, &alloc)
            .is_some());

        clock.advance(dec!(1));
        assert!(engine
            .generate_quote(&ticker(dec!(1.0001), dec!(1.0011), dec!(11)), &adj, &alloc)
            .is_none());

        clock.advance(dec!(1));
        assert!(engine
            .generate_quote(&ticker(dec!(1.0005), dec!(1.0015), dec!(12)), &adj, &alloc)
            .is_some());
    }

    #[test]
    fn stale_ticker_is_skipped() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 0;
        config.trading.stale_ms = 5000;
        let clock = ManualClock::new(dec!(100));
        let mut engine = engine(config, clock);
        let (adj, alloc) = neutral();

        // 6 seconds old.
        assert!(engine
            .generate_quote(&ticker(dec!(1.0), dec!(1.001), dec!(94)), &adj, &alloc)
            .is_none());
    }

    #[test]
    fn crossed_ticker_is_dropped() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 0;
        let clock = ManualClock::new(dec!(100));
        let mut engine = engine(config, clock);
        let (adj, alloc) = neutral();

        assert!(engine
            .generate_quote(&ticker(dec!(1.002), dec!(1.001), dec!(100)), &adj, &alloc)
            .is_none());
    }

    #[test]
    fn ratio_multipliers_shape_the_ladder() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 0;
        config.trading.num_layers = 1;
        let clock = ManualClock::new(dec!(10));
        let mut engine = engine(config, clock);

        let adj = RatioAdjustment {
            bid_spread_multiplier: dec!(0.5),
            ask_spread_multiplier: dec!(2.0),
            bid_liquidity_multiplier: dec!(2.0),
            ask_liquidity_multiplier: dec!(0.5),
            imbalance_ratio: dec!(2.0),
        };
        let alloc = CapitalAllocation {
            bid: dec!(0.8),
            ask: dec!(0.2),
        };

        let quote = engine
            .generate_quote(&ticker(dec!(1.0000), dec!(1.0010), dec!(10)), &adj, &alloc)
            .unwrap();

        // Bid spread halved: 10bps * 0.5 = 5bps.
        assert_eq!(quote.bid_layers[0].price, dec!(0.999500));
        // Ask spread doubled: 20bps on 1.0010.
        assert_eq!(quote.ask_layers[0].price, dec!(1.003002));
        // Bid qty gets 80% of liquidity, doubled; ask 20%, halved.
        assert!(quote.bid_layers[0].quantity > quote.ask_layers[0].quantity);
    }

    #[test]
    fn uncross_recentres_around_mid() {
        let mut config = Config::default();
        config.trading.min_requote_ms = 0;
        config.trading.num_layers = 1;
        config.trading.base_spread_bps = 10;
        config.trading.tick_spread_bps = 5;
        let clock = ManualClock::new(dec!(10));
        let mut engine = engine(config, clock);

        // Shrink the bid spread and invert the ask so the tops cross.
        let adj = RatioAdjustment {
            bid_spread_multiplier: dec!(-2.0),
            ask_spread_multiplier: dec!(-2.0),
            bid_liquidity_multiplier: Decimal::ONE,
            ask_liquidity_multiplier: Decimal::ONE,
            imbalance_ratio: Decimal::ONE,
        };
        let alloc = CapitalAllocation::neutral();

        let quote = engine
            .generate_quote(&ticker(dec!(1.0000), dec!(1.0001), dec!(10)), &adj, &alloc)
            .unwrap();
        let bid = quote.bid_layers[0].price;
        let ask = quote.ask_layers[0].price;
        assert!(bid < ask, "uncross must leave bid {bid} < ask {ask}");
    }
}

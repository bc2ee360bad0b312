//! Asset ratio management.
//!
//! Tracks USD-valued balances of the base and quote assets and derives
//! spread/size multipliers plus a bid/ask capital split that lean quoting
//! toward whichever side rebalances inventory to the target ratio. Valuation
//! comes from outside; this module never prices assets itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;

/// Floor for any multiplier so one side never collapses entirely.
fn multiplier_floor() -> Decimal {
    Decimal::new(1, 1)
}

/// Maximum shift of capital away from the 50/50 split.
fn allocation_shift_cap() -> Decimal {
    Decimal::new(3, 1)
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetBalance {
    pub asset: String,
    pub quantity: Decimal,
    pub value_usd: Decimal,
    pub ts: Decimal,
}

/// Multipliers applied to the quote engine's spreads and sizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatioAdjustment {
    pub bid_spread_multiplier: Decimal,
    pub ask_spread_multiplier: Decimal,
    pub bid_liquidity_multiplier: Decimal,
    pub ask_liquidity_multiplier: Decimal,
    /// `current_ratio / target_ratio`.
    pub imbalance_ratio: Decimal,
}

impl RatioAdjustment {
    pub fn neutral() -> Self {
        Self {
            bid_spread_multiplier: Decimal::ONE,
            ask_spread_multiplier: Decimal::ONE,
            bid_liquidity_multiplier: Decimal::ONE,
            ask_liquidity_multiplier: Decimal::ONE,
            imbalance_ratio: Decimal::ONE,
        }
    }
}

/// Fraction of `total_liquidity` given to each side; sums to 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalAllocation {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl CapitalAllocation {
    pub fn neutral() -> Self {
        let half = Decimal::new(5, 1);
        Self { bid: half, ask: half }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RatioStatus {
    pub balances: HashMap<String, AssetBalance>,
    pub current_ratio: Option<Decimal>,
    pub target_ratio: Decimal,
    pub is_within_tolerance: bool,
    pub adjustment: RatioAdjustment,
    pub allocation: CapitalAllocation,
}

/// Maintains asset valuations and computes the quoting adjustments.
pub struct RatioManager {
    config: Arc<Config>,
    base_asset: String,
    quote_asset: String,
    balances: RwLock<HashMap<String, AssetBalance>>,
}

impl RatioManager {
    pub fn new(config: Arc<Config>) -> Self {
        let (base_asset, quote_asset) = config.symbol_assets();
        Self {
            config,
            base_asset,
            quote_asset,
            balances: RwLock::new(HashMap::new()),
        }
    }

    /// Record a balance with its externally supplied USD price.
    pub fn update_balance(&self, asset: &str, quantity: Decimal, price_usd: Decimal, ts: Decimal) {
        let value_usd = quantity * price_usd;
        debug!(asset, %quantity, %value_usd, "updated ratio balance");
        self.balances.write().insert(
            asset.to_string(),
            AssetBalance {
                asset: asset.to_string(),
                quantity,
                value_usd,
                ts,
            },
        );
    }

    /// `quote_value / base_value`, or `None` while either side is unknown
    /// or the base is worthless (ratio undefined).
    pub fn current_ratio(&self) -> Option<Decimal> {
        let balances = self.balances.read();
        let quote = balances.get(&self.quote_asset)?;
        let base = balances.get(&self.base_asset)?;
        if base.value_usd.is_zero() {
            return None;
        }
        Some(quote.value_usd / base.value_usd)
    }

    pub fn is_within_tolerance(&self) -> (bool, Option<Decimal>) {
        let Some(current) = self.current_ratio() else {
            return (false, None);
        };
        let target = self.config.trading.target_asset_ratio;
        let deviation = ((current - target) / target).abs();
        (deviation <= self.config.trading.ratio_tolerance, Some(current))
    }

    /// Spread/size multipliers for the current imbalance; neutral when the
    /// ratio is undefined.
    pub fn adjustment(&self) -> RatioAdjustment {
        let Some(current) = self.current_ratio() else {
            return RatioAdjustment::neutral();
        };

        let target = self.config.trading.target_asset_ratio;
        let imbalance = current / target;
        let spread_factor = self.config.trading.spread_adjustment_factor;
        let liquidity_factor = self.config.trading.liquidity_adjustment_factor;
        let floor = multiplier_floor();

        let adjustment = if imbalance > Decimal::ONE {
            // Excess quote asset: buy base more eagerly, sell it less.
            let excess = imbalance - Decimal::ONE;
            RatioAdjustment {
                bid_spread_multiplier: (Decimal::ONE - excess * spread_factor).max(floor),
                bid_liquidity_multiplier: Decimal::ONE + excess * liquidity_factor,
                ask_spread_multiplier: Decimal::ONE + excess * spread_factor,
                ask_liquidity_multiplier: (Decimal::ONE - excess * liquidity_factor).max(floor),
                imbalance_ratio: imbalance,
            }
        } else {
            // Excess base asset: mirror.
            let deficit = Decimal::ONE - imbalance;
            RatioAdjustment {
                ask_spread_multiplier: (Decimal::ONE - deficit * spread_factor).max(floor),
                ask_liquidity_multiplier: Decimal::ONE + deficit * liquidity_factor,
                bid_spread_multiplier: Decimal::ONE + deficit * spread_factor,
                bid_liquidity_multiplier: (Decimal::ONE - deficit * liquidity_factor).max(floor),
                imbalance_ratio: imbalance,
            }
        };

        let deviation = (imbalance - Decimal::ONE).abs();
        if deviation > self.config.trading.ratio_tolerance {
            info!(
                current_ratio = %current,
                target_ratio = %target,
                imbalance = %imbalance,
                bid_spread_mult = %adjustment.bid_spread_multiplier,
                ask_spread_mult = %adjustment.ask_spread_multiplier,
                "asset ratio imbalance detected"
            );
        }

        adjustment
    }

    /// Bid/ask share of total liquidity; equal when the ratio is undefined.
    pub fn capital_allocation(&self) -> CapitalAllocation {
        let Some(current) = self.current_ratio() else {
            return CapitalAllocation::neutral();
        };

        let target = self.config.trading.target_asset_ratio;
        let imbalance = current / target;
        let half = Decimal::new(5, 1);
        let cap = allocation_shift_cap();

        if imbalance > Decimal::ONE {
            let excess = (imbalance - Decimal::ONE).min(Decimal::ONE);
            let bid = half + excess * cap;
            CapitalAllocation {
                bid,
                ask: Decimal::ONE - bid,
            }
        } else {
            let deficit = (Decimal::ONE - imbalance).min(Decimal::ONE);
            let ask = half + deficit * cap;
            CapitalAllocation {
                bid: Decimal::ONE - ask,
                ask,
            }
        }
    }

    pub fn status(&self) -> RatioStatus {
        let (is_within_tolerance, current_ratio) = self.is_within_tolerance();
        RatioStatus {
            balances: self.balances.read().clone(),
            current_ratio,
            target_ratio: self.config.trading.target_asset_ratio,
            is_within_tolerance,
            adjustment: self.adjustment(),
            allocation: self.capital_allocation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> RatioManager {
        RatioManager::new(Arc::new(Config::default()))
    }

    #[test]
    fn missing_data_is_neutral() {
        let manager = manager();
        assert_eq!(manager.current_ratio(), None);
        assert_eq!(manager.adjustment(), RatioAdjustment::neutral());
        assert_eq!(manager.capital_allocation(), CapitalAllocation::neutral());

        manager.update_balance("USDM", dec!(2000), dec!(1), dec!(0));
        assert_eq!(manager.adjustment(), RatioAdjustment::neutral());
    }

    #[test]
    fn excess_quote_tightens_bids_and_shifts_capital() {
        // ADA 1000 @ $0.50 = $500, USDM 2000 @ $1 = $2000, target 1.0.
        // r = 4, excess = 3.
        let manager = manager();
        manager.update_balance("ADA", dec!(1000), dec!(0.50), dec!(0));
        manager.update_balance("USDM", dec!(2000), dec!(1), dec!(0));

        assert_eq!(manager.current_ratio(), Some(dec!(4)));

        let adj = manager.adjustment();
        // spread_factor 0.3: 1 - 3*0.3 = 0.1 (at the floor exactly).
        assert_eq!(adj.bid_spread_multiplier, dec!(0.1));
        assert_eq!(adj.ask_spread_multiplier, dec!(1.9));
        // liquidity_factor 0.2: 1 + 3*0.2 = 1.6; 1 - 0.6 = 0.4.
        assert_eq!(adj.bid_liquidity_multiplier, dec!(1.6));
        assert_eq!(adj.ask_liquidity_multiplier, dec!(0.4));

        let alloc = manager.capital_allocation();
        assert_eq!(alloc.bid, dec!(0.8));
        assert_eq!(alloc.ask, dec!(0.2));
    }

    #[test]
    fn excess_base_mirrors() {
        // ADA worth $4000, USDM worth $1000: r = 0.25, deficit = 0.75.
        let manager = manager();
        manager.update_balance("ADA", dec!(8000), dec!(0.50), dec!(0));
        manager.update_balance("USDM", dec!(1000), dec!(1), dec!(0));

        let adj = manager.adjustment();
        assert_eq!(adj.ask_spread_multiplier, dec!(0.775));
        assert_eq!(adj.bid_spread_multiplier, dec!(1.225));
        assert_eq!(adj.ask_liquidity_multiplier, dec!(1.15));
        assert_eq!(adj.bid_liquidity_multiplier, dec!(0.85));

        let alloc = manager.capital_allocation();
        assert_eq!(alloc.ask, dec!(0.725));
        assert_eq!(alloc.bid, dec!(0.275));
    }

    #[test]
    fn spread_multiplier_is_floored() {
        // Massive imbalance drives 1 - excess*factor well below zero.
        let manager = manager();
        manager.update_balance("ADA", dec!(10), dec!(0.50), dec!(0));
        manager.update_balance("USDM", dec!(100000), dec!(1), dec!(0));

        let adj = manager.adjustment();
        assert_eq!(adj.bid_spread_multiplier, dec!(0.1));
        assert_eq!(adj.ask_liquidity_multiplier, dec!(0.1));
    }

    #[test]
    fn allocation_shift_caps_at_80_percent() {
        let manager = manager();
        manager.update_balance("ADA", dec!(10), dec!(0.50), dec!(0));
        manager.update_balance("USDM", dec!(100000), dec!(1), dec!(0));

        let alloc = manager.capital_allocation();
        assert_eq!(alloc.bid, dec!(0.8));
        assert_eq!(alloc.ask, dec!(0.2));
    }

    #[test]
    fn tolerance_band() {
        let manager = manager();
        manager.update_balance("ADA", dec!(2000), dec!(0.50), dec!(0));
        manager.update_balance("USDM", dec!(1050), dec!(1), dec!(0));

        // r = 1.05, within 10% tolerance.
        let (within, ratio) = manager.is_within_tolerance();
        assert!(within);
        assert_eq!(ratio, Some(dec!(1.05)));
    }
}

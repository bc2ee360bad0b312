//! Application configuration.
//!
//! Resolution order: built-in defaults, then an optional YAML file, then
//! environment variables with double-underscore nesting
//! (`TRADING__SYMBOL_DST=ADAUSDM`). Environment always wins so deployments
//! can override a checked-in config file.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Reference venue symbol (e.g. ADAUSDT).
    pub symbol_src: String,
    /// Destination venue symbol (e.g. ADAUSDM).
    pub symbol_dst: String,
    /// Layer-1 spread from the reference price, in basis points.
    pub base_spread_bps: u32,
    /// Incremental spread per layer, in basis points. Half of this is also
    /// the minimum reference move that triggers a requote.
    pub tick_spread_bps: u32,
    /// Ladder layers per side.
    pub num_layers: u32,
    /// Quantity growth factor per layer.
    pub layer_liquidity_multiplier: Decimal,
    /// Total notional spread across all layers of one side.
    pub total_liquidity: Decimal,
    /// Minimum order quantity.
    pub min_quote_size: Decimal,
    /// Minimum time between requotes, in milliseconds.
    pub min_requote_ms: u64,
    /// Quote TTL and feed staleness threshold, in milliseconds.
    pub stale_ms: u64,
    /// Target quote/base value ratio.
    pub target_asset_ratio: Decimal,
    /// Dead-band around the target ratio.
    pub ratio_tolerance: Decimal,
    pub spread_adjustment_factor: Decimal,
    pub liquidity_adjustment_factor: Decimal,
    /// Which sides to quote ("bid", "ask").
    pub side_enable: Vec<String>,
    /// Explicit base asset of `symbol_dst`; overrides suffix parsing.
    pub base_asset: Option<String>,
    /// Explicit quote asset of `symbol_dst`; overrides suffix parsing.
    pub quote_asset: Option<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol_src: "ADAUSDT".to_string(),
            symbol_dst: "ADAUSDM".to_string(),
            base_spread_bps: 10,
            tick_spread_bps: 5,
            num_layers: 3,
            layer_liquidity_multiplier: Decimal::new(5, 1),
            total_liquidity: Decimal::from(3000),
            min_quote_size: Decimal::from(10),
            min_requote_ms: 100,
            stale_ms: 5000,
            target_asset_ratio: Decimal::ONE,
            ratio_tolerance: Decimal::new(1, 1),
            spread_adjustment_factor: Decimal::new(3, 1),
            liquidity_adjustment_factor: Decimal::new(2, 1),
            side_enable: vec!["bid".to_string(), "ask".to_string()],
            base_asset: None,
            quote_asset: None,
        }
    }
}

/// Venue connection configuration. Credential *values* are read here; how
/// they are used for signing lives behind the venue client boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub trading_password: String,
}

/// Risk management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_position_size: Decimal,
    pub max_daily_loss: Decimal,
    pub max_open_orders: u32,
    pub max_layers_per_side: u32,
    pub max_skew: Decimal,
    pub emergency_stop: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::from(5000),
            max_daily_loss: Decimal::from(1000),
            max_open_orders: 10,
            max_layers_per_side: 5,
            max_skew: Decimal::from(2000),
            emergency_stop: false,
        }
    }
}

/// Trading mode selecting venue endpoints and credential requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Testnet,
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(Mode::Paper),
            "testnet" => Ok(Mode::Testnet),
            "live" => Ok(Mode::Live),
            other => bail!("unknown mode {other:?} (expected paper, testnet or live)"),
        }
    }
}

/// System and operational configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub mode: Mode,
    pub db_path: String,
    /// Token bucket refill rate for venue calls.
    pub max_orders_per_second: f64,
    pub health_port: u16,
    pub cleanup_unregistered_orders: bool,
    pub cleanup_check_interval_ms: u64,
    pub order_registration_timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Paper,
            db_path: "ladderbot.db".to_string(),
            max_orders_per_second: 5.0,
            health_port: 8080,
            cleanup_unregistered_orders: true,
            cleanup_check_interval_ms: 60_000,
            order_registration_timeout_ms: 30_000,
        }
    }
}

/// Root configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub exchange: ExchangeConfig,
    pub risk: RiskConfig,
    pub system: SystemConfig,
}

impl Config {
    /// Load defaults, overlay the YAML file at `path` if it exists, then
    /// overlay environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_yaml(p)?,
            Some(p) => bail!("config file not found: {}", p.display()),
            None => {
                let default_path = Path::new("config.yaml");
                if default_path.exists() {
                    Self::from_yaml(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_yaml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Overlay `SECTION__FIELD` environment variables onto `self`.
    pub fn apply_env(&mut self) {
        let t = &mut self.trading;
        env_string("TRADING__SYMBOL_SRC", &mut t.symbol_src);
        env_string("TRADING__SYMBOL_DST", &mut t.symbol_dst);
        env_parse("TRADING__BASE_SPREAD_BPS", &mut t.base_spread_bps);
        env_parse("TRADING__TICK_SPREAD_BPS", &mut t.tick_spread_bps);
        env_parse("TRADING__NUM_LAYERS", &mut t.num_layers);
        env_parse(
            "TRADING__LAYER_LIQUIDITY_MULTIPLIER",
            &mut t.layer_liquidity_multiplier,
        );
        env_parse("TRADING__TOTAL_LIQUIDITY", &mut t.total_liquidity);
        env_parse("TRADING__MIN_QUOTE_SIZE", &mut t.min_quote_size);
        env_parse("TRADING__MIN_REQUOTE_MS", &mut t.min_requote_ms);
        env_parse("TRADING__STALE_MS", &mut t.stale_ms);
        env_parse("TRADING__TARGET_ASSET_RATIO", &mut t.target_asset_ratio);
        env_parse("TRADING__RATIO_TOLERANCE", &mut t.ratio_tolerance);
        env_parse(
            "TRADING__SPREAD_ADJUSTMENT_FACTOR",
            &mut t.spread_adjustment_factor,
        );
        env_parse(
            "TRADING__LIQUIDITY_ADJUSTMENT_FACTOR",
            &mut t.liquidity_adjustment_factor,
        );
        env_list("TRADING__SIDE_ENABLE", &mut t.side_enable);
        env_opt_string("TRADING__BASE_ASSET", &mut t.base_asset);
        env_opt_string("TRADING__QUOTE_ASSET", &mut t.quote_asset);

        env_string("EXCHANGE__API_KEY", &mut self.exchange.api_key);
        env_string(
            "EXCHANGE__TRADING_PASSWORD",
            &mut self.exchange.trading_password,
        );

        let r = &mut self.risk;
        env_parse("RISK__MAX_POSITION_SIZE", &mut r.max_position_size);
        env_parse("RISK__MAX_DAILY_LOSS", &mut r.max_daily_loss);
        env_parse("RISK__MAX_OPEN_ORDERS", &mut r.max_open_orders);
        env_parse("RISK__MAX_LAYERS_PER_SIDE", &mut r.max_layers_per_side);
        env_parse("RISK__MAX_SKEW", &mut r.max_skew);
        env_bool("RISK__EMERGENCY_STOP", &mut r.emergency_stop);

        let s = &mut self.system;
        env_parse("SYSTEM__MODE", &mut s.mode);
        env_string("SYSTEM__DB_PATH", &mut s.db_path);
        env_parse("SYSTEM__MAX_ORDERS_PER_SECOND", &mut s.max_orders_per_second);
        env_parse("SYSTEM__HEALTH_PORT", &mut s.health_port);
        env_bool(
            "SYSTEM__CLEANUP_UNREGISTERED_ORDERS",
            &mut s.cleanup_unregistered_orders,
        );
        env_parse(
            "SYSTEM__CLEANUP_CHECK_INTERVAL_MS",
            &mut s.cleanup_check_interval_ms,
        );
        env_parse(
            "SYSTEM__ORDER_REGISTRATION_TIMEOUT_MS",
            &mut s.order_registration_timeout_ms,
        );
    }

    /// Startup validation. Failures here are fatal (exit code 1); the
    /// trading loop never re-validates.
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbol_src.is_empty() || self.trading.symbol_dst.is_empty() {
            bail!("trading.symbol_src and trading.symbol_dst must be set");
        }
        if self.trading.num_layers == 0 {
            bail!("trading.num_layers must be at least 1");
        }
        if self.trading.num_layers > self.risk.max_layers_per_side {
            bail!(
                "trading.num_layers ({}) exceeds risk.max_layers_per_side ({})",
                self.trading.num_layers,
                self.risk.max_layers_per_side
            );
        }
        if self.trading.total_liquidity <= Decimal::ZERO {
            bail!("trading.total_liquidity must be positive");
        }
        if self.trading.min_quote_size <= Decimal::ZERO {
            bail!("trading.min_quote_size must be positive");
        }
        if self.trading.target_asset_ratio <= Decimal::ZERO {
            bail!("trading.target_asset_ratio must be positive");
        }
        for side in &self.trading.side_enable {
            if side != "bid" && side != "ask" {
                bail!("trading.side_enable entries must be \"bid\" or \"ask\", got {side:?}");
            }
        }
        if self.risk.max_open_orders == 0 {
            bail!("risk.max_open_orders must be at least 1");
        }
        if self.system.max_orders_per_second <= 0.0 {
            bail!("system.max_orders_per_second must be positive");
        }
        if self.system.mode != Mode::Paper {
            if self.exchange.api_key.is_empty() {
                bail!("exchange.api_key is required in {:?} mode", self.system.mode);
            }
            if self.exchange.trading_password.is_empty() {
                bail!(
                    "exchange.trading_password is required in {:?} mode",
                    self.system.mode
                );
            }
        }
        Ok(())
    }

    /// Spread applied when recentring a crossed quote, in basis points.
    pub fn total_spread_bps(&self) -> u32 {
        self.trading.base_spread_bps + self.trading.tick_spread_bps
    }

    pub fn is_side_enabled(&self, side: &str) -> bool {
        self.trading
            .side_enable
            .iter()
            .any(|s| s.eq_ignore_ascii_case(side))
    }

    /// Base/quote assets of the destination symbol. Explicit config wins,
    /// then known 4-char quote suffixes, then a positional 3/rest split.
    pub fn symbol_assets(&self) -> (String, String) {
        if let (Some(base), Some(quote)) = (&self.trading.base_asset, &self.trading.quote_asset) {
            return (base.clone(), quote.clone());
        }
        split_symbol(&self.trading.symbol_dst)
    }
}

/// Suffix-based base/quote split with a positional fallback.
pub fn split_symbol(symbol: &str) -> (String, String) {
    for quote in ["USDM", "USDT"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    if symbol.len() > 3 {
        tracing::debug!(symbol, "falling back to positional 3/rest symbol split");
        (symbol[..3].to_string(), symbol[3..].to_string())
    } else {
        (symbol.to_string(), String::new())
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *slot = v;
    }
}

fn env_opt_string(key: &str, slot: &mut Option<String>) {
    if let Ok(v) = std::env::var(key) {
        *slot = if v.is_empty() { None } else { Some(v) };
    }
}

fn env_list(key: &str, slot: &mut Vec<String>) {
    if let Ok(v) = std::env::var(key) {
        *slot = v
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *slot = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes");
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.trading.symbol_src, "ADAUSDT");
        assert_eq!(config.total_spread_bps(), 15);
        assert!(config.is_side_enabled("bid"));
        assert!(config.is_side_enabled("ASK"));
    }

    #[test]
    fn live_mode_requires_credentials() {
        let mut config = Config::default();
        config.system.mode = Mode::Live;
        assert!(config.validate().is_err());

        config.exchange.api_key = "key".to_string();
        assert!(config.validate().is_err());

        config.exchange.trading_password = "secret".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_sides_and_layers() {
        let mut config = Config::default();
        config.trading.side_enable = vec!["both".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.num_layers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.num_layers = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn symbol_assets_prefers_explicit_then_suffix() {
        let mut config = Config::default();
        assert_eq!(
            config.symbol_assets(),
            ("ADA".to_string(), "USDM".to_string())
        );

        config.trading.base_asset = Some("XADA".to_string());
        config.trading.quote_asset = Some("XUSD".to_string());
        assert_eq!(
            config.symbol_assets(),
            ("XADA".to_string(), "XUSD".to_string())
        );
    }

    #[test]
    fn split_symbol_fallback() {
        assert_eq!(split_symbol("ADAUSDT"), ("ADA".into(), "USDT".into()));
        assert_eq!(split_symbol("BTCUSDM"), ("BTC".into(), "USDM".into()));
        assert_eq!(split_symbol("SOLEUR"), ("SOL".into(), "EUR".into()));
    }

    #[test]
    fn yaml_roundtrip_overrides_defaults() {
        let yaml = r#"
trading:
  symbol_dst: BTCUSDM
  num_layers: 2
risk:
  max_open_orders: 4
system:
  mode: paper
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.trading.symbol_dst, "BTCUSDM");
        assert_eq!(config.trading.num_layers, 2);
        assert_eq!(config.risk.max_open_orders, 4);
        // Untouched sections keep defaults.
        assert_eq!(config.trading.symbol_src, "ADAUSDT");
        assert_eq!(config.trading.min_quote_size, dec!(10));
    }
}

use crate::adaptive::AdaptiveParameterConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::TradeDirection;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

pub const DEFAULT_PERIODS_PER_YEAR: f64 = 252.0;

/// Candle interval of a market data series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour4,
    Day1,
    Week1,
    Month1,
}

impl Timeframe {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1m" => Some(Self::Minute1),
            "5m" => Some(Self::Minute5),
            "15m" => Some(Self::Minute15),
            "30m" => Some(Self::Minute30),
            "1h" => Some(Self::Hour1),
            "4h" => Some(Self::Hour4),
            "1d" => Some(Self::Day1),
            "1w" => Some(Self::Week1),
            "1M" => Some(Self::Month1),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Self::Minute1 => 60,
            Self::Minute5 => 300,
            Self::Minute15 => 900,
            Self::Minute30 => 1_800,
            Self::Hour1 => 3_600,
            Self::Hour4 => 14_400,
            Self::Day1 => 86_400,
            Self::Week1 => 604_800,
            Self::Month1 => 2_592_000,
        }
    }

    /// Crypto markets trade around the clock, so a year is 365 days of bars.
    pub fn periods_per_year(self) -> f64 {
        match self {
            Self::Week1 => 52.0,
            Self::Month1 => 12.0,
            other => 365.0 * 86_400.0 / other.seconds() as f64,
        }
    }
}

/// Account-level simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BacktestConfig {
    pub initial_balance: f64,
    pub maker_fee_percent: f64,
    pub taker_fee_percent: f64,
    pub slippage_percent: f64,
    pub periods_per_year: Option<f64>,
    /// Annual rate deducted from per-period returns in Sharpe and Sortino.
    pub risk_free_rate_percent: f64,
    pub log_fills: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            maker_fee_percent: 0.1,
            taker_fee_percent: 0.1,
            slippage_percent: 0.05,
            periods_per_year: None,
            risk_free_rate_percent: 0.0,
            log_fills: false,
        }
    }
}

impl BacktestConfig {
    /// Builds the config from string settings. Every key is optional and falls back to the
    /// default, but a present value must parse and sit inside its bounds.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let initial_balance =
            optional_setting_f64(settings, "INITIAL_BALANCE", defaults.initial_balance, None, None)?;
        let maker_fee_percent = optional_setting_f64(
            settings,
            "MAKER_FEE_PERCENT",
            defaults.maker_fee_percent,
            Some(0.0),
            Some(1.0),
        )?;
        let taker_fee_percent = optional_setting_f64(
            settings,
            "TAKER_FEE_PERCENT",
            defaults.taker_fee_percent,
            Some(0.0),
            Some(1.0),
        )?;
        let slippage_percent = optional_setting_f64(
            settings,
            "SLIPPAGE_PERCENT",
            defaults.slippage_percent,
            Some(0.0),
            Some(5.0),
        )?;
        let periods_per_year = match setting_value(settings, "PERIODS_PER_YEAR") {
            Some(_) => Some(optional_setting_f64(
                settings,
                "PERIODS_PER_YEAR",
                DEFAULT_PERIODS_PER_YEAR,
                Some(1.0),
                None,
            )?),
            None => None,
        };
        let risk_free_rate_percent = optional_setting_f64(
            settings,
            "RISK_FREE_RATE_PERCENT",
            defaults.risk_free_rate_percent,
            Some(0.0),
            Some(100.0),
        )?;
        let log_fills = optional_setting_f64(settings, "LOG_FILLS", 0.0, Some(0.0), Some(1.0))? >= 0.5;

        let config = Self {
            initial_balance,
            maker_fee_percent,
            taker_fee_percent,
            slippage_percent,
            periods_per_year,
            risk_free_rate_percent,
            log_fills,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.initial_balance.is_finite() || self.initial_balance <= 0.0 {
            return Err(EngineError::config(format!(
                "initial balance must be positive (value: {})",
                self.initial_balance
            )));
        }
        for (label, value, max) in [
            ("maker fee percent", self.maker_fee_percent, 1.0),
            ("taker fee percent", self.taker_fee_percent, 1.0),
            ("slippage percent", self.slippage_percent, 5.0),
            ("risk free rate percent", self.risk_free_rate_percent, 100.0),
        ] {
            if !value.is_finite() || !(0.0..=max).contains(&value) {
                return Err(EngineError::config(format!(
                    "{} must be within [0, {}] (value: {})",
                    label, max, value
                )));
            }
        }
        if let Some(periods) = self.periods_per_year {
            if !periods.is_finite() || periods < 1.0 {
                return Err(EngineError::config(format!(
                    "periods per year must be >= 1 (value: {})",
                    periods
                )));
            }
        }
        Ok(())
    }

    pub fn maker_fee_rate(&self) -> f64 {
        self.maker_fee_percent / 100.0
    }

    pub fn taker_fee_rate(&self) -> f64 {
        self.taker_fee_percent / 100.0
    }

    pub fn slippage_rate(&self) -> f64 {
        self.slippage_percent / 100.0
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate_percent / 100.0
    }

    /// Explicit setting first, then the candle timeframe, then a daily-bar default.
    pub fn resolve_periods_per_year(&self, timeframe: Option<&str>) -> f64 {
        self.periods_per_year
            .or_else(|| timeframe.and_then(Timeframe::parse).map(Timeframe::periods_per_year))
            .unwrap_or(DEFAULT_PERIODS_PER_YEAR)
    }
}

/// Static grid parameters of one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridParams {
    pub grid_levels: usize,
    pub grid_spacing_percent: f64,
    pub take_profit_percent: f64,
    pub max_drawdown_percent: f64,
    pub min_volatility_threshold: f64,
    pub volatility_lookback: usize,
    pub allocation_percent: f64,
    /// Cancel an untouched grid after this many candles; 0 keeps it open.
    pub order_timeout_candles: usize,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            grid_levels: 5,
            grid_spacing_percent: 0.5,
            take_profit_percent: 5.0,
            max_drawdown_percent: 8.0,
            min_volatility_threshold: 0.5,
            volatility_lookback: 20,
            allocation_percent: 10.0,
            order_timeout_candles: 0,
        }
    }
}

impl GridParams {
    pub const KNOWN_KEYS: [&'static str; 8] = [
        "gridLevels",
        "gridSpacingPercent",
        "takeProfitPercent",
        "maxDrawdownPercent",
        "minVolatilityThreshold",
        "volatilityLookback",
        "allocationPercent",
        "orderTimeoutCandles",
    ];

    /// Create grid parameters from a parameter map. Values outside their bounds are errors.
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> EngineResult<Self> {
        use crate::param_utils::*;

        let defaults = Self::default();
        let params = Self {
            grid_levels: get_param_usize_in_range(parameters, "gridLevels", defaults.grid_levels, 1, 20)?,
            grid_spacing_percent: get_param_f64_in_range(
                parameters,
                "gridSpacingPercent",
                defaults.grid_spacing_percent,
                0.1,
                10.0,
            )?,
            take_profit_percent: get_param_f64_in_range(
                parameters,
                "takeProfitPercent",
                defaults.take_profit_percent,
                0.0,
                100.0,
            )?,
            max_drawdown_percent: get_param_f64_in_range(
                parameters,
                "maxDrawdownPercent",
                defaults.max_drawdown_percent,
                0.0,
                100.0,
            )?,
            min_volatility_threshold: get_param_f64_in_range(
                parameters,
                "minVolatilityThreshold",
                defaults.min_volatility_threshold,
                0.0,
                f64::MAX,
            )?,
            volatility_lookback: get_param_usize_in_range(
                parameters,
                "volatilityLookback",
                defaults.volatility_lookback,
                2,
                10_000,
            )?,
            allocation_percent: get_param_f64_in_range(
                parameters,
                "allocationPercent",
                defaults.allocation_percent,
                0.0,
                100.0,
            )?,
            order_timeout_candles: get_param_usize_in_range(
                parameters,
                "orderTimeoutCandles",
                defaults.order_timeout_candles,
                0,
                1_000_000,
            )?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> EngineResult<()> {
        use crate::param_utils::ensure_in_range;

        ensure_in_range("gridLevels", self.grid_levels as f64, 1.0, 20.0)?;
        ensure_in_range("gridSpacingPercent", self.grid_spacing_percent, 0.1, 10.0)?;
        ensure_in_range("takeProfitPercent", self.take_profit_percent, 0.0, 100.0)?;
        ensure_in_range("maxDrawdownPercent", self.max_drawdown_percent, 0.0, 100.0)?;
        ensure_in_range("minVolatilityThreshold", self.min_volatility_threshold, 0.0, f64::MAX)?;
        ensure_in_range("volatilityLookback", self.volatility_lookback as f64, 2.0, 10_000.0)?;
        ensure_in_range("allocationPercent", self.allocation_percent, 0.0, 100.0)?;
        ensure_in_range("orderTimeoutCandles", self.order_timeout_candles as f64, 0.0, 1_000_000.0)?;
        if self.allocation_percent <= 0.0 {
            return Err(EngineError::config("allocationPercent must be positive"));
        }
        // The deepest LONG level must stay above zero.
        let deepest =
            self.grid_spacing_percent / 100.0 * self.grid_levels.saturating_sub(1) as f64;
        if deepest >= 1.0 {
            return Err(EngineError::config(format!(
                "grid of {} levels at {}% spacing reaches a non-positive price",
                self.grid_levels, self.grid_spacing_percent
            )));
        }
        Ok(())
    }

    pub fn order_timeout(&self) -> Option<usize> {
        if self.order_timeout_candles == 0 {
            None
        } else {
            Some(self.order_timeout_candles)
        }
    }
}

fn default_template_id() -> String {
    "grid".to_string()
}

/// One strategy instance bound to one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default = "default_template_id")]
    pub template_id: String,
    pub symbol: String,
    pub direction: TradeDirection,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    #[serde(default)]
    pub adaptive: Option<AdaptiveParameterConfig>,
}

impl StrategyConfig {
    pub fn grid(symbol: &str, direction: TradeDirection, parameters: HashMap<String, f64>) -> Self {
        Self {
            template_id: default_template_id(),
            symbol: symbol.to_string(),
            direction,
            parameters,
            adaptive: None,
        }
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveParameterConfig) -> Self {
        self.adaptive = Some(adaptive);
        self
    }
}

/// Contents of a run file: account settings plus the strategies to simulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    pub strategies: Vec<StrategyConfig>,
}

impl RunConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config at {}", path.display()))?;
        let config: RunConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid run config JSON in {}", path.display()))?;
        config.validate_strategies()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) {
        for (key, value) in overrides {
            self.settings.insert(key.clone(), value.clone());
        }
    }

    pub fn backtest_config(&self) -> Result<BacktestConfig> {
        BacktestConfig::from_settings_map(&self.settings)
    }

    pub fn validate_strategies(&self) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(anyhow!("Run config must declare at least one strategy"));
        }
        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            if strategy.symbol.trim().is_empty() {
                return Err(anyhow!("Strategy symbol must not be empty"));
            }
            if !seen.insert(strategy.symbol.as_str()) {
                return Err(anyhow!(
                    "Symbol {} has more than one strategy; one strategy per symbol is supported",
                    strategy.symbol
                ));
            }
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.strategies
                .iter()
                .map(|s| format!("{}:{}", s.symbol, s.direction))
                .collect::<Vec<_>>()
                .join(",")
        })
    }
}

/// Parses `KEY=VALUE` pairs given on the command line.
pub fn parse_setting_override(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Setting override must look like KEY=VALUE (value: {})", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Setting override has an empty key (value: {})", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn setting_value<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = match setting_value(settings, key) {
        Some(raw) => raw,
        None => return Ok(default),
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

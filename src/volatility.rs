use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::models::Candle;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolatilityWeights {
    pub bollinger: f64,
    pub garman_klass: f64,
    pub atr: f64,
    pub ewma: f64,
}

impl Default for VolatilityWeights {
    fn default() -> Self {
        Self {
            bollinger: 0.25,
            garman_klass: 0.25,
            atr: 0.25,
            ewma: 0.25,
        }
    }
}

impl VolatilityWeights {
    /// Clamps each weight to be non-negative and rescales them to sum to one. All-zero weights
    /// fall back to equal weighting.
    pub fn normalized(&self) -> Self {
        let clamp = |w: f64| if w.is_finite() { w.max(0.0) } else { 0.0 };
        let raw = [
            clamp(self.bollinger),
            clamp(self.garman_klass),
            clamp(self.atr),
            clamp(self.ewma),
        ];
        let total: f64 = raw.iter().sum();
        if total <= f64::EPSILON {
            return Self::default();
        }
        Self {
            bollinger: raw[0] / total,
            garman_klass: raw[1] / total,
            atr: raw[2] / total,
            ewma: raw[3] / total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolatilityConfig {
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub atr_period: usize,
    pub ewma_alpha: f64,
    pub weights: VolatilityWeights,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            bb_period: 20,
            bb_std_dev: 2.0,
            atr_period: 14,
            ewma_alpha: 0.33,
            weights: VolatilityWeights::default(),
        }
    }
}

impl VolatilityConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.bb_period < 2 {
            return Err(EngineError::config(format!(
                "bbPeriod must be >= 2 (value: {})",
                self.bb_period
            )));
        }
        if self.atr_period == 0 {
            return Err(EngineError::config("atrPeriod must be >= 1"));
        }
        if !self.bb_std_dev.is_finite() || self.bb_std_dev <= 0.0 {
            return Err(EngineError::config(format!(
                "bbStdDev must be positive (value: {})",
                self.bb_std_dev
            )));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(EngineError::config(format!(
                "ewmaAlpha must be in (0, 1] (value: {})",
                self.ewma_alpha
            )));
        }
        Ok(())
    }

    /// Number of bars the calculator has to remember to serve every measure.
    pub fn history_capacity(&self) -> usize {
        self.bb_period.max(self.atr_period + 1)
    }
}

/// Point-in-time volatility readings, all in percent except `atr` which is in price units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolatilityMeasures {
    pub bollinger_bandwidth: f64,
    pub garman_klass: f64,
    pub atr: f64,
    pub atr_percent: f64,
    pub ewma: f64,
    pub composite: f64,
}

/// Rolling multi-measure volatility over a bounded OHLC window.
#[derive(Debug, Clone)]
pub struct VolatilityCalculator {
    config: VolatilityConfig,
    weights: VolatilityWeights,
    capacity: usize,
    opens: VecDeque<f64>,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    closes: VecDeque<f64>,
    ewma_variance: Option<f64>,
}

impl VolatilityCalculator {
    pub fn new(config: VolatilityConfig) -> EngineResult<Self> {
        config.validate()?;
        let capacity = config.history_capacity();
        Ok(Self {
            weights: config.weights.normalized(),
            config,
            capacity,
            opens: VecDeque::with_capacity(capacity + 1),
            highs: VecDeque::with_capacity(capacity + 1),
            lows: VecDeque::with_capacity(capacity + 1),
            closes: VecDeque::with_capacity(capacity + 1),
            ewma_variance: None,
        })
    }

    pub fn config(&self) -> &VolatilityConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn update_candle(&mut self, candle: &Candle) -> VolatilityMeasures {
        self.update(candle.high, candle.low, candle.close, candle.open)
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64, open: f64) -> VolatilityMeasures {
        self.opens.push_back(open);
        self.highs.push_back(high);
        self.lows.push_back(low);
        self.closes.push_back(close);
        while self.closes.len() > self.capacity {
            self.opens.pop_front();
            self.highs.pop_front();
            self.lows.pop_front();
            self.closes.pop_front();
        }

        self.opens.make_contiguous();
        self.highs.make_contiguous();
        self.lows.make_contiguous();
        self.closes.make_contiguous();
        let opens = self.opens.as_slices().0;
        let highs = self.highs.as_slices().0;
        let lows = self.lows.as_slices().0;
        let closes = self.closes.as_slices().0;

        let bollinger_bandwidth =
            indicators::bollinger_bandwidth_percent(closes, self.config.bb_period, self.config.bb_std_dev);
        let garman_klass =
            indicators::garman_klass_percent(opens, highs, lows, closes, self.config.atr_period);
        let atr = indicators::average_true_range(highs, lows, closes, self.config.atr_period);
        let atr_percent = if close > 0.0 { atr / close * 100.0 } else { 0.0 };

        self.ewma_variance = next_ewma_variance(self.ewma_variance, closes, self.config.ewma_alpha);
        let ewma = self
            .ewma_variance
            .map(|variance| variance.max(0.0).sqrt() * 100.0)
            .unwrap_or(0.0);

        let composite = self.weights.bollinger * bollinger_bandwidth
            + self.weights.garman_klass * garman_klass
            + self.weights.atr * atr_percent
            + self.weights.ewma * ewma;

        VolatilityMeasures {
            bollinger_bandwidth,
            garman_klass,
            atr,
            atr_percent,
            ewma,
            composite: if composite.is_finite() { composite } else { 0.0 },
        }
    }

    pub fn reset(&mut self) {
        self.opens.clear();
        self.highs.clear();
        self.lows.clear();
        self.closes.clear();
        self.ewma_variance = None;
    }
}

/// Seeds with the variance of the buffered returns, then folds in the latest squared return.
fn next_ewma_variance(previous: Option<f64>, closes: &[f64], alpha: f64) -> Option<f64> {
    if closes.len() < 2 {
        return previous;
    }
    match previous {
        None => Some(indicators::population_variance(&indicators::simple_returns(closes))),
        Some(prev) => {
            let last = closes[closes.len() - 1];
            let before = closes[closes.len() - 2];
            if before <= 0.0 {
                return Some(prev);
            }
            let ret = (last - before) / before;
            Some(alpha * ret * ret + (1.0 - alpha) * prev)
        }
    }
}

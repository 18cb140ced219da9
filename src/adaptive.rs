use crate::error::{EngineError, EngineResult};
use crate::models::Candle;
use crate::volatility::{VolatilityCalculator, VolatilityConfig, VolatilityMeasures};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolatilityLevel {
    Low,
    Normal,
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Grows with volatility.
    Direct,
    /// Shrinks as volatility rises.
    Inverse,
}

impl ScalingMode {
    pub fn apply(self, base: f64, factor: f64) -> f64 {
        let scaled = match self {
            ScalingMode::Direct => base * factor,
            ScalingMode::Inverse => {
                if factor > 0.0 {
                    base / factor
                } else {
                    0.0
                }
            }
        };
        if scaled.is_finite() {
            scaled.max(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScalingModes {
    pub grid_spacing: ScalingMode,
    pub order_volume: ScalingMode,
    pub take_profit: ScalingMode,
    pub max_drawdown: ScalingMode,
}

impl Default for ScalingModes {
    fn default() -> Self {
        Self {
            grid_spacing: ScalingMode::Direct,
            order_volume: ScalingMode::Inverse,
            take_profit: ScalingMode::Direct,
            max_drawdown: ScalingMode::Direct,
        }
    }
}

/// Unscaled strategy values the engine scales from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseParameters {
    pub grid_spacing_percent: f64,
    /// Fraction of the initial balance committed to one position.
    pub order_volume: f64,
    pub take_profit_percent: f64,
    pub max_drawdown_percent: f64,
}

impl BaseParameters {
    fn validate(&self) -> EngineResult<()> {
        for (label, value) in [
            ("gridSpacingPercent", self.grid_spacing_percent),
            ("orderVolume", self.order_volume),
            ("takeProfitPercent", self.take_profit_percent),
            ("maxDrawdownPercent", self.max_drawdown_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::config(format!(
                    "base {} must be non-negative (value: {})",
                    label, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveParameterConfig {
    pub low_volatility_threshold: f64,
    pub high_volatility_threshold: f64,
    pub min_scaling_factor: f64,
    pub max_scaling_factor: f64,
    pub scaling_modes: ScalingModes,
    pub volatility: VolatilityConfig,
    pub record_history: bool,
}

impl Default for AdaptiveParameterConfig {
    fn default() -> Self {
        Self {
            low_volatility_threshold: 1.0,
            high_volatility_threshold: 5.0,
            min_scaling_factor: 0.4,
            max_scaling_factor: 2.5,
            scaling_modes: ScalingModes::default(),
            volatility: VolatilityConfig::default(),
            record_history: true,
        }
    }
}

impl AdaptiveParameterConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let low = self.low_volatility_threshold;
        let high = self.high_volatility_threshold;
        if !low.is_finite() || !high.is_finite() || low < 0.0 || high <= low {
            return Err(EngineError::config(format!(
                "volatility thresholds must satisfy 0 <= low < high (low: {}, high: {})",
                low, high
            )));
        }
        let min = self.min_scaling_factor;
        let max = self.max_scaling_factor;
        if !min.is_finite() || !max.is_finite() || min <= 0.0 || max < min {
            return Err(EngineError::config(format!(
                "scaling bounds must satisfy 0 < min <= max (min: {}, max: {})",
                min, max
            )));
        }
        self.volatility.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledParameters {
    pub grid_spacing_percent: f64,
    pub order_volume: f64,
    pub take_profit_percent: f64,
    pub max_drawdown_percent: f64,
    pub volatility_level: VolatilityLevel,
    pub scaling_factor: f64,
    pub composite_volatility: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveHistoryEntry {
    pub volatility: f64,
    pub parameters: ScaledParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveHistory {
    pub entries: Vec<AdaptiveHistoryEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveSummary {
    pub samples: usize,
    pub average_volatility: f64,
    pub min_volatility: f64,
    pub max_volatility: f64,
    pub average_scaling_factor: f64,
    pub level_counts: BTreeMap<VolatilityLevel, usize>,
}

impl AdaptiveHistory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> AdaptiveSummary {
        if self.entries.is_empty() {
            return AdaptiveSummary::default();
        }
        let samples = self.entries.len();
        let mut level_counts = BTreeMap::new();
        let mut volatility_sum = 0.0;
        let mut factor_sum = 0.0;
        let mut min_volatility = f64::INFINITY;
        let mut max_volatility = f64::NEG_INFINITY;
        for entry in &self.entries {
            *level_counts
                .entry(entry.parameters.volatility_level)
                .or_insert(0) += 1;
            volatility_sum += entry.volatility;
            factor_sum += entry.parameters.scaling_factor;
            min_volatility = min_volatility.min(entry.volatility);
            max_volatility = max_volatility.max(entry.volatility);
        }
        AdaptiveSummary {
            samples,
            average_volatility: volatility_sum / samples as f64,
            min_volatility,
            max_volatility,
            average_scaling_factor: factor_sum / samples as f64,
            level_counts,
        }
    }

    pub fn export_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create history directory {}", parent.display())
                })?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Unable to create adaptive history at {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .context("Failed to serialize adaptive history")?;
        writer
            .flush()
            .context("Failed to flush adaptive history to disk")?;
        Ok(())
    }
}

/// Maps composite volatility to a bounded scaling factor and scales the base parameters.
#[derive(Debug, Clone)]
pub struct AdaptiveParameterEngine {
    config: AdaptiveParameterConfig,
    base: BaseParameters,
    history: AdaptiveHistory,
}

impl AdaptiveParameterEngine {
    pub fn new(config: AdaptiveParameterConfig, base: BaseParameters) -> EngineResult<Self> {
        config.validate()?;
        base.validate()?;
        Ok(Self {
            config,
            base,
            history: AdaptiveHistory::default(),
        })
    }

    pub fn config(&self) -> &AdaptiveParameterConfig {
        &self.config
    }

    pub fn base(&self) -> &BaseParameters {
        &self.base
    }

    /// EXTREME is tested before HIGH. Both thresholds are exclusive: a reading exactly at the
    /// low threshold is NORMAL, and one exactly at the high threshold is NORMAL too.
    pub fn classify(&self, volatility: f64) -> VolatilityLevel {
        let high = self.config.high_volatility_threshold;
        if volatility > high * 1.5 {
            VolatilityLevel::Extreme
        } else if volatility > high {
            VolatilityLevel::High
        } else if volatility < self.config.low_volatility_threshold {
            VolatilityLevel::Low
        } else {
            VolatilityLevel::Normal
        }
    }

    pub fn scaling_factor(&self, volatility: f64) -> f64 {
        let midpoint =
            (self.config.low_volatility_threshold + self.config.high_volatility_threshold) / 2.0;
        let reference = if midpoint > 0.0 { midpoint } else { 1.0 };
        let raw = if volatility.is_finite() {
            volatility / reference
        } else {
            0.0
        };
        raw.clamp(self.config.min_scaling_factor, self.config.max_scaling_factor)
    }

    pub fn scale_parameters(
        &mut self,
        measures: &VolatilityMeasures,
        timestamp: DateTime<Utc>,
    ) -> ScaledParameters {
        let volatility = if measures.composite.is_finite() {
            measures.composite.max(0.0)
        } else {
            0.0
        };
        let factor = self.scaling_factor(volatility);
        let modes = &self.config.scaling_modes;
        let scaled = ScaledParameters {
            grid_spacing_percent: modes.grid_spacing.apply(self.base.grid_spacing_percent, factor),
            order_volume: modes.order_volume.apply(self.base.order_volume, factor),
            take_profit_percent: modes.take_profit.apply(self.base.take_profit_percent, factor),
            max_drawdown_percent: modes
                .max_drawdown
                .apply(self.base.max_drawdown_percent, factor),
            volatility_level: self.classify(volatility),
            scaling_factor: factor,
            composite_volatility: volatility,
            timestamp,
        };
        if self.config.record_history {
            self.history.entries.push(AdaptiveHistoryEntry {
                volatility,
                parameters: scaled.clone(),
            });
        }
        scaled
    }

    pub fn history(&self) -> &AdaptiveHistory {
        &self.history
    }

    pub fn take_history(&mut self) -> AdaptiveHistory {
        std::mem::take(&mut self.history)
    }

    pub fn export_history<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        self.history.export_json(path)
    }

    pub fn clear_history(&mut self) {
        self.history.entries.clear();
    }
}

/// Volatility calculator feeding an adaptive engine, one per traded symbol.
#[derive(Debug, Clone)]
pub struct AdaptivePipeline {
    calculator: VolatilityCalculator,
    engine: AdaptiveParameterEngine,
    last_measures: VolatilityMeasures,
}

impl AdaptivePipeline {
    pub fn new(config: AdaptiveParameterConfig, base: BaseParameters) -> EngineResult<Self> {
        let calculator = VolatilityCalculator::new(config.volatility.clone())?;
        let engine = AdaptiveParameterEngine::new(config, base)?;
        Ok(Self {
            calculator,
            engine,
            last_measures: VolatilityMeasures::default(),
        })
    }

    pub fn on_candle(&mut self, candle: &Candle) -> ScaledParameters {
        self.last_measures = self.calculator.update_candle(candle);
        self.engine
            .scale_parameters(&self.last_measures, candle.timestamp)
    }

    pub fn last_measures(&self) -> &VolatilityMeasures {
        &self.last_measures
    }

    pub fn engine(&self) -> &AdaptiveParameterEngine {
        &self.engine
    }

    pub fn take_history(&mut self) -> AdaptiveHistory {
        self.engine.take_history()
    }
}

use crate::config::Timeframe;
use crate::error::{EngineError, EngineResult};
use crate::models::Candle;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Candle history of one symbol, validated on construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MarketDataRecord", into = "MarketDataRecord")]
pub struct MarketData {
    symbol: String,
    timeframe: String,
    candles: Vec<Candle>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDataRecord {
    symbol: String,
    timeframe: String,
    candles: Vec<Candle>,
}

impl TryFrom<MarketDataRecord> for MarketData {
    type Error = EngineError;

    fn try_from(record: MarketDataRecord) -> EngineResult<Self> {
        MarketData::new(record.symbol, record.timeframe, record.candles)
    }
}

impl From<MarketData> for MarketDataRecord {
    fn from(data: MarketData) -> Self {
        Self {
            symbol: data.symbol,
            timeframe: data.timeframe,
            candles: data.candles,
        }
    }
}

impl MarketData {
    /// Rejects invalid candles and timestamps that do not strictly increase.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        candles: Vec<Candle>,
    ) -> EngineResult<Self> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(EngineError::config("market data symbol must not be empty"));
        }
        for (index, candle) in candles.iter().enumerate() {
            candle.validate()?;
            if index > 0 && candles[index - 1].timestamp >= candle.timestamp {
                return Err(EngineError::UnorderedCandles {
                    symbol,
                    index,
                    previous: candles[index - 1].timestamp,
                    current: candle.timestamp,
                });
            }
        }
        Ok(Self {
            symbol,
            timeframe: timeframe.into(),
            candles,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(|c| c.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.timestamp)
    }
}

/// Sorted union of every candle timestamp across the series.
pub fn unique_timestamps<'a>(
    series: impl IntoIterator<Item = &'a MarketData>,
) -> Vec<DateTime<Utc>> {
    let mut timestamps = BTreeSet::new();
    for data in series {
        timestamps.extend(data.candles.iter().map(|c| c.timestamp));
    }
    timestamps.into_iter().collect()
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: Vec<MarketData>,
}

fn is_binary_snapshot(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("bin"))
        .unwrap_or(false)
}

/// Loads a snapshot written by [`save_market_data`]. `.bin` files are bincode, anything else
/// is read as JSON.
pub fn load_market_data<P: AsRef<Path>>(path: P) -> Result<Vec<MarketData>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open market data snapshot at {}", path.display()))?;
    let reader = BufReader::new(file);
    let snapshot: MarketDataSnapshot = if is_binary_snapshot(path) {
        bincode::deserialize_from(reader).context("Snapshot decode failed")?
    } else {
        serde_json::from_reader(reader)
            .with_context(|| format!("Invalid market data JSON in {}", path.display()))?
    };

    if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
        return Err(anyhow!(
            "Market data snapshot version mismatch (found {}, expected {})",
            snapshot.version,
            MARKET_DATA_SNAPSHOT_VERSION
        ));
    }
    if snapshot.series.is_empty() {
        return Err(anyhow!(
            "Market data snapshot {} has no series",
            path.display()
        ));
    }
    let mut symbols = BTreeSet::new();
    for data in &snapshot.series {
        if !symbols.insert(data.symbol.as_str()) {
            return Err(anyhow!(
                "Market data snapshot {} contains {} more than once",
                path.display(),
                data.symbol
            ));
        }
    }

    info!(
        "Loaded {} series ({} candles) from {}",
        snapshot.series.len(),
        snapshot.series.iter().map(MarketData::len).sum::<usize>(),
        path.display()
    );
    Ok(snapshot.series)
}

pub fn save_market_data<P: AsRef<Path>>(path: P, series: &[MarketData]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot directory {}", parent.display())
            })?;
        }
    }

    let file = File::create(path).with_context(|| {
        format!(
            "Unable to create market data snapshot at {}",
            path.display()
        )
    })?;
    let mut writer = BufWriter::new(file);
    let snapshot = MarketDataSnapshot {
        version: MARKET_DATA_SNAPSHOT_VERSION,
        generated_at: Utc::now(),
        series: series.to_vec(),
    };
    if is_binary_snapshot(path) {
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
    } else {
        serde_json::to_writer_pretty(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
    }
    writer
        .flush()
        .context("Failed to flush market data snapshot to disk")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Regime {
    Calm,
    Trending(f64),
    Turbulent,
}

impl Regime {
    fn drift(self) -> f64 {
        match self {
            Regime::Trending(drift) => drift,
            _ => 0.0,
        }
    }

    fn volatility(self) -> f64 {
        match self {
            Regime::Calm => 0.003,
            Regime::Trending(_) => 0.008,
            Regime::Turbulent => 0.025,
        }
    }
}

/// Settings of the seeded random-walk generator.
#[derive(Debug, Clone)]
pub struct SyntheticMarketConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: usize,
    pub start_price: f64,
    pub seed: u64,
    pub start_time: DateTime<Utc>,
    /// Chance per candle of switching to another regime.
    pub regime_switch_probability: f64,
}

impl SyntheticMarketConfig {
    pub fn new(symbol: &str, timeframe: Timeframe, candles: usize, seed: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            candles,
            start_price: 100.0,
            seed,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            regime_switch_probability: 0.02,
        }
    }
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn next_regime(rng: &mut StdRng) -> Regime {
    match rng.gen_range(0..3) {
        0 => Regime::Calm,
        1 => {
            let drift = rng.gen_range(0.0005..0.002);
            if rng.gen_bool(0.5) {
                Regime::Trending(drift)
            } else {
                Regime::Trending(-drift)
            }
        }
        _ => Regime::Turbulent,
    }
}

/// Regime-switching geometric random walk. The same config always yields the same candles.
pub fn generate_synthetic(config: &SyntheticMarketConfig) -> EngineResult<MarketData> {
    if !config.start_price.is_finite() || config.start_price <= 0.0 {
        return Err(EngineError::config(format!(
            "start price must be positive (value: {})",
            config.start_price
        )));
    }
    if !(0.0..=1.0).contains(&config.regime_switch_probability) {
        return Err(EngineError::config(format!(
            "regime switch probability must be within [0, 1] (value: {})",
            config.regime_switch_probability
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let step = Duration::seconds(config.timeframe.seconds());
    let mut regime = Regime::Calm;
    let mut close = config.start_price;
    let mut candles = Vec::with_capacity(config.candles);
    let mut timestamp = config.start_time;

    for index in 0..config.candles {
        if rng.gen_bool(config.regime_switch_probability) {
            regime = next_regime(&mut rng);
        }
        let volatility = regime.volatility();
        let open = close;
        let log_return = regime.drift() + volatility * standard_normal(&mut rng);
        close = (open * log_return.exp()).max(1e-6);

        let wick_up = rng.gen_range(0.0..1.0) * volatility * 0.5;
        let wick_down = rng.gen_range(0.0..1.0) * volatility * 0.5;
        let high = open.max(close) * (1.0 + wick_up);
        let low = open.min(close) * (1.0 - wick_down);
        let volume = rng.gen_range(100.0..1_000.0) * (1.0 + log_return.abs() * 50.0);

        candles.push(Candle::new(timestamp, open, high, low, close, volume)?);
        if index + 1 < config.candles {
            timestamp = timestamp.checked_add_signed(step).ok_or_else(|| {
                EngineError::config(format!(
                    "{} candles of {} from {} run past the supported date range",
                    config.candles,
                    config.timeframe.label(),
                    config.start_time
                ))
            })?;
        }
    }

    MarketData::new(config.symbol.clone(), config.timeframe.label(), candles)
}

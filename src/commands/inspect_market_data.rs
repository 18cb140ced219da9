use crate::data_context::{load_market_data, MarketData};
use crate::indicators::trailing_return_volatility_percent;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub symbol: String,
    pub timeframe: String,
    pub candles: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub lowest: f64,
    pub highest: f64,
    pub return_volatility_percent: f64,
}

pub fn summarize(data: &MarketData) -> SeriesSummary {
    let candles = data.candles();
    let lowest = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let highest = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    SeriesSummary {
        symbol: data.symbol().to_string(),
        timeframe: data.timeframe().to_string(),
        candles: candles.len(),
        first: data.first_timestamp(),
        last: data.last_timestamp(),
        lowest: if lowest.is_finite() { lowest } else { 0.0 },
        highest: if highest.is_finite() { highest } else { 0.0 },
        return_volatility_percent: trailing_return_volatility_percent(candles, candles.len()),
    }
}

pub fn run(path: &Path) -> Result<Vec<SeriesSummary>> {
    let series = load_market_data(path)?;
    let summaries: Vec<SeriesSummary> = series.iter().map(summarize).collect();
    for summary in &summaries {
        info!(
            "{} [{}]: {} candles {} .. {}, range {:.8} - {:.8}, return volatility {:.4}%",
            summary.symbol,
            summary.timeframe,
            summary.candles,
            summary
                .first
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            summary
                .last
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            summary.lowest,
            summary.highest,
            summary.return_volatility_percent
        );
    }
    Ok(summaries)
}

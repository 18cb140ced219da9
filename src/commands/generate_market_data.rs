use crate::config::Timeframe;
use crate::data_context::{generate_synthetic, save_market_data, SyntheticMarketConfig};
use anyhow::{anyhow, ensure, Context, Result};
use log::info;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub candles: usize,
    pub seed: u64,
    pub start_price: f64,
    pub output: PathBuf,
}

/// Writes a synthetic snapshot with one series per symbol. Each symbol gets its own seed
/// derived from the base seed so series differ but stay reproducible.
pub fn run(options: &GenerateOptions) -> Result<()> {
    ensure!(!options.symbols.is_empty(), "At least one symbol is required");
    ensure!(options.candles > 0, "Candle count must be positive");
    let timeframe = Timeframe::parse(&options.timeframe)
        .ok_or_else(|| anyhow!("Unknown timeframe {}", options.timeframe))?;

    let mut series = Vec::with_capacity(options.symbols.len());
    for (index, symbol) in options.symbols.iter().enumerate() {
        let mut config = SyntheticMarketConfig::new(
            symbol,
            timeframe,
            options.candles,
            options.seed.wrapping_add(index as u64),
        );
        config.start_price = options.start_price;
        let data = generate_synthetic(&config)
            .with_context(|| format!("Failed to generate candles for {}", symbol))?;
        series.push(data);
    }

    save_market_data(&options.output, &series)?;
    info!(
        "Market data snapshot with {} series of {} {} candles written to {}",
        series.len(),
        options.candles,
        timeframe.label(),
        options.output.display()
    );
    Ok(())
}

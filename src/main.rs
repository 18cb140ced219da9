use anyhow::Result;
use clap::{Parser, Subcommand};
use grid_backtester::commands::{
    backtest::{self, BacktestOptions},
    generate_market_data::{self, GenerateOptions},
    inspect_market_data,
};
use grid_backtester::config::parse_setting_override;
use log::info;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "grid-backtester")]
#[command(about = "Volatility-adaptive grid trading backtester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one or more run files against a market data snapshot
    Backtest {
        /// Run config JSON files; each is simulated on its own worker thread
        #[arg(required = true, value_name = "RUN_FILE")]
        run_files: Vec<PathBuf>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Directory receiving result JSON files
        #[arg(short, long = "output-dir", value_name = "DIR", default_value = "results")]
        output_dir: PathBuf,
        /// Override a run setting, e.g. --set TAKER_FEE_PERCENT=0.04
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Worker threads (defaults to the number of CPUs)
        #[arg(long)]
        workers: Option<usize>,
        /// Also write each symbol's adaptive parameter history
        #[arg(long)]
        export_history: bool,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Generate a synthetic market data snapshot
    GenerateMarketData {
        /// Comma separated symbols
        #[arg(long, value_delimiter = ',', default_value = "BTCUSDC")]
        symbols: Vec<String>,
        /// Candle timeframe (1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w, 1M)
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// Candles per symbol
        #[arg(long, default_value_t = 2_000)]
        candles: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 100.0)]
        start_price: f64,
        /// Destination file; `.bin` is written as bincode, anything else as JSON
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Print a summary of every series in a market data snapshot
    InspectMarketData {
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    info!("Starting grid backtester. Simulated results are not indicative of future returns.");

    match command {
        Commands::Backtest {
            run_files,
            data_file,
            output_dir,
            set,
            workers,
            export_history,
            no_progress,
        } => {
            let overrides = set
                .iter()
                .map(|raw| parse_setting_override(raw))
                .collect::<Result<Vec<_>>>()?;
            let options = BacktestOptions {
                run_files,
                data_file: resolve_market_data_path(data_file),
                output_dir,
                overrides,
                workers,
                export_history,
                show_progress: !no_progress,
            };
            backtest::run(&options)?;
        }
        Commands::GenerateMarketData {
            symbols,
            timeframe,
            candles,
            seed,
            start_price,
            output,
        } => {
            let options = GenerateOptions {
                symbols,
                timeframe,
                candles,
                seed,
                start_price,
                output: resolve_market_data_path(output),
            };
            generate_market_data::run(&options)?;
        }
        Commands::InspectMarketData { data_file } => {
            inspect_market_data::run(&resolve_market_data_path(data_file))?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}

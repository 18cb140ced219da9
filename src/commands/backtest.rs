use crate::config::RunConfig;
use crate::data_context::{load_market_data, MarketData};
use crate::engine::BacktestEngine;
use crate::logging::RunLogger;
use crate::models::BacktestResult;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct BacktestOptions {
    pub run_files: Vec<PathBuf>,
    pub data_file: PathBuf,
    pub output_dir: PathBuf,
    pub overrides: Vec<(String, String)>,
    pub workers: Option<usize>,
    pub export_history: bool,
    pub show_progress: bool,
}

struct BacktestTask {
    name: String,
    label: String,
    config: RunConfig,
}

struct BacktestResultMsg {
    name: String,
    label: String,
    duration_seconds: f64,
    run: StdResult<BacktestResult, String>,
}

/// Runs every run file against one shared market data set and writes a result JSON per run.
/// Returns the paths of the written result files.
pub fn run(options: &BacktestOptions) -> Result<Vec<PathBuf>> {
    if options.run_files.is_empty() {
        return Err(anyhow!("At least one run file is required"));
    }
    let market = Arc::new(load_market_data(&options.data_file)?);
    let tasks = load_tasks(options)?;
    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            options.output_dir.display()
        )
    })?;

    let total = tasks.len();
    let requested_workers = options.workers.unwrap_or_else(num_cpus::get);
    let num_workers = std::cmp::min(total, std::cmp::max(1, requested_workers));
    info!(
        "Running {} backtest{} on {} worker thread{}",
        total,
        if total == 1 { "" } else { "s" },
        num_workers,
        if num_workers == 1 { "" } else { "s" }
    );

    let (task_tx, task_rx): (Sender<BacktestTask>, Receiver<BacktestTask>) = bounded(total);
    let (result_tx, result_rx): (Sender<BacktestResultMsg>, Receiver<BacktestResultMsg>) =
        bounded(total);

    let mut handles = Vec::new();
    for _ in 0..num_workers {
        let rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let market = market.clone();
        let handle = thread::spawn(move || {
            while let Ok(task) = rx.recv() {
                let BacktestTask {
                    name,
                    label,
                    config,
                } = task;
                let start = Instant::now();
                let run = execute(&config, market.as_slice());
                let message = BacktestResultMsg {
                    name,
                    label,
                    duration_seconds: start.elapsed().as_secs_f64(),
                    run,
                };
                if result_tx.send(message).is_err() {
                    break;
                }
            }
        });
        handles.push(handle);
    }
    drop(result_tx);

    for task in tasks {
        task_tx
            .send(task)
            .map_err(|_| anyhow!("Backtest workers stopped before all runs were queued"))?;
    }
    drop(task_tx);

    let pb = if options.show_progress {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut written = Vec::with_capacity(total);
    let mut failures: Vec<String> = Vec::new();
    let mut completed = 0usize;
    while completed < total {
        let message = match result_rx.recv() {
            Ok(message) => message,
            Err(_) => {
                warn!(
                    "Result channel closed after {} of {} backtests",
                    completed, total
                );
                break;
            }
        };
        completed += 1;
        pb.set_position(completed as u64);

        match message.run {
            Ok(result) => {
                let metrics = &result.metrics;
                info!(
                    "Completed {} in {:.2}s: {} trades, return {:+.2}%, max drawdown {:.2}%, Sharpe {:.3}",
                    message.label,
                    message.duration_seconds,
                    metrics.total_trades,
                    metrics.total_return_percent,
                    metrics.max_drawdown_percent,
                    metrics.sharpe_ratio
                );
                let path = options.output_dir.join(format!("{}.result.json", message.name));
                write_result(&path, &result)?;
                if options.export_history {
                    for (symbol, history) in &result.adaptive_history {
                        let history_path = options
                            .output_dir
                            .join(format!("{}.{}.adaptive.json", message.name, symbol));
                        history.export_json(&history_path)?;
                    }
                }
                written.push(path);
            }
            Err(error) => {
                warn!("Backtest {} failed: {}", message.label, error);
                failures.push(format!("{} ({})", message.label, error));
            }
        }
    }
    pb.finish_and_clear();

    finish_workers(handles, completed, total)?;

    if !failures.is_empty() {
        return Err(anyhow!(
            "{} of {} backtests failed: {}",
            failures.len(),
            total,
            failures.join("; ")
        ));
    }
    info!(
        "Wrote {} result file{} to {}",
        written.len(),
        if written.len() == 1 { "" } else { "s" },
        options.output_dir.display()
    );
    Ok(written)
}

fn load_tasks(options: &BacktestOptions) -> Result<Vec<BacktestTask>> {
    let mut used_names = HashSet::new();
    let mut tasks = Vec::with_capacity(options.run_files.len());
    for (index, path) in options.run_files.iter().enumerate() {
        let mut config = RunConfig::load_from_file(path)?;
        config.apply_overrides(&options.overrides);
        // Surface bad settings before any worker starts.
        config
            .backtest_config()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        let name = unique_name(&mut used_names, run_file_stem(path), index);
        tasks.push(BacktestTask {
            label: config.label(),
            name,
            config,
        });
    }
    Ok(tasks)
}

/// Claims `stem` in `used`, or the first free `stem-<index>` / `stem-<index>-<n>` variant.
fn unique_name(used: &mut HashSet<String>, stem: String, index: usize) -> String {
    if used.insert(stem.clone()) {
        return stem;
    }
    let mut candidate = format!("{}-{}", stem, index);
    let mut attempt = 1;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}-{}-{}", stem, index, attempt);
        attempt += 1;
    }
    candidate
}

/// Joins every worker and fails when one panicked or results are missing.
fn finish_workers(handles: Vec<JoinHandle<()>>, completed: usize, total: usize) -> Result<()> {
    let mut panics = Vec::new();
    for handle in handles {
        if let Err(payload) = handle.join() {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            panics.push(message);
        }
    }
    if !panics.is_empty() {
        return Err(anyhow!(
            "{} backtest worker{} panicked after {} of {} backtests completed: {}",
            panics.len(),
            if panics.len() == 1 { "" } else { "s" },
            completed,
            total,
            panics.join("; ")
        ));
    }
    if completed < total {
        return Err(anyhow!(
            "Only {} of {} backtests reported a result",
            completed,
            total
        ));
    }
    Ok(())
}

fn run_file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("run")
        .to_string()
}

fn execute(config: &RunConfig, market: &[MarketData]) -> StdResult<BacktestResult, String> {
    let backtest_config = config.backtest_config().map_err(|e| format!("{:#}", e))?;
    let logger = RunLogger::for_new_run().with_fill_logging(backtest_config.log_fills);
    let engine = BacktestEngine::new(backtest_config)
        .map_err(|e| e.to_string())?
        .with_logger(logger);
    engine
        .run(market, &config.strategies)
        .map_err(|e| e.to_string())
}

pub fn write_result(path: &Path, result: &BacktestResult) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Unable to create result file at {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, result).context("Failed to serialize result")?;
    writer
        .flush()
        .context("Failed to flush result file to disk")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_stems_never_collide_with_real_names() {
        let mut used = HashSet::new();
        let names: Vec<String> = ["run", "run-2", "run", "run-2", "run"]
            .iter()
            .enumerate()
            .map(|(index, stem)| unique_name(&mut used, stem.to_string(), index))
            .collect();
        assert_eq!(names, vec!["run", "run-2", "run-2-1", "run-2-3", "run-4"]);
        assert_eq!(used.len(), names.len());
    }

    #[test]
    fn run_file_stem_falls_back_for_empty_names() {
        assert_eq!(run_file_stem(Path::new("configs/long-btc.json")), "long-btc");
        assert_eq!(run_file_stem(Path::new("/")), "run");
    }

    #[test]
    fn worker_panic_is_reported() {
        let handles = vec![
            thread::spawn(|| {}),
            thread::spawn(|| panic!("engine exploded")),
        ];
        let err = finish_workers(handles, 1, 2).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("engine exploded"), "{}", message);
        assert!(message.contains("1 of 2"), "{}", message);
    }

    #[test]
    fn missing_results_are_an_error() {
        let err = finish_workers(vec![thread::spawn(|| {})], 2, 3).unwrap_err();
        assert!(err.to_string().contains("2 of 3"));
        finish_workers(vec![thread::spawn(|| {})], 3, 3).unwrap();
    }
}

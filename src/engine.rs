use crate::adaptive::{AdaptiveParameterConfig, AdaptivePipeline};
use crate::config::{BacktestConfig, StrategyConfig};
use crate::data_context::{unique_timestamps, MarketData};
use crate::error::{EngineError, EngineResult};
use crate::execution::OrderExecutor;
use crate::logging::RunLogger;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::portfolio::Portfolio;
use crate::strategy::{create_strategy, Strategy};
use std::collections::BTreeMap;

pub type BoxedStrategy = Box<dyn Strategy + Send + Sync>;

#[derive(Debug, PartialEq)]
enum EntryOutcome {
    NoSignal,
    Armed { orders: usize },
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

const SKIP_INSUFFICIENT_CASH: &str = "insufficient cash";

#[derive(Debug, Default)]
struct RunCounters {
    candles_processed: usize,
    missed_entries_due_to_cash: usize,
    cancelled_orders: usize,
}

/// Per-symbol state carried through the loop.
struct SymbolRunner<'a> {
    symbol: String,
    candles: &'a [Candle],
    cursor: usize,
    strategy: BoxedStrategy,
    pipeline: Option<AdaptivePipeline>,
    pending: Vec<Order>,
    armed_at: Option<usize>,
}

impl<'a> SymbolRunner<'a> {
    fn advance_to(&mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Option<usize> {
        let index = self.cursor;
        match self.candles.get(index) {
            Some(candle) if candle.timestamp == timestamp => {
                self.cursor += 1;
                Some(index)
            }
            _ => None,
        }
    }

    /// Cash a resting grid would consume if every order filled at its limit.
    fn reserved_cash(&self, slippage_rate: f64, fee_rate: f64) -> f64 {
        self.pending
            .iter()
            .map(|o| o.remaining_quantity() * o.price * (1.0 + slippage_rate) * (1.0 + fee_rate))
            .sum()
    }

    fn cancel_pending(&mut self) -> usize {
        let count = self.pending.len();
        for order in self.pending.iter_mut() {
            order.cancel();
        }
        self.pending.clear();
        self.armed_at = None;
        count
    }
}

/// Candle-driven simulation of one or more grid strategies sharing a single account.
pub struct BacktestEngine {
    config: BacktestConfig,
    executor: OrderExecutor,
    logger: RunLogger,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> EngineResult<Self> {
        config.validate()?;
        let executor = OrderExecutor::from_config(&config)?;
        let logger = RunLogger::for_new_run().with_fill_logging(config.log_fills);
        Ok(Self {
            config,
            executor,
            logger,
        })
    }

    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Builds the strategies from their configs and runs them.
    pub fn run(
        &self,
        market: &[MarketData],
        strategies: &[StrategyConfig],
    ) -> EngineResult<BacktestResult> {
        let mut built = Vec::with_capacity(strategies.len());
        for config in strategies {
            built.push((create_strategy(config)?, config.adaptive.clone()));
        }
        self.run_with_strategies(market, built)
    }

    pub fn run_with_strategies(
        &self,
        market: &[MarketData],
        strategies: Vec<(BoxedStrategy, Option<AdaptiveParameterConfig>)>,
    ) -> EngineResult<BacktestResult> {
        if strategies.is_empty() {
            return Err(EngineError::config("at least one strategy is required"));
        }

        let mut series: BTreeMap<&str, &MarketData> = BTreeMap::new();
        for data in market {
            if series.insert(data.symbol(), data).is_some() {
                return Err(EngineError::config(format!(
                    "market data for {} supplied more than once",
                    data.symbol()
                )));
            }
        }

        let mut runners: BTreeMap<String, SymbolRunner> = BTreeMap::new();
        let mut traded: Vec<&MarketData> = Vec::with_capacity(strategies.len());
        for (strategy, adaptive) in strategies {
            let symbol = strategy.symbol().to_string();
            let data = *series
                .get(symbol.as_str())
                .ok_or_else(|| EngineError::MissingMarketData(symbol.clone()))?;
            if runners.contains_key(&symbol) {
                return Err(EngineError::config(format!(
                    "symbol {} has more than one strategy",
                    symbol
                )));
            }
            let pipeline = match adaptive {
                Some(config) => Some(AdaptivePipeline::new(config, strategy.base_parameters())?),
                None => None,
            };
            traded.push(data);
            runners.insert(
                symbol.clone(),
                SymbolRunner {
                    symbol,
                    candles: data.candles(),
                    cursor: 0,
                    strategy,
                    pipeline,
                    pending: Vec::new(),
                    armed_at: None,
                },
            );
        }

        let periods_per_year = self.resolve_periods_per_year(&traded);
        let timestamps = unique_timestamps(traded.iter().copied());
        self.logger.info(format!(
            "Backtesting {} symbol(s) over {} timestamps, balance {:.2}, {} periods/year",
            runners.len(),
            timestamps.len(),
            self.config.initial_balance,
            periods_per_year
        ));

        let mut portfolio = Portfolio::new(self.config.initial_balance);
        let mut counters = RunCounters::default();
        let mut equity_curve = Vec::with_capacity(timestamps.len());

        let symbols: Vec<String> = runners.keys().cloned().collect();
        for &timestamp in &timestamps {
            for symbol in &symbols {
                let reserved: f64 = runners
                    .values()
                    .map(|r| {
                        r.reserved_cash(self.config.slippage_rate(), self.executor.maker_fee_rate())
                    })
                    .sum();
                let runner = match runners.get_mut(symbol) {
                    Some(runner) => runner,
                    None => continue,
                };
                let index = match runner.advance_to(timestamp) {
                    Some(index) => index,
                    None => continue,
                };
                self.process_candle(runner, index, reserved, &mut portfolio, &mut counters)?;
                counters.candles_processed += 1;
            }
            let pending_orders = runners.values().map(|r| r.pending.len()).sum();
            equity_curve.push(portfolio.snapshot(timestamp, pending_orders));
        }

        let mut adaptive_history = BTreeMap::new();
        let mut adaptive_summary = BTreeMap::new();
        for (symbol, runner) in runners.iter_mut() {
            if let Some(pipeline) = runner.pipeline.as_mut() {
                let history = pipeline.take_history();
                adaptive_summary.insert(symbol.clone(), history.summary());
                adaptive_history.insert(symbol.clone(), history);
            }
        }

        let final_equity = portfolio.total_equity();
        let (trades, open_positions) = portfolio.into_parts();
        let metrics = PerformanceCalculator::calculate_metrics(
            &trades,
            &equity_curve,
            self.config.initial_balance,
            periods_per_year,
            self.config.risk_free_rate(),
        );

        self.logger.info(format!(
            "Finished: {} trades, {} open, final equity {:.2} ({:+.2}%), max drawdown {:.2}%",
            trades.len(),
            open_positions.len(),
            final_equity,
            metrics.total_return_percent,
            metrics.max_drawdown_percent
        ));
        if counters.missed_entries_due_to_cash > 0 {
            self.logger.warn(format!(
                "{} entries skipped for lack of cash",
                counters.missed_entries_due_to_cash
            ));
        }

        Ok(BacktestResult {
            id: self.logger.run_id().to_string(),
            start_time: timestamps.first().copied(),
            end_time: timestamps.last().copied(),
            initial_balance: self.config.initial_balance,
            final_equity,
            periods_per_year,
            candles_processed: counters.candles_processed,
            missed_entries_due_to_cash: counters.missed_entries_due_to_cash,
            cancelled_orders: counters.cancelled_orders,
            metrics,
            trades,
            open_positions,
            equity_curve,
            adaptive_history,
            adaptive_summary,
        })
    }

    fn resolve_periods_per_year(&self, traded: &[&MarketData]) -> f64 {
        let first = traded.iter().min_by(|a, b| a.symbol().cmp(b.symbol()));
        if let Some(first) = first {
            if traded.iter().any(|d| d.timeframe() != first.timeframe()) {
                self.logger.warn(format!(
                    "Symbols use mixed timeframes; annualizing with {} from {}",
                    first.timeframe(),
                    first.symbol()
                ));
            }
        }
        self.config
            .resolve_periods_per_year(first.map(|d| d.timeframe()))
    }

    fn process_candle(
        &self,
        runner: &mut SymbolRunner,
        index: usize,
        reserved_cash: f64,
        portfolio: &mut Portfolio,
        counters: &mut RunCounters,
    ) -> EngineResult<()> {
        let candles = runner.candles;
        let candle = &candles[index];
        portfolio.mark(&runner.symbol, candle.close, candle.timestamp);

        if let Some(pipeline) = runner.pipeline.as_mut() {
            let scaled = pipeline.on_candle(candle);
            runner.strategy.apply_scaled_parameters(scaled);
        }

        self.match_pending_orders(runner, candle, portfolio)?;

        if portfolio.position(&runner.symbol).is_none() {
            if !runner.strategy.entry_signal_pending() {
                let available = portfolio.cash_balance() - reserved_cash;
                match self.try_enter(runner, index, available)? {
                    EntryOutcome::Skipped { reason, details } => {
                        if reason == SKIP_INSUFFICIENT_CASH {
                            counters.missed_entries_due_to_cash += 1;
                        }
                        self.logger.warn(format!(
                            "{} entry skipped: {}{}",
                            runner.symbol,
                            reason,
                            details.map(|d| format!(" ({})", d)).unwrap_or_default()
                        ));
                    }
                    EntryOutcome::Armed { orders } => {
                        self.logger.debug(format!(
                            "{} grid armed with {} orders at {}",
                            runner.symbol, orders, candle.timestamp
                        ));
                    }
                    EntryOutcome::NoSignal => {}
                }
            } else {
                self.expire_stale_grid(runner, index, counters);
            }
            return Ok(());
        }

        self.evaluate_exit(runner, candle, portfolio, counters)
    }

    fn match_pending_orders(
        &self,
        runner: &mut SymbolRunner,
        candle: &Candle,
        portfolio: &mut Portfolio,
    ) -> EngineResult<usize> {
        if runner.pending.is_empty() {
            return Ok(0);
        }
        let mut still_pending = Vec::with_capacity(runner.pending.len());
        let mut filled = 0;
        for mut order in std::mem::take(&mut runner.pending) {
            match self.executor.execute_limit_order(&mut order, candle)? {
                Some(fill) => {
                    self.logger.fill(&fill);
                    let position = portfolio.apply_entry_fill(order.clone())?;
                    runner.strategy.on_entry_filled(&order, position)?;
                    filled += 1;
                }
                None => still_pending.push(order),
            }
        }
        runner.pending = still_pending;
        Ok(filled)
    }

    fn try_enter(
        &self,
        runner: &mut SymbolRunner,
        index: usize,
        available_cash: f64,
    ) -> EngineResult<EntryOutcome> {
        let candles = runner.candles;
        let candle = &candles[index];
        let signal = match runner.strategy.analyze(&candles[..=index]) {
            Some(signal) => signal,
            None => return Ok(EntryOutcome::NoSignal),
        };

        let size = runner
            .strategy
            .position_size(self.config.initial_balance, signal.price);
        if size <= 0.0 {
            runner.strategy.reset();
            return Ok(EntryOutcome::Skipped {
                reason: "zero position size",
                details: None,
            });
        }

        let required = size
            * signal.price
            * (1.0 + self.config.slippage_rate())
            * (1.0 + self.executor.maker_fee_rate());
        if required > available_cash {
            runner.strategy.reset();
            return Ok(EntryOutcome::Skipped {
                reason: SKIP_INSUFFICIENT_CASH,
                details: Some(format!("needs {:.2}, has {:.2}", required, available_cash)),
            });
        }

        let orders = runner
            .strategy
            .generate_orders(signal.price, size, candle.timestamp)?;
        let count = orders.len();
        runner.pending.extend(orders);
        runner.armed_at = Some(index);
        self.logger.info(format!(
            "{} {} entry signal at {:.8} (volatility {:.3}%), size {:.8}",
            signal.symbol, signal.direction, signal.price, signal.volatility, size
        ));
        Ok(EntryOutcome::Armed { orders: count })
    }

    fn expire_stale_grid(&self, runner: &mut SymbolRunner, index: usize, counters: &mut RunCounters) {
        let timeout = match runner.strategy.order_timeout_candles() {
            Some(timeout) => timeout,
            None => return,
        };
        let armed_at = match runner.armed_at {
            Some(armed_at) => armed_at,
            None => return,
        };
        if runner.strategy.state() != StrategyState::Idle || index - armed_at < timeout {
            return;
        }
        let cancelled = runner.cancel_pending();
        counters.cancelled_orders += cancelled;
        runner.strategy.reset();
        self.logger.info(format!(
            "{} grid expired unfilled after {} candles, cancelled {} orders",
            runner.symbol, timeout, cancelled
        ));
    }

    fn evaluate_exit(
        &self,
        runner: &mut SymbolRunner,
        candle: &Candle,
        portfolio: &mut Portfolio,
        counters: &mut RunCounters,
    ) -> EngineResult<()> {
        let signal = {
            let position = portfolio
                .position(&runner.symbol)
                .ok_or_else(|| EngineError::NoOpenPosition(runner.symbol.clone()))?;
            if position.entry_orders.is_empty() {
                return Ok(());
            }
            let equity = portfolio.total_equity();
            runner
                .strategy
                .check_exit(position, candle.close, equity, candle.timestamp)?
        };
        let signal = match signal {
            Some(signal) => signal,
            None => return Ok(()),
        };

        let mut exit_order = signal.order.clone();
        let fill = self.executor.execute_market_order(&mut exit_order, candle)?;
        self.logger.fill(&fill);
        runner.strategy.on_exit_filled(&exit_order)?;
        let trade = portfolio.close_position(&runner.symbol, &exit_order, signal.reason)?;

        let cancelled = runner.cancel_pending();
        counters.cancelled_orders += cancelled;
        runner.strategy.reset();
        self.logger.exit(&runner.symbol, &signal, &trade);
        if cancelled > 0 {
            self.logger.debug(format!(
                "{} cancelled {} unfilled grid orders on exit",
                runner.symbol, cancelled
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::GridTradingStrategy;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::HashMap;

    fn ts(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn bar(hour: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(ts(hour), open, high, low, close, 1_000.0).unwrap()
    }

    fn flat_bar(hour: i64, price: f64) -> Candle {
        bar(hour, price, price, price, price)
    }

    fn series(symbol: &str, candles: Vec<Candle>) -> MarketData {
        MarketData::new(symbol, "1h", candles).unwrap()
    }

    fn frictionless() -> BacktestConfig {
        BacktestConfig {
            initial_balance: 10_000.0,
            maker_fee_percent: 0.0,
            taker_fee_percent: 0.0,
            slippage_percent: 0.0,
            periods_per_year: None,
            risk_free_rate_percent: 0.0,
            log_fills: false,
        }
    }

    fn params(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn single_level_grid() -> HashMap<String, f64> {
        params(&[
            ("gridLevels", 1.0),
            ("takeProfitPercent", 1.0),
            ("minVolatilityThreshold", 0.0),
            ("volatilityLookback", 2.0),
        ])
    }

    fn assert_snapshot_invariants(result: &BacktestResult) {
        for snapshot in &result.equity_curve {
            let mut expected = snapshot.cash_balance;
            for (symbol, position) in &snapshot.positions {
                let mark = snapshot.mark_prices[symbol];
                expected += position.cost_basis() + position.unrealized_pnl(mark);

                let quantity: f64 = position.entry_orders.iter().map(|o| o.filled_quantity).sum();
                let notional: f64 = position
                    .entry_orders
                    .iter()
                    .map(|o| o.filled_quantity * o.average_fill_price.unwrap())
                    .sum();
                assert!((position.quantity - quantity).abs() < 1e-9);
                assert!((position.entry_price - notional / quantity).abs() < 1e-9);
            }
            assert!((snapshot.total_equity - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn single_level_take_profit_closes_position() {
        let _ = env_logger::builder().is_test(true).try_init();
        let candles = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            bar(2, 100.0, 100.5, 99.5, 100.0),
            bar(3, 100.0, 101.5, 100.0, 101.2),
            flat_bar(4, 101.2),
        ];
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategies = vec![StrategyConfig::grid(
            "BTCUSDC",
            TradeDirection::Long,
            single_level_grid(),
        )];
        let result = engine.run(&[series("BTCUSDC", candles)], &strategies).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert!((trade.entry_price - 100.0).abs() < 1e-9);
        assert!((trade.exit_price - 101.2).abs() < 1e-9);
        assert!(trade.pnl_percent >= 1.0 - 1e-9);
        assert!((trade.quantity - 10.0).abs() < 1e-9);
        assert!(result.open_positions.is_empty());
        assert!((result.final_equity - 10_012.0).abs() < 1e-6);
        assert_eq!(result.equity_curve.len(), 5);
        assert_eq!(result.candles_processed, 5);
        assert!(result.equity_curve[3].positions.is_empty());
        assert_snapshot_invariants(&result);
    }

    #[test]
    fn strategy_re_enters_after_take_profit() {
        let candles = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            bar(2, 100.0, 101.5, 100.0, 101.2),
            flat_bar(3, 101.2),
            flat_bar(4, 101.2),
            bar(5, 101.2, 102.5, 101.2, 102.3),
            flat_bar(6, 102.3),
        ];
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategies = vec![StrategyConfig::grid(
            "BTCUSDC",
            TradeDirection::Long,
            single_level_grid(),
        )];
        let result = engine.run(&[series("BTCUSDC", candles)], &strategies).unwrap();

        assert_eq!(result.trades.len(), 2);
        let (first, second) = (&result.trades[0], &result.trades[1]);
        assert!(result
            .trades
            .iter()
            .all(|t| t.exit_reason == ExitReason::TakeProfit));
        assert_ne!(first.id, second.id);
        assert!((first.entry_price - 100.0).abs() < 1e-9);
        assert!((second.entry_price - 101.2).abs() < 1e-9);
        assert_eq!(first.entry_time, ts(1));
        assert_eq!(first.exit_time, ts(2));
        assert_eq!(second.entry_time, ts(4));
        assert_eq!(second.exit_time, ts(5));
        // the second grid is sized from the initial balance at the new reference
        assert!((second.quantity - 1_000.0 / 101.2).abs() < 1e-9);
        assert!(result.open_positions.is_empty());
        assert_eq!(result.equity_curve[6].pending_orders, 1);
        assert_snapshot_invariants(&result);
    }

    #[test]
    fn take_profit_closes_winning_short() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategies = vec![StrategyConfig::grid(
            "BTCUSDC",
            TradeDirection::Short,
            single_level_grid(),
        )];
        let candles = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            bar(2, 100.0, 100.0, 98.5, 98.8),
            flat_bar(3, 98.8),
        ];
        let result = engine.run(&[series("BTCUSDC", candles)], &strategies).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.direction, TradeDirection::Short);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert!((trade.entry_price - 100.0).abs() < 1e-9);
        assert!((trade.exit_price - 98.8).abs() < 1e-9);
        assert!((trade.pnl - 12.0).abs() < 1e-9);
        assert!((trade.pnl_percent - 1.2).abs() < 1e-9);
        assert!(result.open_positions.is_empty());
        assert!((result.final_equity - 10_012.0).abs() < 1e-6);
        assert_snapshot_invariants(&result);
    }

    #[test]
    fn flat_prices_never_trade() {
        let candles: Vec<Candle> = (0..40).map(|h| flat_bar(h, 50.0)).collect();
        let engine = BacktestEngine::new(BacktestConfig::default()).unwrap();
        let strategies = vec![StrategyConfig::grid("ETHUSDC", TradeDirection::Long, HashMap::new())];
        let result = engine.run(&[series("ETHUSDC", candles)], &strategies).unwrap();
        assert!(result.trades.is_empty());
        assert!(result.open_positions.is_empty());
        assert_eq!(result.final_equity, 10_000.0);
        assert!(result
            .equity_curve
            .iter()
            .all(|s| s.total_equity == 10_000.0 && s.pending_orders == 0));
    }

    fn choppy_candles(count: i64) -> Vec<Candle> {
        (0..count)
            .map(|h| {
                let close = if h % 2 == 0 { 100.0 } else { 97.0 };
                bar(h, close, close * 1.005, close * 0.97, close)
            })
            .collect()
    }

    #[test]
    fn averaging_and_equity_identity_hold_every_candle() {
        let mut config = BacktestConfig::default();
        config.maker_fee_percent = 0.1;
        config.taker_fee_percent = 0.2;
        config.slippage_percent = 0.05;
        let engine = BacktestEngine::new(config).unwrap();
        let strategies = vec![StrategyConfig::grid(
            "BTCUSDC",
            TradeDirection::Long,
            params(&[
                ("gridLevels", 4.0),
                ("gridSpacingPercent", 1.0),
                ("takeProfitPercent", 2.0),
                ("minVolatilityThreshold", 0.5),
                ("volatilityLookback", 5.0),
            ]),
        )];
        let result = engine
            .run(&[series("BTCUSDC", choppy_candles(60))], &strategies)
            .unwrap();
        assert!(result
            .equity_curve
            .iter()
            .any(|s| s.positions.values().any(|p| p.entry_orders.len() > 1)));
        assert_snapshot_invariants(&result);
        assert!(result.metrics.total_fees > 0.0);
    }

    #[test]
    fn entry_skipped_when_cash_is_short() {
        let mut config = frictionless();
        config.initial_balance = 1_000.0;
        let engine = BacktestEngine::new(config).unwrap();
        let mut parameters = single_level_grid();
        parameters.insert("allocationPercent".to_string(), 100.0);
        parameters.insert("takeProfitPercent".to_string(), 50.0);
        parameters.insert("maxDrawdownPercent".to_string(), 100.0);
        let first = StrategyConfig::grid("AAA", TradeDirection::Long, parameters.clone());
        let second = StrategyConfig::grid("BBB", TradeDirection::Long, parameters);

        let candles = vec![
            flat_bar(0, 10.0),
            bar(1, 10.0, 10.2, 9.8, 10.0),
            bar(2, 10.0, 10.2, 9.8, 10.0),
            bar(3, 10.0, 10.2, 9.8, 10.0),
        ];
        let result = engine
            .run(
                &[series("AAA", candles.clone()), series("BBB", candles)],
                &[first, second],
            )
            .unwrap();
        // AAA arms first and reserves all the cash, so every BBB signal is refused.
        assert!(result.missed_entries_due_to_cash >= 1);
        assert_eq!(result.open_positions.len(), 1);
        assert_eq!(result.open_positions[0].symbol, "AAA");
        assert!(engine.logger().warning_count() >= 1);
    }

    #[test]
    fn unfilled_grid_expires_after_timeout() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let mut parameters = single_level_grid();
        parameters.insert("orderTimeoutCandles".to_string(), 2.0);
        let strategies = vec![StrategyConfig::grid("BTCUSDC", TradeDirection::Long, parameters)];
        // Price runs away upward, so the level at the signal close is never touched.
        let candles = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 101.0, 101.0, 101.0, 101.0),
            bar(2, 102.0, 102.0, 102.0, 102.0),
            bar(3, 103.0, 103.0, 103.0, 103.0),
            bar(4, 104.0, 104.0, 104.0, 104.0),
        ];
        let result = engine.run(&[series("BTCUSDC", candles)], &strategies).unwrap();
        assert!(result.cancelled_orders >= 1);
        assert!(result.trades.is_empty());
        assert!(result.open_positions.is_empty());
    }

    #[test]
    fn stop_loss_closes_losing_short() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let mut parameters = single_level_grid();
        parameters.insert("allocationPercent".to_string(), 50.0);
        parameters.insert("maxDrawdownPercent".to_string(), 1.0);
        let strategies = vec![StrategyConfig::grid("BTCUSDC", TradeDirection::Short, parameters)];
        let candles = vec![
            flat_bar(0, 100.0),
            flat_bar(1, 100.0),
            bar(2, 100.0, 100.5, 99.5, 100.0),
            bar(3, 100.0, 100.5, 100.0, 100.5),
            bar(4, 100.5, 104.0, 100.5, 104.0),
        ];
        let result = engine.run(&[series("BTCUSDC", candles)], &strategies).unwrap();
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::StopLoss);
        assert!(result.trades[0].pnl < 0.0);
        assert_snapshot_invariants(&result);
    }

    #[test]
    fn adaptive_runs_record_history() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategies = vec![StrategyConfig::grid(
            "BTCUSDC",
            TradeDirection::Long,
            single_level_grid(),
        )
        .with_adaptive(AdaptiveParameterConfig::default())];
        let result = engine
            .run(&[series("BTCUSDC", choppy_candles(30))], &strategies)
            .unwrap();
        let history = &result.adaptive_history["BTCUSDC"];
        assert_eq!(history.len(), 30);
        assert_eq!(result.adaptive_summary["BTCUSDC"].samples, 30);
        assert!(history
            .entries
            .iter()
            .all(|e| e.parameters.scaling_factor >= 0.4 && e.parameters.scaling_factor <= 2.5));
        assert_snapshot_invariants(&result);
    }

    #[test]
    fn missing_market_data_is_rejected() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategy: BoxedStrategy = Box::new(
            GridTradingStrategy::from_parameters("SOLUSDC", TradeDirection::Long, &HashMap::new())
                .unwrap(),
        );
        let err = engine
            .run_with_strategies(
                &[series("BTCUSDC", vec![flat_bar(0, 1.0)])],
                vec![(strategy, None)],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingMarketData(symbol) if symbol == "SOLUSDC"));
    }

    #[test]
    fn symbols_run_on_merged_timeline() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let strategies = vec![
            StrategyConfig::grid("AAA", TradeDirection::Long, HashMap::new()),
            StrategyConfig::grid("BBB", TradeDirection::Long, HashMap::new()),
        ];
        let a = series("AAA", vec![flat_bar(0, 1.0), flat_bar(2, 1.0)]);
        let b = series("BBB", vec![flat_bar(1, 1.0), flat_bar(2, 1.0)]);
        let result = engine.run(&[a, b], &strategies).unwrap();
        assert_eq!(result.equity_curve.len(), 3);
        assert_eq!(result.candles_processed, 4);
        assert_eq!(result.start_time, Some(ts(0)));
        assert_eq!(result.end_time, Some(ts(2)));
        assert_eq!(result.periods_per_year, 8_760.0);
    }
}

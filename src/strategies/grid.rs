use crate::adaptive::{BaseParameters, ScaledParameters};
use crate::config::GridParams;
use crate::error::{EngineError, EngineResult};
use crate::indicators::trailing_return_volatility_percent;
use crate::models::*;
use crate::param_utils::unknown_params;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;

/// Places a ladder of limit orders below (LONG) or above (SHORT) the entry reference and exits
/// the averaged position on take profit or on an equity-relative loss limit.
#[derive(Debug, Clone, PartialEq)]
pub struct GridTradingStrategy {
    template_id: String,
    symbol: String,
    direction: TradeDirection,
    params: GridParams,
    state: StrategyState,
    entry_signal_generated: bool,
    position_id: Option<String>,
    entry_orders: Vec<Order>,
    exit_orders: Vec<Order>,
    scaled: Option<ScaledParameters>,
    // peak for LONG, trough for SHORT
    extreme_price: Option<f64>,
}

impl GridTradingStrategy {
    pub fn new(symbol: &str, direction: TradeDirection, params: GridParams) -> EngineResult<Self> {
        params.validate()?;
        if symbol.trim().is_empty() {
            return Err(EngineError::config("strategy symbol must not be empty"));
        }
        Ok(Self {
            template_id: "grid".to_string(),
            symbol: symbol.to_string(),
            direction,
            params,
            state: StrategyState::Idle,
            entry_signal_generated: false,
            position_id: None,
            entry_orders: Vec::new(),
            exit_orders: Vec::new(),
            scaled: None,
            extreme_price: None,
        })
    }

    pub fn from_parameters(
        symbol: &str,
        direction: TradeDirection,
        parameters: &HashMap<String, f64>,
    ) -> EngineResult<Self> {
        let unknown = unknown_params(parameters, &GridParams::KNOWN_KEYS);
        if !unknown.is_empty() {
            warn!(
                "Ignoring unknown grid parameters for {}: {}",
                symbol,
                unknown.join(", ")
            );
        }
        Self::new(symbol, direction, GridParams::from_parameters(parameters)?)
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn position_id(&self) -> Option<&str> {
        self.position_id.as_deref()
    }

    pub fn entry_orders(&self) -> &[Order] {
        &self.entry_orders
    }

    pub fn exit_orders(&self) -> &[Order] {
        &self.exit_orders
    }

    pub fn scaled_parameters(&self) -> Option<&ScaledParameters> {
        self.scaled.as_ref()
    }

    pub fn grid_spacing_percent(&self) -> f64 {
        self.scaled
            .as_ref()
            .map(|s| s.grid_spacing_percent)
            .unwrap_or(self.params.grid_spacing_percent)
    }

    pub fn take_profit_percent(&self) -> f64 {
        self.scaled
            .as_ref()
            .map(|s| s.take_profit_percent)
            .unwrap_or(self.params.take_profit_percent)
    }

    pub fn max_drawdown_percent(&self) -> f64 {
        self.scaled
            .as_ref()
            .map(|s| s.max_drawdown_percent)
            .unwrap_or(self.params.max_drawdown_percent)
    }

    /// Fraction of the initial balance committed to one position.
    pub fn allocation_fraction(&self) -> f64 {
        self.scaled
            .as_ref()
            .map(|s| s.order_volume)
            .unwrap_or(self.params.allocation_percent / 100.0)
    }

    fn level_price(&self, reference_price: f64, spacing: f64, level: usize) -> f64 {
        let offset = spacing * level as f64;
        match self.direction {
            TradeDirection::Long => reference_price * (1.0 - offset),
            TradeDirection::Short => reference_price * (1.0 + offset),
        }
    }

    fn track_extreme(&mut self, price: f64) -> f64 {
        let extreme = match (self.extreme_price, self.direction) {
            (None, _) => price,
            (Some(peak), TradeDirection::Long) => peak.max(price),
            (Some(trough), TradeDirection::Short) => trough.min(price),
        };
        self.extreme_price = Some(extreme);
        extreme
    }
}

impl super::Strategy for GridTradingStrategy {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn direction(&self) -> TradeDirection {
        self.direction
    }

    fn state(&self) -> StrategyState {
        self.state
    }

    fn entry_signal_pending(&self) -> bool {
        self.entry_signal_generated
    }

    fn base_parameters(&self) -> BaseParameters {
        BaseParameters {
            grid_spacing_percent: self.params.grid_spacing_percent,
            order_volume: self.params.allocation_percent / 100.0,
            take_profit_percent: self.params.take_profit_percent,
            max_drawdown_percent: self.params.max_drawdown_percent,
        }
    }

    fn apply_scaled_parameters(&mut self, scaled: ScaledParameters) {
        self.scaled = Some(scaled);
    }

    fn order_timeout_candles(&self) -> Option<usize> {
        self.params.order_timeout()
    }

    fn analyze(&mut self, candles: &[Candle]) -> Option<EntrySignal> {
        if self.state != StrategyState::Idle || self.entry_signal_generated {
            return None;
        }
        let last = candles.last()?;
        let volatility = trailing_return_volatility_percent(candles, self.params.volatility_lookback);
        if volatility < self.params.min_volatility_threshold {
            return None;
        }

        self.entry_signal_generated = true;
        debug!(
            "{} {} entry signal at {} (volatility {:.4}%)",
            self.symbol, self.direction, last.close, volatility
        );
        Some(EntrySignal {
            symbol: self.symbol.clone(),
            direction: self.direction,
            timestamp: last.timestamp,
            price: last.close,
            strength: (volatility / 10.0).min(1.0),
            volatility,
        })
    }

    fn position_size(&self, initial_balance: f64, reference_price: f64) -> f64 {
        if reference_price <= 0.0 || !reference_price.is_finite() {
            return 0.0;
        }
        let size = initial_balance * self.allocation_fraction() / reference_price;
        if size.is_finite() {
            size.max(0.0)
        } else {
            0.0
        }
    }

    fn generate_orders(
        &mut self,
        reference_price: f64,
        position_size: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<Vec<Order>> {
        if self.state != StrategyState::Idle || !self.entry_signal_generated {
            return Err(EngineError::contract(format!(
                "grid for {} requested without a pending entry signal",
                self.symbol
            )));
        }
        let levels = self.params.grid_levels;
        let spacing = self.grid_spacing_percent() / 100.0;
        let quantity = position_size / levels as f64;

        let mut orders = Vec::with_capacity(levels);
        for level in 0..levels {
            let price = self.level_price(reference_price, spacing, level);
            if price <= 0.0 {
                warn!(
                    "Skipping {} grid level {} at non-positive price {:.8} (spacing {:.4}%)",
                    self.symbol,
                    level,
                    price,
                    spacing * 100.0
                );
                continue;
            }
            orders.push(Order::limit(
                &self.symbol,
                self.direction,
                quantity,
                price,
                Some(level),
                timestamp,
            )?);
        }
        self.entry_orders = orders.clone();
        Ok(orders)
    }

    fn on_entry_filled(&mut self, order: &Order, position: &Position) -> EngineResult<()> {
        if order.symbol != self.symbol || order.direction != self.direction {
            return Err(EngineError::contract(format!(
                "{} {} strategy received a fill for {} {}",
                self.symbol, self.direction, order.symbol, order.direction
            )));
        }
        if let Some(existing) = self.entry_orders.iter_mut().find(|o| o.id == order.id) {
            *existing = order.clone();
        }
        if self.state == StrategyState::Idle {
            self.state = StrategyState::Active;
            self.position_id = Some(position.id.clone());
            self.extreme_price = order.average_fill_price;
        }
        Ok(())
    }

    fn on_exit_filled(&mut self, order: &Order) -> EngineResult<()> {
        if !order.reduce_only || order.status != OrderStatus::Filled || order.symbol != self.symbol
        {
            return Err(EngineError::contract(format!(
                "{} strategy cannot record order {} ({}) as a filled exit",
                self.symbol,
                order.id,
                order.status.as_str()
            )));
        }
        self.exit_orders.push(order.clone());
        Ok(())
    }

    fn check_exit(
        &mut self,
        position: &Position,
        current_price: f64,
        account_equity: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<Option<ExitSignal>> {
        if self.state != StrategyState::Active {
            return Err(EngineError::contract(format!(
                "exit check for {} while no position is open",
                self.symbol
            )));
        }
        if position.symbol != self.symbol || position.entry_orders.is_empty() {
            return Err(EngineError::contract(format!(
                "exit check for {} against position {} with {} entry orders",
                self.symbol,
                position.symbol,
                position.entry_orders.len()
            )));
        }

        let extreme = self.track_extreme(current_price);
        let drawdown_from_extreme_percent = if extreme > 0.0 {
            ((extreme - current_price) / extreme * 100.0 * self.direction.sign()).max(0.0)
        } else {
            0.0
        };
        let unrealized_pnl = position.unrealized_pnl(current_price);
        let pnl_percent = position.unrealized_pnl_percent(current_price);

        let reason = if pnl_percent >= self.take_profit_percent() {
            Some(ExitReason::TakeProfit)
        } else {
            let loss = (-unrealized_pnl).max(0.0);
            let loss_limit = account_equity * self.max_drawdown_percent() / 100.0;
            if loss > 0.0 && loss >= loss_limit {
                Some(ExitReason::StopLoss)
            } else {
                None
            }
        };

        let reason = match reason {
            Some(reason) => reason,
            None => return Ok(None),
        };
        let order = Order::market_exit(
            &self.symbol,
            self.direction,
            position.quantity,
            current_price,
            timestamp,
        )?;
        Ok(Some(ExitSignal {
            reason,
            price: current_price,
            unrealized_pnl,
            pnl_percent,
            drawdown_from_extreme_percent,
            order,
        }))
    }

    fn reset(&mut self) {
        self.state = StrategyState::Idle;
        self.position_id = None;
        self.entry_orders.clear();
        self.exit_orders.clear();
        self.entry_signal_generated = false;
        self.extreme_price = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::VolatilityLevel;
    use crate::strategy::Strategy;
    use chrono::{Duration, TimeZone};

    fn ts(index: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(index)
    }

    fn generate_candles(prices: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| Candle {
                timestamp: ts(i as i64),
                open: price,
                high: price * 1.01,
                low: price * 0.99,
                close: price,
                volume: 1_000.0,
            })
            .collect()
    }

    fn choppy_prices(count: usize) -> Vec<f64> {
        (0..count)
            .map(|i| if i % 2 == 0 { 100.0 } else { 103.0 })
            .collect()
    }

    fn strategy(direction: TradeDirection, params: GridParams) -> GridTradingStrategy {
        GridTradingStrategy::new("BTCUSDC", direction, params).unwrap()
    }

    fn fill(order: &Order, price: f64) -> Order {
        let mut filled = order.clone();
        filled.record_fill(price, 0.0, order.created_at).unwrap();
        filled
    }

    fn activate(strategy: &mut GridTradingStrategy, price: f64) -> Position {
        strategy.analyze(&generate_candles(&choppy_prices(30))).unwrap();
        let orders = strategy.generate_orders(price, 1.0, ts(30)).unwrap();
        let first = fill(&orders[0], price);
        let position = Position::open(first.clone()).unwrap();
        strategy.on_entry_filled(&first, &position).unwrap();
        position
    }

    #[test]
    fn flat_prices_never_signal() {
        let mut strategy = strategy(TradeDirection::Long, GridParams::default());
        let candles = generate_candles(&[100.0; 60]);
        for end in 1..=candles.len() {
            assert!(strategy.analyze(&candles[..end]).is_none());
        }
        assert!(!strategy.entry_signal_pending());
    }

    #[test]
    fn signal_latches_until_reset() {
        let mut strategy = strategy(TradeDirection::Long, GridParams::default());
        let candles = generate_candles(&choppy_prices(30));
        let signal = strategy.analyze(&candles).unwrap();
        assert_eq!(signal.price, 103.0);
        assert!(signal.strength > 0.0 && signal.strength <= 1.0);
        assert!(strategy.analyze(&candles).is_none());

        strategy.reset();
        assert!(strategy.analyze(&candles).is_some());
    }

    #[test]
    fn reset_is_idempotent() {
        let mut once = strategy(TradeDirection::Long, GridParams::default());
        activate(&mut once, 100.0);
        let mut twice = once.clone();

        once.reset();
        twice.reset();
        twice.reset();

        assert_eq!(once, twice);
        assert_eq!(twice.state(), StrategyState::Idle);
        assert!(twice.position_id().is_none());
        assert!(twice.entry_orders().is_empty());
        assert!(twice.exit_orders().is_empty());
        assert!(!twice.entry_signal_pending());
        assert!(twice.analyze(&generate_candles(&choppy_prices(30))).is_some());
    }

    #[test]
    fn long_grid_descends_from_reference() {
        let params = GridParams {
            grid_levels: 4,
            grid_spacing_percent: 1.0,
            ..GridParams::default()
        };
        let mut strategy = strategy(TradeDirection::Long, params);
        strategy.analyze(&generate_candles(&choppy_prices(30))).unwrap();
        let orders = strategy.generate_orders(200.0, 2.0, ts(0)).unwrap();

        let prices: Vec<f64> = orders.iter().map(|o| o.price).collect();
        let expected = [200.0, 198.0, 196.0, 194.0];
        for (price, expected) in prices.iter().zip(expected) {
            assert!((price - expected).abs() < 1e-9);
        }
        assert!(orders.iter().all(|o| (o.quantity - 0.5).abs() < 1e-12));
        assert!(orders.iter().all(|o| o.kind == OrderKind::Limit && o.is_pending()));
        assert_eq!(strategy.entry_orders().len(), 4);
    }

    #[test]
    fn short_grid_ascends_from_reference() {
        let params = GridParams {
            grid_levels: 3,
            grid_spacing_percent: 2.0,
            ..GridParams::default()
        };
        let mut strategy = strategy(TradeDirection::Short, params);
        strategy.analyze(&generate_candles(&choppy_prices(30))).unwrap();
        let orders = strategy.generate_orders(100.0, 3.0, ts(0)).unwrap();
        assert!((orders[1].price - 102.0).abs() < 1e-9);
        assert!((orders[2].price - 104.0).abs() < 1e-9);
        assert_eq!(orders[2].grid_level, Some(2));
    }

    #[test]
    fn grid_without_signal_is_a_contract_violation() {
        let mut strategy = strategy(TradeDirection::Long, GridParams::default());
        let err = strategy.generate_orders(100.0, 1.0, ts(0)).unwrap_err();
        assert!(matches!(err, EngineError::ContractViolation(_)));
    }

    #[test]
    fn adaptive_spacing_overrides_static() {
        let mut strategy = strategy(TradeDirection::Long, GridParams::default());
        strategy.apply_scaled_parameters(ScaledParameters {
            grid_spacing_percent: 2.0,
            order_volume: 0.05,
            take_profit_percent: 3.0,
            max_drawdown_percent: 4.0,
            volatility_level: VolatilityLevel::High,
            scaling_factor: 2.0,
            composite_volatility: 6.0,
            timestamp: ts(0),
        });
        strategy.analyze(&generate_candles(&choppy_prices(30))).unwrap();
        let orders = strategy.generate_orders(100.0, 5.0, ts(0)).unwrap();
        assert!((orders[1].price - 98.0).abs() < 1e-9);
        assert!((strategy.position_size(10_000.0, 100.0) - 5.0).abs() < 1e-9);
        assert_eq!(strategy.take_profit_percent(), 3.0);
        assert_eq!(
            strategy.scaled_parameters().map(|s| s.volatility_level),
            Some(VolatilityLevel::High)
        );
    }

    #[test]
    fn default_position_size_is_ten_percent() {
        let strategy = strategy(TradeDirection::Long, GridParams::default());
        assert!((strategy.position_size(10_000.0, 100.0) - 10.0).abs() < 1e-12);
        assert_eq!(strategy.position_size(10_000.0, 0.0), 0.0);
    }

    #[test]
    fn exit_check_while_idle_fails_loudly() {
        let mut idle = strategy(TradeDirection::Long, GridParams::default());
        let mut active = idle.clone();
        let position = activate(&mut active, 100.0);
        let err = idle.check_exit(&position, 100.0, 10_000.0, ts(31)).unwrap_err();
        assert!(matches!(err, EngineError::ContractViolation(_)));
    }

    #[test]
    fn take_profit_triggers_at_threshold() {
        let params = GridParams {
            take_profit_percent: 1.0,
            ..GridParams::default()
        };
        let mut strategy = strategy(TradeDirection::Long, params);
        let position = activate(&mut strategy, 100.0);
        assert_eq!(strategy.state(), StrategyState::Active);

        assert!(strategy
            .check_exit(&position, 100.5, 10_000.0, ts(31))
            .unwrap()
            .is_none());
        let exit = strategy
            .check_exit(&position, 101.0, 10_000.0, ts(32))
            .unwrap()
            .unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert!(exit.order.reduce_only);
        assert_eq!(exit.order.side(), OrderSide::Sell);
        assert!(strategy.exit_orders().is_empty());

        let err = strategy.on_exit_filled(&exit.order).unwrap_err();
        assert!(matches!(err, EngineError::ContractViolation(_)));
        strategy.on_exit_filled(&fill(&exit.order, 101.0)).unwrap();
        assert_eq!(strategy.exit_orders().len(), 1);
        assert_eq!(strategy.exit_orders()[0].status, OrderStatus::Filled);
    }

    #[test]
    fn zero_grid_levels_is_a_config_error() {
        let err = GridTradingStrategy::new(
            "BTCUSDC",
            TradeDirection::Long,
            GridParams {
                grid_levels: 0,
                ..GridParams::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn stop_loss_uses_equity_fraction() {
        let params = GridParams {
            max_drawdown_percent: 1.0,
            ..GridParams::default()
        };
        let mut strategy = strategy(TradeDirection::Short, params);
        // 0.2 units short from 100; the loss limit is 1% of 1,000 equity
        let position = activate(&mut strategy, 100.0);
        assert!((position.quantity - 0.2).abs() < 1e-12);
        assert!(strategy
            .check_exit(&position, 140.0, 1_000.0, ts(31))
            .unwrap()
            .is_none());
        let exit = strategy
            .check_exit(&position, 151.0, 1_000.0, ts(32))
            .unwrap()
            .unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert!((exit.drawdown_from_extreme_percent - 51.0).abs() < 1e-9);
    }

    #[test]
    fn profit_never_triggers_stop() {
        let params = GridParams {
            take_profit_percent: 100.0,
            max_drawdown_percent: 0.0,
            ..GridParams::default()
        };
        let mut strategy = strategy(TradeDirection::Long, params);
        let position = activate(&mut strategy, 100.0);
        assert!(strategy
            .check_exit(&position, 150.0, 10_000.0, ts(31))
            .unwrap()
            .is_none());
    }
}

use crate::adaptive::{BaseParameters, ScaledParameters};
use crate::config::StrategyConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use chrono::{DateTime, Utc};

/// Per-symbol trading logic driven by the backtest engine.
///
/// The engine calls `analyze` only while the strategy is idle with no pending entry, and
/// `check_exit` only while a position built from at least one fill is open. Calls outside
/// that protocol return `EngineError::ContractViolation`.
pub trait Strategy {
    fn template_id(&self) -> &str;
    fn symbol(&self) -> &str;
    fn direction(&self) -> TradeDirection;
    fn state(&self) -> StrategyState;
    fn entry_signal_pending(&self) -> bool;

    /// Values an adaptive engine scales from when one is attached.
    fn base_parameters(&self) -> BaseParameters;
    fn apply_scaled_parameters(&mut self, scaled: ScaledParameters);
    fn order_timeout_candles(&self) -> Option<usize> {
        None
    }

    fn analyze(&mut self, candles: &[Candle]) -> Option<EntrySignal>;
    fn position_size(&self, initial_balance: f64, reference_price: f64) -> f64;
    fn generate_orders(
        &mut self,
        reference_price: f64,
        position_size: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<Vec<Order>>;
    fn on_entry_filled(&mut self, order: &Order, position: &Position) -> EngineResult<()>;
    /// Records the filled reduce-only order that closed the position, before `reset`.
    fn on_exit_filled(&mut self, order: &Order) -> EngineResult<()>;
    fn check_exit(
        &mut self,
        position: &Position,
        current_price: f64,
        account_equity: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<Option<ExitSignal>>;
    fn reset(&mut self);
}

#[path = "strategies/grid.rs"]
pub mod grid;

pub use grid::GridTradingStrategy;

pub fn create_strategy(config: &StrategyConfig) -> EngineResult<Box<dyn Strategy + Send + Sync>> {
    match config.template_id.as_str() {
        "grid" => Ok(Box::new(GridTradingStrategy::from_parameters(
            &config.symbol,
            config.direction,
            &config.parameters,
        )?)),
        other => Err(EngineError::config(format!(
            "Unknown strategy template: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn creates_grid_strategy() {
        let config = StrategyConfig::grid("BTCUSDC", TradeDirection::Short, HashMap::new());
        let strategy = create_strategy(&config).unwrap();
        assert_eq!(strategy.template_id(), "grid");
        assert_eq!(strategy.symbol(), "BTCUSDC");
        assert_eq!(strategy.direction(), TradeDirection::Short);
        assert_eq!(strategy.state(), StrategyState::Idle);
    }

    #[test]
    fn rejects_unknown_template() {
        let mut config = StrategyConfig::grid("BTCUSDC", TradeDirection::Long, HashMap::new());
        config.template_id = "martingale".to_string();
        assert!(create_strategy(&config).is_err());
    }
}

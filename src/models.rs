use crate::adaptive::{AdaptiveHistory, AdaptiveSummary};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> EngineResult<Self> {
        let candle = Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Checks the OHLC envelope: every price positive and finite, open and close inside
    /// `[low, high]`, volume non-negative.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidCandle {
            timestamp: self.timestamp,
            reason,
        };
        for (label, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{} must be positive and finite (got {})", label, value)));
            }
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(invalid(format!(
                "volume must be non-negative and finite (got {})",
                self.volume
            )));
        }
        if self.low > self.high {
            return Err(invalid(format!("low {} above high {}", self.low, self.high)));
        }
        if self.open < self.low || self.open > self.high {
            return Err(invalid(format!(
                "open {} outside [{}, {}]",
                self.open, self.low, self.high
            )));
        }
        if self.close < self.low || self.close > self.high {
            return Err(invalid(format!(
                "close {} outside [{}, {}]",
                self.close, self.low, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
        }
    }

    /// +1 for long, -1 for short. Multiplies a price move into P&L.
    pub fn sign(&self) -> f64 {
        match self {
            TradeDirection::Long => 1.0,
            TradeDirection::Short => -1.0,
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(TradeDirection::Long),
            "short" | "sell" => Ok(TradeDirection::Short),
            other => Err(EngineError::config(format!(
                "direction must be LONG or SHORT (value: {})",
                other
            ))),
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeDirection::Long => write!(f, "LONG"),
            TradeDirection::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub direction: TradeDirection,
    pub kind: OrderKind,
    /// Exit orders reduce the position instead of adding to it.
    pub reduce_only: bool,
    pub quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub grid_level: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub filled_quantity: f64,
    pub average_fill_price: Option<f64>,
    pub commission: f64,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn limit(
        symbol: &str,
        direction: TradeDirection,
        quantity: f64,
        price: f64,
        grid_level: Option<usize>,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Self> {
        Self::build(
            symbol,
            direction,
            OrderKind::Limit,
            false,
            quantity,
            price,
            grid_level,
            created_at,
        )
    }

    /// Market order closing a position. `reference_price` is the price the order was decided
    /// at; the fill price is set by the executor.
    pub fn market_exit(
        symbol: &str,
        direction: TradeDirection,
        quantity: f64,
        reference_price: f64,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Self> {
        Self::build(
            symbol,
            direction,
            OrderKind::Market,
            true,
            quantity,
            reference_price,
            None,
            created_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        symbol: &str,
        direction: TradeDirection,
        kind: OrderKind,
        reduce_only: bool,
        quantity: f64,
        price: f64,
        grid_level: Option<usize>,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Self> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: format!("quantity must be positive (got {})", quantity),
            });
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: format!("price must be positive (got {})", price),
            });
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction,
            kind,
            reduce_only,
            quantity,
            price,
            status: OrderStatus::Pending,
            grid_level,
            created_at,
            filled_quantity: 0.0,
            average_fill_price: None,
            commission: 0.0,
            filled_at: None,
        })
    }

    pub fn side(&self) -> OrderSide {
        match (self.direction, self.reduce_only) {
            (TradeDirection::Long, false) | (TradeDirection::Short, true) => OrderSide::Buy,
            (TradeDirection::Long, true) | (TradeDirection::Short, false) => OrderSide::Sell,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    pub(crate) fn record_fill(
        &mut self,
        price: f64,
        commission: f64,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !self.is_pending() {
            return Err(EngineError::contract(format!(
                "order {} for {} is {} and cannot be filled",
                self.id,
                self.symbol,
                self.status.as_str()
            )));
        }
        self.filled_quantity = self.quantity;
        self.average_fill_price = Some(price);
        self.commission = commission;
        self.filled_at = Some(timestamp);
        self.status = OrderStatus::Filled;
        Ok(())
    }

    pub(crate) fn cancel(&mut self) {
        if self.is_pending() {
            self.status = OrderStatus::Cancelled;
        }
    }

    fn filled_price(&self) -> EngineResult<f64> {
        match (self.status, self.average_fill_price) {
            (OrderStatus::Filled, Some(price)) if self.filled_quantity > 0.0 => Ok(price),
            _ => Err(EngineError::contract(format!(
                "order {} for {} has no fill to book",
                self.id, self.symbol
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_orders: Vec<Order>,
    pub entry_fees: f64,
}

impl Position {
    /// Opens a position from its first filled entry order.
    pub fn open(order: Order) -> EngineResult<Self> {
        let price = order.filled_price()?;
        if order.reduce_only {
            return Err(EngineError::contract(format!(
                "exit order {} cannot open a position",
                order.id
            )));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            entry_price: price,
            quantity: order.filled_quantity,
            entry_time: order.filled_at.unwrap_or(order.created_at),
            entry_fees: order.commission,
            entry_orders: vec![order],
        })
    }

    /// Re-averages the entry price with another filled entry order and records it.
    pub fn add_entry_order(&mut self, order: Order) -> EngineResult<()> {
        let price = order.filled_price()?;
        if order.symbol != self.symbol || order.direction != self.direction || order.reduce_only
        {
            return Err(EngineError::contract(format!(
                "order {} ({} {}) cannot add to {} {} position",
                order.id, order.direction, order.symbol, self.direction, self.symbol
            )));
        }
        let total_quantity = self.quantity + order.filled_quantity;
        self.entry_price =
            (self.entry_price * self.quantity + price * order.filled_quantity) / total_quantity;
        self.quantity = total_quantity;
        self.entry_fees += order.commission;
        self.entry_orders.push(order);
        Ok(())
    }

    /// Volume-weighted fill price recomputed from the recorded entry orders.
    pub fn weighted_entry_price(&self) -> f64 {
        let (notional, quantity) = self
            .entry_orders
            .iter()
            .fold((0.0, 0.0), |(notional, quantity), order| {
                let price = order.average_fill_price.unwrap_or(0.0);
                (
                    notional + price * order.filled_quantity,
                    quantity + order.filled_quantity,
                )
            });
        if quantity > 0.0 {
            notional / quantity
        } else {
            0.0
        }
    }

    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.quantity
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity * self.direction.sign()
    }

    pub fn unrealized_pnl_percent(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (current_price - self.entry_price) / self.entry_price * 100.0 * self.direction.sign()
    }

    pub fn market_value(&self, current_price: f64) -> f64 {
        self.cost_basis() + self.unrealized_pnl(current_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_after_fees: f64,
    pub pnl_percent: f64,
    pub fees: f64,
    pub exit_reason: ExitReason,
    pub entry_fills: usize,
}

impl Trade {
    pub fn duration_hours(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 3600.0
    }

    pub fn is_win(&self) -> bool {
        self.pnl_after_fees > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: TradeDirection,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub strength: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub price: f64,
    pub unrealized_pnl: f64,
    pub pnl_percent: f64,
    /// Adverse move from the best price seen since the position opened.
    pub drawdown_from_extreme_percent: f64,
    /// Reduce-only market order closing the whole position.
    pub order: Order,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cash_balance: f64,
    pub total_equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fees: f64,
    pub positions: BTreeMap<String, Position>,
    pub mark_prices: BTreeMap<String, f64>,
    pub closed_trades: usize,
    pub pending_orders: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub average_win: f64,
    pub average_loss: f64,
    #[serde(with = "ratio_format")]
    pub profit_factor: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
    pub average_trade_duration_hours: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub total_fees: f64,
    pub final_equity: f64,
    pub total_return_percent: f64,
    pub annualized_return_percent: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub max_drawdown_duration: usize,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub recovery_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub initial_balance: f64,
    pub final_equity: f64,
    pub periods_per_year: f64,
    pub candles_processed: usize,
    pub missed_entries_due_to_cash: usize,
    pub cancelled_orders: usize,
    pub metrics: BacktestMetrics,
    pub trades: Vec<Trade>,
    pub open_positions: Vec<Position>,
    pub equity_curve: Vec<PortfolioSnapshot>,
    pub adaptive_history: BTreeMap<String, AdaptiveHistory>,
    pub adaptive_summary: BTreeMap<String, AdaptiveSummary>,
}

/// Serializes non-finite ratios as strings so JSON output keeps them.
pub mod ratio_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawRatio {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match RawRatio::deserialize(deserializer)? {
            RawRatio::Number(value) => Ok(value),
            RawRatio::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!(
                    "unrecognized ratio value {}",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn filled_order(direction: TradeDirection, quantity: f64, price: f64) -> Order {
        let mut order = Order::limit("BTCUSDC", direction, quantity, price, Some(0), ts(0)).unwrap();
        order.record_fill(price, quantity * price * 0.001, ts(1)).unwrap();
        order
    }

    #[test]
    fn candle_rejects_close_above_high() {
        let err = Candle::new(ts(0), 100.0, 101.0, 99.0, 102.0, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCandle { .. }));
        assert!(Candle::new(ts(0), 100.0, 101.0, 99.0, 101.0, 1.0).is_ok());
    }

    #[test]
    fn candle_rejects_non_positive_prices() {
        assert!(Candle::new(ts(0), 0.0, 1.0, 0.0, 1.0, 1.0).is_err());
        assert!(Candle::new(ts(0), 1.0, 1.0, 1.0, 1.0, -5.0).is_err());
    }

    #[test]
    fn order_rejects_non_positive_quantity_and_price() {
        assert!(Order::limit("ETH", TradeDirection::Long, 0.0, 10.0, None, ts(0)).is_err());
        assert!(Order::limit("ETH", TradeDirection::Long, 1.0, -1.0, None, ts(0)).is_err());
        assert!(Order::limit("ETH", TradeDirection::Long, f64::NAN, 1.0, None, ts(0)).is_err());
    }

    #[test]
    fn order_side_follows_direction_and_intent() {
        let entry = Order::limit("ETH", TradeDirection::Short, 1.0, 10.0, None, ts(0)).unwrap();
        let exit = Order::market_exit("ETH", TradeDirection::Short, 1.0, 10.0, ts(0)).unwrap();
        assert_eq!(entry.side(), OrderSide::Sell);
        assert_eq!(exit.side(), OrderSide::Buy);
    }

    #[test]
    fn filled_order_cannot_fill_again() {
        let mut order = filled_order(TradeDirection::Long, 1.0, 100.0);
        assert!(order.record_fill(99.0, 0.0, ts(2)).is_err());
    }

    #[test]
    fn position_averages_entry_price_over_fills() {
        let mut position = Position::open(filled_order(TradeDirection::Long, 1.0, 100.0)).unwrap();
        position
            .add_entry_order(filled_order(TradeDirection::Long, 3.0, 96.0))
            .unwrap();

        assert_eq!(position.entry_orders.len(), 2);
        assert!((position.quantity - 4.0).abs() < 1e-12);
        assert!((position.entry_price - 97.0).abs() < 1e-12);
        assert!((position.entry_price - position.weighted_entry_price()).abs() < 1e-12);
    }

    #[test]
    fn position_refuses_unfilled_or_mismatched_orders() {
        let mut position = Position::open(filled_order(TradeDirection::Long, 1.0, 100.0)).unwrap();
        let pending = Order::limit("BTCUSDC", TradeDirection::Long, 1.0, 90.0, None, ts(0)).unwrap();
        assert!(position.add_entry_order(pending).is_err());
        assert!(position
            .add_entry_order(filled_order(TradeDirection::Short, 1.0, 90.0))
            .is_err());
        assert_eq!(position.entry_orders.len(), 1);
    }

    #[test]
    fn short_position_pnl_is_inverted() {
        let position = Position::open(filled_order(TradeDirection::Short, 2.0, 50.0)).unwrap();
        assert!((position.unrealized_pnl(45.0) - 10.0).abs() < 1e-12);
        assert!((position.unrealized_pnl_percent(45.0) - 10.0).abs() < 1e-12);
        assert!((position.market_value(45.0) - 110.0).abs() < 1e-12);
    }

    #[test]
    fn infinite_profit_factor_survives_json() {
        let metrics = BacktestMetrics {
            profit_factor: f64::INFINITY,
            ..BacktestMetrics::default()
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"profitFactor\":\"inf\""));
        let decoded: BacktestMetrics = serde_json::from_str(&json).unwrap();
        assert!(decoded.profit_factor.is_infinite());
    }
}

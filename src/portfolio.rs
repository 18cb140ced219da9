use crate::error::{EngineError, EngineResult};
use crate::models::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Live account state of one backtest run.
///
/// Entry fills move their notional out of cash and into the position, so equity is cash plus
/// the marked value of every open position.
#[derive(Debug, Clone)]
pub struct Portfolio {
    initial_balance: f64,
    cash_balance: f64,
    positions: BTreeMap<String, Position>,
    closed_trades: Vec<Trade>,
    total_fees: f64,
    mark_prices: BTreeMap<String, f64>,
    timestamp: Option<DateTime<Utc>>,
}

impl Portfolio {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            cash_balance: initial_balance,
            positions: BTreeMap::new(),
            closed_trades: Vec::new(),
            total_fees: 0.0,
            mark_prices: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn cash_balance(&self) -> f64 {
        self.cash_balance
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed_trades
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn mark(&mut self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        self.mark_prices.insert(symbol.to_string(), price);
        self.timestamp = Some(timestamp);
    }

    pub fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.mark_prices.get(symbol).copied()
    }

    fn mark_for(&self, position: &Position) -> f64 {
        self.mark_price(&position.symbol)
            .unwrap_or(position.entry_price)
    }

    /// Books a filled entry order: pays its commission, moves its notional out of cash, and
    /// opens or re-averages the symbol's position.
    pub fn apply_entry_fill(&mut self, order: Order) -> EngineResult<&Position> {
        if order.reduce_only {
            return Err(EngineError::contract(format!(
                "exit order {} booked as an entry",
                order.id
            )));
        }
        let price = order.average_fill_price.ok_or_else(|| {
            EngineError::contract(format!("order {} has no fill price", order.id))
        })?;
        let notional = order.filled_quantity * price;
        let commission = order.commission;
        let symbol = order.symbol.clone();

        match self.positions.get_mut(&symbol) {
            Some(position) => position.add_entry_order(order)?,
            None => {
                let position = Position::open(order)?;
                self.positions.insert(symbol.clone(), position);
            }
        }
        self.cash_balance -= notional + commission;
        self.total_fees += commission;

        self.positions
            .get(&symbol)
            .ok_or_else(|| EngineError::NoOpenPosition(symbol.clone()))
    }

    /// Closes the symbol's position with a filled reduce-only order and records the trade.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_order: &Order,
        reason: ExitReason,
    ) -> EngineResult<Trade> {
        let position = self
            .positions
            .get(symbol)
            .ok_or_else(|| EngineError::NoOpenPosition(symbol.to_string()))?;
        let exit_price = match (exit_order.reduce_only, exit_order.average_fill_price) {
            (true, Some(price)) if exit_order.status == OrderStatus::Filled => price,
            _ => {
                return Err(EngineError::contract(format!(
                    "order {} is not a filled exit order",
                    exit_order.id
                )))
            }
        };
        if exit_order.symbol != symbol || exit_order.direction != position.direction {
            return Err(EngineError::contract(format!(
                "exit order {} ({} {}) does not match {} {} position",
                exit_order.id, exit_order.direction, exit_order.symbol, position.direction, symbol
            )));
        }
        if (exit_order.filled_quantity - position.quantity).abs() > 1e-9 * position.quantity.max(1.0) {
            return Err(EngineError::contract(format!(
                "exit order {} closes {} of {} {}",
                exit_order.id, exit_order.filled_quantity, position.quantity, symbol
            )));
        }

        let cost_basis = position.cost_basis();
        let pnl = (exit_price - position.entry_price) * position.quantity * position.direction.sign();
        let exit_fee = exit_order.commission;
        let fees = position.entry_fees + exit_fee;
        let pnl_percent = if cost_basis > 0.0 {
            pnl / cost_basis * 100.0
        } else {
            0.0
        };
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            entry_time: position.entry_time,
            exit_time: exit_order.filled_at.unwrap_or(exit_order.created_at),
            pnl,
            pnl_after_fees: pnl - fees,
            pnl_percent,
            fees,
            exit_reason: reason,
            entry_fills: position.entry_orders.len(),
        };

        self.cash_balance += cost_basis + pnl - exit_fee;
        self.total_fees += exit_fee;
        self.positions.remove(symbol);
        self.closed_trades.push(trade.clone());
        Ok(trade)
    }

    pub fn realized_pnl(&self) -> f64 {
        self.closed_trades.iter().map(|t| t.pnl_after_fees).sum()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.unrealized_pnl(self.mark_for(p)))
            .sum()
    }

    pub fn positions_value(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.market_value(self.mark_for(p)))
            .sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.cash_balance + self.positions_value()
    }

    pub fn snapshot(&self, timestamp: DateTime<Utc>, pending_orders: usize) -> PortfolioSnapshot {
        PortfolioSnapshot {
            timestamp,
            cash_balance: self.cash_balance,
            total_equity: self.total_equity(),
            realized_pnl: self.realized_pnl(),
            unrealized_pnl: self.unrealized_pnl(),
            total_fees: self.total_fees,
            positions: self.positions.clone(),
            mark_prices: self
                .mark_prices
                .iter()
                .filter(|(symbol, _)| self.positions.contains_key(*symbol))
                .map(|(symbol, price)| (symbol.clone(), *price))
                .collect(),
            closed_trades: self.closed_trades.len(),
            pending_orders,
        }
    }

    pub fn into_parts(self) -> (Vec<Trade>, Vec<Position>) {
        (self.closed_trades, self.positions.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn entry(direction: TradeDirection, quantity: f64, price: f64, commission: f64) -> Order {
        let mut order = Order::limit("BTCUSDC", direction, quantity, price, Some(0), ts(0)).unwrap();
        order.record_fill(price, commission, ts(1)).unwrap();
        order
    }

    fn exit(direction: TradeDirection, quantity: f64, price: f64, commission: f64) -> Order {
        let mut order = Order::market_exit("BTCUSDC", direction, quantity, price, ts(5)).unwrap();
        order.record_fill(price, commission, ts(5)).unwrap();
        order
    }

    fn assert_equity_identity(portfolio: &Portfolio) {
        let expected = portfolio.cash_balance()
            + portfolio
                .positions()
                .values()
                .map(|p| {
                    let mark = portfolio.mark_price(&p.symbol).unwrap_or(p.entry_price);
                    p.cost_basis() + p.unrealized_pnl(mark)
                })
                .sum::<f64>();
        assert!((portfolio.total_equity() - expected).abs() < 1e-9);
    }

    #[test]
    fn entry_fill_debits_notional_and_commission() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 10.0, 100.0, 1.0))
            .unwrap();
        assert!((portfolio.cash_balance() - 8_999.0).abs() < 1e-9);
        assert!((portfolio.total_fees() - 1.0).abs() < 1e-12);
        assert!((portfolio.total_equity() - 9_999.0).abs() < 1e-9);

        portfolio.mark("BTCUSDC", 105.0, ts(2));
        assert!((portfolio.unrealized_pnl() - 50.0).abs() < 1e-9);
        assert!((portfolio.total_equity() - 10_049.0).abs() < 1e-9);
        assert_equity_identity(&portfolio);
    }

    #[test]
    fn second_fill_reaverages_and_appends() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 1.0, 100.0, 0.0))
            .unwrap();
        let position = portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 1.0, 98.0, 0.0))
            .unwrap();
        assert_eq!(position.entry_orders.len(), 2);
        assert!((position.entry_price - 99.0).abs() < 1e-12);
        assert!((position.quantity - 2.0).abs() < 1e-12);
    }

    #[test]
    fn closing_long_records_trade_and_restores_cash() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 10.0, 100.0, 1.0))
            .unwrap();
        let trade = portfolio
            .close_position("BTCUSDC", &exit(TradeDirection::Long, 10.0, 101.0, 1.01), ExitReason::TakeProfit)
            .unwrap();

        assert!((trade.pnl - 10.0).abs() < 1e-9);
        assert!((trade.pnl_after_fees - (10.0 - 2.01)).abs() < 1e-9);
        assert!((trade.pnl_percent - 1.0).abs() < 1e-9);
        assert!(portfolio.positions().is_empty());
        assert!((portfolio.cash_balance() - (10_000.0 + 10.0 - 2.01)).abs() < 1e-9);
        assert!((portfolio.realized_pnl() - trade.pnl_after_fees).abs() < 1e-12);
        assert!((portfolio.total_equity() - portfolio.cash_balance()).abs() < 1e-12);
    }

    #[test]
    fn closing_short_credits_inverse_move() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Short, 2.0, 50.0, 0.0))
            .unwrap();
        let trade = portfolio
            .close_position("BTCUSDC", &exit(TradeDirection::Short, 2.0, 45.0, 0.0), ExitReason::TakeProfit)
            .unwrap();
        assert!((trade.pnl - 10.0).abs() < 1e-9);
        assert!((portfolio.cash_balance() - 1_010.0).abs() < 1e-9);
    }

    #[test]
    fn double_close_fails() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 1.0, 50.0, 0.0))
            .unwrap();
        let exit_order = exit(TradeDirection::Long, 1.0, 55.0, 0.0);
        portfolio
            .close_position("BTCUSDC", &exit_order, ExitReason::TakeProfit)
            .unwrap();
        let err = portfolio
            .close_position("BTCUSDC", &exit_order, ExitReason::TakeProfit)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoOpenPosition(_)));
        assert_eq!(portfolio.closed_trades().len(), 1);
    }

    #[test]
    fn partial_exit_is_rejected() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 2.0, 50.0, 0.0))
            .unwrap();
        let err = portfolio
            .close_position("BTCUSDC", &exit(TradeDirection::Long, 1.0, 55.0, 0.0), ExitReason::StopLoss)
            .unwrap_err();
        assert!(matches!(err, EngineError::ContractViolation(_)));
        assert!(portfolio.position("BTCUSDC").is_some());
    }

    #[test]
    fn snapshot_carries_marks_for_open_positions() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio.mark("ETHUSDC", 10.0, ts(0));
        portfolio
            .apply_entry_fill(entry(TradeDirection::Long, 1.0, 50.0, 0.5))
            .unwrap();
        portfolio.mark("BTCUSDC", 52.0, ts(3));
        let snapshot = portfolio.snapshot(ts(3), 4);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.mark_prices.get("BTCUSDC"), Some(&52.0));
        assert!(snapshot.mark_prices.get("ETHUSDC").is_none());
        assert_eq!(snapshot.pending_orders, 4);
        assert!((snapshot.total_equity - (949.5 + 52.0)).abs() < 1e-9);
    }
}

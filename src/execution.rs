use crate::config::BacktestConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Candle, Order, OrderKind, OrderSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub liquidity: Liquidity,
    pub timestamp: DateTime<Utc>,
}

/// Fills orders against a single candle.
///
/// Only the candle's extremes are consulted, never the path inside the bar, so a buy and a
/// sell resting on opposite sides of the same bar can both fill. Orders fill completely or not
/// at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderExecutor {
    maker_fee_rate: f64,
    taker_fee_rate: f64,
    slippage_rate: f64,
}

impl OrderExecutor {
    /// Rates are fractions (0.001 = 0.1%).
    pub fn new(maker_fee_rate: f64, taker_fee_rate: f64, slippage_rate: f64) -> EngineResult<Self> {
        for (label, rate) in [
            ("maker fee rate", maker_fee_rate),
            ("taker fee rate", taker_fee_rate),
            ("slippage rate", slippage_rate),
        ] {
            if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
                return Err(EngineError::config(format!(
                    "{} must be within [0, 1) (value: {})",
                    label, rate
                )));
            }
        }
        Ok(Self {
            maker_fee_rate,
            taker_fee_rate,
            slippage_rate,
        })
    }

    pub fn from_config(config: &BacktestConfig) -> EngineResult<Self> {
        Self::new(
            config.maker_fee_rate(),
            config.taker_fee_rate(),
            config.slippage_rate(),
        )
    }

    pub fn maker_fee_rate(&self) -> f64 {
        self.maker_fee_rate
    }

    pub fn taker_fee_rate(&self) -> f64 {
        self.taker_fee_rate
    }

    pub fn commission(&self, quantity: f64, price: f64, liquidity: Liquidity) -> f64 {
        let rate = match liquidity {
            Liquidity::Maker => self.maker_fee_rate,
            Liquidity::Taker => self.taker_fee_rate,
        };
        quantity * price * rate
    }

    fn apply_slippage(&self, price: f64, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => price * (1.0 + self.slippage_rate),
            OrderSide::Sell => price * (1.0 - self.slippage_rate),
        }
    }

    /// Price a resting limit order would fill at on this candle, before slippage.
    pub fn limit_touch_price(order: &Order, candle: &Candle) -> Option<f64> {
        match order.side() {
            OrderSide::Buy if candle.low <= order.price => Some(order.price.min(candle.close)),
            OrderSide::Sell if candle.high >= order.price => Some(order.price.max(candle.close)),
            _ => None,
        }
    }

    /// Fills `order` in place when the candle reaches its limit price.
    pub fn execute_limit_order(
        &self,
        order: &mut Order,
        candle: &Candle,
    ) -> EngineResult<Option<Fill>> {
        if order.kind != OrderKind::Limit {
            return Err(EngineError::contract(format!(
                "order {} is not a limit order",
                order.id
            )));
        }
        if !order.is_pending() {
            return Err(EngineError::contract(format!(
                "order {} for {} is {} and cannot be matched",
                order.id,
                order.symbol,
                order.status.as_str()
            )));
        }
        let touch = match Self::limit_touch_price(order, candle) {
            Some(price) => price,
            None => return Ok(None),
        };
        self.fill(order, touch, Liquidity::Maker, candle.timestamp)
            .map(Some)
    }

    /// Fills a market order at the candle close.
    pub fn execute_market_order(&self, order: &mut Order, candle: &Candle) -> EngineResult<Fill> {
        if order.kind != OrderKind::Market {
            return Err(EngineError::contract(format!(
                "order {} is not a market order",
                order.id
            )));
        }
        self.fill(order, candle.close, Liquidity::Taker, candle.timestamp)
    }

    fn fill(
        &self,
        order: &mut Order,
        base_price: f64,
        liquidity: Liquidity,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<Fill> {
        let side = order.side();
        let price = self.apply_slippage(base_price, side);
        let quantity = order.remaining_quantity();
        let commission = self.commission(quantity, price, liquidity);
        order.record_fill(price, commission, timestamp)?;
        Ok(Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side,
            quantity,
            price,
            commission,
            liquidity,
            timestamp,
        })
    }
}

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures raised by the simulation core.
///
/// Input problems are reported at construction time; contract violations mean a caller drove
/// the strategy or portfolio out of order and are never swallowed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid candle at {timestamp}: {reason}")]
    InvalidCandle {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("candles for {symbol} are out of order at index {index} ({current} does not follow {previous})")]
    UnorderedCandles {
        symbol: String,
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("invalid order for {symbol}: {reason}")]
    InvalidOrder { symbol: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no market data for {0}")]
    MissingMarketData(String),

    #[error("no open position for {0}")]
    NoOpenPosition(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        EngineError::ContractViolation(message.into())
    }
}

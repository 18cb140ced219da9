pub mod backtest;
pub mod generate_market_data;
pub mod inspect_market_data;

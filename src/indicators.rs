use crate::models::Candle;

/// Simple close-to-close returns. Pairs with a non-positive previous close are skipped.
pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by n).
pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = mean(values);
    values.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn population_std_dev(values: &[f64]) -> f64 {
    population_variance(values).max(0.0).sqrt()
}

pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Band width of Bollinger bands over the trailing `period` closes, as a percent of the
/// middle band: `std_dev * σ / mean * 100`.
pub fn bollinger_bandwidth_percent(closes: &[f64], period: usize, std_dev: f64) -> f64 {
    if period == 0 || closes.len() < period {
        return 0.0;
    }
    let window = &closes[closes.len() - period..];
    let middle = mean(window);
    if middle <= 0.0 {
        return 0.0;
    }
    std_dev * population_std_dev(window) / middle * 100.0
}

/// Mean true range over the trailing `period` bars. Needs `period + 1` bars.
pub fn average_true_range(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let len = closes.len();
    if period == 0 || len < period + 1 || highs.len() != len || lows.len() != len {
        return 0.0;
    }
    let start = len - period;
    let sum: f64 = (start..len)
        .map(|i| true_range(highs[i], lows[i], closes[i - 1]))
        .sum();
    sum / period as f64
}

/// Garman-Klass range estimator over the trailing `period` bars, as a percent.
pub fn garman_klass_percent(
    opens: &[f64],
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> f64 {
    let len = closes.len();
    if period == 0 || len < period || opens.len() != len || highs.len() != len || lows.len() != len
    {
        return 0.0;
    }
    let start = len - period;
    let close_open_weight = 2.0 * std::f64::consts::LN_2 - 1.0;
    let mut sum = 0.0;
    for i in start..len {
        if opens[i] <= 0.0 || lows[i] <= 0.0 {
            return 0.0;
        }
        let log_hl = (highs[i] / lows[i]).ln();
        let log_co = (closes[i] / opens[i]).ln();
        sum += 0.5 * log_hl * log_hl - close_open_weight * log_co * log_co;
    }
    (sum / period as f64).abs().sqrt() * 100.0
}

/// Population standard deviation of the last `lookback` simple returns, in percent.
pub fn trailing_return_volatility_percent(candles: &[Candle], lookback: usize) -> f64 {
    if candles.len() < 2 || lookback == 0 {
        return 0.0;
    }
    let start = candles.len().saturating_sub(lookback + 1);
    let closes: Vec<f64> = candles[start..].iter().map(|c| c.close).collect();
    let returns = simple_returns(&closes);
    if returns.is_empty() {
        return 0.0;
    }
    population_std_dev(&returns) * 100.0
}

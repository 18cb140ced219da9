use crate::models::*;
use statrs::statistics::Statistics;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DrawdownInfo {
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    /// Candles from the peak to the trough of the deepest percentage drawdown.
    pub duration: usize,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_metrics(
        trades: &[Trade],
        equity_curve: &[PortfolioSnapshot],
        initial_balance: f64,
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> BacktestMetrics {
        let total_trades = trades.len();
        let mut winning_pnls = Vec::new();
        let mut losing_pnls = Vec::new();
        for trade in trades {
            if trade.is_win() {
                winning_pnls.push(trade.pnl_after_fees);
            } else if trade.pnl_after_fees < 0.0 {
                losing_pnls.push(trade.pnl_after_fees);
            }
        }
        let winning_trades = winning_pnls.len();
        let losing_trades = losing_pnls.len();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let gross_profit: f64 = winning_pnls.iter().sum();
        let gross_loss: f64 = losing_pnls.iter().map(|pnl| pnl.abs()).sum();
        let net_profit: f64 = trades.iter().map(|t| t.pnl_after_fees).sum();

        let trade_percents: Vec<f64> = trades.iter().map(|t| t.pnl_percent).collect();
        let best_trade_percent = Self::finite_or_zero(
            trade_percents
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
        );
        let worst_trade_percent =
            Self::finite_or_zero(trade_percents.iter().copied().fold(f64::INFINITY, f64::min));
        let durations: Vec<f64> = trades.iter().map(|t| t.duration_hours()).collect();
        let (max_consecutive_wins, max_consecutive_losses) = Self::calculate_streaks(trades);

        let equity: Vec<f64> = equity_curve.iter().map(|s| s.total_equity).collect();
        let final_equity = equity.last().copied().unwrap_or(initial_balance);
        let total_fees = equity_curve
            .last()
            .map(|s| s.total_fees)
            .unwrap_or_else(|| trades.iter().map(|t| t.fees).sum());
        let total_return_percent = if initial_balance > 0.0 {
            (final_equity - initial_balance) / initial_balance * 100.0
        } else {
            0.0
        };
        let annualized_return_percent = Self::calculate_annualized_return_percent(
            initial_balance,
            final_equity,
            equity.len().saturating_sub(1),
            periods_per_year,
        );

        let returns = Self::period_returns(&equity);
        let drawdown = Self::calculate_max_drawdown(&equity);

        BacktestMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            gross_profit,
            gross_loss,
            net_profit,
            average_win: Self::average(&winning_pnls),
            average_loss: Self::average(&losing_pnls),
            profit_factor: Self::calculate_profit_factor(gross_profit, gross_loss),
            best_trade_percent,
            worst_trade_percent,
            average_trade_duration_hours: Self::average(&durations),
            max_consecutive_wins,
            max_consecutive_losses,
            total_fees,
            final_equity,
            total_return_percent,
            annualized_return_percent,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_percent: drawdown.max_drawdown_percent,
            max_drawdown_duration: drawdown.duration,
            sharpe_ratio: Self::calculate_sharpe_ratio(&returns, periods_per_year, risk_free_rate),
            sortino_ratio: Self::calculate_sortino_ratio(&returns, periods_per_year, risk_free_rate),
            calmar_ratio: Self::calculate_calmar_ratio(
                annualized_return_percent,
                drawdown.max_drawdown_percent,
            ),
            recovery_factor: if drawdown.max_drawdown > f64::EPSILON {
                net_profit / drawdown.max_drawdown
            } else {
                0.0
            },
        }
    }

    /// Infinite when there are profits and no losses, zero when there is neither.
    pub fn calculate_profit_factor(gross_profit: f64, gross_loss: f64) -> f64 {
        if gross_loss > f64::EPSILON {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    pub fn period_returns(equity: &[f64]) -> Vec<f64> {
        equity
            .windows(2)
            .map(|window| {
                if window[0] > 0.0 {
                    (window[1] - window[0]) / window[0]
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Per-period returns less `risk_free_rate / periods_per_year`, where the rate is
    /// annual and expressed as a fraction.
    fn excess_returns(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> Vec<f64> {
        let per_period = if periods_per_year > 0.0 {
            risk_free_rate / periods_per_year
        } else {
            0.0
        };
        returns.iter().map(|r| r - per_period).collect()
    }

    pub fn calculate_sharpe_ratio(
        returns: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let excess = Self::excess_returns(returns, periods_per_year, risk_free_rate);
        let mean_return = excess.iter().mean();
        let std_dev = excess.iter().std_dev();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return 0.0;
        }
        Self::finite_or_zero(mean_return / std_dev * periods_per_year.sqrt())
    }

    /// Uses the downside deviation `sqrt(mean(min(r - rf, 0)^2))` in place of sigma.
    pub fn calculate_sortino_ratio(
        returns: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let excess = Self::excess_returns(returns, periods_per_year, risk_free_rate);
        let mean_return = excess.iter().mean();
        let downside_deviation = (excess
            .iter()
            .map(|r| r.min(0.0).powi(2))
            .sum::<f64>()
            / excess.len() as f64)
            .sqrt();
        if downside_deviation <= f64::EPSILON {
            return 0.0;
        }
        Self::finite_or_zero(mean_return / downside_deviation * periods_per_year.sqrt())
    }

    pub fn calculate_calmar_ratio(annualized_return_percent: f64, max_drawdown_percent: f64) -> f64 {
        if !annualized_return_percent.is_finite() || !max_drawdown_percent.is_finite() {
            return 0.0;
        }
        if max_drawdown_percent.abs() <= f64::EPSILON {
            return 0.0;
        }
        annualized_return_percent / max_drawdown_percent.abs()
    }

    pub fn calculate_annualized_return_percent(
        initial_balance: f64,
        final_equity: f64,
        periods: usize,
        periods_per_year: f64,
    ) -> f64 {
        if initial_balance <= 0.0 || periods == 0 || periods_per_year <= 0.0 {
            return 0.0;
        }
        let ratio = final_equity / initial_balance;
        if !ratio.is_finite() {
            return 0.0;
        }
        if ratio <= 0.0 {
            return -100.0;
        }
        Self::finite_or_zero((ratio.powf(periods_per_year / periods as f64) - 1.0) * 100.0)
    }

    pub fn calculate_max_drawdown(equity: &[f64]) -> DrawdownInfo {
        let mut info = DrawdownInfo::default();
        let (mut peak_value, mut peak_index) = match equity.first() {
            Some(&first) => (first, 0usize),
            None => return info,
        };

        for (index, &value) in equity.iter().enumerate() {
            if value > peak_value {
                peak_value = value;
                peak_index = index;
                continue;
            }
            let drawdown = peak_value - value;
            let drawdown_percent = if peak_value > 0.0 {
                drawdown / peak_value * 100.0
            } else {
                0.0
            };
            if drawdown > info.max_drawdown {
                info.max_drawdown = drawdown;
            }
            if drawdown_percent > info.max_drawdown_percent {
                info.max_drawdown_percent = drawdown_percent;
                info.duration = index - peak_index;
            }
        }
        info
    }

    fn calculate_streaks(trades: &[Trade]) -> (usize, usize) {
        let mut max_wins = 0;
        let mut max_losses = 0;
        let mut wins = 0;
        let mut losses = 0;
        for trade in trades {
            if trade.is_win() {
                wins += 1;
                losses = 0;
            } else if trade.pnl_after_fees < 0.0 {
                losses += 1;
                wins = 0;
            } else {
                wins = 0;
                losses = 0;
            }
            max_wins = max_wins.max(wins);
            max_losses = max_losses.max(losses);
        }
        (max_wins, max_losses)
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn finite_or_zero(value: f64) -> f64 {
        if value.is_finite() {
            value
        } else {
            0.0
        }
    }
}

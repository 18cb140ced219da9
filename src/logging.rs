use crate::execution::Fill;
use crate::models::{ExitSignal, Trade};
use log::{debug, info, warn};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const RUN_LOG_TARGET: &str = "grid_backtester::run";

/// Logging handle owned by a single backtest run. Every record is tagged with the run id so
/// interleaved output from parallel runs stays attributable.
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    log_fills: bool,
    warnings: Arc<AtomicUsize>,
}

impl RunLogger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            log_fills: false,
            warnings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn for_new_run() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Fills log at info level when enabled, debug otherwise.
    pub fn with_fill_logging(mut self, enabled: bool) -> Self {
        self.log_fills = enabled;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn info(&self, message: impl Display) {
        info!(target: RUN_LOG_TARGET, "[{}] {}", self.run_id, message);
    }

    pub fn debug(&self, message: impl Display) {
        debug!(target: RUN_LOG_TARGET, "[{}] {}", self.run_id, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!(target: RUN_LOG_TARGET, "[{}] {}", self.run_id, message);
    }

    pub fn fill(&self, fill: &Fill) {
        let message = format!(
            "{} {:?} {:.8} @ {:.8} fee {:.8} ({:?})",
            fill.symbol, fill.side, fill.quantity, fill.price, fill.commission, fill.liquidity
        );
        if self.log_fills {
            self.info(message);
        } else {
            self.debug(message);
        }
    }

    pub fn exit(&self, symbol: &str, signal: &ExitSignal, trade: &Trade) {
        self.info(format!(
            "{} closed on {} at {:.8}: pnl {:.4} ({:.3}%), after fees {:.4}",
            symbol,
            signal.reason.as_str(),
            trade.exit_price,
            trade.pnl,
            trade.pnl_percent,
            trade.pnl_after_fees
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_warning_counter() {
        let _ = env_logger::builder().is_test(true).try_init();
        let logger = RunLogger::new("run-1").with_fill_logging(true);
        let clone = logger.clone();
        logger.warn("first");
        clone.warn("second");
        logger.info("not counted");
        assert_eq!(logger.warning_count(), 2);
        assert_eq!(clone.run_id(), "run-1");
    }

    #[test]
    fn new_runs_get_distinct_ids() {
        assert_ne!(RunLogger::for_new_run().run_id(), RunLogger::for_new_run().run_id());
    }
}

//! AutoEye Runner — scheduling, data sources and cycle orchestration.
//!
//! This crate builds on `autoeye-core` to provide:
//! - TOML configuration with defaults and validation
//! - Market data sources (CSV directory, in-memory)
//! - Per-pair scheduling on timeframe bar boundaries
//! - Cycle runner with a bounded worker pool and one writer per symbol
//! - JSONL change log
//! - CSV export and status summaries
//! - Replay backtests over a historical window

pub mod backtest;
pub mod changelog;
pub mod config;
pub mod cycle;
pub mod export;
pub mod scheduler;
pub mod source;

pub use backtest::{
    run_backtest, BacktestError, BacktestEvent, BacktestOptions, BacktestReport, BacktestSummary,
    Proposal,
};
pub use changelog::{cycle_id, ChangeLog, ChangeRecord, ElementChange};
pub use config::{AutoEyeConfig, ConfigError};
pub use cycle::{CycleError, CycleOptions, CycleReport, CycleRunner, PairReport, RunError};
pub use export::{export_elements_csv, export_symbol, store_status, SymbolStatus};
pub use scheduler::SchedulerContext;
pub use source::{BarWindow, CsvBarSource, MarketDataSource, MemorySource, Quote, SourceError};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_is_send_sync() {
        assert_send::<AutoEyeConfig>();
        assert_sync::<AutoEyeConfig>();
    }

    #[test]
    fn runner_is_send_sync() {
        assert_send::<CycleRunner>();
        assert_sync::<CycleRunner>();
        assert_send::<SchedulerContext>();
        assert_sync::<SchedulerContext>();
    }

    #[test]
    fn sources_are_send_sync() {
        assert_send::<CsvBarSource>();
        assert_sync::<CsvBarSource>();
        assert_send::<MemorySource>();
        assert_sync::<MemorySource>();
    }

    #[test]
    fn reports_are_send() {
        assert_send::<CycleReport>();
        assert_send::<CycleError>();
        assert_send::<ChangeRecord>();
        assert_sync::<PairReport>();
        assert_send::<BacktestReport>();
        assert_send::<BacktestError>();
    }
}

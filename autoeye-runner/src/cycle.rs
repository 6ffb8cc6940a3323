//! Cycle runner — one pass over every due (symbol, timeframe) pair.
//!
//! Symbols are processed in parallel on a bounded rayon pool. Each symbol is
//! owned by exactly one task, which fans out over its due timeframes, merges
//! every timeframe result into the symbol's snapshot, resolves trend and
//! scenarios, and replaces the snapshot file once. That task is the only
//! writer for the symbol.
//!
//! A pair that fails to fetch is left due and retried at the next tick; no
//! partial state is written for it. A failed snapshot write leaves the
//! previous file authoritative and every pair of that symbol due.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use autoeye_core::domain::{Element, Timeframe};
use autoeye_core::pipeline::{
    process_timeframe, select_mode, PairInput, PairOutcome, PipelineConfig, ScanMode, ScanWarning,
};
use autoeye_core::scenario;
use autoeye_core::snapshot::{Derived, Market, SymbolSnapshot, TimeframeState};
use autoeye_core::store::{StateStore, StoreError};
use autoeye_core::trend::{resolve_trend, TREND_TIMEFRAME};

use crate::changelog::{cycle_id, ChangeLog, ChangeRecord, ElementChange};
use crate::config::{AutoEyeConfig, ConfigError};
use crate::scheduler::SchedulerContext;
use crate::source::{BarWindow, MarketDataSource, SourceError};

/// Per-pair and per-symbol failures. None of these stop the cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("[{cycle}] {symbol} {timeframe}: data unavailable: {source}")]
    DataUnavailable {
        cycle: String,
        symbol: String,
        timeframe: Timeframe,
        #[source]
        source: SourceError,
    },

    #[error("[{cycle}] {symbol} {timeframe}: malformed bar sequence: {reason}")]
    MalformedBarSequence {
        cycle: String,
        symbol: String,
        timeframe: Timeframe,
        reason: String,
    },

    /// Warning only.
    #[error("[{cycle}] {symbol} {timeframe}: {warning}")]
    StaleRuleMismatch {
        cycle: String,
        symbol: String,
        timeframe: Timeframe,
        warning: ScanWarning,
    },

    #[error("[{cycle}] {symbol}: persistence failure: {source}")]
    PersistenceFailure {
        cycle: String,
        symbol: String,
        #[source]
        source: StoreError,
    },
}

impl CycleError {
    pub fn symbol(&self) -> &str {
        match self {
            CycleError::DataUnavailable { symbol, .. }
            | CycleError::MalformedBarSequence { symbol, .. }
            | CycleError::StaleRuleMismatch { symbol, .. }
            | CycleError::PersistenceFailure { symbol, .. } => symbol,
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        match self {
            CycleError::DataUnavailable { timeframe, .. }
            | CycleError::MalformedBarSequence { timeframe, .. }
            | CycleError::StaleRuleMismatch { timeframe, .. } => Some(*timeframe),
            CycleError::PersistenceFailure { .. } => None,
        }
    }
}

/// Hard failures: nothing was attempted.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("data source '{0}' is unreachable")]
    SourceUnreachable(String),

    #[error("no symbols to process")]
    NoSymbols,

    #[error("cannot build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("cannot prepare state directory: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one processed pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub mode: ScanMode,
    pub new_count: usize,
    pub status_updated_count: usize,
    pub total_active: usize,
    pub total_elements: usize,
    /// True when the symbol's snapshot was rewritten this cycle.
    pub written: bool,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub pairs: Vec<PairReport>,
    pub failures: Vec<CycleError>,
    pub warnings: Vec<CycleError>,
    pub symbols_written: usize,
    pub transitions_created: usize,
    pub deals_created: usize,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: SymbolReport) {
        self.pairs.extend(other.pairs);
        self.failures.extend(other.failures);
        self.warnings.extend(other.warnings);
        self.symbols_written += usize::from(other.written);
        self.transitions_created += other.transitions_created;
        self.deals_created += other.deals_created;
    }
}

/// What to process in a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOptions {
    /// Rebuild from full history instead of the incremental tail.
    pub force_full: bool,
    /// Restrict the cycle to these symbols.
    pub symbols: Option<Vec<String>>,
}

impl CycleOptions {
    pub fn full_scan() -> Self {
        Self {
            force_full: true,
            symbols: None,
        }
    }
}

#[derive(Debug, Default)]
struct SymbolReport {
    pairs: Vec<PairReport>,
    failures: Vec<CycleError>,
    warnings: Vec<CycleError>,
    written: bool,
    transitions_created: usize,
    deals_created: usize,
}

/// Long-lived runner: configuration, store, change log and schedule.
pub struct CycleRunner {
    config: AutoEyeConfig,
    pipeline: PipelineConfig,
    symbols: Vec<String>,
    store: StateStore,
    changelog: ChangeLog,
    scheduler: SchedulerContext,
    pool: rayon::ThreadPool,
}

impl CycleRunner {
    pub fn new(config: AutoEyeConfig) -> Result<Self, RunError> {
        config.validate()?;
        let symbols = config.symbols();
        if symbols.is_empty() {
            return Err(RunError::NoSymbols);
        }
        let timeframes = config.timeframes()?;
        let pipeline = config.pipeline_config()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.schedule.worker_threads)
            .build()?;

        Ok(Self {
            store: StateStore::new(&config.paths.state_dir),
            changelog: ChangeLog::new(&config.paths.state_dir),
            scheduler: SchedulerContext::new(&symbols, &timeframes),
            symbols,
            pipeline,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &AutoEyeConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    pub fn scheduler(&self) -> &SchedulerContext {
        &self.scheduler
    }

    /// Process every pair due at `now`.
    pub fn run_cycle(
        &self,
        source: &dyn MarketDataSource,
        now: DateTime<Utc>,
        options: &CycleOptions,
    ) -> Result<CycleReport, RunError> {
        if !source.is_available() {
            return Err(RunError::SourceUnreachable(source.name().to_string()));
        }
        self.store.ensure_schema_file(now)?;

        if let Some(only) = &options.symbols {
            if only.is_empty() {
                return Err(RunError::NoSymbols);
            }
        }
        if options.force_full {
            match &options.symbols {
                Some(only) => self.scheduler.mark_symbols_due(only),
                None => self.scheduler.mark_all_due(),
            }
        }
        let mut due = self.scheduler.due(now);
        if let Some(only) = &options.symbols {
            due.retain(|symbol, _| only.iter().any(|s| s == symbol));
        }

        let work: Vec<(String, Vec<Timeframe>)> = due.into_iter().collect();
        let results: Vec<SymbolReport> = self.pool.install(|| {
            work.par_iter()
                .map(|(symbol, timeframes)| {
                    self.process_symbol(source, symbol, timeframes, now, options.force_full)
                })
                .collect()
        });

        let mut report = CycleReport {
            started_at: Some(now),
            ..CycleReport::default()
        };
        for r in results {
            report.absorb(r);
        }

        info!(
            "cycle {}: {} pairs, {} failed, {} warnings, {} symbols written, {} transitions, {} deals",
            now.to_rfc3339(),
            report.pairs.len(),
            report.failures.len(),
            report.warnings.len(),
            report.symbols_written,
            report.transitions_created,
            report.deals_created,
        );
        Ok(report)
    }

    /// Poll until `cancel` is set or `max_cycles` have run.
    ///
    /// Only the first cycle honours `first_full`. Hard failures are logged
    /// and retried at the next tick.
    pub fn run_loop(
        &self,
        source: &dyn MarketDataSource,
        first_full: bool,
        cancel: Option<&AtomicBool>,
        max_cycles: Option<usize>,
    ) -> usize {
        let poll = self.config.schedule.poll_interval();
        let mut cycles = 0;
        let mut options = CycleOptions {
            force_full: first_full,
            symbols: None,
        };

        loop {
            if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                break;
            }
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            match self.run_cycle(source, Utc::now(), &options) {
                Ok(report) => {
                    for failure in &report.failures {
                        warn!("{failure}");
                    }
                }
                Err(e) => error!("cycle skipped: {e}"),
            }
            cycles += 1;
            options.force_full = false;

            // sleep in short slices so cancellation is prompt
            let mut slept = StdDuration::ZERO;
            while slept < poll && !cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                let step = StdDuration::from_millis(250).min(poll - slept);
                std::thread::sleep(step);
                slept += step;
            }
        }
        cycles
    }

    fn process_symbol(
        &self,
        source: &dyn MarketDataSource,
        symbol: &str,
        timeframes: &[Timeframe],
        now: DateTime<Utc>,
        force_full: bool,
    ) -> SymbolReport {
        let cycle = cycle_id(symbol, now);
        let mut report = SymbolReport::default();

        let claimed: Vec<Timeframe> = timeframes
            .iter()
            .copied()
            .filter(|tf| self.scheduler.try_begin(symbol, *tf))
            .collect();
        if claimed.is_empty() {
            return report;
        }

        let prior = match self.store.load(symbol) {
            Ok(p) => p,
            Err(source) => {
                error!("[{cycle}] {symbol}: cannot load snapshot: {source}");
                self.release_all(symbol, &claimed);
                report.failures.push(CycleError::PersistenceFailure {
                    cycle,
                    symbol: symbol.to_string(),
                    source,
                });
                return report;
            }
        };
        let base = prior
            .clone()
            .unwrap_or_else(|| SymbolSnapshot::new(symbol));

        let point_size = self
            .config
            .point_size(symbol)
            .or_else(|| source.point_size(symbol))
            .unwrap_or(0.0);

        let outcomes: Vec<(Timeframe, Result<PairOutcome, CycleError>)> = claimed
            .par_iter()
            .map(|tf| {
                let prior_state = base.timeframe(*tf).cloned().unwrap_or_default();
                let result = self.process_pair(
                    source,
                    &cycle,
                    symbol,
                    *tf,
                    &prior_state,
                    point_size,
                    now,
                    force_full,
                );
                (*tf, result)
            })
            .collect();

        let mut next = base.clone();
        let mut succeeded: Vec<(Timeframe, PairOutcome)> = Vec::new();
        let mut failed: Vec<Timeframe> = Vec::new();
        for (tf, result) in outcomes {
            match result {
                Ok(outcome) => {
                    for warning in &outcome.warnings {
                        let w = CycleError::StaleRuleMismatch {
                            cycle: cycle.clone(),
                            symbol: symbol.to_string(),
                            timeframe: tf,
                            warning: warning.clone(),
                        };
                        warn!("{w}");
                        report.warnings.push(w);
                    }
                    for (id, e) in &outcome.lifecycle_rejections {
                        warn!("[{cycle}] {symbol} {tf}: lifecycle rejected for {id}: {e}");
                    }
                    for rejected in &outcome.report.rejected {
                        warn!("[{cycle}] {symbol} {tf}: {rejected}");
                    }
                    next.timeframes.insert(tf, outcome.state.clone());
                    succeeded.push((tf, outcome));
                }
                Err(e) => {
                    warn!("{e}");
                    report.failures.push(e);
                    failed.push(tf);
                }
            }
        }

        next.market = match source.latest_price(symbol) {
            Ok(quote) => Market {
                price: Some(quote.price),
                tick_time: Some(quote.time),
            },
            Err(e) => {
                warn!("[{cycle}] {symbol}: no quote, keeping previous: {e}");
                base.market.clone()
            }
        };

        let prior_trend = base.derived.as_ref().map(|d| &d.trend);
        let trend = resolve_trend(next.timeframe(TREND_TIMEFRAME), prior_trend, now);
        let trend_direction = trend.direction;
        next.derived = Some(Derived { trend });

        let mut scenario_changes = Vec::new();
        if self.config.scenario.enabled {
            match scenario::build(
                base.scenarios.as_ref(),
                &next,
                trend_direction,
                &self.config.scenario,
                now,
            ) {
                Ok(outcome) => {
                    report.transitions_created = outcome.transitions_created;
                    report.deals_created = outcome.deals_created;
                    scenario_changes = outcome.changes;
                    next.scenarios = Some(outcome.book);
                }
                Err(e) => warn!("[{cycle}] {symbol}: scenarios not advanced: {e}"),
            }
        }

        let changed = prior.as_ref().map_or(true, |p| next.differs_from(p));
        if changed {
            next.updated_at = Some(now);
            if let Err(source) = self.store.save(&next) {
                error!("[{cycle}] {symbol}: snapshot write failed: {source}");
                self.release_all(symbol, &claimed);
                report.failures.push(CycleError::PersistenceFailure {
                    cycle,
                    symbol: symbol.to_string(),
                    source,
                });
                return report;
            }
            report.written = true;

            let record = change_record(&cycle, symbol, now, &succeeded, scenario_changes);
            if !record.is_empty() {
                if let Err(e) = self.changelog.append(&record) {
                    warn!("[{cycle}] {symbol}: change log append failed: {e}");
                }
            }
        }

        for tf in &failed {
            self.scheduler.release(symbol, *tf);
        }
        for (tf, outcome) in succeeded {
            self.scheduler.complete(symbol, tf, now);
            report.pairs.push(PairReport {
                symbol: symbol.to_string(),
                timeframe: tf,
                mode: outcome.mode,
                new_count: outcome.new_count(),
                status_updated_count: outcome.status_updated_count(),
                total_active: outcome.state.elements.active_count(),
                total_elements: outcome.state.elements.len(),
                written: report.written,
            });
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn process_pair(
        &self,
        source: &dyn MarketDataSource,
        cycle: &str,
        symbol: &str,
        timeframe: Timeframe,
        prior: &TimeframeState,
        point_size: f64,
        now: DateTime<Utc>,
        force_full: bool,
    ) -> Result<PairOutcome, CycleError> {
        let mode = select_mode(prior, force_full);
        let window = match mode {
            ScanMode::Full => {
                BarWindow::Since(now - Duration::days(self.config.schedule.full_scan_days()))
            }
            ScanMode::Incremental => BarWindow::Latest(self.config.schedule.incremental_bars),
        };
        debug!("[{cycle}] {symbol} {timeframe}: {mode} scan, window {window:?}");

        let bars = source
            .bars(symbol, timeframe, window)
            .map_err(|source| match source {
                SourceError::Malformed { reason, .. } => CycleError::MalformedBarSequence {
                    cycle: cycle.to_string(),
                    symbol: symbol.to_string(),
                    timeframe,
                    reason,
                },
                other => CycleError::DataUnavailable {
                    cycle: cycle.to_string(),
                    symbol: symbol.to_string(),
                    timeframe,
                    source: other,
                },
            })?;
        if bars.is_empty() {
            return Err(CycleError::DataUnavailable {
                cycle: cycle.to_string(),
                symbol: symbol.to_string(),
                timeframe,
                source: SourceError::Unavailable {
                    symbol: symbol.to_string(),
                    reason: "empty bar window".to_string(),
                },
            });
        }

        let input = PairInput {
            symbol,
            timeframe,
            bars: &bars,
            point_size,
        };
        process_timeframe(prior, input, &self.pipeline, mode, now).map_err(|e| {
            CycleError::MalformedBarSequence {
                cycle: cycle.to_string(),
                symbol: symbol.to_string(),
                timeframe,
                reason: e.to_string(),
            }
        })
    }

    fn release_all(&self, symbol: &str, timeframes: &[Timeframe]) {
        for tf in timeframes {
            self.scheduler.release(symbol, *tf);
        }
    }
}

fn change_record(
    cycle: &str,
    symbol: &str,
    now: DateTime<Utc>,
    outcomes: &[(Timeframe, PairOutcome)],
    scenarios: Vec<scenario::ScenarioChange>,
) -> ChangeRecord {
    let mut elements = Vec::new();
    for (tf, outcome) in outcomes {
        for (id, change) in outcome.report.changes() {
            let Some(element) = outcome.state.elements.get(id) else {
                continue;
            };
            elements.push(element_change(*tf, element, change));
        }
    }
    ChangeRecord {
        cycle_id: cycle.to_string(),
        symbol: symbol.to_string(),
        recorded_at: now,
        elements,
        scenarios,
    }
}

fn element_change(
    timeframe: Timeframe,
    element: &Element,
    change: autoeye_core::reconcile::ChangeKind,
) -> ElementChange {
    ElementChange {
        id: element.id.clone(),
        timeframe,
        element_type: element.element_type(),
        change,
        status: element.status_label().to_string(),
    }
}

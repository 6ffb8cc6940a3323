//! Replay backtest — step through a historical window one M15 close at a
//! time and record the scenarios the live engine would have produced.
//!
//! Each symbol keeps a rolling snapshot. At every step the M15 pair (and the
//! H1 pair, whenever another H1 bar has closed) goes through the same
//! pipeline a live cycle uses: a full scan over the warmup history on the
//! first step, incremental tails afterwards. Trend and scenarios are then
//! rebuilt on top of the previous step's book.
//!
//! Output lands in `<state_dir>/backtests/<run_id>/`:
//! - `proposals.jsonl`: one row per deal created during the replay
//! - `events.jsonl`: trend changes, created and expired scenarios, skips
//! - `summary.json`: counters for the whole run

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use autoeye_core::domain::{
    Bar, BarSequenceError, DealState, ElementId, ScenarioId, Timeframe, TransitionState,
};
use autoeye_core::pipeline::{process_timeframe, select_mode, PairInput, PipelineConfig, ScanMode};
use autoeye_core::reconcile::ChangeKind;
use autoeye_core::scenario::{
    self, DealSide, PriceZone, ScenarioBook, ScenarioKind, TakeProfit, TransitionKind,
    ANCHOR_TIMEFRAME, CONFIRM_TIMEFRAME,
};
use autoeye_core::snapshot::{Derived, Market, SymbolSnapshot, TimeframeState};
use autoeye_core::trend::{resolve_trend, TrendDirection, TREND_TIMEFRAME};

use crate::config::{AutoEyeConfig, ConfigError};
use crate::source::{BarWindow, MarketDataSource, SourceError};

pub const DEFAULT_WARMUP_BARS: usize = 500;
pub const MIN_WARMUP_BARS: usize = 20;

/// Fewest closed bars per timeframe before a step is evaluated.
const MIN_BARS: usize = 3;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("backtest end {end} is not after start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("invalid run id {0:?}")]
    InvalidRunId(String),

    #[error("no symbols to replay")]
    NoSymbols,

    #[error("market data source {0} is unreachable")]
    SourceUnreachable(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{timeframe}: malformed bar sequence: {source}")]
    Bars {
        timeframe: Timeframe,
        #[source]
        source: BarSequenceError,
    },

    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktestOptions {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Defaults to every configured symbol.
    pub symbols: Option<Vec<String>>,
    /// Defaults to `<SYMBOL|multi>_<start>_<end>`.
    pub run_id: Option<String>,
    /// M15 bars fetched before `start`; at least [`MIN_WARMUP_BARS`].
    pub warmup_bars: usize,
}

impl BacktestOptions {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            symbols: None,
            run_id: None,
            warmup_bars: DEFAULT_WARMUP_BARS,
        }
    }
}

/// One deal created during the replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub symbol: String,
    pub deal_id: ScenarioId,
    pub transition_id: ScenarioId,
    pub kind: Option<TransitionKind>,
    pub side: DealSide,
    pub trend_at_creation: Option<TrendDirection>,
    pub anchor_id: Option<ElementId>,
    pub confirmation_id: Option<ElementId>,
    pub entry: PriceZone,
    pub sl: f64,
    pub tp: Option<TakeProfit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BacktestEvent {
    SymbolSkipped {
        run_id: String,
        symbol: String,
        reason: String,
        m15_bars: usize,
        h1_bars: usize,
    },
    TrendChanged {
        run_id: String,
        symbol: String,
        time: DateTime<Utc>,
        trend: TrendDirection,
    },
    ScenarioCreated {
        run_id: String,
        symbol: String,
        time: DateTime<Utc>,
        scenario_id: ScenarioId,
        kind: ScenarioKind,
        state: String,
    },
    ScenarioExpired {
        run_id: String,
        symbol: String,
        time: DateTime<Utc>,
        scenario_id: ScenarioId,
        kind: ScenarioKind,
    },
}

impl BacktestEvent {
    pub fn symbol(&self) -> &str {
        match self {
            BacktestEvent::SymbolSkipped { symbol, .. }
            | BacktestEvent::TrendChanged { symbol, .. }
            | BacktestEvent::ScenarioCreated { symbol, .. }
            | BacktestEvent::ScenarioExpired { symbol, .. } => symbol,
        }
    }
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub symbols: Vec<String>,
    pub symbols_processed: usize,
    pub steps_processed: usize,
    pub proposals_created: usize,
    pub scenarios_expired: usize,
    pub events_written: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestReport {
    pub output_dir: PathBuf,
    pub summary: BacktestSummary,
}

impl BacktestReport {
    pub fn run_id(&self) -> &str {
        &self.summary.run_id
    }

    pub fn proposals_path(&self) -> PathBuf {
        self.output_dir.join("proposals.jsonl")
    }

    pub fn events_path(&self) -> PathBuf {
        self.output_dir.join("events.jsonl")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join("summary.json")
    }
}

#[derive(Debug, Default)]
struct SymbolReplay {
    steps: usize,
    expired: usize,
    proposals: Vec<Proposal>,
    events: Vec<BacktestEvent>,
}

/// Settings shared by every symbol of one run.
struct Replay<'a> {
    config: &'a AutoEyeConfig,
    pipeline: PipelineConfig,
    source: &'a dyn MarketDataSource,
    run_id: &'a str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    warmup_bars: usize,
}

/// Default run id: `<SYMBOL>` for one symbol, `multi` otherwise, then both
/// window bounds.
pub fn default_run_id(symbols: &[String], start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let who = match symbols {
        [one] => one.as_str(),
        _ => "multi",
    };
    format!(
        "{who}_{}_{}",
        start.format("%Y%m%dT%H%M%SZ"),
        end.format("%Y%m%dT%H%M%SZ")
    )
}

fn resolve_run_id(options: &BacktestOptions, symbols: &[String]) -> Result<String, BacktestError> {
    let run_id = match options.run_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Ok(default_run_id(symbols, options.start, options.end)),
    };
    if run_id == "." || run_id == ".." || run_id.contains(['/', '\\']) {
        return Err(BacktestError::InvalidRunId(run_id));
    }
    Ok(run_id)
}

fn resolve_symbols(config: &AutoEyeConfig, options: &BacktestOptions) -> Vec<String> {
    let requested = options.symbols.clone().unwrap_or_else(|| config.symbols());
    let mut out: Vec<String> = Vec::new();
    for symbol in requested {
        let symbol = symbol.trim().to_string();
        if !symbol.is_empty() && !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

/// Replay `[options.start, options.end]` for every requested symbol and write
/// the run's output files. A symbol that fails is recorded in the summary's
/// `errors`; the other symbols still run.
pub fn run_backtest(
    config: &AutoEyeConfig,
    source: &dyn MarketDataSource,
    options: &BacktestOptions,
    started_at: DateTime<Utc>,
) -> Result<BacktestReport, BacktestError> {
    if options.end <= options.start {
        return Err(BacktestError::InvalidRange {
            start: options.start,
            end: options.end,
        });
    }
    config.validate()?;
    let symbols = resolve_symbols(config, options);
    if symbols.is_empty() {
        return Err(BacktestError::NoSymbols);
    }
    let run_id = resolve_run_id(options, &symbols)?;
    if !source.is_available() {
        return Err(BacktestError::SourceUnreachable(source.name().to_string()));
    }

    let output_dir = config.paths.state_dir.join("backtests").join(&run_id);
    fs::create_dir_all(&output_dir).map_err(|source| BacktestError::Io {
        path: output_dir.clone(),
        source,
    })?;

    info!(
        "backtest {run_id}: {} symbol(s) from {} to {}",
        symbols.len(),
        options.start,
        options.end
    );

    let replay = Replay {
        config,
        pipeline: config.pipeline_config()?,
        source,
        run_id: &run_id,
        start: options.start,
        end: options.end,
        warmup_bars: options.warmup_bars.max(MIN_WARMUP_BARS),
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.schedule.worker_threads)
        .build()?;
    let results: Vec<(String, Result<SymbolReplay, BacktestError>)> = pool.install(|| {
        symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), replay.symbol(symbol)))
            .collect()
    });

    let mut proposals = Vec::new();
    let mut events = Vec::new();
    let mut steps = 0;
    let mut expired = 0;
    let mut errors = Vec::new();
    for (symbol, result) in results {
        match result {
            Ok(r) => {
                debug!("backtest {run_id}: {symbol} replayed {} step(s)", r.steps);
                steps += r.steps;
                expired += r.expired;
                proposals.extend(r.proposals);
                events.extend(r.events);
            }
            Err(e) => {
                error!("backtest {run_id}: {symbol} failed: {e}");
                errors.push(format!("{symbol}: {e}"));
            }
        }
    }

    write_jsonl(&output_dir.join("proposals.jsonl"), &proposals)?;
    write_jsonl(&output_dir.join("events.jsonl"), &events)?;

    let summary = BacktestSummary {
        run_id: run_id.clone(),
        started_at,
        start: options.start,
        end: options.end,
        symbols_processed: symbols.len(),
        symbols,
        steps_processed: steps,
        proposals_created: proposals.len(),
        scenarios_expired: expired,
        events_written: events.len(),
        errors,
    };
    write_json(&output_dir.join("summary.json"), &summary)?;

    info!(
        "backtest {run_id}: {} proposal(s), {} event(s), {} error(s)",
        summary.proposals_created,
        summary.events_written,
        summary.errors.len()
    );
    if !summary.errors.is_empty() {
        warn!("backtest {run_id}: some symbols did not replay");
    }

    Ok(BacktestReport {
        output_dir,
        summary,
    })
}

impl Replay<'_> {
    fn symbol(&self, symbol: &str) -> Result<SymbolReplay, BacktestError> {
        let m15_since = self.start - Duration::minutes(15) * self.warmup_bars.max(MIN_BARS) as i32;
        let h1_since = self.start - Duration::hours(1) * (self.warmup_bars / 4).max(MIN_BARS) as i32;
        let m15 = self
            .source
            .bars(symbol, CONFIRM_TIMEFRAME, BarWindow::Since(m15_since))?;
        let h1 = self
            .source
            .bars(symbol, ANCHOR_TIMEFRAME, BarWindow::Since(h1_since))?;

        let mut out = SymbolReplay::default();
        if m15.len() < MIN_BARS || h1.len() < MIN_BARS {
            warn!(
                "backtest {}: {symbol} skipped, {} M15 / {} H1 bars",
                self.run_id,
                m15.len(),
                h1.len()
            );
            out.events.push(BacktestEvent::SymbolSkipped {
                run_id: self.run_id.to_string(),
                symbol: symbol.to_string(),
                reason: "not_enough_bars".to_string(),
                m15_bars: m15.len(),
                h1_bars: h1.len(),
            });
            return Ok(out);
        }

        let point_size = self
            .config
            .point_size(symbol)
            .or_else(|| self.source.point_size(symbol))
            .unwrap_or(0.0);

        let mut snapshot = SymbolSnapshot::new(symbol);
        let mut h1_seen = 0;
        for (idx, bar) in m15.iter().enumerate() {
            let now = CONFIRM_TIMEFRAME.next_boundary(bar.open_time);
            if now < self.start {
                continue;
            }
            if now > self.end {
                break;
            }
            let h1_closed = h1.partition_point(|b| ANCHOR_TIMEFRAME.is_closed(b.open_time, now));
            if idx + 1 < MIN_BARS || h1_closed < MIN_BARS {
                continue;
            }

            self.advance_pair(&mut snapshot, CONFIRM_TIMEFRAME, &m15[..=idx], point_size, now)?;
            if h1_closed != h1_seen {
                self.advance_pair(&mut snapshot, ANCHOR_TIMEFRAME, &h1[..h1_closed], point_size, now)?;
                h1_seen = h1_closed;
            }
            snapshot.market = Market {
                price: Some(bar.close),
                tick_time: Some(now),
            };
            self.evaluate(&mut snapshot, now, &mut out);
            out.steps += 1;
        }
        Ok(out)
    }

    /// One pipeline pass for a pair: a full scan over everything fetched the
    /// first time, the configured incremental tail afterwards.
    fn advance_pair(
        &self,
        snapshot: &mut SymbolSnapshot,
        timeframe: Timeframe,
        bars: &[Bar],
        point_size: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BacktestError> {
        let prior: TimeframeState = snapshot.timeframe(timeframe).cloned().unwrap_or_default();
        let mode = select_mode(&prior, false);
        let window = match mode {
            ScanMode::Full => bars,
            ScanMode::Incremental => {
                let tail = self.config.schedule.incremental_bars.max(MIN_BARS);
                &bars[bars.len().saturating_sub(tail)..]
            }
        };
        let input = PairInput {
            symbol: &snapshot.symbol,
            timeframe,
            bars: window,
            point_size,
        };
        let outcome = process_timeframe(&prior, input, &self.pipeline, mode, now)
            .map_err(|source| BacktestError::Bars { timeframe, source })?;
        for (id, e) in &outcome.lifecycle_rejections {
            debug!("backtest {}: {timeframe} lifecycle rejected for {id}: {e}", self.run_id);
        }
        snapshot.timeframes.insert(timeframe, outcome.state);
        Ok(())
    }

    fn evaluate(&self, snapshot: &mut SymbolSnapshot, now: DateTime<Utc>, out: &mut SymbolReplay) {
        let prior_trend = snapshot.derived.as_ref().map(|d| &d.trend);
        let previous = prior_trend.map(|t| t.direction);
        let trend = resolve_trend(snapshot.timeframe(TREND_TIMEFRAME), prior_trend, now);
        let direction = trend.direction;
        snapshot.derived = Some(Derived { trend });
        if previous != Some(direction) {
            out.events.push(BacktestEvent::TrendChanged {
                run_id: self.run_id.to_string(),
                symbol: snapshot.symbol.clone(),
                time: now,
                trend: direction,
            });
        }

        let outcome = match scenario::build(
            snapshot.scenarios.as_ref(),
            snapshot,
            direction,
            &self.config.scenario,
            now,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("backtest {}: {} at {now}: scenarios not advanced: {e}", self.run_id, snapshot.symbol);
                return;
            }
        };
        for change in &outcome.changes {
            match change.change {
                ChangeKind::Inserted => {
                    out.events.push(BacktestEvent::ScenarioCreated {
                        run_id: self.run_id.to_string(),
                        symbol: snapshot.symbol.clone(),
                        time: now,
                        scenario_id: change.id.clone(),
                        kind: change.kind,
                        state: change.state.clone(),
                    });
                    if change.kind == ScenarioKind::Deal {
                        if let Some(p) = self.proposal(&outcome.book, &change.id) {
                            out.proposals.push(p);
                        }
                    }
                }
                ChangeKind::Updated if is_expired(&outcome.book, change.kind, &change.id) => {
                    out.expired += 1;
                    out.events.push(BacktestEvent::ScenarioExpired {
                        run_id: self.run_id.to_string(),
                        symbol: snapshot.symbol.clone(),
                        time: now,
                        scenario_id: change.id.clone(),
                        kind: change.kind,
                    });
                }
                ChangeKind::Updated => {}
            }
        }
        snapshot.scenarios = Some(outcome.book);
    }

    fn proposal(&self, book: &ScenarioBook, deal_id: &ScenarioId) -> Option<Proposal> {
        let deal = book.deals.iter().find(|d| &d.id == deal_id)?;
        let transition = book.transitions.iter().find(|t| t.id == deal.transition_ref);
        Some(Proposal {
            run_id: self.run_id.to_string(),
            created_at: deal.created_at,
            symbol: deal.symbol.clone(),
            deal_id: deal.id.clone(),
            transition_id: deal.transition_ref.clone(),
            kind: transition.map(|t| t.kind),
            side: deal.side,
            trend_at_creation: transition.map(|t| t.trend_at_creation),
            anchor_id: transition.map(|t| t.conditions.anchor_id.clone()),
            confirmation_id: transition.and_then(|t| t.confirmation_id.clone()),
            entry: deal.entry,
            sl: deal.sl,
            tp: deal.tp.clone(),
        })
    }
}

fn is_expired(book: &ScenarioBook, kind: ScenarioKind, id: &ScenarioId) -> bool {
    match kind {
        ScenarioKind::Transition => book
            .transitions
            .iter()
            .any(|t| &t.id == id && t.state == TransitionState::Expired),
        ScenarioKind::Deal => book
            .deals
            .iter()
            .any(|d| &d.id == id && d.state == DealState::Expired),
    }
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), BacktestError> {
    let io_err = |source| BacktestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    for row in rows {
        serde_json::to_writer(&mut writer, row).map_err(|e| io_err(io::Error::from(e)))?;
        writeln!(writer).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BacktestError> {
    let io_err = |source| BacktestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| io_err(io::Error::from(e)))?;
    writeln!(writer).map_err(io_err)?;
    writer.flush().map_err(io_err)
}

/// Read a JSONL file written by a backtest run.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(io::Error::from))
        .collect()
}

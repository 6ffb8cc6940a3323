//! Market data sources.
//!
//! `MarketDataSource` abstracts over where bars and quotes come from so the
//! cycle runner can be driven by a CSV directory in production and by an
//! in-memory source in tests. Fetching is the only blocking step of a cycle.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use autoeye_core::domain::{Bar, Timeframe};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Transient: retry at the next tick.
    #[error("{symbol}: data unavailable: {reason}")]
    Unavailable { symbol: String, reason: String },

    #[error("{symbol}: malformed data: {reason}")]
    Malformed { symbol: String, reason: String },
}

/// Which part of a series to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarWindow {
    /// The most recent `n` bars.
    Latest(usize),
    /// Every bar opening at or after the given time.
    Since(DateTime<Utc>),
}

impl BarWindow {
    fn apply(self, mut bars: Vec<Bar>) -> Vec<Bar> {
        match self {
            BarWindow::Latest(n) => {
                let skip = bars.len().saturating_sub(n);
                bars.drain(..skip);
                bars
            }
            BarWindow::Since(start) => {
                bars.retain(|b| b.open_time >= start);
                bars
            }
        }
    }
}

/// Latest traded price for a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub price: f64,
    pub time: DateTime<Utc>,
}

pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// False when the source is unreachable as a whole.
    fn is_available(&self) -> bool;

    /// Bars for one pair, ascending by open time. The last bar may still be
    /// open; callers filter by close time.
    fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: BarWindow,
    ) -> Result<Vec<Bar>, SourceError>;

    fn latest_price(&self, symbol: &str) -> Result<Quote, SourceError>;

    /// Instrument point size when the source knows it.
    fn point_size(&self, _symbol: &str) -> Option<f64> {
        None
    }
}

// ─── CSV directory ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CsvBarRow {
    #[serde(alias = "time", alias = "timestamp")]
    open_time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default, alias = "tick_volume")]
    volume: Option<f64>,
}

/// Bars from `<dir>/<SYMBOL>_<TF>.csv` files.
///
/// Columns: `open_time,open,high,low,close[,volume]`. Times are RFC 3339 or
/// `YYYY-MM-DD HH:MM[:SS]` in UTC. The quote is the close of the finest
/// timeframe file present.
#[derive(Debug, Clone)]
pub struct CsvBarSource {
    dir: PathBuf,
}

impl CsvBarSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.dir.join(format!("{symbol}_{timeframe}.csv"))
    }

    fn read_all(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Bar>, SourceError> {
        let path = self.path_for(symbol, timeframe);
        let mut reader = csv::Reader::from_path(&path).map_err(|e| SourceError::Unavailable {
            symbol: symbol.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;

        let mut bars = Vec::new();
        for (line, row) in reader.deserialize::<CsvBarRow>().enumerate() {
            let malformed = |reason: String| SourceError::Malformed {
                symbol: symbol.to_string(),
                reason: format!("{} row {}: {reason}", path.display(), line + 1),
            };
            let row = row.map_err(|e| malformed(e.to_string()))?;
            let open_time = parse_time(&row.open_time)
                .ok_or_else(|| malformed(format!("bad time '{}'", row.open_time)))?;
            bars.push(Bar {
                open_time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume.map(|v| v.max(0.0) as u64).unwrap_or(0),
            });
        }
        Ok(bars)
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl MarketDataSource for CsvBarSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }

    fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: BarWindow,
    ) -> Result<Vec<Bar>, SourceError> {
        Ok(window.apply(self.read_all(symbol, timeframe)?))
    }

    fn latest_price(&self, symbol: &str) -> Result<Quote, SourceError> {
        for tf in Timeframe::ALL {
            if !self.path_for(symbol, tf).exists() {
                continue;
            }
            if let Some(last) = self.read_all(symbol, tf)?.last() {
                return Ok(Quote {
                    price: last.close,
                    time: last.open_time,
                });
            }
        }
        Err(SourceError::Unavailable {
            symbol: symbol.to_string(),
            reason: format!("no bar files under {}", self.dir.display()),
        })
    }
}

// ─── In-memory ──────────────────────────────────────────────────────

/// Mutable in-process source for tests and embedding.
#[derive(Debug)]
pub struct MemorySource {
    bars: Mutex<HashMap<(String, Timeframe), Vec<Bar>>>,
    quotes: Mutex<HashMap<String, Quote>>,
    point_sizes: HashMap<String, f64>,
    available: AtomicBool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            point_sizes: HashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point_size(mut self, symbol: &str, point_size: f64) -> Self {
        self.point_sizes.insert(symbol.to_string(), point_size);
        self
    }

    pub fn set_bars(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        self.bars
            .lock()
            .unwrap()
            .insert((symbol.to_string(), timeframe), bars);
    }

    pub fn push_bar(&self, symbol: &str, timeframe: Timeframe, bar: Bar) {
        self.bars
            .lock()
            .unwrap()
            .entry((symbol.to_string(), timeframe))
            .or_default()
            .push(bar);
    }

    pub fn set_price(&self, symbol: &str, price: f64, time: DateTime<Utc>) {
        self.quotes
            .lock()
            .unwrap()
            .insert(symbol.to_string(), Quote { price, time });
    }

    pub fn clear_price(&self, symbol: &str) {
        self.quotes.lock().unwrap().remove(symbol);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl MarketDataSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: BarWindow,
    ) -> Result<Vec<Bar>, SourceError> {
        if !self.is_available() {
            return Err(SourceError::Unavailable {
                symbol: symbol.to_string(),
                reason: "source offline".to_string(),
            });
        }
        let bars = self
            .bars
            .lock()
            .unwrap()
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .ok_or_else(|| SourceError::Unavailable {
                symbol: symbol.to_string(),
                reason: format!("no {timeframe} series"),
            })?;
        Ok(window.apply(bars))
    }

    fn latest_price(&self, symbol: &str) -> Result<Quote, SourceError> {
        self.quotes
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| SourceError::Unavailable {
                symbol: symbol.to_string(),
                reason: "no quote".to_string(),
            })
    }

    fn point_size(&self, symbol: &str) -> Option<f64> {
        self.point_sizes.get(symbol).copied()
    }
}

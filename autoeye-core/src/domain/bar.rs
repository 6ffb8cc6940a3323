//! Bar — the fundamental market data unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::timeframe::Timeframe;

/// OHLC bar for a single symbol on a single timeframe, keyed by its open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: u64,
}

impl Bar {
    /// Returns true if any OHLC field is not finite.
    pub fn is_void(&self) -> bool {
        !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite())
    }

    /// Basic OHLC sanity check: high >= low and open/close inside the range.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// True when the bar's range overlaps `[low, high]`.
    pub fn intersects(&self, low: f64, high: f64) -> bool {
        self.low <= high && self.high >= low
    }
}

/// Why a fetched bar window was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BarSequenceError {
    #[error("bar {index} at {time} does not follow the previous bar")]
    OutOfOrder { index: usize, time: DateTime<Utc> },

    #[error("bar {index} at {time} is not on a {timeframe} boundary")]
    Misaligned {
        index: usize,
        time: DateTime<Utc>,
        timeframe: Timeframe,
    },

    #[error("bar {index} at {time} has inconsistent OHLC values")]
    Insane { index: usize, time: DateTime<Utc> },
}

/// Validate a fetched window: strictly ascending, boundary-aligned, sane bars.
pub fn validate_window(timeframe: Timeframe, bars: &[Bar]) -> Result<(), BarSequenceError> {
    for (index, bar) in bars.iter().enumerate() {
        if !bar.is_sane() {
            return Err(BarSequenceError::Insane {
                index,
                time: bar.open_time,
            });
        }
        if !timeframe.is_aligned(bar.open_time) {
            return Err(BarSequenceError::Misaligned {
                index,
                time: bar.open_time,
                timeframe,
            });
        }
        if index > 0 && bar.open_time <= bars[index - 1].open_time {
            return Err(BarSequenceError::OutOfOrder {
                index,
                time: bar.open_time,
            });
        }
    }
    Ok(())
}

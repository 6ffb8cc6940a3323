//! Timeframe — the six bar cadences and their boundary arithmetic.
//!
//! Boundaries are computed in UTC:
//! - M15/H1/H4 floor on epoch seconds
//! - D1 starts at midnight
//! - W1 starts on the ISO-week Monday
//! - MN1 starts on the first of the month

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bar cadence of a tracked series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown timeframe '{0}' (expected one of M15, H1, H4, D1, W1, MN1)")]
pub struct TimeframeParseError(pub String);

impl Timeframe {
    /// Every timeframe, shortest first. Snapshot keys are always these six.
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::MN1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN1 => "MN1",
        }
    }

    /// Intraday cadences have a fixed length in seconds.
    fn fixed_seconds(self) -> Option<i64> {
        match self {
            Timeframe::M15 => Some(15 * 60),
            Timeframe::H1 => Some(60 * 60),
            Timeframe::H4 => Some(4 * 60 * 60),
            _ => None,
        }
    }

    /// Open time of the bar containing `ts`.
    pub fn bar_open(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(period) = self.fixed_seconds() {
            let whole = ts - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()));
            return whole - Duration::seconds(whole.timestamp().rem_euclid(period));
        }

        let date = ts.date_naive();
        let start = match self {
            Timeframe::W1 => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Timeframe::MN1 => date - Duration::days(i64::from(date.day0())),
            _ => date,
        };
        Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN))
    }

    /// Open time of the bar after the one containing `ts`.
    pub fn next_boundary(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let open = self.bar_open(ts);
        match self {
            Timeframe::M15 | Timeframe::H1 | Timeframe::H4 => {
                open + Duration::seconds(self.fixed_seconds().unwrap_or_default())
            }
            Timeframe::D1 => open + Duration::days(1),
            Timeframe::W1 => open + Duration::days(7),
            Timeframe::MN1 => {
                // Day 33 of any month is always inside the following month.
                let later = open + Duration::days(32);
                let date = later.date_naive() - Duration::days(i64::from(later.day0()));
                Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
            }
        }
    }

    /// True when `ts` sits exactly on a bar boundary.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        self.bar_open(ts) == ts
    }

    /// True when the bar opening at `open_time` has closed by `now`.
    pub fn is_closed(self, open_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_boundary(open_time) <= now
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M15" => Ok(Timeframe::M15),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            "W1" => Ok(Timeframe::W1),
            "MN1" | "MN" => Ok(Timeframe::MN1),
            _ => Err(TimeframeParseError(s.to_string())),
        }
    }
}

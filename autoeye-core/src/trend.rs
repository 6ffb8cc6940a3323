//! Trend resolution from the latest H1 signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Direction, ElementId, ElementKind, ElementType, FvgStatus, SnrStatus, Timeframe};
use crate::snapshot::TimeframeState;

pub const TREND_TIMEFRAME: Timeframe = Timeframe::H1;
pub const TREND_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendDirection {
    pub fn as_direction(self) -> Option<Direction> {
        match self {
            TrendDirection::Bullish => Some(Direction::Bullish),
            TrendDirection::Bearish => Some(Direction::Bearish),
            TrendDirection::Neutral => None,
        }
    }
}

impl From<Direction> for TrendDirection {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Bullish => TrendDirection::Bullish,
            Direction::Bearish => TrendDirection::Bearish,
        }
    }
}

/// The element that set the trend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSignal {
    pub element_id: ElementId,
    pub element_type: ElementType,
    pub direction: Direction,
    pub signal_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendChange {
    pub changed_at: DateTime<Utc>,
    pub direction: TrendDirection,
    #[serde(default)]
    pub source: Option<TrendSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendView {
    pub timeframe: Timeframe,
    pub direction: TrendDirection,
    #[serde(default)]
    pub source: Option<TrendSignal>,
    #[serde(default)]
    pub history: Vec<TrendChange>,
}

/// Latest usable signal in `state`: live FVGs contribute their direction at
/// formation, live SNRs theirs at break time.
pub fn latest_signal(state: &TimeframeState) -> Option<TrendSignal> {
    state
        .elements
        .iter()
        .filter_map(|e| {
            let live = match &e.kind {
                ElementKind::Fvg(f) => matches!(f.status, FvgStatus::Active | FvgStatus::Touched),
                ElementKind::Snr(s) => matches!(s.status, SnrStatus::Active | SnrStatus::Retested),
                ElementKind::Fractal(_) => false,
            };
            if !live {
                return None;
            }
            Some(TrendSignal {
                element_id: e.id.clone(),
                element_type: e.element_type(),
                direction: e.direction()?,
                signal_time: e.signal_time(),
            })
        })
        .max_by(|a, b| {
            (a.signal_time, &a.element_id, a.element_type)
                .cmp(&(b.signal_time, &b.element_id, b.element_type))
        })
}

/// Resolve the trend for `state`, extending `prior`'s history when the
/// direction flips.
pub fn resolve_trend(
    state: Option<&TimeframeState>,
    prior: Option<&TrendView>,
    now: DateTime<Utc>,
) -> TrendView {
    let source = state.and_then(latest_signal);
    let direction = source
        .as_ref()
        .map(|s| TrendDirection::from(s.direction))
        .unwrap_or(TrendDirection::Neutral);

    let mut history = prior.map(|p| p.history.clone()).unwrap_or_default();
    if let Some(p) = prior {
        if p.direction != direction {
            history.push(TrendChange {
                changed_at: now,
                direction,
                source: source.clone(),
            });
        }
    }
    if history.len() > TREND_HISTORY_LIMIT {
        history.drain(..history.len() - TREND_HISTORY_LIMIT);
    }

    TrendView {
        timeframe: TREND_TIMEFRAME,
        direction,
        source,
        history,
    }
}

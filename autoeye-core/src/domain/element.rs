//! Tracked market-structure elements.
//!
//! An `Element` carries the common header (id, symbol, timeframe, formation
//! time) plus a tagged `ElementKind` with the per-type fields and status
//! machine. `attributes` is an open, order-irrelevant bag for extension
//! fields that older or newer writers may add; it is carried through
//! reconciliation untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::ids::ElementId;
use super::status::{FractalStatus, FvgStatus, Lifecycle, SnrStatus};
use super::timeframe::Timeframe;

/// The three element families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Fvg,
    Fractal,
    Snr,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown element type '{0}' (expected fvg, fractal or snr)")]
pub struct ElementTypeParseError(pub String);

impl ElementType {
    pub const ALL: [ElementType; 3] = [ElementType::Fvg, ElementType::Fractal, ElementType::Snr];

    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Fvg => "fvg",
            ElementType::Fractal => "fractal",
            ElementType::Snr => "snr",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = ElementTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fvg" => Ok(ElementType::Fvg),
            "fractal" | "fractals" => Ok(ElementType::Fractal),
            "snr" => Ok(ElementType::Snr),
            _ => Err(ElementTypeParseError(s.to_string())),
        }
    }
}

/// Market direction implied by an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FractalType {
    High,
    Low,
}

impl FractalType {
    pub fn as_str(self) -> &'static str {
        match self {
            FractalType::High => "high",
            FractalType::Low => "low",
        }
    }
}

/// Which close defined the fractal's L price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LRule {
    /// Pivot bar closed below its open: L is the pivot close.
    C2Close,
    /// Otherwise L is the close of the bar before the pivot.
    C1Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnrRole {
    Support,
    Resistance,
}

impl SnrRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SnrRole::Support => "support",
            SnrRole::Resistance => "resistance",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            SnrRole::Support => Direction::Bullish,
            SnrRole::Resistance => Direction::Bearish,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakType {
    BreakUpClose,
    BreakDownClose,
}

impl BreakType {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakType::BreakUpClose => "break_up_close",
            BreakType::BreakDownClose => "break_down_close",
        }
    }
}

/// Which fill condition mitigated an FVG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationTrigger {
    Touch,
    Full,
}

/// Fair value gap between bar 1 and bar 3 of a triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fvg {
    pub direction: Direction,
    pub gap_low: f64,
    pub gap_high: f64,
    pub gap_size: f64,
    pub c1_time: DateTime<Utc>,
    pub c2_time: DateTime<Utc>,
    pub c3_time: DateTime<Utc>,
    pub status: FvgStatus,
    #[serde(default)]
    pub touched_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mitigated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mitigation_trigger: Option<MitigationTrigger>,
    /// Deepest penetration of the gap seen so far, in percent.
    #[serde(default)]
    pub fill_percent: f64,
}

/// Confirmed swing pivot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fractal {
    pub fractal_type: FractalType,
    pub pivot_time: DateTime<Utc>,
    pub confirm_time: DateTime<Utc>,
    pub extreme_price: f64,
    pub l_price: f64,
    pub l_alt_price: f64,
    pub l_rule: LRule,
    pub status: FractalStatus,
}

/// Support/resistance zone left behind by a broken fractal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snr {
    /// Weak reference: the fractal may be absent from the snapshot.
    pub origin_fractal_id: ElementId,
    pub role: SnrRole,
    pub break_type: BreakType,
    pub break_time: DateTime<Utc>,
    pub break_close: f64,
    pub l_price: f64,
    pub extreme_price: f64,
    pub departure_extreme_price: f64,
    pub departure_extreme_time: DateTime<Utc>,
    pub departure_range_start_time: DateTime<Utc>,
    pub departure_range_end_time: DateTime<Utc>,
    pub snr_low: f64,
    pub snr_high: f64,
    pub status: SnrStatus,
    #[serde(default)]
    pub retest_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalidated_time: Option<DateTime<Utc>>,
}

/// Per-type payload, tagged by `element_type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element_type", rename_all = "snake_case")]
pub enum ElementKind {
    Fvg(Fvg),
    Fractal(Fractal),
    Snr(Snr),
}

/// A detected element with its stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub formation_time: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Element {
    pub fn element_type(&self) -> ElementType {
        match self.kind {
            ElementKind::Fvg(_) => ElementType::Fvg,
            ElementKind::Fractal(_) => ElementType::Fractal,
            ElementKind::Snr(_) => ElementType::Snr,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match &self.kind {
            ElementKind::Fvg(f) => f.status.label(),
            ElementKind::Fractal(f) => f.status.label(),
            ElementKind::Snr(s) => s.status.label(),
        }
    }

    /// Terminal elements are never evaluated again.
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            ElementKind::Fvg(f) => f.status.is_terminal(),
            ElementKind::Fractal(f) => f.status.is_terminal(),
            ElementKind::Snr(s) => s.status.is_terminal(),
        }
    }

    /// Price band `(low, high)` the element occupies.
    pub fn zone(&self) -> (f64, f64) {
        match &self.kind {
            ElementKind::Fvg(f) => (f.gap_low, f.gap_high),
            ElementKind::Fractal(f) => (f.l_price.min(f.extreme_price), f.l_price.max(f.extreme_price)),
            ElementKind::Snr(s) => (s.snr_low, s.snr_high),
        }
    }

    /// Directional bias of zone elements; fractals have none.
    pub fn direction(&self) -> Option<Direction> {
        match &self.kind {
            ElementKind::Fvg(f) => Some(f.direction),
            ElementKind::Snr(s) => Some(s.role.direction()),
            ElementKind::Fractal(_) => None,
        }
    }

    /// Time the element became usable as a signal.
    pub fn signal_time(&self) -> DateTime<Utc> {
        match &self.kind {
            ElementKind::Snr(s) => s.break_time,
            _ => self.formation_time,
        }
    }

    /// Tie-break key for stable ordering inside a timeframe.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.formation_time, self.id.as_str())
    }

    pub fn as_fractal(&self) -> Option<&Fractal> {
        match &self.kind {
            ElementKind::Fractal(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_fvg() -> Element {
        let t = |m: u32| Utc.with_ymd_and_hms(2026, 2, 1, 0, m, 0).unwrap();
        Element {
            id: ElementId::new("abc"),
            symbol: "EURUSD".into(),
            timeframe: Timeframe::M15,
            formation_time: t(30),
            kind: ElementKind::Fvg(Fvg {
                direction: Direction::Bullish,
                gap_low: 10.0,
                gap_high: 11.0,
                gap_size: 1.0,
                c1_time: t(0),
                c2_time: t(15),
                c3_time: t(30),
                status: FvgStatus::Active,
                touched_time: None,
                mitigated_time: None,
                mitigation_trigger: None,
                fill_percent: 0.0,
            }),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn element_json_is_flat_and_tagged() {
        let element = sample_fvg();
        let value = serde_json::to_value(&element).unwrap();
        assert_eq!(value["element_type"], "fvg");
        assert_eq!(value["gap_low"], 10.0);
        assert_eq!(value["status"], "active");
        assert_eq!(value["timeframe"], "M15");
        assert!(value.get("attributes").is_none());
    }

    #[test]
    fn element_serialization_roundtrip_keeps_attributes() {
        let mut element = sample_fvg();
        element
            .attributes
            .insert("source".into(), serde_json::json!("replay"));
        let json = serde_json::to_string(&element).unwrap();
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(back, element);
    }

    #[test]
    fn element_type_parses_plural_alias() {
        assert_eq!("fractals".parse::<ElementType>().unwrap(), ElementType::Fractal);
        assert!("rb".parse::<ElementType>().is_err());
    }

    #[test]
    fn accessors_follow_kind() {
        let element = sample_fvg();
        assert_eq!(element.element_type(), ElementType::Fvg);
        assert_eq!(element.zone(), (10.0, 11.0));
        assert_eq!(element.direction(), Some(Direction::Bullish));
        assert!(!element.is_terminal());
    }
}

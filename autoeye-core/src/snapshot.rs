//! Persisted per-symbol snapshot.
//!
//! One `SymbolSnapshot` per symbol is the unit of atomic persistence. Each
//! of the six timeframes has a `TimeframeState` that only the reconciler for
//! that pair mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{Element, ElementId, ElementType, Timeframe};
use crate::scenario::ScenarioBook;
use crate::trend::TrendView;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Elements of one timeframe, bucketed by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSet {
    #[serde(default)]
    pub fvg: Vec<Element>,
    #[serde(default, alias = "fractals")]
    pub fractal: Vec<Element>,
    #[serde(default)]
    pub snr: Vec<Element>,
}

impl ElementSet {
    /// Bucket `elements` by type, keeping their relative order.
    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        let mut set = ElementSet::default();
        for element in elements {
            set.bucket_mut(element.element_type()).push(element);
        }
        set
    }

    pub fn bucket(&self, element_type: ElementType) -> &[Element] {
        match element_type {
            ElementType::Fvg => &self.fvg,
            ElementType::Fractal => &self.fractal,
            ElementType::Snr => &self.snr,
        }
    }

    fn bucket_mut(&mut self, element_type: ElementType) -> &mut Vec<Element> {
        match element_type {
            ElementType::Fvg => &mut self.fvg,
            ElementType::Fractal => &mut self.fractal,
            ElementType::Snr => &mut self.snr,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.fvg.iter().chain(self.fractal.iter()).chain(self.snr.iter())
    }

    pub fn len(&self) -> usize {
        self.fvg.len() + self.fractal.len() + self.snr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.iter().find(|e| &e.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|e| !e.is_terminal()).count()
    }
}

/// State of one (symbol, timeframe) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeframeState {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_bar_time: Option<DateTime<Utc>>,
    /// Last bar covered by the most recent full scan.
    #[serde(default)]
    pub full_scan_through: Option<DateTime<Utc>>,
    /// Fingerprint of the detection settings the elements were built with.
    #[serde(default)]
    pub rules_fingerprint: Option<String>,
    #[serde(default)]
    pub elements: ElementSet,
}

/// Last known quote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub price: Option<f64>,
    pub tick_time: Option<DateTime<Utc>>,
}

/// Views computed from the element set on every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    pub trend: TrendView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub schema_version: String,
    pub symbol: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub market: Market,
    #[serde(default)]
    pub timeframes: BTreeMap<Timeframe, TimeframeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<Derived>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<ScenarioBook>,
}

impl SymbolSnapshot {
    /// Fresh snapshot with all six timeframes present and uninitialized.
    pub fn new(symbol: &str) -> Self {
        let mut snapshot = SymbolSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            symbol: symbol.to_string(),
            updated_at: None,
            market: Market::default(),
            timeframes: BTreeMap::new(),
            derived: None,
            scenarios: None,
        };
        snapshot.ensure_timeframes();
        snapshot
    }

    /// Insert any missing timeframe keys.
    pub fn ensure_timeframes(&mut self) {
        for tf in Timeframe::ALL {
            self.timeframes.entry(tf).or_default();
        }
    }

    pub fn timeframe(&self, tf: Timeframe) -> Option<&TimeframeState> {
        self.timeframes.get(&tf)
    }

    /// Whether `self` differs from `prior` in anything but bookkeeping.
    ///
    /// `updated_at` stamps and the market quote are ignored: a refreshed
    /// quote alone does not warrant a rewrite.
    pub fn differs_from(&self, prior: &SymbolSnapshot) -> bool {
        self.normalized() != prior.normalized()
    }

    fn normalized(&self) -> SymbolSnapshot {
        let mut copy = self.clone();
        copy.updated_at = None;
        copy.market = Market::default();
        for state in copy.timeframes.values_mut() {
            state.updated_at = None;
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_snapshot_has_all_timeframes() {
        let snapshot = SymbolSnapshot::new("EURUSD");
        assert_eq!(snapshot.timeframes.len(), 6);
        assert!(snapshot.timeframes.values().all(|s| !s.initialized));
        assert_eq!(snapshot.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn json_uses_timeframe_keys() {
        let snapshot = SymbolSnapshot::new("EURUSD");
        let value = serde_json::to_value(&snapshot).unwrap();
        for key in ["M15", "H1", "H4", "D1", "W1", "MN1"] {
            assert!(value["timeframes"].get(key).is_some(), "missing {key}");
        }
        assert!(value.get("scenarios").is_none());
        assert!(value["market"].get("price").is_some());
    }

    #[test]
    fn partial_file_is_filled_in() {
        let raw = r#"{
            "schema_version": "1.0.0",
            "symbol": "XAUUSD",
            "timeframes": { "H1": { "initialized": true, "elements": { "fractals": [] } } }
        }"#;
        let mut snapshot: SymbolSnapshot = serde_json::from_str(raw).unwrap();
        assert!(snapshot.timeframes[&Timeframe::H1].initialized);
        snapshot.ensure_timeframes();
        assert_eq!(snapshot.timeframes.len(), 6);
    }

    #[test]
    fn stamps_and_quote_do_not_count_as_change() {
        let prior = SymbolSnapshot::new("EURUSD");
        let mut next = prior.clone();
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 10, 0, 0).unwrap();
        next.updated_at = Some(now);
        next.market = Market {
            price: Some(1.085),
            tick_time: Some(now),
        };
        if let Some(h1) = next.timeframes.get_mut(&Timeframe::H1) {
            h1.updated_at = Some(now);
        }
        assert!(!next.differs_from(&prior));

        if let Some(h1) = next.timeframes.get_mut(&Timeframe::H1) {
            h1.last_bar_time = Some(now);
        }
        assert!(next.differs_from(&prior));
    }
}

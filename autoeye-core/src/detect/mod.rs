//! Detectors: pure functions from an ordered bar window to candidate elements.
//!
//! Each detector is deterministic and performs no I/O. SNR is the only
//! dependent detector: it consumes the fractals found in the same window.
//! Candidates come back with fresh (`active`/`confirmed`) status; advancing
//! them against later bars is the lifecycle evaluator's job.

pub mod baseline;
pub mod fractal;
pub mod fvg;
pub mod snr;

use serde::{Deserialize, Serialize};

use crate::domain::{Bar, Element, ElementType, Timeframe};

/// Which fill condition mitigates an FVG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillRule {
    /// First bar whose range intersects the gap.
    Touch,
    /// First bar that closes beyond the far boundary.
    Full,
    /// Whichever of the two happens first.
    Both,
}

/// Where the SNR departure range begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureStart {
    Pivot,
    Confirm,
}

/// Detection and lifecycle thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_gap_points: f64,
    pub require_displacement: bool,
    pub displacement_k: f64,
    pub atr_period: usize,
    pub median_body_period: usize,
    pub fill_rule: FillRule,
    /// Odd number of bars in the fractal window, pivot in the middle.
    pub fractal_window: usize,
    pub snr_departure_start: DepartureStart,
    pub snr_include_break_candle: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_gap_points: 0.0,
            require_displacement: false,
            displacement_k: 1.5,
            atr_period: 14,
            median_body_period: 20,
            fill_rule: FillRule::Both,
            fractal_window: 3,
            snr_departure_start: DepartureStart::Pivot,
            snr_include_break_candle: false,
        }
    }
}

impl DetectionConfig {
    /// Bars on each side of a fractal pivot.
    pub fn fractal_wing(&self) -> usize {
        (self.fractal_window.max(3)) / 2
    }
}

/// A closed-bar window for one (symbol, timeframe) pair.
#[derive(Debug, Clone, Copy)]
pub struct Series<'a> {
    pub symbol: &'a str,
    pub timeframe: Timeframe,
    pub bars: &'a [Bar],
    /// Instrument point size; zero when unknown.
    pub point_size: f64,
}

/// Run the enabled detectors over `series`.
///
/// Output is ordered by formation time, then id.
pub fn detect_all(
    series: &Series<'_>,
    enabled: &[ElementType],
    config: &DetectionConfig,
) -> Vec<Element> {
    let mut out = Vec::new();

    if enabled.contains(&ElementType::Fvg) {
        out.extend(fvg::detect(series, config));
    }

    let wants_fractals = enabled.contains(&ElementType::Fractal);
    let wants_snr = enabled.contains(&ElementType::Snr);
    if wants_fractals || wants_snr {
        let fractals = fractal::detect(series, config);
        if wants_snr {
            out.extend(snr::detect(series, &fractals, config));
        }
        if wants_fractals {
            out.extend(fractals);
        }
    }

    out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    out
}

#[cfg(test)]
pub(crate) mod test_bars {
    use crate::domain::{Bar, Timeframe};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    /// M15 bar `index` slots after 2026-02-01 00:00 UTC.
    pub fn bar(index: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: base() + Duration::minutes(15 * index),
            open,
            high,
            low,
            close,
            volume: 100,
        }
    }

    pub fn series(bars: &[Bar]) -> super::Series<'_> {
        super::Series {
            symbol: "EURUSD",
            timeframe: Timeframe::M15,
            bars,
            point_size: 0.0001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_bars::{bar, series};
    use super::*;

    #[test]
    fn detect_all_respects_enabled_set() {
        let bars = vec![
            bar(0, 8.8, 10.0, 8.0, 9.0),
            bar(1, 9.2, 12.0, 9.1, 9.15),
            bar(2, 10.8, 11.0, 8.75, 8.8),
            bar(3, 8.9, 9.1, 8.65, 8.7),
            bar(4, 8.8, 9.4, 8.6, 9.2),
        ];
        let config = DetectionConfig::default();

        let only_snr = detect_all(&series(&bars), &[ElementType::Snr], &config);
        assert_eq!(only_snr.len(), 1);
        assert_eq!(only_snr[0].element_type(), ElementType::Snr);

        let all = detect_all(&series(&bars), &ElementType::ALL, &config);
        assert!(all.iter().any(|e| e.element_type() == ElementType::Fractal));
        let keys: Vec<_> = all.iter().map(|e| e.sort_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn config_defaults_apply_to_partial_input() {
        let config: DetectionConfig = serde_json::from_str(r#"{"fill_rule":"full"}"#).unwrap();
        assert_eq!(config.fill_rule, FillRule::Full);
        assert_eq!(config.atr_period, 14);
        assert_eq!(config.fractal_wing(), 1);
    }
}

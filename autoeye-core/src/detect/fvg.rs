//! Fair value gap detection.
//!
//! For each triple (c1, c2, c3):
//! - bullish when `c1.high < c3.low`, gap `[c1.high, c3.low]`
//! - bearish when `c1.low > c3.high`, gap `[c3.high, c1.low]`
//!
//! The gap must reach the size threshold, and with `require_displacement`
//! the middle bar's body must reach `displacement_k` times the baseline.

use std::collections::BTreeMap;

use super::baseline::{lookback_complete, mean_true_range, median_body};
use super::{DetectionConfig, Series};
use crate::domain::{
    price_key, Bar, Direction, Element, ElementId, ElementKind, FvgStatus, Fvg,
};

/// Minimum gap size in price units.
pub fn gap_threshold(min_gap_points: f64, point_size: f64) -> f64 {
    if min_gap_points <= 0.0 {
        0.0
    } else if point_size > 0.0 {
        min_gap_points * point_size
    } else {
        min_gap_points
    }
}

pub fn detect(series: &Series<'_>, config: &DetectionConfig) -> Vec<Element> {
    let threshold = gap_threshold(config.min_gap_points, series.point_size);
    let bars = series.bars;

    bars.windows(3)
        .enumerate()
        .filter_map(|(i, w)| {
            let (c1, c2, c3) = (&w[0], &w[1], &w[2]);
            let (direction, low, high) = if c1.high < c3.low {
                (Direction::Bullish, c1.high, c3.low)
            } else if c1.low > c3.high {
                (Direction::Bearish, c3.high, c1.low)
            } else {
                return None;
            };

            let size = high - low;
            if size < threshold {
                return None;
            }
            if config.require_displacement && !passes_displacement(bars, i + 1, config) {
                return None;
            }
            Some(build(series, direction, c1, c2, c3, low, high))
        })
        .collect()
}

/// Displacement filter on the middle bar at `c2`.
///
/// A candidate without a full baseline lookback is left for a wider window
/// to decide, so a tail window never disagrees with the full history.
fn passes_displacement(bars: &[Bar], c2: usize, config: &DetectionConfig) -> bool {
    if !lookback_complete(c2, config.atr_period.max(1), config.median_body_period.max(1)) {
        return false;
    }
    let body = bars[c2].body();
    if body <= 0.0 {
        return false;
    }
    let baseline = mean_true_range(bars, c2, config.atr_period.max(1))
        .filter(|v| *v > 0.0)
        .or_else(|| median_body(bars, c2, config.median_body_period.max(1)).filter(|v| *v > 0.0));
    match baseline {
        Some(b) => body >= config.displacement_k * b,
        None => true,
    }
}

fn build(
    series: &Series<'_>,
    direction: Direction,
    c1: &Bar,
    c2: &Bar,
    c3: &Bar,
    low: f64,
    high: f64,
) -> Element {
    let formation = c3.open_time;
    let id = ElementId::from_seed(&[
        "fvg",
        series.symbol,
        series.timeframe.as_str(),
        direction.as_str(),
        &formation.to_rfc3339(),
        &price_key(low),
        &price_key(high),
    ]);

    Element {
        id,
        symbol: series.symbol.to_string(),
        timeframe: series.timeframe,
        formation_time: formation,
        kind: ElementKind::Fvg(Fvg {
            direction,
            gap_low: low,
            gap_high: high,
            gap_size: high - low,
            c1_time: c1.open_time,
            c2_time: c2.open_time,
            c3_time: c3.open_time,
            status: FvgStatus::Active,
            touched_time: None,
            mitigated_time: None,
            mitigation_trigger: None,
            fill_percent: 0.0,
        }),
        attributes: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::test_bars::{bar, series};

    fn fvg(element: &Element) -> &Fvg {
        match &element.kind {
            ElementKind::Fvg(f) => f,
            other => panic!("expected fvg, got {other:?}"),
        }
    }

    #[test]
    fn detects_bullish_gap() {
        let bars = vec![
            bar(0, 9.4, 10.0, 9.0, 9.8),
            bar(1, 9.8, 10.4, 9.6, 10.2),
            bar(2, 11.1, 11.4, 11.0, 11.3),
        ];
        let found = detect(&series(&bars), &DetectionConfig::default());
        assert_eq!(found.len(), 1);
        let gap = fvg(&found[0]);
        assert_eq!(gap.direction, Direction::Bullish);
        assert!((gap.gap_low - 10.0).abs() < 1e-12);
        assert!((gap.gap_high - 11.0).abs() < 1e-12);
        assert_eq!(found[0].formation_time, bars[2].open_time);
    }

    #[test]
    fn touching_wicks_are_not_a_gap() {
        let bars = vec![
            bar(0, 9.4, 10.0, 9.0, 9.8),
            bar(1, 9.8, 10.4, 9.6, 10.2),
            bar(2, 10.1, 11.4, 10.0, 11.3),
        ];
        assert!(detect(&series(&bars), &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn detects_bearish_gap() {
        let bars = vec![
            bar(0, 12.2, 12.5, 12.0, 12.1),
            bar(1, 12.0, 12.2, 11.6, 11.8),
            bar(2, 10.7, 11.0, 10.5, 10.6),
        ];
        let found = detect(&series(&bars), &DetectionConfig::default());
        assert_eq!(found.len(), 1);
        let gap = fvg(&found[0]);
        assert_eq!(gap.direction, Direction::Bearish);
        assert!((gap.gap_low - 11.0).abs() < 1e-12);
        assert!((gap.gap_high - 12.0).abs() < 1e-12);
    }

    #[test]
    fn min_gap_uses_point_size() {
        let bars = vec![
            bar(0, 9.9, 10.0, 9.8, 9.95),
            bar(1, 10.0, 10.6, 9.95, 10.55),
            bar(2, 10.6, 10.8, 10.6, 10.7),
        ];
        let mut s = series(&bars);
        s.point_size = 0.1;
        let config = DetectionConfig {
            min_gap_points: 5.0,
            ..DetectionConfig::default()
        };
        assert_eq!(detect(&s, &config).len(), 1);

        let strict = DetectionConfig {
            min_gap_points: 7.0,
            ..DetectionConfig::default()
        };
        assert!(detect(&s, &strict).is_empty());
    }

    #[test]
    fn ids_are_stable_between_runs() {
        let bars = vec![
            bar(0, 9.4, 10.0, 9.0, 9.8),
            bar(1, 9.8, 10.4, 9.6, 10.2),
            bar(2, 11.1, 11.4, 11.0, 11.3),
        ];
        let first = detect(&series(&bars), &DetectionConfig::default());
        let second = detect(&series(&bars), &DetectionConfig::default());
        assert_eq!(first, second);
    }

    fn quiet_bars(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| bar(i, 10.0, 10.1, 9.9, 10.05))
            .collect()
    }

    #[test]
    fn displacement_rejects_small_middle_body() {
        let mut bars = quiet_bars(20);
        bars.push(bar(20, 10.0, 10.1, 9.9, 10.05));
        bars.push(bar(21, 10.05, 10.2, 10.0, 10.1));
        bars.push(bar(22, 10.3, 10.4, 10.25, 10.35));
        let config = DetectionConfig {
            require_displacement: true,
            atr_period: 5,
            median_body_period: 5,
            ..DetectionConfig::default()
        };
        assert!(detect(&series(&bars), &config).is_empty());
    }

    #[test]
    fn displacement_accepts_impulsive_middle_bar() {
        let mut bars = quiet_bars(20);
        bars.push(bar(20, 10.0, 10.1, 9.9, 10.05));
        bars.push(bar(21, 10.05, 11.0, 10.0, 10.95));
        bars.push(bar(22, 10.95, 11.2, 10.9, 11.1));
        let config = DetectionConfig {
            require_displacement: true,
            atr_period: 5,
            median_body_period: 5,
            ..DetectionConfig::default()
        };
        let found = detect(&series(&bars), &config);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn displacement_leaves_short_lookback_undecided() {
        let bars = vec![
            bar(0, 10.0, 10.1, 9.9, 10.05),
            bar(1, 10.05, 11.0, 10.0, 10.95),
            bar(2, 10.95, 11.2, 10.9, 11.1),
        ];
        let config = DetectionConfig {
            require_displacement: true,
            atr_period: 5,
            median_body_period: 5,
            ..DetectionConfig::default()
        };
        assert!(detect(&series(&bars), &config).is_empty());
    }
}

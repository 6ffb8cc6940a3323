//! Support/resistance zones from broken fractals.
//!
//! After a fractal confirms, the first bar whose close crosses the fractal's
//! L price breaks it. A close up through L leaves support behind, a close
//! down through L leaves resistance. The zone spans L and the departure
//! extreme: the lowest low (support) or highest high (resistance) between the
//! departure start and the break.

use std::collections::BTreeMap;

use super::{DepartureStart, DetectionConfig, Series};
use crate::domain::{
    Bar, BreakType, Element, ElementId, ElementKind, Fractal, Snr, SnrRole, SnrStatus,
};

pub fn detect(series: &Series<'_>, fractals: &[Element], config: &DetectionConfig) -> Vec<Element> {
    let bars = series.bars;
    fractals
        .iter()
        .filter_map(|element| {
            let fractal = element.as_fractal()?;
            let pivot = index_of(bars, fractal.pivot_time)?;
            let confirm = index_of(bars, fractal.confirm_time)?;
            let (brk, role, break_type) = find_break(bars, confirm, fractal.l_price)?;
            Some(build(series, element, fractal, pivot, confirm, brk, role, break_type, config))
        })
        .collect()
}

fn index_of(bars: &[Bar], time: chrono::DateTime<chrono::Utc>) -> Option<usize> {
    bars.binary_search_by(|b| b.open_time.cmp(&time)).ok()
}

/// First close that crosses `level` after the confirmation bar.
fn find_break(bars: &[Bar], confirm: usize, level: f64) -> Option<(usize, SnrRole, BreakType)> {
    let start = (confirm + 1).max(1);
    (start..bars.len()).find_map(|i| {
        let prev = bars[i - 1].close;
        let close = bars[i].close;
        if close > level && prev <= level {
            Some((i, SnrRole::Support, BreakType::BreakUpClose))
        } else if close < level && prev >= level {
            Some((i, SnrRole::Resistance, BreakType::BreakDownClose))
        } else {
            None
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn build(
    series: &Series<'_>,
    origin: &Element,
    fractal: &Fractal,
    pivot: usize,
    confirm: usize,
    brk: usize,
    role: SnrRole,
    break_type: BreakType,
    config: &DetectionConfig,
) -> Element {
    let bars = series.bars;
    let start = match config.snr_departure_start {
        DepartureStart::Pivot => pivot,
        DepartureStart::Confirm => confirm,
    };
    let end = if config.snr_include_break_candle {
        Some(brk)
    } else {
        brk.checked_sub(1)
    };

    let range = end.filter(|&e| e >= start).map(|e| start..=e);
    let departure = range.clone().and_then(|r| match role {
        SnrRole::Support => r.fold(None, |best: Option<usize>, i| match best {
            Some(b) if bars[b].low <= bars[i].low => Some(b),
            _ => Some(i),
        }),
        SnrRole::Resistance => r.fold(None, |best: Option<usize>, i| match best {
            Some(b) if bars[b].high >= bars[i].high => Some(b),
            _ => Some(i),
        }),
    });

    let (dep_price, dep_time) = match departure {
        Some(i) => {
            let price = match role {
                SnrRole::Support => bars[i].low,
                SnrRole::Resistance => bars[i].high,
            };
            (price, bars[i].open_time)
        }
        None => (fractal.extreme_price, fractal.pivot_time),
    };
    let (range_start, range_end) = match range {
        Some(r) => (bars[*r.start()].open_time, bars[*r.end()].open_time),
        None => (fractal.pivot_time, fractal.pivot_time),
    };

    let b = &bars[brk];
    let id = ElementId::from_seed(&[
        "snr",
        series.symbol,
        series.timeframe.as_str(),
        origin.id.as_str(),
        &b.open_time.to_rfc3339(),
        role.as_str(),
        break_type.as_str(),
    ]);

    Element {
        id,
        symbol: series.symbol.to_string(),
        timeframe: series.timeframe,
        formation_time: b.open_time,
        kind: ElementKind::Snr(Snr {
            origin_fractal_id: origin.id.clone(),
            role,
            break_type,
            break_time: b.open_time,
            break_close: b.close,
            l_price: fractal.l_price,
            extreme_price: fractal.extreme_price,
            departure_extreme_price: dep_price,
            departure_extreme_time: dep_time,
            departure_range_start_time: range_start,
            departure_range_end_time: range_end,
            snr_low: dep_price.min(fractal.l_price),
            snr_high: dep_price.max(fractal.l_price),
            status: SnrStatus::Active,
            retest_time: None,
            invalidated_time: None,
        }),
        attributes: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::fractal;
    use crate::detect::test_bars::{bar, series};
    use crate::domain::LRule;

    fn broken_high() -> Vec<Bar> {
        vec![
            bar(0, 8.8, 10.0, 8.0, 9.0),
            bar(1, 9.2, 12.0, 9.1, 9.15),
            bar(2, 10.8, 11.0, 8.75, 8.8),
            bar(3, 8.9, 9.1, 8.65, 8.7),
            bar(4, 8.8, 9.4, 8.6, 9.2),
        ]
    }

    fn run(bars: &[Bar], config: &DetectionConfig) -> Vec<Element> {
        let s = series(bars);
        let fractals = fractal::detect(&s, config);
        detect(&s, &fractals, config)
    }

    fn snr(element: &Element) -> &Snr {
        match &element.kind {
            ElementKind::Snr(s) => s,
            other => panic!("expected snr, got {other:?}"),
        }
    }

    #[test]
    fn close_above_l_leaves_support() {
        let bars = broken_high();
        let found = run(&bars, &DetectionConfig::default());
        assert_eq!(found.len(), 1);

        let zone = snr(&found[0]);
        assert_eq!(zone.role, SnrRole::Support);
        assert_eq!(zone.break_type, BreakType::BreakUpClose);
        assert_eq!(zone.break_time, bars[4].open_time);
        assert_eq!(found[0].formation_time, bars[4].open_time);
        assert_eq!(zone.l_price, 9.15);
        assert_eq!(zone.extreme_price, 12.0);
        assert_eq!(zone.departure_extreme_price, 8.65);
        assert_eq!(zone.departure_extreme_time, bars[3].open_time);
        assert_eq!(zone.departure_range_start_time, bars[1].open_time);
        assert_eq!(zone.departure_range_end_time, bars[3].open_time);
        assert_eq!((zone.snr_low, zone.snr_high), (8.65, 9.15));
    }

    #[test]
    fn origin_fractal_uses_bearish_pivot_close() {
        let bars = broken_high();
        let s = series(&bars);
        let fractals = fractal::detect(&s, &DetectionConfig::default());
        assert_eq!(fractals.len(), 1);
        let origin = fractals[0].as_fractal().unwrap();
        assert_eq!(origin.l_rule, LRule::C2Close);

        let found = detect(&s, &fractals, &DetectionConfig::default());
        assert_eq!(snr(&found[0]).origin_fractal_id, fractals[0].id);
    }

    #[test]
    fn close_below_l_leaves_resistance() {
        let bars = vec![
            bar(0, 10.0, 10.5, 9.5, 10.2),
            bar(1, 10.0, 10.3, 8.0, 10.1),
            bar(2, 10.1, 10.8, 9.0, 10.6),
            bar(3, 10.6, 11.2, 10.4, 11.0),
            bar(4, 11.0, 11.1, 9.8, 9.9),
        ];
        let found = run(&bars, &DetectionConfig::default());
        assert_eq!(found.len(), 1);
        let zone = snr(&found[0]);
        assert_eq!(zone.role, SnrRole::Resistance);
        assert_eq!(zone.break_type, BreakType::BreakDownClose);
        // low fractal at bar 1 is bullish, so L is bar 0's close
        assert_eq!(zone.l_price, 10.2);
        assert_eq!(zone.departure_extreme_price, 11.2);
        assert_eq!((zone.snr_low, zone.snr_high), (10.2, 11.2));
    }

    #[test]
    fn no_break_no_zone() {
        let bars = &broken_high()[..4];
        assert!(run(bars, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn include_break_candle_extends_departure() {
        let bars = broken_high();
        let config = DetectionConfig {
            snr_include_break_candle: true,
            ..DetectionConfig::default()
        };
        let zone = run(&bars, &config);
        let zone = snr(&zone[0]);
        assert_eq!(zone.departure_extreme_price, 8.6);
        assert_eq!(zone.departure_range_end_time, bars[4].open_time);
    }

    #[test]
    fn confirm_start_narrows_departure() {
        let bars = broken_high();
        let config = DetectionConfig {
            snr_departure_start: DepartureStart::Confirm,
            ..DetectionConfig::default()
        };
        let zone = run(&bars, &config);
        let zone = snr(&zone[0]);
        assert_eq!(zone.departure_range_start_time, bars[2].open_time);
        assert_eq!(zone.departure_extreme_price, 8.65);
    }
}

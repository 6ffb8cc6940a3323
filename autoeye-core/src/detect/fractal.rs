//! Swing fractal detection.
//!
//! A pivot at index `p` is a high fractal when its high is strictly greater
//! than every other high within `wing` bars on both sides, and a low fractal
//! when its low is strictly lower than every other low. An outside bar may be
//! both. The fractal is confirmed by the last bar of the window.

use std::collections::BTreeMap;

use super::{DetectionConfig, Series};
use crate::domain::{
    price_key, Bar, Element, ElementId, ElementKind, Fractal, FractalStatus, FractalType, LRule,
};

pub fn detect(series: &Series<'_>, config: &DetectionConfig) -> Vec<Element> {
    let wing = config.fractal_wing();
    let bars = series.bars;
    if bars.len() < 2 * wing + 1 {
        return Vec::new();
    }

    let mut out = Vec::new();
    for pivot in wing..bars.len() - wing {
        let neighbours = (pivot - wing..=pivot + wing).filter(|&i| i != pivot);
        let p = &bars[pivot];

        if neighbours.clone().all(|i| p.high > bars[i].high) {
            out.push(build(series, bars, pivot, wing, FractalType::High));
        }
        if neighbours.clone().all(|i| p.low < bars[i].low) {
            out.push(build(series, bars, pivot, wing, FractalType::Low));
        }
    }
    out
}

/// L price of the pivot: its own close when the pivot bar is bearish,
/// otherwise the previous bar's close.
fn l_price(bars: &[Bar], pivot: usize) -> (f64, LRule) {
    let p = &bars[pivot];
    if p.is_bearish() || pivot == 0 {
        (p.close, LRule::C2Close)
    } else {
        (bars[pivot - 1].close, LRule::C1Close)
    }
}

fn build(
    series: &Series<'_>,
    bars: &[Bar],
    pivot: usize,
    wing: usize,
    fractal_type: FractalType,
) -> Element {
    let p = &bars[pivot];
    let confirm = &bars[pivot + wing];
    let extreme = match fractal_type {
        FractalType::High => p.high,
        FractalType::Low => p.low,
    };
    let (l, rule) = l_price(bars, pivot);

    let id = ElementId::from_seed(&[
        "fractal",
        series.symbol,
        series.timeframe.as_str(),
        fractal_type.as_str(),
        &p.open_time.to_rfc3339(),
        &price_key(extreme),
        &price_key(l),
    ]);

    Element {
        id,
        symbol: series.symbol.to_string(),
        timeframe: series.timeframe,
        formation_time: confirm.open_time,
        kind: ElementKind::Fractal(Fractal {
            fractal_type,
            pivot_time: p.open_time,
            confirm_time: confirm.open_time,
            extreme_price: extreme,
            l_price: l,
            l_alt_price: p.open,
            l_rule: rule,
            status: FractalStatus::Confirmed,
        }),
        attributes: BTreeMap::new(),
    }
}

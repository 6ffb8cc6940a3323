//! Lifecycle evaluator: advances existing elements against newer bars.
//!
//! Evaluation only looks at bars after an element formed (after `c3_time`
//! for FVGs, after `break_time` for SNRs). Re-evaluating bars that were
//! already seen leaves the element unchanged, so replaying an overlapping
//! window is harmless. Every status move goes through [`Lifecycle::advance`].

use crate::detect::FillRule;
use crate::domain::{
    Bar, Direction, Element, ElementId, ElementKind, FvgStatus, Fvg, Lifecycle, LifecycleError,
    MitigationTrigger, Snr, SnrRole, SnrStatus,
};

/// Result of evaluating a batch of elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Elements whose status or tracking fields changed.
    pub updates: Vec<Element>,
    pub rejected: Vec<(ElementId, LifecycleError)>,
}

/// Advance one element against `bars` (ascending, closed bars only).
///
/// Returns `Ok(None)` when nothing changed. Terminal elements are returned
/// unchanged without looking at the bars.
pub fn advance(
    element: &Element,
    bars: &[Bar],
    fill_rule: FillRule,
) -> Result<Option<Element>, LifecycleError> {
    if element.is_terminal() {
        return Ok(None);
    }
    let kind = match &element.kind {
        ElementKind::Fvg(fvg) => ElementKind::Fvg(advance_fvg(fvg, bars, fill_rule)?),
        ElementKind::Snr(snr) => ElementKind::Snr(advance_snr(snr, bars)?),
        ElementKind::Fractal(_) => return Ok(None),
    };
    if kind == element.kind {
        return Ok(None);
    }
    Ok(Some(Element {
        kind,
        ..element.clone()
    }))
}

/// Evaluate every non-terminal element in `elements`.
pub fn evaluate_all<'a, I>(elements: I, bars: &[Bar], fill_rule: FillRule) -> Evaluation
where
    I: IntoIterator<Item = &'a Element>,
{
    let mut out = Evaluation::default();
    for element in elements {
        match advance(element, bars, fill_rule) {
            Ok(Some(updated)) => out.updates.push(updated),
            Ok(None) => {}
            Err(e) => out.rejected.push((element.id.clone(), e)),
        }
    }
    out
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn advance_fvg(prior: &Fvg, bars: &[Bar], fill_rule: FillRule) -> Result<Fvg, LifecycleError> {
    let mut fvg = prior.clone();
    let size = fvg.gap_high - fvg.gap_low;

    for bar in bars.iter().filter(|b| b.open_time > fvg.c3_time) {
        let touched = bar.intersects(fvg.gap_low, fvg.gap_high);
        let full = match fvg.direction {
            Direction::Bullish => bar.close < fvg.gap_low,
            Direction::Bearish => bar.close > fvg.gap_high,
        };

        let depth = match fvg.direction {
            Direction::Bullish if bar.low < fvg.gap_high => fvg.gap_high - bar.low,
            Direction::Bearish if bar.high > fvg.gap_low => bar.high - fvg.gap_low,
            _ => 0.0,
        };
        if size > 0.0 && depth > 0.0 {
            let pct = round2((depth / size * 100.0).min(100.0));
            fvg.fill_percent = fvg.fill_percent.max(pct);
        }

        if touched {
            fvg.status = fvg.status.advance(FvgStatus::Touched)?;
            fvg.touched_time.get_or_insert(bar.open_time);
        }

        // same-bar tie under `both` records the touch
        let trigger = match fill_rule {
            FillRule::Touch => touched.then_some(MitigationTrigger::Touch),
            FillRule::Full => full.then_some(MitigationTrigger::Full),
            FillRule::Both => {
                if touched {
                    Some(MitigationTrigger::Touch)
                } else if full {
                    Some(MitigationTrigger::Full)
                } else {
                    None
                }
            }
        };
        if let Some(trigger) = trigger {
            fvg.status = fvg.status.advance(FvgStatus::MitigatedFull)?;
            fvg.mitigated_time = Some(bar.open_time);
            fvg.mitigation_trigger = Some(trigger);
            fvg.fill_percent = 100.0;
            break;
        }
    }
    Ok(fvg)
}

fn advance_snr(prior: &Snr, bars: &[Bar]) -> Result<Snr, LifecycleError> {
    let mut snr = prior.clone();

    for bar in bars.iter().filter(|b| b.open_time > snr.break_time) {
        let broken = match snr.role {
            SnrRole::Support => bar.close < snr.snr_low,
            SnrRole::Resistance => bar.close > snr.snr_high,
        };
        if broken {
            snr.status = snr.status.advance(SnrStatus::Invalidated)?;
            snr.invalidated_time = Some(bar.open_time);
            break;
        }
        if snr.status == SnrStatus::Active && bar.intersects(snr.snr_low, snr.snr_high) {
            snr.status = snr.status.advance(SnrStatus::Retested)?;
            snr.retest_time = Some(bar.open_time);
        }
    }
    Ok(snr)
}

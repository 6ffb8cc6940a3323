//! Per-pair pipeline: closed bars in, reconciled timeframe state out.
//!
//! One call handles one (symbol, timeframe) pair:
//!
//! 1. Drop bars that have not closed yet, then validate the window.
//! 2. Run the enabled detectors over the window.
//! 3. Evaluate lifecycle for every non-terminal element, prior or new.
//! 4. Reconcile detections and updates into the prior state.
//! 5. Record scan bookkeeping (`full_scan_through`, `rules_fingerprint`).
//!
//! The same steps run in both modes; only the window the caller fetched
//! differs. That is what keeps full-scan and incremental results equal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::detect::{detect_all, DetectionConfig, Series};
use crate::domain::{
    validate_window, Bar, BarSequenceError, Element, ElementId, ElementType, LifecycleError,
    Timeframe,
};
use crate::fingerprint::rules_fingerprint;
use crate::lifecycle;
use crate::reconcile::{merge, MergeReport};
use crate::snapshot::TimeframeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Incremental,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanMode::Full => "full",
            ScanMode::Incremental => "incremental",
        })
    }
}

/// Full scan when forced or when the pair has never been processed.
pub fn select_mode(state: &TimeframeState, force_full: bool) -> ScanMode {
    if force_full || !state.initialized {
        ScanMode::Full
    } else {
        ScanMode::Incremental
    }
}

/// Non-fatal conditions noticed while processing a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarning {
    /// A full scan was requested for a pair that only ever ran incrementally.
    NeverFullScanned { elements: usize },
    /// Elements were built under different detection rules.
    RulesChanged { stored: String, current: String },
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanWarning::NeverFullScanned { elements } => write!(
                f,
                "{elements} elements came from incremental runs only; back-detected structures may be new"
            ),
            ScanWarning::RulesChanged { stored, current } => write!(
                f,
                "detection rules changed ({stored} -> {current}); run a full scan to rebuild"
            ),
        }
    }
}

/// Settings shared by every pair in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub elements: Vec<ElementType>,
}

impl PipelineConfig {
    pub fn new(detection: DetectionConfig, elements: Vec<ElementType>) -> Self {
        Self {
            detection,
            elements,
        }
    }

    pub fn fingerprint(&self) -> String {
        rules_fingerprint(&self.detection, &self.elements)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(DetectionConfig::default(), ElementType::ALL.to_vec())
    }
}

/// The fetched window for one pair.
#[derive(Debug, Clone, Copy)]
pub struct PairInput<'a> {
    pub symbol: &'a str,
    pub timeframe: Timeframe,
    pub bars: &'a [Bar],
    pub point_size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub state: TimeframeState,
    pub changed: bool,
    pub mode: ScanMode,
    pub report: MergeReport,
    pub lifecycle_rejections: Vec<(ElementId, LifecycleError)>,
    pub warnings: Vec<ScanWarning>,
    /// Closed bars the pipeline actually used.
    pub bars_used: usize,
}

impl PairOutcome {
    pub fn new_count(&self) -> usize {
        self.report.inserted.len()
    }

    pub fn status_updated_count(&self) -> usize {
        self.report.updated.len()
    }
}

/// Run detection, lifecycle and reconciliation for one pair.
pub fn process_timeframe(
    prior: &TimeframeState,
    input: PairInput<'_>,
    config: &PipelineConfig,
    mode: ScanMode,
    now: DateTime<Utc>,
) -> Result<PairOutcome, BarSequenceError> {
    let closed: Vec<Bar> = input
        .bars
        .iter()
        .filter(|b| input.timeframe.is_closed(b.open_time, now))
        .copied()
        .collect();
    validate_window(input.timeframe, &closed)?;

    let fingerprint = config.fingerprint();
    let warnings = scan_warnings(prior, mode, &fingerprint);

    let series = Series {
        symbol: input.symbol,
        timeframe: input.timeframe,
        bars: &closed,
        point_size: input.point_size,
    };
    let detected = detect_all(&series, &config.elements, &config.detection);

    let known: BTreeSet<&ElementId> = prior.elements.iter().map(|e| &e.id).collect();
    let fresh: Vec<&Element> = detected.iter().filter(|e| !known.contains(&e.id)).collect();
    let evaluation = lifecycle::evaluate_all(
        prior.elements.iter().chain(fresh.iter().copied()),
        &closed,
        config.detection.fill_rule,
    );

    let last_bar_time = closed.last().map(|b| b.open_time);
    let merged = merge(prior, detected, evaluation.updates, last_bar_time);

    let mut state = merged.state;
    if mode == ScanMode::Full {
        if let Some(last) = last_bar_time {
            state.full_scan_through = Some(last);
        }
        state.rules_fingerprint = Some(fingerprint);
    } else if state.rules_fingerprint.is_none() {
        state.rules_fingerprint = Some(fingerprint);
    }

    let bookkeeping_moved = state.full_scan_through != prior.full_scan_through
        || state.rules_fingerprint != prior.rules_fingerprint;
    let changed = merged.changed || bookkeeping_moved;
    if changed {
        state.updated_at = Some(now);
    }

    Ok(PairOutcome {
        state,
        changed,
        mode,
        report: merged.report,
        lifecycle_rejections: evaluation.rejected,
        warnings,
        bars_used: closed.len(),
    })
}

fn scan_warnings(prior: &TimeframeState, mode: ScanMode, fingerprint: &str) -> Vec<ScanWarning> {
    let mut out = Vec::new();
    match mode {
        ScanMode::Full => {
            if prior.initialized && prior.full_scan_through.is_none() && !prior.elements.is_empty()
            {
                out.push(ScanWarning::NeverFullScanned {
                    elements: prior.elements.len(),
                });
            }
        }
        ScanMode::Incremental => {
            if let Some(stored) = &prior.rules_fingerprint {
                if stored != fingerprint {
                    out.push(ScanWarning::RulesChanged {
                        stored: stored.clone(),
                        current: fingerprint.to_string(),
                    });
                }
            }
        }
    }
    out
}

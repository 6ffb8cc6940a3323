//! Property tests for engine invariants.
//!
//! Uses proptest to verify:
//! 1. Determinism: detectors return identical output for identical input
//! 2. Idempotence: re-running a pair on the same bars changes nothing
//! 3. Monotonic status: elements never regress and are never dropped
//! 4. Mode equivalence: a full scan equals a full scan followed by
//!    incremental runs over the same bars
//! 5. Bounded tails: incremental runs over a fixed-size tail never invent
//!    elements, and only miss SNRs whose origin left the tail

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;

use autoeye_core::detect::{detect_all, DetectionConfig, FillRule, Series};
use autoeye_core::domain::{Bar, Element, ElementId, ElementKind, ElementType, Timeframe};
use autoeye_core::pipeline::{process_timeframe, PairInput, PipelineConfig, ScanMode};
use autoeye_core::snapshot::TimeframeState;

// ── Strategies (proptest) ────────────────────────────────────────────

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap()
}

/// Random walk of sane, aligned M15 bars.
fn arb_bars(min: usize, max: usize) -> impl Strategy<Value = Vec<Bar>> {
    prop::collection::vec((-1.0..1.0_f64, 0.0..0.6_f64, 0.0..0.6_f64), min..max).prop_map(
        |steps| {
            let mut close = 100.0;
            steps
                .into_iter()
                .enumerate()
                .map(|(i, (delta, up, down))| {
                    let open = close;
                    close = open + delta;
                    Bar {
                        open_time: base() + Duration::minutes(15 * i as i64),
                        open,
                        high: open.max(close) + up,
                        low: open.min(close) - down,
                        close,
                        volume: 100,
                    }
                })
                .collect()
        },
    )
}

fn arb_fill_rule() -> impl Strategy<Value = FillRule> {
    prop_oneof![
        Just(FillRule::Touch),
        Just(FillRule::Full),
        Just(FillRule::Both),
    ]
}

fn arb_config() -> impl Strategy<Value = PipelineConfig> {
    (arb_fill_rule(), any::<bool>(), prop_oneof![Just(3usize), Just(5usize)]).prop_map(
        |(fill_rule, require_displacement, fractal_window)| {
            PipelineConfig::new(
                DetectionConfig {
                    fill_rule,
                    require_displacement,
                    displacement_k: 1.0,
                    atr_period: 5,
                    median_body_period: 5,
                    fractal_window,
                    ..DetectionConfig::default()
                },
                ElementType::ALL.to_vec(),
            )
        },
    )
}

// ── Helpers ──────────────────────────────────────────────────────────

fn input(bars: &[Bar]) -> PairInput<'_> {
    PairInput {
        symbol: "EURUSD",
        timeframe: Timeframe::M15,
        bars,
        point_size: 0.01,
    }
}

fn closed_after(bars: &[Bar]) -> DateTime<Utc> {
    bars.last().map(|b| b.open_time).unwrap_or_else(base) + Duration::minutes(15)
}

fn run(prior: &TimeframeState, bars: &[Bar], config: &PipelineConfig, mode: ScanMode) -> TimeframeState {
    process_timeframe(prior, input(bars), config, mode, closed_after(bars))
        .expect("generated bars are valid")
        .state
}

fn by_id(state: &TimeframeState) -> BTreeMap<ElementId, Element> {
    state.elements.iter().map(|e| (e.id.clone(), e.clone())).collect()
}

fn rank(label: &str) -> u8 {
    match label {
        "active" | "confirmed" => 0,
        "touched" | "retested" => 1,
        _ => 2,
    }
}

// ── 1. Determinism ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn detection_is_deterministic(bars in arb_bars(5, 120), config in arb_config()) {
        let series = Series {
            symbol: "EURUSD",
            timeframe: Timeframe::M15,
            bars: &bars,
            point_size: 0.01,
        };
        let a = detect_all(&series, &config.elements, &config.detection);
        let b = detect_all(&series, &config.elements, &config.detection);
        prop_assert_eq!(a, b);
    }
}

// ── 2. Idempotence ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn rerun_on_same_bars_is_a_no_op(bars in arb_bars(5, 120), config in arb_config()) {
        let first = run(&TimeframeState::default(), &bars, &config, ScanMode::Full);
        let out = process_timeframe(
            &first,
            input(&bars),
            &config,
            ScanMode::Incremental,
            closed_after(&bars) + Duration::minutes(1),
        )
        .unwrap();
        prop_assert!(!out.changed);
        prop_assert_eq!(out.state, first);
    }
}

// ── 3. Monotonic status ──────────────────────────────────────────────

proptest! {
    #[test]
    fn statuses_only_move_forward(
        bars in arb_bars(20, 150),
        config in arb_config(),
        cuts in prop::collection::vec(0.0..1.0_f64, 1..5),
    ) {
        let mut ends: Vec<usize> = cuts
            .iter()
            .map(|c| 5 + (c * (bars.len() - 5) as f64) as usize)
            .collect();
        ends.push(bars.len());
        ends.sort_unstable();

        let mut state = TimeframeState::default();
        for end in ends {
            let before = by_id(&state);
            state = run(&state, &bars[..end], &config, ScanMode::Incremental);
            let after = by_id(&state);

            for (id, old) in &before {
                let new = after.get(id);
                prop_assert!(new.is_some(), "element {} dropped", id);
                let new = new.unwrap();
                prop_assert!(rank(new.status_label()) >= rank(old.status_label()));
                if old.is_terminal() {
                    prop_assert_eq!(new, old);
                }
            }
        }
    }
}

// ── 4. Mode equivalence ──────────────────────────────────────────────

proptest! {
    #[test]
    fn incremental_runs_match_full_scan(
        bars in arb_bars(20, 150),
        config in arb_config(),
        cuts in prop::collection::vec(0.0..1.0_f64, 1..5),
    ) {
        let full = run(&TimeframeState::default(), &bars, &config, ScanMode::Full);

        let mut ends: Vec<usize> = cuts
            .iter()
            .map(|c| 5 + (c * (bars.len() - 5) as f64) as usize)
            .collect();
        ends.sort_unstable();

        let mut state = run(&TimeframeState::default(), &bars[..ends[0]], &config, ScanMode::Full);
        for &end in ends.iter().skip(1).chain(std::iter::once(&bars.len())) {
            state = run(&state, &bars[..end], &config, ScanMode::Incremental);
        }

        prop_assert_eq!(by_id(&state), by_id(&full));
        prop_assert_eq!(state.last_bar_time, full.last_bar_time);
    }
}

// ── 5. Bounded tail windows ──────────────────────────────────────────

const TAIL: usize = 500;
const STRIDE: usize = 10;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn rolling_tail_agrees_with_full_scan(
        bars in arb_bars(1000, 1300),
        config in arb_config(),
    ) {
        let full = run(&TimeframeState::default(), &bars, &config, ScanMode::Full);

        let mut state = run(&TimeframeState::default(), &bars[..600], &config, ScanMode::Full);
        let mut end = 600;
        while end < bars.len() {
            end = (end + STRIDE).min(bars.len());
            state = run(&state, &bars[end - TAIL..end], &config, ScanMode::Incremental);
        }
        prop_assert_eq!(state.last_bar_time, full.last_bar_time);

        let full_by_id = by_id(&full);
        for (id, e) in by_id(&state) {
            let same = full_by_id.get(&id);
            prop_assert!(same.is_some(), "tail invented {}", id);
            prop_assert_eq!(same.unwrap(), &e);
        }

        // a break is seen by the first tail that contains it; a missed SNR's
        // pivot and left wing had already slid out of that tail
        let wing = config.detection.fractal_wing();
        let reach = Duration::minutes(15 * (TAIL - STRIDE - wing) as i64);
        for e in full.elements.iter().filter(|e| state.elements.get(&e.id).is_none()) {
            let ElementKind::Snr(snr) = &e.kind else {
                return Err(TestCaseError::fail(format!("tail missed non-SNR element {}", e.id)));
            };
            let pivot = full
                .elements
                .get(&snr.origin_fractal_id)
                .and_then(|origin| origin.as_fractal())
                .map(|f| f.pivot_time);
            prop_assert!(pivot.is_some(), "origin fractal of {} missing", e.id);
            prop_assert!(
                pivot.unwrap() < snr.break_time - reach,
                "{} missed with its pivot inside the tail",
                e.id
            );
        }
    }
}

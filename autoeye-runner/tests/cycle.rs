//! Cycle integration tests: scheduling, write suppression, failure isolation
//! and mode equivalence against an in-memory source and a temp state dir.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use autoeye_core::domain::{Bar, Timeframe};
use autoeye_core::pipeline::ScanMode;
use autoeye_runner::{
    AutoEyeConfig, CycleError, CycleOptions, CycleRunner, MemorySource, RunError,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap()
}

/// Sane, aligned bars with enough swings to produce every element type.
fn make_bars(timeframe: Timeframe, n: usize) -> Vec<Bar> {
    let step = match timeframe {
        Timeframe::M15 => Duration::minutes(15),
        _ => Duration::hours(1),
    };
    let mut close = 1.0850;
    (0..n)
        .map(|i| {
            let open = close;
            close = open + (i as f64 * 0.9).sin() * 0.0015;
            Bar {
                open_time: base() + step * i as i32,
                open,
                high: open.max(close) + 0.0004,
                low: open.min(close) - 0.0004,
                close,
                volume: 100,
            }
        })
        .collect()
}

fn config(dir: &TempDir, symbols: &[&str]) -> AutoEyeConfig {
    let mut config = AutoEyeConfig::default();
    config.engine.symbols = symbols.iter().map(|s| s.to_string()).collect();
    config.engine.timeframes = vec!["M15".into(), "H1".into()];
    config.paths.state_dir = dir.path().join("state");
    config.schedule.worker_threads = 2;
    // quote-driven scenario churn would mask element-level write suppression
    config.scenario.enabled = false;
    config
}

fn source(symbols: &[&str], m15: usize, h1: usize) -> MemorySource {
    let source = MemorySource::new().with_point_size("EURUSD", 0.0001);
    for symbol in symbols {
        source.set_bars(symbol, Timeframe::M15, make_bars(Timeframe::M15, m15));
        source.set_bars(symbol, Timeframe::H1, make_bars(Timeframe::H1, h1));
        source.set_price(symbol, 1.0850, base());
    }
    source
}

/// First instant at which every bar in the fixtures has closed.
fn closed_at(h1: usize) -> DateTime<Utc> {
    base() + Duration::hours(h1 as i64)
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn first_cycle_full_scans_and_writes() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    let now = closed_at(60);

    let report = runner.run_cycle(&src, now, &CycleOptions::default()).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.pairs.len(), 2);
    assert!(report.pairs.iter().all(|p| p.mode == ScanMode::Full && p.written));
    assert_eq!(report.symbols_written, 1);

    let snapshot = runner.store().load("EURUSD").unwrap().unwrap();
    let h1 = snapshot.timeframe(Timeframe::H1).unwrap();
    assert!(h1.initialized);
    assert!(!h1.elements.is_empty());
    assert_eq!(h1.full_scan_through, Some(base() + Duration::hours(59)));
    assert!(snapshot.derived.is_some());
    assert_eq!(snapshot.market.price, Some(1.0850));
    assert!(dir.path().join("state").join("schema_version.json").exists());

    let log = runner.changelog().read_all("EURUSD").unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].elements.is_empty());
}

#[test]
fn unchanged_rerun_does_not_rewrite() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    let now = closed_at(60);

    let first = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    first.run_cycle(&src, now, &CycleOptions::default()).unwrap();
    let path = first.store().path_for("EURUSD");
    let before = std::fs::read_to_string(&path).unwrap();

    // fresh runner: every pair is due again, but nothing new has closed
    src.set_price("EURUSD", 1.0861, now);
    let second = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    let report = second
        .run_cycle(&src, now + Duration::minutes(5), &CycleOptions::default())
        .unwrap();
    assert!(report.is_clean());
    assert!(report.pairs.iter().all(|p| p.mode == ScanMode::Incremental));
    assert!(report.pairs.iter().all(|p| !p.written && p.new_count == 0));
    assert_eq!(report.symbols_written, 0);

    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    assert_eq!(second.changelog().read_all("EURUSD").unwrap().len(), 1);
}

#[test]
fn pairs_wait_for_their_next_bar() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    let now = closed_at(60) + Duration::minutes(1);

    runner.run_cycle(&src, now, &CycleOptions::default()).unwrap();
    let idle = runner
        .run_cycle(&src, now + Duration::minutes(5), &CycleOptions::default())
        .unwrap();
    assert!(idle.pairs.is_empty());

    // M15 closes at :15, H1 not until the top of the hour
    src.set_bars("EURUSD", Timeframe::M15, make_bars(Timeframe::M15, 241));
    let next = runner
        .run_cycle(&src, now + Duration::minutes(15), &CycleOptions::default())
        .unwrap();
    assert_eq!(next.pairs.len(), 1);
    assert_eq!(next.pairs[0].timeframe, Timeframe::M15);
    assert_eq!(next.pairs[0].mode, ScanMode::Incremental);
    assert!(next.pairs[0].written);
}

#[test]
fn missing_series_fails_only_that_pair() {
    let dir = TempDir::new().unwrap();
    let src = MemorySource::new();
    src.set_bars("EURUSD", Timeframe::H1, make_bars(Timeframe::H1, 60));
    src.set_price("EURUSD", 1.0850, base());
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    let now = closed_at(60);

    let report = runner.run_cycle(&src, now, &CycleOptions::default()).unwrap();
    assert_eq!(report.pairs.len(), 1);
    assert_eq!(report.pairs[0].timeframe, Timeframe::H1);
    assert!(matches!(
        report.failures.as_slice(),
        [CycleError::DataUnavailable { timeframe: Timeframe::M15, .. }]
    ));

    // failed pair stays due and recovers at the next tick
    src.set_bars("EURUSD", Timeframe::M15, make_bars(Timeframe::M15, 240));
    let retry = runner
        .run_cycle(&src, now + Duration::minutes(1), &CycleOptions::default())
        .unwrap();
    assert!(retry.is_clean());
    assert_eq!(retry.pairs.len(), 1);
    assert_eq!(retry.pairs[0].timeframe, Timeframe::M15);
    assert_eq!(retry.pairs[0].mode, ScanMode::Full);
}

#[test]
fn malformed_window_is_rejected_without_state() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    let mut broken = make_bars(Timeframe::H1, 60);
    broken.swap(10, 11);
    src.set_bars("EURUSD", Timeframe::H1, broken);
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();

    let report = runner
        .run_cycle(&src, closed_at(60), &CycleOptions::default())
        .unwrap();
    assert!(matches!(
        report.failures.as_slice(),
        [CycleError::MalformedBarSequence { timeframe: Timeframe::H1, .. }]
    ));
    let snapshot = runner.store().load("EURUSD").unwrap().unwrap();
    assert!(!snapshot.timeframe(Timeframe::H1).unwrap().initialized);
    assert!(snapshot.timeframe(Timeframe::M15).unwrap().initialized);
}

#[test]
fn unreadable_snapshot_does_not_block_other_symbols() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD", "GBPUSD"], 240, 60);
    let runner = CycleRunner::new(config(&dir, &["EURUSD", "GBPUSD"])).unwrap();
    std::fs::create_dir_all(runner.store().path_for("GBPUSD")).unwrap();

    let report = runner
        .run_cycle(&src, closed_at(60), &CycleOptions::default())
        .unwrap();
    assert!(matches!(
        report.failures.as_slice(),
        [CycleError::PersistenceFailure { symbol, .. }] if symbol == "GBPUSD"
    ));
    assert_eq!(report.symbols_written, 1);
    assert!(report.pairs.iter().all(|p| p.symbol == "EURUSD"));
}

#[test]
fn offline_source_is_a_hard_failure() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    src.set_available(false);
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    assert!(matches!(
        runner.run_cycle(&src, closed_at(60), &CycleOptions::default()),
        Err(RunError::SourceUnreachable(_))
    ));
}

#[test]
fn missing_quote_keeps_previous_market() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD"], 240, 60);
    let runner = CycleRunner::new(config(&dir, &["EURUSD"])).unwrap();
    runner
        .run_cycle(&src, closed_at(60), &CycleOptions::default())
        .unwrap();

    src.clear_price("EURUSD");
    src.set_bars("EURUSD", Timeframe::H1, make_bars(Timeframe::H1, 61));
    src.set_bars("EURUSD", Timeframe::M15, make_bars(Timeframe::M15, 244));
    let report = runner
        .run_cycle(&src, closed_at(61), &CycleOptions::default())
        .unwrap();
    assert!(report.is_clean());
    let snapshot = runner.store().load("EURUSD").unwrap().unwrap();
    assert_eq!(snapshot.market.price, Some(1.0850));
}

#[test]
fn incremental_history_matches_full_scan() {
    let symbols = ["EURUSD"];

    // incremental: start with a partial history, then feed the rest
    let inc_dir = TempDir::new().unwrap();
    let src = source(&symbols, 160, 40);
    let inc = CycleRunner::new(config(&inc_dir, &symbols)).unwrap();
    inc.run_cycle(&src, closed_at(40), &CycleOptions::default())
        .unwrap();
    for h in 41..=60 {
        src.set_bars("EURUSD", Timeframe::H1, make_bars(Timeframe::H1, h));
        src.set_bars("EURUSD", Timeframe::M15, make_bars(Timeframe::M15, h * 4));
        let report = inc
            .run_cycle(&src, closed_at(h), &CycleOptions::default())
            .unwrap();
        assert!(report.is_clean());
    }

    // full: everything in one pass
    let full_dir = TempDir::new().unwrap();
    let full_src = source(&symbols, 240, 60);
    let full = CycleRunner::new(config(&full_dir, &symbols)).unwrap();
    full.run_cycle(&full_src, closed_at(60), &CycleOptions::full_scan())
        .unwrap();

    let a = inc.store().load("EURUSD").unwrap().unwrap();
    let b = full.store().load("EURUSD").unwrap().unwrap();
    for tf in [Timeframe::M15, Timeframe::H1] {
        let ea: Vec<_> = a.timeframe(tf).unwrap().elements.iter().cloned().collect();
        let eb: Vec<_> = b.timeframe(tf).unwrap().elements.iter().cloned().collect();
        assert_eq!(ea, eb, "{tf} elements differ");
    }
}

#[test]
fn full_scan_can_target_symbols() {
    let dir = TempDir::new().unwrap();
    let src = source(&["EURUSD", "GBPUSD"], 240, 60);
    let runner = CycleRunner::new(config(&dir, &["EURUSD", "GBPUSD"])).unwrap();
    runner
        .run_cycle(&src, closed_at(60), &CycleOptions::default())
        .unwrap();

    let options = CycleOptions {
        force_full: true,
        symbols: Some(vec!["GBPUSD".to_string()]),
    };
    let report = runner
        .run_cycle(&src, closed_at(60) + Duration::minutes(1), &options)
        .unwrap();
    assert_eq!(report.pairs.len(), 2);
    assert!(report
        .pairs
        .iter()
        .all(|p| p.symbol == "GBPUSD" && p.mode == ScanMode::Full));

    // the untargeted symbol keeps its schedule
    assert_eq!(
        runner.scheduler().next_due("EURUSD", Timeframe::M15),
        Some(closed_at(60) + Duration::minutes(15))
    );
    let next = runner
        .run_cycle(&src, closed_at(60) + Duration::minutes(2), &CycleOptions::default())
        .unwrap();
    assert!(next.pairs.is_empty());
}

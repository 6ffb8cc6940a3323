//! AutoEye CLI — scan cycles, state inspection and export.
//!
//! Commands:
//! - `run-once` — process every pair that is due right now, then exit
//! - `run` — poll continuously, processing pairs as their bars close
//! - `full-scan` — rebuild state from full history for some or all symbols
//! - `status` — summarize stored snapshots
//! - `export` — write one symbol's elements as CSV
//! - `backtest` — replay a historical window and record scenario proposals

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use autoeye_core::store::StateStore;
use autoeye_runner::backtest::DEFAULT_WARMUP_BARS;
use autoeye_runner::{
    export_symbol, run_backtest, store_status, AutoEyeConfig, BacktestOptions, BacktestReport,
    CsvBarSource, CycleOptions, CycleReport, CycleRunner,
};

#[derive(Parser)]
#[command(
    name = "autoeye",
    about = "AutoEye — market-structure detection over multiple timeframes"
)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every due pair once and exit.
    RunOnce {
        /// Rebuild from full history instead of the incremental tail.
        #[arg(long, default_value_t = false)]
        full_scan: bool,
    },
    /// Poll continuously until interrupted.
    Run {
        /// Full-scan on the first cycle.
        #[arg(long, default_value_t = false)]
        full_scan: bool,

        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<usize>,
    },
    /// Rebuild state from full history.
    FullScan {
        /// Symbols to rebuild. Defaults to every configured symbol.
        symbols: Vec<String>,
    },
    /// Summarize stored snapshots.
    Status,
    /// Export one symbol's elements as CSV.
    Export {
        #[arg(long)]
        symbol: String,

        /// Output file.
        #[arg(long)]
        out: PathBuf,
    },
    /// Replay a historical window and record the scenarios it would produce.
    Backtest {
        /// Window start (RFC 3339 or `YYYY-MM-DD HH:MM`, UTC).
        #[arg(long, value_parser = parse_utc)]
        start: DateTime<Utc>,

        /// Window end. Defaults to now.
        #[arg(long, value_parser = parse_utc)]
        end: Option<DateTime<Utc>>,

        /// Symbols to replay. Defaults to every configured symbol.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Output directory name under `<state_dir>/backtests`.
        #[arg(long)]
        run_id: Option<String>,

        /// M15 bars of history loaded before the window.
        #[arg(long, default_value_t = DEFAULT_WARMUP_BARS)]
        warmup_bars: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    match cli.command {
        Commands::RunOnce { full_scan } => {
            let options = CycleOptions {
                force_full: full_scan,
                symbols: None,
            };
            run_once(config, &options)
        }
        Commands::Run {
            full_scan,
            max_cycles,
        } => run_forever(config, full_scan, max_cycles),
        Commands::FullScan { symbols } => {
            let options = CycleOptions {
                force_full: true,
                symbols: (!symbols.is_empty()).then_some(symbols),
            };
            run_once(config, &options)
        }
        Commands::Status => run_status(&config),
        Commands::Export { symbol, out } => run_export(&config, &symbol, &out),
        Commands::Backtest {
            start,
            end,
            symbols,
            run_id,
            warmup_bars,
        } => {
            let mut options = BacktestOptions::new(start, end.unwrap_or_else(Utc::now));
            options.symbols = (!symbols.is_empty()).then_some(symbols);
            options.run_id = run_id;
            options.warmup_bars = warmup_bars;
            run_backtest_command(&config, &options)
        }
    }
}

fn parse_utc(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|t| t.and_utc())
        .ok_or_else(|| format!("unrecognized time {s:?}"))
}

fn load_config(path: Option<&Path>) -> Result<AutoEyeConfig> {
    match path {
        Some(path) => AutoEyeConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        // run commands still validate when the runner is built
        None => Ok(AutoEyeConfig::default()),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();
}

fn run_once(config: AutoEyeConfig, options: &CycleOptions) -> Result<()> {
    let source = CsvBarSource::new(&config.paths.bars_dir);
    let runner = CycleRunner::new(config)?;
    let report = runner.run_cycle(&source, Utc::now(), options)?;
    print_report(&report);
    Ok(())
}

fn run_forever(config: AutoEyeConfig, full_scan: bool, max_cycles: Option<usize>) -> Result<()> {
    let source = CsvBarSource::new(&config.paths.bars_dir);
    let runner = CycleRunner::new(config)?;
    info!(
        "polling every {}s, bars from {}",
        runner.config().schedule.poll_seconds,
        source.dir().display()
    );
    let cycles = runner.run_loop(&source, full_scan, None, max_cycles);
    info!("stopped after {cycles} cycle(s)");
    Ok(())
}

fn run_status(config: &AutoEyeConfig) -> Result<()> {
    let store = StateStore::new(&config.paths.state_dir);
    let statuses = store_status(&store)?;
    if statuses.is_empty() {
        println!("No snapshots in {}", store.root().display());
        return Ok(());
    }

    for status in &statuses {
        println!();
        println!(
            "{}  trend: {}  updated: {}  transitions: {}  deals: {}",
            status.symbol,
            status.trend.as_deref().unwrap_or("-"),
            status
                .updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".into()),
            status.transitions,
            status.deals,
        );
        println!(
            "  {:<4} {:>5} {:>5} {:>8} {:>5} {:>7}  {}",
            "TF", "Init", "FVG", "Fractal", "SNR", "Active", "Last Bar"
        );
        for tf in &status.timeframes {
            println!(
                "  {:<4} {:>5} {:>5} {:>8} {:>5} {:>7}  {}",
                tf.timeframe.as_str(),
                if tf.initialized { "yes" } else { "no" },
                tf.fvg,
                tf.fractal,
                tf.snr,
                tf.active,
                tf.last_bar_time
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into()),
            );
        }
    }
    Ok(())
}

fn run_export(config: &AutoEyeConfig, symbol: &str, out: &Path) -> Result<()> {
    let store = StateStore::new(&config.paths.state_dir);
    let n = export_symbol(&store, symbol, out)?;
    println!("Exported {n} element(s) for {symbol} to {}", out.display());
    Ok(())
}

fn run_backtest_command(config: &AutoEyeConfig, options: &BacktestOptions) -> Result<()> {
    let source = CsvBarSource::new(&config.paths.bars_dir);
    let report = run_backtest(config, &source, options, Utc::now())
        .with_context(|| format!("backtest from {} to {} failed", options.start, options.end))?;
    print_backtest(&report);
    Ok(())
}

fn print_backtest(report: &BacktestReport) {
    let s = &report.summary;
    println!();
    println!("=== Backtest {} ===", s.run_id);
    println!("Window:     {} .. {}", s.start, s.end);
    println!("Symbols:    {}", s.symbols_processed);
    println!("Steps:      {}", s.steps_processed);
    println!("Proposals:  {}", s.proposals_created);
    println!("Expired:    {}", s.scenarios_expired);
    println!("Events:     {}", s.events_written);
    println!("Output:     {}", report.output_dir.display());
    for e in &s.errors {
        eprintln!("FAILED: {e}");
    }
    println!();
}

fn print_report(report: &CycleReport) {
    println!();
    println!("=== Cycle ===");
    println!("Pairs:          {}", report.pairs.len());
    println!("Symbols written:{}", report.symbols_written);
    println!("Transitions:    {}", report.transitions_created);
    println!("Deals:          {}", report.deals_created);
    if !report.pairs.is_empty() {
        println!();
        println!(
            "{:<10} {:<4} {:<12} {:>5} {:>8} {:>7} {:>6}",
            "Symbol", "TF", "Mode", "New", "Updated", "Active", "Total"
        );
        println!("{}", "-".repeat(58));
        for p in &report.pairs {
            println!(
                "{:<10} {:<4} {:<12} {:>5} {:>8} {:>7} {:>6}",
                p.symbol,
                p.timeframe.as_str(),
                p.mode.to_string(),
                p.new_count,
                p.status_updated_count,
                p.total_active,
                p.total_elements,
            );
        }
    }
    for w in &report.warnings {
        println!("WARNING: {w}");
    }
    for f in &report.failures {
        eprintln!("FAILED: {f}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backtest_times_accept_rfc3339_and_plain_utc() {
        let want = Utc.with_ymd_and_hms(2026, 2, 3, 9, 30, 0).unwrap();
        assert_eq!(parse_utc("2026-02-03T09:30:00Z").unwrap(), want);
        assert_eq!(parse_utc("2026-02-03T11:30:00+02:00").unwrap(), want);
        assert_eq!(parse_utc("2026-02-03 09:30").unwrap(), want);
        assert!(parse_utc("yesterday").is_err());
    }

    #[test]
    fn backtest_symbols_split_on_commas() {
        let cli = Cli::try_parse_from([
            "autoeye",
            "backtest",
            "--start",
            "2026-02-03 00:00",
            "--symbols",
            "EURUSD,XAUUSD",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest {
                symbols,
                end,
                warmup_bars,
                ..
            } => {
                assert_eq!(symbols, vec!["EURUSD", "XAUUSD"]);
                assert!(end.is_none());
                assert_eq!(warmup_bars, DEFAULT_WARMUP_BARS);
            }
            _ => panic!("expected backtest"),
        }
    }
}

//! Reporting and export — CSV element tables and per-symbol status summaries.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use autoeye_core::domain::{Element, ElementKind, Timeframe};
use autoeye_core::snapshot::SymbolSnapshot;
use autoeye_core::store::StateStore;

// ─── CSV export ─────────────────────────────────────────────────────

/// Export every element of a snapshot as CSV, timeframe by timeframe.
///
/// Columns: symbol, timeframe, element_type, id, formation_time, signal_time,
/// direction, status, zone_low, zone_high, detail
pub fn export_elements_csv(snapshot: &SymbolSnapshot) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "symbol",
        "timeframe",
        "element_type",
        "id",
        "formation_time",
        "signal_time",
        "direction",
        "status",
        "zone_low",
        "zone_high",
        "detail",
    ])?;

    for (tf, state) in &snapshot.timeframes {
        for e in state.elements.iter() {
            let (low, high) = e.zone();
            wtr.write_record([
                &snapshot.symbol,
                tf.as_str(),
                e.element_type().as_str(),
                e.id.as_str(),
                &e.formation_time.to_rfc3339(),
                &e.signal_time().to_rfc3339(),
                e.direction().map(|d| d.as_str()).unwrap_or(""),
                e.status_label(),
                &format!("{low:.5}"),
                &format!("{high:.5}"),
                &detail(e),
            ])?;
        }
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

fn detail(element: &Element) -> String {
    match &element.kind {
        ElementKind::Fvg(f) => format!(
            "fill={:.2}%{}",
            f.fill_percent,
            f.mitigation_trigger
                .map(|t| format!(" trigger={t:?}").to_lowercase())
                .unwrap_or_default()
        ),
        ElementKind::Fractal(f) => format!("{} L={:.5}", f.fractal_type.as_str(), f.l_price),
        ElementKind::Snr(s) => format!("{} origin={}", s.break_type.as_str(), s.origin_fractal_id),
    }
}

/// Load `symbol` from the store and write its elements to `out`.
///
/// Returns the number of elements written.
pub fn export_symbol(store: &StateStore, symbol: &str, out: &Path) -> Result<usize> {
    let snapshot = store
        .load(symbol)
        .with_context(|| format!("failed to load snapshot for {symbol}"))?
        .with_context(|| format!("no snapshot stored for {symbol}"))?;
    let csv = export_elements_csv(&snapshot)?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(out, csv).with_context(|| format!("failed to write {}", out.display()))?;
    Ok(snapshot.timeframes.values().map(|s| s.elements.len()).sum())
}

// ─── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeframeStatus {
    pub timeframe: Timeframe,
    pub initialized: bool,
    pub fvg: usize,
    pub fractal: usize,
    pub snr: usize,
    pub active: usize,
    pub last_bar_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub trend: Option<String>,
    pub transitions: usize,
    pub deals: usize,
    pub timeframes: Vec<TimeframeStatus>,
}

pub fn symbol_status(snapshot: &SymbolSnapshot) -> SymbolStatus {
    SymbolStatus {
        symbol: snapshot.symbol.clone(),
        updated_at: snapshot.updated_at,
        trend: snapshot
            .derived
            .as_ref()
            .map(|d| format!("{:?}", d.trend.direction).to_lowercase()),
        transitions: snapshot.scenarios.as_ref().map_or(0, |b| b.transitions.len()),
        deals: snapshot.scenarios.as_ref().map_or(0, |b| b.deals.len()),
        timeframes: snapshot
            .timeframes
            .iter()
            .map(|(tf, state)| TimeframeStatus {
                timeframe: *tf,
                initialized: state.initialized,
                fvg: state.elements.fvg.len(),
                fractal: state.elements.fractal.len(),
                snr: state.elements.snr.len(),
                active: state.elements.active_count(),
                last_bar_time: state.last_bar_time,
            })
            .collect(),
    }
}

/// Status of every stored symbol.
pub fn store_status(store: &StateStore) -> Result<Vec<SymbolStatus>> {
    let mut out = Vec::new();
    for symbol in store.symbols().context("failed to list stored symbols")? {
        if let Some(snapshot) = store
            .load(&symbol)
            .with_context(|| format!("failed to load snapshot for {symbol}"))?
        {
            out.push(symbol_status(&snapshot));
        }
    }
    Ok(out)
}

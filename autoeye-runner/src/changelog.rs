//! Change log — JSONL append-only record of what each cycle changed.
//!
//! One file per symbol at `<state_dir>/changes/<SYMBOL>.jsonl`, one JSON
//! object per cycle that rewrote the snapshot. Downstream consumers tail
//! these files instead of diffing snapshots.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use autoeye_core::domain::{content_hash, ElementId, ElementType, Timeframe};
use autoeye_core::reconcile::ChangeKind;
use autoeye_core::scenario::ScenarioChange;

/// One element inserted or advanced during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementChange {
    pub id: ElementId,
    pub timeframe: Timeframe,
    pub element_type: ElementType,
    pub change: ChangeKind,
    pub status: String,
}

/// Everything one cycle changed for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub cycle_id: String,
    pub symbol: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub elements: Vec<ElementChange>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioChange>,
}

impl ChangeRecord {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.scenarios.is_empty()
    }
}

/// Stable id for one symbol's cycle started at `started_at`.
pub fn cycle_id(symbol: &str, started_at: DateTime<Utc>) -> String {
    content_hash(&["cycle", symbol, &started_at.to_rfc3339()])
}

/// Per-symbol JSONL change files under one directory.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    dir: PathBuf,
}

impl ChangeLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("changes"),
        }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.jsonl"))
    }

    /// Append one record.
    pub fn append(&self, record: &ChangeRecord) -> io::Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&record.symbol))?;

        writeln!(file, "{json}")?;
        file.flush()
    }

    /// Read a symbol's records in file order.
    ///
    /// Skips malformed lines.
    pub fn read_all(&self, symbol: &str) -> io::Result<Vec<ChangeRecord>> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = io::BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<ChangeRecord>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

//! Durable per-symbol snapshots.
//!
//! Layout: `{state_dir}/{SYMBOL}.json` plus `{state_dir}/schema_version.json`.
//!
//! Writes are atomic: serialize to `{SYMBOL}.json.tmp`, flush to disk, then
//! rename over the live file. A failed write leaves the previous snapshot
//! authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::snapshot::{SymbolSnapshot, SCHEMA_VERSION};

const SCHEMA_FILE: &str = "schema_version.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{symbol}: i/o error on {path}: {source}")]
    Io {
        symbol: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{symbol}: snapshot at {path} is not valid: {source}")]
    Corrupt {
        symbol: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{symbol}: failed to serialize snapshot: {source}")]
    Serialize {
        symbol: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SchemaFile {
    schema_version: String,
    updated_at: DateTime<Utc>,
    notes: String,
}

/// Snapshot files under one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("{symbol}.json"))
    }

    /// Load a symbol's snapshot; `None` when no (or an empty) file exists.
    ///
    /// Missing timeframe keys are filled in.
    pub fn load(&self, symbol: &str) -> Result<Option<SymbolSnapshot>, StoreError> {
        let path = self.path_for(symbol);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    symbol: symbol.to_string(),
                    path,
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let mut snapshot: SymbolSnapshot =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                symbol: symbol.to_string(),
                path: path.clone(),
                source,
            })?;
        snapshot.ensure_timeframes();
        Ok(Some(snapshot))
    }

    /// Atomically replace the symbol's snapshot.
    pub fn save(&self, snapshot: &SymbolSnapshot) -> Result<(), StoreError> {
        let symbol = snapshot.symbol.as_str();
        let path = self.path_for(symbol);
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| {
            StoreError::Serialize {
                symbol: symbol.to_string(),
                source,
            }
        })?;
        self.write_atomic(symbol, &path, json.as_bytes())
    }

    /// Write `schema_version.json` unless it already names the current version.
    pub fn ensure_schema_file(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let path = self.root.join(SCHEMA_FILE);
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(existing) = serde_json::from_str::<SchemaFile>(&content) {
                if existing.schema_version == SCHEMA_VERSION {
                    return Ok(());
                }
            }
        }
        let payload = SchemaFile {
            schema_version: SCHEMA_VERSION.to_string(),
            updated_at: now,
            notes: "per-symbol market structure snapshots".to_string(),
        };
        let json = serde_json::to_string_pretty(&payload).map_err(|source| {
            StoreError::Serialize {
                symbol: SCHEMA_FILE.to_string(),
                source,
            }
        })?;
        self.write_atomic(SCHEMA_FILE, &path, json.as_bytes())
    }

    /// Symbols with a stored snapshot, sorted.
    pub fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error("*", &self.root, source)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_error("*", &self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(SCHEMA_FILE) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn write_atomic(&self, symbol: &str, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| self.io_error(symbol, &self.root, e))?;

        let tmp_path = path.with_extension("json.tmp");
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(self.io_error(symbol, &tmp_path, e));
        }

        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            self.io_error(symbol, path, e)
        })
    }

    fn io_error(&self, symbol: &str, path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            symbol: symbol.to_string(),
            path: path.to_path_buf(),
            source,
        }
    }
}

//! TOML configuration for the runner.
//!
//! Every field has a default, so a minimal file only needs
//! `[engine] symbols = [...]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use autoeye_core::detect::DetectionConfig;
use autoeye_core::domain::{ElementType, Timeframe};
use autoeye_core::pipeline::PipelineConfig;
use autoeye_core::scenario::ScenarioConfig;

/// Poll intervals below this are raised to it.
pub const MIN_POLL_SECONDS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no symbols configured")]
    NoSymbols,

    #[error("unknown timeframe '{0}'")]
    UnknownTimeframe(String),

    #[error("unknown element type '{0}'")]
    UnknownElement(String),

    #[error("fractal_window must be odd and at least 3, got {0}")]
    FractalWindow(usize),

    #[error("{0} must be positive")]
    NonPositive(&'static str),
}

/// Which symbols, timeframes and element types to track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub symbols: Vec<String>,
    pub timeframes: Vec<String>,
    pub elements: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timeframes: Timeframe::ALL.iter().map(|t| t.as_str().to_string()).collect(),
            elements: ElementType::ALL.iter().map(|e| e.as_str().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub history_days: i64,
    pub history_buffer_days: i64,
    pub incremental_bars: usize,
    pub poll_seconds: u64,
    pub worker_threads: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            history_days: 30,
            history_buffer_days: 5,
            incremental_bars: 500,
            poll_seconds: 60,
            worker_threads: 4,
        }
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds.max(MIN_POLL_SECONDS))
    }

    /// Days of history a full scan fetches.
    pub fn full_scan_days(&self) -> i64 {
        self.history_days + self.history_buffer_days.max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub bars_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            bars_dir: PathBuf::from("bars"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-symbol overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    pub point_size: Option<f64>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEyeConfig {
    pub engine: EngineSection,
    pub detection: DetectionConfig,
    pub schedule: ScheduleConfig,
    pub scenario: ScenarioConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub symbols: BTreeMap<String, SymbolConfig>,
}

impl AutoEyeConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.symbols.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::NoSymbols);
        }
        self.timeframes()?;
        self.elements()?;

        let window = self.detection.fractal_window;
        if window < 3 || window % 2 == 0 {
            return Err(ConfigError::FractalWindow(window));
        }
        if self.detection.atr_period == 0 {
            return Err(ConfigError::NonPositive("detection.atr_period"));
        }
        if self.detection.median_body_period == 0 {
            return Err(ConfigError::NonPositive("detection.median_body_period"));
        }
        let k = self.detection.displacement_k;
        if !k.is_finite() || k <= 0.0 {
            return Err(ConfigError::NonPositive("detection.displacement_k"));
        }
        if self.schedule.history_days <= 0 {
            return Err(ConfigError::NonPositive("schedule.history_days"));
        }
        if self.schedule.incremental_bars == 0 {
            return Err(ConfigError::NonPositive("schedule.incremental_bars"));
        }
        if self.schedule.worker_threads == 0 {
            return Err(ConfigError::NonPositive("schedule.worker_threads"));
        }
        if self.scenario.expiry_hours <= 0 {
            return Err(ConfigError::NonPositive("scenario.expiry_hours"));
        }
        Ok(())
    }

    /// Configured symbols, trimmed, without blanks or repeats.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in &self.engine.symbols {
            let s = s.trim();
            if !s.is_empty() && !out.iter().any(|o| o == s) {
                out.push(s.to_string());
            }
        }
        out
    }

    /// Configured timeframes in cadence order.
    pub fn timeframes(&self) -> Result<Vec<Timeframe>, ConfigError> {
        let mut out = Vec::new();
        for name in &self.engine.timeframes {
            let tf: Timeframe = name
                .parse()
                .map_err(|_| ConfigError::UnknownTimeframe(name.clone()))?;
            if !out.contains(&tf) {
                out.push(tf);
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn elements(&self) -> Result<Vec<ElementType>, ConfigError> {
        let mut out = Vec::new();
        for name in &self.engine.elements {
            let element: ElementType = name
                .parse()
                .map_err(|_| ConfigError::UnknownElement(name.clone()))?;
            if !out.contains(&element) {
                out.push(element);
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(PipelineConfig::new(self.detection.clone(), self.elements()?))
    }

    /// Configured point size for `symbol`, if any.
    pub fn point_size(&self, symbol: &str) -> Option<f64> {
        self.symbols
            .get(symbol)
            .and_then(|s| s.point_size)
            .filter(|p| *p > 0.0)
    }
}

//! AutoEye Core — market-structure detection and state reconciliation.
//!
//! This crate contains the engine proper:
//! - Domain types (bars, timeframes, elements, content-derived ids, statuses)
//! - Detectors for fair-value gaps, fractals and support/resistance zones
//! - Lifecycle evaluator and id-based reconciler
//! - Per-pair pipeline shared by full-scan and incremental modes
//! - Per-symbol snapshots with an atomic file store
//! - Trend resolution and the scenario builder

pub mod detect;
pub mod domain;
pub mod fingerprint;
pub mod lifecycle;
pub mod pipeline;
pub mod reconcile;
pub mod scenario;
pub mod snapshot;
pub mod store;
pub mod trend;

//! Content-derived identifiers.
//!
//! Ids are BLAKE3 hashes over a `|`-joined seed of the fields that anchor an
//! element or scenario, so recomputing from the same bars always yields the
//! same id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex characters kept from the BLAKE3 digest.
const ID_LEN: usize = 20;

/// Hash a seed built from `parts` into a short stable id.
pub fn content_hash(parts: &[&str]) -> String {
    let seed = parts.join("|");
    let mut hex = blake3::hash(seed.as_bytes()).to_hex().to_string();
    hex.truncate(ID_LEN);
    hex
}

/// Canonical price text for id seeds.
pub fn price_key(price: f64) -> String {
    format!("{price:.10}")
}

/// Stable identity of a detected element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_seed(parts: &[&str]) -> Self {
        Self(content_hash(parts))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a transition or deal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(pub String);

impl ScenarioId {
    pub fn from_seed(parts: &[&str]) -> Self {
        Self(content_hash(parts))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Rule fingerprinting: identifies the detection settings a timeframe's
//! elements were built under.
//!
//! The fingerprint is a BLAKE3 hash over canonical JSON (`serde_json::Value`
//! maps are key-sorted), so field order in the config file does not matter.

use serde::Serialize;

use crate::detect::DetectionConfig;
use crate::domain::ElementType;

#[derive(Serialize)]
struct Rules<'a> {
    detection: &'a DetectionConfig,
    elements: Vec<ElementType>,
}

/// Fingerprint of `config` plus the enabled element types.
pub fn rules_fingerprint(config: &DetectionConfig, enabled: &[ElementType]) -> String {
    let mut elements = enabled.to_vec();
    elements.sort();
    elements.dedup();

    // Value maps are sorted, giving a canonical byte string
    let canonical = serde_json::to_value(Rules {
        detection: config,
        elements,
    })
    .map(|v| v.to_string())
    .unwrap_or_default();

    let mut hex = blake3::hash(canonical.as_bytes()).to_hex().to_string();
    hex.truncate(16);
    hex
}

//! Reconciler: merges detections and lifecycle updates into a timeframe's
//! persisted state.
//!
//! Ids are content-derived, so a re-detected candidate with a known id is the
//! same element and is dropped. Updates are applied only when the status
//! move is legal for the element's state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::{Element, ElementId, ElementKind, Lifecycle, LifecycleError};
use crate::snapshot::{ElementSet, TimeframeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
}

/// An update the reconciler refused to apply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RejectedUpdate {
    #[error("update for unknown element {0}")]
    Unknown(ElementId),

    #[error("update for {0} changes its element type")]
    TypeMismatch(ElementId),

    #[error("element {id}: {source}")]
    Lifecycle {
        id: ElementId,
        #[source]
        source: LifecycleError,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub inserted: Vec<ElementId>,
    pub updated: Vec<ElementId>,
    pub rejected: Vec<RejectedUpdate>,
}

impl MergeReport {
    /// Inserted then updated ids, each tagged with its change kind.
    pub fn changes(&self) -> impl Iterator<Item = (&ElementId, ChangeKind)> {
        self.inserted
            .iter()
            .map(|id| (id, ChangeKind::Inserted))
            .chain(self.updated.iter().map(|id| (id, ChangeKind::Updated)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub state: TimeframeState,
    pub changed: bool,
    pub report: MergeReport,
}

/// Merge `detected` candidates and `updates` into `prior`.
///
/// `changed` is true when an element was inserted, an element's value
/// differs from before, `last_bar_time` advanced, or the state was not yet
/// initialized. `updated_at` is left for the caller to stamp.
pub fn merge(
    prior: &TimeframeState,
    detected: Vec<Element>,
    updates: Vec<Element>,
    last_bar_time: Option<DateTime<Utc>>,
) -> MergeOutcome {
    let mut index: BTreeMap<ElementId, Element> = prior
        .elements
        .iter()
        .map(|e| (e.id.clone(), e.clone()))
        .collect();
    let mut report = MergeReport::default();

    for candidate in detected {
        if !index.contains_key(&candidate.id) {
            report.inserted.push(candidate.id.clone());
            index.insert(candidate.id.clone(), candidate);
        }
    }

    for update in updates {
        let Some(existing) = index.get_mut(&update.id) else {
            report.rejected.push(RejectedUpdate::Unknown(update.id));
            continue;
        };
        if let Err(rejection) = check_status_move(existing, &update) {
            report.rejected.push(rejection);
            continue;
        }
        if *existing != update {
            if !report.inserted.contains(&update.id) && !report.updated.contains(&update.id) {
                report.updated.push(update.id.clone());
            }
            *existing = update;
        }
    }

    let advanced = match (prior.last_bar_time, last_bar_time) {
        (Some(old), Some(new)) => new > old,
        (None, Some(_)) => true,
        _ => false,
    };

    let mut elements: Vec<Element> = index.into_values().collect();
    elements.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let changed = !report.inserted.is_empty()
        || !report.updated.is_empty()
        || advanced
        || !prior.initialized;

    let state = TimeframeState {
        initialized: true,
        updated_at: prior.updated_at,
        last_bar_time: if advanced { last_bar_time } else { prior.last_bar_time },
        full_scan_through: prior.full_scan_through,
        rules_fingerprint: prior.rules_fingerprint.clone(),
        elements: ElementSet::from_elements(elements),
    };

    MergeOutcome {
        state,
        changed,
        report,
    }
}

fn check_status_move(existing: &Element, update: &Element) -> Result<(), RejectedUpdate> {
    let lifecycle = |source: LifecycleError| RejectedUpdate::Lifecycle {
        id: update.id.clone(),
        source,
    };
    match (&existing.kind, &update.kind) {
        (ElementKind::Fvg(a), ElementKind::Fvg(b)) => {
            a.status.advance(b.status).map_err(lifecycle)?;
        }
        (ElementKind::Snr(a), ElementKind::Snr(b)) => {
            a.status.advance(b.status).map_err(lifecycle)?;
        }
        (ElementKind::Fractal(a), ElementKind::Fractal(b)) => {
            a.status.advance(b.status).map_err(lifecycle)?;
        }
        _ => return Err(RejectedUpdate::TypeMismatch(update.id.clone())),
    }
    Ok(())
}

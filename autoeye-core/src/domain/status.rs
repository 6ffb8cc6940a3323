//! Status state machines for elements and scenarios.
//!
//! Every status type moves forward only. `Lifecycle::advance` is the single
//! gate: staying put is always allowed, regressions and moves out of a
//! terminal state are rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Rejected status change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind} transition: {from} → {to}")]
pub struct LifecycleError {
    pub kind: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Forward-only finite state machine.
pub trait Lifecycle: Copy + Eq + fmt::Debug {
    const KIND: &'static str;

    fn label(self) -> &'static str;

    fn is_terminal(self) -> bool;

    /// Whether a move from `self` to a different state `next` is legal.
    fn permits(self, next: Self) -> bool;

    fn advance(self, next: Self) -> Result<Self, LifecycleError> {
        if next == self || self.permits(next) {
            Ok(next)
        } else {
            Err(LifecycleError {
                kind: Self::KIND,
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

/// FVG status: active → touched → mitigated_full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FvgStatus {
    Active,
    Touched,
    MitigatedFull,
}

impl Lifecycle for FvgStatus {
    const KIND: &'static str = "fvg";

    fn label(self) -> &'static str {
        match self {
            FvgStatus::Active => "active",
            FvgStatus::Touched => "touched",
            FvgStatus::MitigatedFull => "mitigated_full",
        }
    }

    fn is_terminal(self) -> bool {
        self == FvgStatus::MitigatedFull
    }

    fn permits(self, next: Self) -> bool {
        matches!(
            (self, next),
            (FvgStatus::Active, FvgStatus::Touched)
                | (FvgStatus::Active, FvgStatus::MitigatedFull)
                | (FvgStatus::Touched, FvgStatus::MitigatedFull)
        )
    }
}

/// SNR status: active → retested → invalidated (active → invalidated allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnrStatus {
    Active,
    Retested,
    Invalidated,
}

impl Lifecycle for SnrStatus {
    const KIND: &'static str = "snr";

    fn label(self) -> &'static str {
        match self {
            SnrStatus::Active => "active",
            SnrStatus::Retested => "retested",
            SnrStatus::Invalidated => "invalidated",
        }
    }

    fn is_terminal(self) -> bool {
        self == SnrStatus::Invalidated
    }

    fn permits(self, next: Self) -> bool {
        matches!(
            (self, next),
            (SnrStatus::Active, SnrStatus::Retested)
                | (SnrStatus::Active, SnrStatus::Invalidated)
                | (SnrStatus::Retested, SnrStatus::Invalidated)
        )
    }
}

/// Fractals are terminal once confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FractalStatus {
    Confirmed,
}

impl Lifecycle for FractalStatus {
    const KIND: &'static str = "fractal";

    fn label(self) -> &'static str {
        "confirmed"
    }

    fn is_terminal(self) -> bool {
        true
    }

    fn permits(self, _next: Self) -> bool {
        false
    }
}

/// Transition state: active → triggered | expired | invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    Active,
    Triggered,
    Expired,
    Invalid,
}

impl Lifecycle for TransitionState {
    const KIND: &'static str = "transition";

    fn label(self) -> &'static str {
        match self {
            TransitionState::Active => "active",
            TransitionState::Triggered => "triggered",
            TransitionState::Expired => "expired",
            TransitionState::Invalid => "invalid",
        }
    }

    fn is_terminal(self) -> bool {
        self != TransitionState::Active
    }

    fn permits(self, _next: Self) -> bool {
        self == TransitionState::Active
    }
}

/// Deal state: candidate → armed → entered; cancelled/expired from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealState {
    Candidate,
    Armed,
    Entered,
    Cancelled,
    Expired,
}

impl Lifecycle for DealState {
    const KIND: &'static str = "deal";

    fn label(self) -> &'static str {
        match self {
            DealState::Candidate => "candidate",
            DealState::Armed => "armed",
            DealState::Entered => "entered",
            DealState::Cancelled => "cancelled",
            DealState::Expired => "expired",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            DealState::Entered | DealState::Cancelled | DealState::Expired
        )
    }

    fn permits(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DealState::Cancelled | DealState::Expired => true,
            DealState::Armed => self == DealState::Candidate,
            DealState::Entered => self == DealState::Armed,
            DealState::Candidate => false,
        }
    }
}

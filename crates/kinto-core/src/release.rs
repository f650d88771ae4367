//! Release build state machine.
//!
//! A release only ever moves forward:
//!
//! ```text
//! pending ──► building ──► succeeded
//!    │            │  └───► failed
//!    └────────────┴──────► aborted
//! ```
//!
//! Succeeded, failed and aborted are terminal. The transition table is
//! independent of storage so callers can check a move before writing it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a release in its build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Building,
    Succeeded,
    Failed,
    Aborted,
}

impl BuildState {
    /// All states, in lifecycle order.
    pub const ALL: [BuildState; 5] = [
        BuildState::Pending,
        BuildState::Building,
        BuildState::Succeeded,
        BuildState::Failed,
        BuildState::Aborted,
    ];

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::Aborted
        )
    }

    /// Whether an abort request may still apply.
    pub fn is_in_flight(self) -> bool {
        matches!(self, BuildState::Pending | BuildState::Building)
    }

    /// Ordering rank: pending < building < {succeeded, failed, aborted}.
    pub fn rank(self) -> u8 {
        match self {
            BuildState::Pending => 0,
            BuildState::Building => 1,
            BuildState::Succeeded | BuildState::Failed | BuildState::Aborted => 2,
        }
    }

    /// Check a move from `self` to `to`.
    pub fn transition(self, to: BuildState) -> Result<BuildState, InvalidTransition> {
        if is_valid_transition(self, to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Building => "building",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
            BuildState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown build state: {s}"))
    }
}

/// Total transition-validity function for the build lifecycle.
pub fn is_valid_transition(from: BuildState, to: BuildState) -> bool {
    use BuildState::*;
    matches!(
        (from, to),
        (Pending, Building)
            | (Building, Succeeded)
            | (Building, Failed)
            | (Pending, Aborted)
            | (Building, Aborted)
    )
}

/// A rejected build state move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid build state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: BuildState,
    pub to: BuildState,
}

//! Severity and lifecycle enums shared by every scan component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a scan outcome.
///
/// Variants are declared from least to most severe, so the derived ordering
/// is the severity ordering: `Clear < Suspicious < Dangerous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningClass {
    /// Nothing found
    #[default]
    Clear,
    /// Heuristic or minority match
    Suspicious,
    /// Confirmed match
    Dangerous,
}

impl WarningClass {
    /// Whether this class counts as a detected threat.
    pub fn is_threat(&self) -> bool {
        matches!(self, WarningClass::Suspicious | WarningClass::Dangerous)
    }

    /// Check if this class is strictly more severe than `other`
    pub fn is_more_severe_than(&self, other: WarningClass) -> bool {
        *self > other
    }
}

impl fmt::Display for WarningClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => write!(f, "CLEAR"),
            Self::Suspicious => write!(f, "SUSPICIOUS"),
            Self::Dangerous => write!(f, "DANGEROUS"),
        }
    }
}

/// Running state of a background service (scan pipeline, download watcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Up,
    #[default]
    Down,
}

impl RunningState {
    pub fn is_up(&self) -> bool {
        matches!(self, RunningState::Up)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, RunningState::Down)
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

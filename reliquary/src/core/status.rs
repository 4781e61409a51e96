//! Closed set of run statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// `IN_PROGRESS` is initial. `DELIVERED` and `BLOCKED` are terminal.
/// `NEEDS_INFO` and `PENDING_APPROVAL` are gates: resting states that wait for
/// a human event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    NeedsInfo,
    PendingApproval,
    Blocked,
    Delivered,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::InProgress,
        RunStatus::NeedsInfo,
        RunStatus::PendingApproval,
        RunStatus::Blocked,
        RunStatus::Delivered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::NeedsInfo => "NEEDS_INFO",
            RunStatus::PendingApproval => "PENDING_APPROVAL",
            RunStatus::Blocked => "BLOCKED",
            RunStatus::Delivered => "DELIVERED",
        }
    }

    /// True if no transition leaves this status.
    pub fn is_terminal(self) -> bool {
        match self {
            RunStatus::Blocked | RunStatus::Delivered => true,
            RunStatus::InProgress | RunStatus::NeedsInfo | RunStatus::PendingApproval => false,
        }
    }

    /// True for the human-in-the-loop resting states.
    pub fn is_gate(self) -> bool {
        match self {
            RunStatus::NeedsInfo | RunStatus::PendingApproval => true,
            RunStatus::InProgress | RunStatus::Blocked | RunStatus::Delivered => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status '{0}' (expected one of IN_PROGRESS, NEEDS_INFO, PENDING_APPROVAL, BLOCKED, DELIVERED)")]
pub struct ParseStatusError(pub String);

impl FromStr for RunStatus {
    type Err = ParseStatusError;

    /// Parses the wire form; lowercase input is accepted for CLI convenience.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde() {
        for status in RunStatus::ALL {
            let json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("needs_info".parse::<RunStatus>(), Ok(RunStatus::NeedsInfo));
        assert_eq!(" DELIVERED ".parse::<RunStatus>(), Ok(RunStatus::Delivered));
        assert!("DONE".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_and_gate_sets_are_disjoint() {
        let terminal: Vec<_> = RunStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        let gates: Vec<_> = RunStatus::ALL.into_iter().filter(|s| s.is_gate()).collect();
        assert_eq!(terminal, vec![RunStatus::Blocked, RunStatus::Delivered]);
        assert_eq!(gates, vec![RunStatus::NeedsInfo, RunStatus::PendingApproval]);
    }
}

//! Legal status transitions for a run.
//!
//! [`apply`] is a pure function `(state, event) -> Result<Transition, InvalidTransition>`.
//! It never mutates its input; callers persist the returned state.

use crate::core::status::RunStatus;
use crate::core::types::{DecisionEvent, RunRecord};

/// Failure mode recorded when the attempt ceiling is reached.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
/// Failure mode recorded when a human rejects the run.
pub const REJECTED: &str = "rejected";

/// The mutable slice of a run that the state machine owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub implement_attempts: u32,
    pub pending_question: Option<String>,
    pub failure_mode: Option<String>,
}

impl RunState {
    pub fn initial() -> Self {
        Self {
            status: RunStatus::InProgress,
            implement_attempts: 0,
            pending_question: None,
            failure_mode: None,
        }
    }
}

impl From<&RunRecord> for RunState {
    fn from(record: &RunRecord) -> Self {
        Self {
            status: record.status,
            implement_attempts: record.implement_attempts,
            pending_question: record.pending_question.clone(),
            failure_mode: record.failure_mode.clone(),
        }
    }
}

/// External event applied to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    AttemptCompleted { success: bool },
    InfoRequested { question: String },
    InfoProvided { answer: String },
    ApprovalRequested,
    ApprovalDecided { approved: bool, reason: String },
    HardFailure { reason: String },
}

impl RunEvent {
    pub fn kind(&self) -> DecisionEvent {
        match self {
            RunEvent::AttemptCompleted { .. } => DecisionEvent::AttemptCompleted,
            RunEvent::InfoRequested { .. } => DecisionEvent::InfoRequested,
            RunEvent::InfoProvided { .. } => DecisionEvent::InfoProvided,
            RunEvent::ApprovalRequested => DecisionEvent::ApprovalRequested,
            RunEvent::ApprovalDecided { .. } => DecisionEvent::ApprovalDecided,
            RunEvent::HardFailure { .. } => DecisionEvent::HardFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{event} is not allowed from {from}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub event: DecisionEvent,
}

/// Accepted transition: previous status plus the complete next state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: RunStatus,
    pub event: DecisionEvent,
    pub next: RunState,
}

impl Transition {
    pub fn to(&self) -> RunStatus {
        self.next.status
    }

    /// True if this transition moves a run into a terminal status.
    pub fn completes(&self) -> bool {
        !self.from.is_terminal() && self.next.status.is_terminal()
    }
}

/// Apply `event` to `state`.
///
/// Every attempt increments `implement_attempts`, including the successful
/// one. A failed attempt that brings the count to `max_attempts` blocks the run.
pub fn apply(
    state: &RunState,
    event: &RunEvent,
    max_attempts: u32,
) -> Result<Transition, InvalidTransition> {
    let from = state.status;
    let reject = || InvalidTransition {
        from,
        event: event.kind(),
    };
    let mut next = state.clone();

    match event {
        RunEvent::AttemptCompleted { success } => {
            if from != RunStatus::InProgress {
                return Err(reject());
            }
            next.implement_attempts = state.implement_attempts.saturating_add(1);
            if *success {
                next.status = RunStatus::Delivered;
            } else if next.implement_attempts >= max_attempts {
                next.status = RunStatus::Blocked;
                next.failure_mode = Some(MAX_ATTEMPTS_EXCEEDED.to_string());
            }
        }
        RunEvent::InfoRequested { question } => {
            if from != RunStatus::InProgress {
                return Err(reject());
            }
            next.status = RunStatus::NeedsInfo;
            next.pending_question = Some(question.clone());
        }
        RunEvent::InfoProvided { .. } => {
            if from != RunStatus::NeedsInfo {
                return Err(reject());
            }
            next.status = RunStatus::InProgress;
            next.pending_question = None;
        }
        RunEvent::ApprovalRequested => {
            if from != RunStatus::InProgress {
                return Err(reject());
            }
            next.status = RunStatus::PendingApproval;
        }
        RunEvent::ApprovalDecided { approved, .. } => {
            if from != RunStatus::PendingApproval {
                return Err(reject());
            }
            if *approved {
                next.status = RunStatus::Delivered;
            } else {
                next.status = RunStatus::Blocked;
                next.failure_mode = Some(REJECTED.to_string());
            }
        }
        RunEvent::HardFailure { reason } => {
            if from.is_terminal() {
                return Err(reject());
            }
            next.status = RunStatus::Blocked;
            next.failure_mode = Some(reason.clone());
            next.pending_question = None;
        }
    }

    Ok(Transition {
        from,
        event: event.kind(),
        next,
    })
}

//! Rebuild a run record from its decision log.
//!
//! Used by reconciliation: after a failed rollback the decision log is the
//! source of truth and the record is re-derived from it.

use crate::core::state_machine::{MAX_ATTEMPTS_EXCEEDED, REJECTED};
use crate::core::status::RunStatus;
use crate::core::types::{DecisionEvent, DecisionLogEntry, RunRecord};

/// Derive status-owned fields of `record` from `decisions`.
///
/// Immutable metadata, `created_at`, `max_attempts` and `version` are taken
/// from `record` unchanged; `inconsistent` is left for the caller to clear.
pub fn project_from_log(record: &RunRecord, decisions: &[DecisionLogEntry]) -> RunRecord {
    let mut projected = record.clone();
    let status = decisions
        .iter()
        .rev()
        .find(|entry| entry.event != DecisionEvent::Reconciled)
        .map_or(RunStatus::InProgress, |entry| entry.to_status);

    projected.status = status;
    projected.implement_attempts = decisions
        .iter()
        .filter(|entry| entry.event == DecisionEvent::AttemptCompleted)
        .count() as u32;

    projected.pending_question = if status == RunStatus::NeedsInfo {
        decisions
            .iter()
            .rev()
            .find(|entry| entry.event == DecisionEvent::InfoRequested)
            .map(|entry| entry.reason.clone())
    } else {
        None
    };

    projected.failure_mode = if status == RunStatus::Blocked {
        record
            .failure_mode
            .clone()
            .or_else(|| blocking_failure_mode(decisions))
    } else {
        None
    };

    projected.completed_at = if status.is_terminal() {
        record.completed_at.clone().or_else(|| {
            decisions
                .iter()
                .find(|entry| entry.to_status.is_terminal())
                .map(|entry| entry.recorded_at.clone())
        })
    } else {
        None
    };

    projected
}

fn blocking_failure_mode(decisions: &[DecisionLogEntry]) -> Option<String> {
    let entry = decisions
        .iter()
        .find(|entry| entry.to_status == RunStatus::Blocked)?;
    let mode = match entry.event {
        DecisionEvent::AttemptCompleted => MAX_ATTEMPTS_EXCEEDED.to_string(),
        DecisionEvent::ApprovalDecided => REJECTED.to_string(),
        DecisionEvent::HardFailure => entry.reason.clone(),
        DecisionEvent::InfoRequested
        | DecisionEvent::InfoProvided
        | DecisionEvent::ApprovalRequested
        | DecisionEvent::Reconciled => return None,
    };
    Some(mode)
}

//! Cross-record invariants between a run, its evidence and its decision log.

use crate::core::chain::verify_chain;
use crate::core::status::RunStatus;
use crate::core::types::{DecisionEvent, DecisionLogEntry, EvidenceEntry, RunRecord};

/// Check the invariants that tie a run record to its logs:
/// - `completed_at` is set iff the status is terminal
/// - `pending_question` is set iff the status is `NEEDS_INFO`
/// - `failure_mode` is set iff the status is `BLOCKED`
/// - `implement_attempts` equals the number of `attempt_completed` entries
/// - `version` equals the decision log length
/// - the last decision ends in the current status
/// - evidence `seq` is contiguous and timestamps never go backwards
/// - the decision hash chain verifies
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_run(
    record: &RunRecord,
    evidence: &[EvidenceEntry],
    decisions: &[DecisionLogEntry],
) -> Vec<String> {
    let mut errors = Vec::new();
    let id = record.work_item_id.as_str();

    if record.completed_at.is_some() != record.status.is_terminal() {
        errors.push(format!(
            "{id}: completed_at must be set iff status is terminal (status={})",
            record.status
        ));
    }
    if record.pending_question.is_some() != (record.status == RunStatus::NeedsInfo) {
        errors.push(format!(
            "{id}: pending_question must be set iff status is NEEDS_INFO (status={})",
            record.status
        ));
    }
    if record.failure_mode.is_some() != (record.status == RunStatus::Blocked) {
        errors.push(format!(
            "{id}: failure_mode must be set iff status is BLOCKED (status={})",
            record.status
        ));
    }

    let attempts = decisions
        .iter()
        .filter(|entry| entry.event == DecisionEvent::AttemptCompleted)
        .count();
    if attempts != record.implement_attempts as usize {
        errors.push(format!(
            "{id}: implement_attempts {} does not match {} recorded attempts",
            record.implement_attempts, attempts
        ));
    }

    if record.version != decisions.len() as u64 {
        errors.push(format!(
            "{id}: version {} does not match decision log length {}",
            record.version,
            decisions.len()
        ));
    }

    let last_status = decisions
        .last()
        .map_or(RunStatus::InProgress, |entry| entry.to_status);
    if last_status != record.status {
        errors.push(format!(
            "{id}: status {} does not match last decision ({last_status})",
            record.status
        ));
    }

    for pair in decisions.windows(2) {
        if pair[1].from_status != pair[0].to_status {
            errors.push(format!(
                "{id}: decision {} starts at {} but previous decision ended at {}",
                pair[1].seq, pair[1].from_status, pair[0].to_status
            ));
        }
        if pair[1].recorded_at < pair[0].recorded_at {
            errors.push(format!(
                "{id}: decision {} recorded before decision {}",
                pair[1].seq, pair[0].seq
            ));
        }
    }

    for (index, entry) in evidence.iter().enumerate() {
        if entry.seq != index as u64 + 1 {
            errors.push(format!(
                "{id}: evidence entry {index} has seq {}, expected {}",
                entry.seq,
                index + 1
            ));
        }
        if entry.work_item_id != id {
            errors.push(format!(
                "{id}: evidence {} belongs to '{}'",
                entry.seq, entry.work_item_id
            ));
        }
    }
    for pair in evidence.windows(2) {
        if pair[1].recorded_at < pair[0].recorded_at {
            errors.push(format!(
                "{id}: evidence {} recorded before evidence {}",
                pair[1].seq, pair[0].seq
            ));
        }
    }

    if let Err(err) = verify_chain(id, decisions) {
        errors.push(format!("{id}: decision chain: {err}"));
    }

    errors
}

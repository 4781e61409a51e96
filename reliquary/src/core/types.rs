//! Shared deterministic types for run tracking.
//!
//! These types define stable contracts between the engine, the stores and the
//! HTTP/CLI surfaces. Field order is the serialized order; keep it stable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::status::RunStatus;

/// Upper bound on work item id length (ids name on-disk directories).
pub const MAX_WORK_ITEM_ID_LEN: usize = 128;

/// Durable record of one run, keyed by `work_item_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub work_item_id: String,
    pub repo_name: String,
    pub ticket_title: String,
    pub task_raw: String,
    pub status: RunStatus,
    /// Number of recorded attempts, successful or not.
    pub implement_attempts: u32,
    /// Attempt ceiling captured at creation.
    pub max_attempts: u32,
    pub failure_mode: Option<String>,
    pub pending_question: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    /// Committed transitions so far; equals the decision log length.
    pub version: u64,
    /// Set when a failed rollback left storage in an unknown state.
    pub inconsistent: Option<String>,
}

impl RunRecord {
    /// Fresh `IN_PROGRESS` record for a new work item.
    pub fn new(new_run: &NewRun, max_attempts: u32, now: &str) -> Self {
        Self {
            work_item_id: new_run.work_item_id.clone(),
            repo_name: new_run.repo_name.clone(),
            ticket_title: new_run.ticket_title.clone(),
            task_raw: new_run.task_raw.clone(),
            status: RunStatus::InProgress,
            implement_attempts: 0,
            max_attempts,
            failure_mode: None,
            pending_question: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            completed_at: None,
            version: 0,
            inconsistent: None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            work_item_id: self.work_item_id.clone(),
            repo_name: self.repo_name.clone(),
            task_raw: self.task_raw.clone(),
            ticket_title: self.ticket_title.clone(),
            final_status: self.status,
            implement_attempts: self.implement_attempts,
            completed_at: self.completed_at.clone(),
            failure_mode: self.failure_mode.clone(),
        }
    }
}

/// Metadata captured when a run is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    pub work_item_id: String,
    pub repo_name: String,
    pub ticket_title: String,
    pub task_raw: String,
}

/// Dashboard listing row. `final_status` mirrors the current status even when
/// the run is not terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub work_item_id: String,
    pub repo_name: String,
    pub task_raw: String,
    pub ticket_title: String,
    pub final_status: RunStatus,
    pub implement_attempts: u32,
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    TestRun,
    LintRun,
    Patch,
    Note,
    Artifact,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::TestRun => "test_run",
            EvidenceKind::LintRun => "lint_run",
            EvidenceKind::Patch => "patch",
            EvidenceKind::Note => "note",
            EvidenceKind::Artifact => "artifact",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "test_run" => Some(EvidenceKind::TestRun),
            "lint_run" => Some(EvidenceKind::LintRun),
            "patch" => Some(EvidenceKind::Patch),
            "note" => Some(EvidenceKind::Note),
            "artifact" => Some(EvidenceKind::Artifact),
            _ => None,
        }
    }
}

/// Evidence as submitted alongside an attempt, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceInput {
    pub kind: EvidenceKind,
    /// Path or URI of the stored artifact.
    pub payload_ref: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Immutable evidence entry; `seq` is 1-based and contiguous per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub work_item_id: String,
    pub seq: u64,
    pub recorded_at: String,
    pub kind: EvidenceKind,
    pub payload_ref: String,
    pub summary: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    System,
    Human,
}

/// Event that produced a decision log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEvent {
    AttemptCompleted,
    InfoRequested,
    InfoProvided,
    ApprovalRequested,
    ApprovalDecided,
    HardFailure,
    Reconciled,
}

impl DecisionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionEvent::AttemptCompleted => "attempt_completed",
            DecisionEvent::InfoRequested => "info_requested",
            DecisionEvent::InfoProvided => "info_provided",
            DecisionEvent::ApprovalRequested => "approval_requested",
            DecisionEvent::ApprovalDecided => "approval_decided",
            DecisionEvent::HardFailure => "hard_failure",
            DecisionEvent::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for DecisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit entry for one status transition.
///
/// `entry_hash` covers every other field, and `previous_hash` links to the
/// prior entry (or [`crate::core::chain::GENESIS`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub work_item_id: String,
    pub seq: u64,
    pub recorded_at: String,
    pub actor: Actor,
    pub event: DecisionEvent,
    pub from_status: RunStatus,
    pub to_status: RunStatus,
    pub reason: String,
    pub previous_hash: String,
    pub entry_hash: String,
}

/// Validate a work item id: `[A-Za-z0-9._-]`, non-empty, bounded length, and
/// not a relative path component.
pub fn validate_work_item_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("work item id must not be empty".to_string());
    }
    if id.len() > MAX_WORK_ITEM_ID_LEN {
        return Err(format!(
            "work item id must be at most {MAX_WORK_ITEM_ID_LEN} characters"
        ));
    }
    if id == "." || id == ".." {
        return Err(format!("work item id '{id}' is reserved"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!(
            "work item id must be [A-Za-z0-9._-] only (got '{id}')"
        ));
    }
    Ok(())
}

//! Error kinds surfaced by the workflow engine and query service.

use crate::core::state_machine::InvalidTransition;
use crate::core::status::RunStatus;
use crate::core::types::DecisionEvent;
use crate::exit_codes;
use crate::io::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run '{0}' not found")]
    RunNotFound(String),
    #[error("run '{0}' already exists")]
    DuplicateRun(String),
    #[error("run '{work_item_id}': {event} is not allowed from {current}")]
    InvalidTransition {
        work_item_id: String,
        current: RunStatus,
        event: DecisionEvent,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("run '{0}' was modified concurrently")]
    Conflict(String),
    #[error("run '{work_item_id}' is flagged inconsistent: {reason}")]
    Inconsistent { work_item_id: String, reason: String },
    #[error("corrupt run data: {0}")]
    Corrupt(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EngineError {
    pub fn invalid_transition(work_item_id: &str, err: InvalidTransition) -> Self {
        EngineError::InvalidTransition {
            work_item_id: work_item_id.to_string(),
            current: err.from,
            event: err.event,
        }
    }

    /// Stable CLI exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::RunNotFound(_) => exit_codes::NOT_FOUND,
            EngineError::DuplicateRun(_) | EngineError::Conflict(_) => exit_codes::CONFLICT,
            EngineError::InvalidTransition { .. } | EngineError::InvalidRequest(_) => {
                exit_codes::INVALID
            }
            EngineError::Inconsistent { .. } | EngineError::Corrupt(_) => {
                exit_codes::INCONSISTENT
            }
            EngineError::StorageFailure(_) => exit_codes::STORAGE,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::RunNotFound(id),
            StoreError::Duplicate(id) => EngineError::DuplicateRun(id),
            StoreError::Conflict { work_item_id, .. } => EngineError::Conflict(work_item_id),
            StoreError::Inconsistent {
                work_item_id,
                reason,
            } => EngineError::Inconsistent {
                work_item_id,
                reason,
            },
            StoreError::Corrupt(msg) => EngineError::Corrupt(msg),
            StoreError::Unavailable(msg) => EngineError::StorageFailure(msg),
        }
    }
}

//! Read-model projections over run records: filtering, listing order, stats.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::status::RunStatus;
use crate::core::types::RunRecord;

/// Optional equality filters for run listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub repo: Option<String>,
    pub status: Option<RunStatus>,
    pub failure_mode: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, record: &RunRecord) -> bool {
        if let Some(repo) = &self.repo
            && &record.repo_name != repo
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(mode) = &self.failure_mode
            && record.failure_mode.as_ref() != Some(mode)
        {
            return false;
        }
        true
    }
}

/// Aggregate statistics over all consistent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_runs: u64,
    pub successful_runs: u64,
    /// `successful_runs / total_runs`, 0 when there are no runs.
    pub success_rate: f64,
    pub avg_attempts: f64,
    pub failure_modes: BTreeMap<String, u64>,
}

/// Listing order: active runs first (newest created first), then terminal
/// runs (most recently completed first), ties broken by `work_item_id`.
pub fn listing_order(a: &RunRecord, b: &RunRecord) -> Ordering {
    let a_terminal = a.status.is_terminal();
    let b_terminal = b.status.is_terminal();
    a_terminal
        .cmp(&b_terminal)
        .then_with(|| {
            if a_terminal {
                b.completed_at.cmp(&a.completed_at)
            } else {
                b.created_at.cmp(&a.created_at)
            }
        })
        .then_with(|| a.work_item_id.cmp(&b.work_item_id))
}

/// Compute stats, skipping runs flagged inconsistent.
pub fn compute_stats(records: &[RunRecord]) -> Stats {
    let mut total_runs = 0u64;
    let mut successful_runs = 0u64;
    let mut attempts_sum = 0u64;
    let mut failure_modes = BTreeMap::new();

    for record in records.iter().filter(|r| r.inconsistent.is_none()) {
        total_runs += 1;
        attempts_sum += u64::from(record.implement_attempts);
        if record.status == RunStatus::Delivered {
            successful_runs += 1;
        }
        if let Some(mode) = &record.failure_mode {
            *failure_modes.entry(mode.clone()).or_insert(0) += 1;
        }
    }

    let (success_rate, avg_attempts) = if total_runs == 0 {
        (0.0, 0.0)
    } else {
        (
            successful_runs as f64 / total_runs as f64,
            attempts_sum as f64 / total_runs as f64,
        )
    };

    Stats {
        total_runs,
        successful_runs,
        success_rate,
        avg_attempts,
        failure_modes,
    }
}

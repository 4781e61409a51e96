//! Read-only query service over committed run state.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::core::invariants::validate_run;
use crate::core::projection::{RunFilter, Stats, compute_stats, listing_order};
use crate::core::types::{DecisionLogEntry, EvidenceEntry, RunRecord, RunSummary};
use crate::error::EngineError;
use crate::io::config::QueryConfig;
use crate::io::store::RunStore;

/// Result of checking one run's record against its logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub work_item_id: String,
    pub valid: bool,
    pub entries: usize,
    pub errors: Vec<String>,
}

pub struct QueryService<S: RunStore + ?Sized> {
    store: Arc<S>,
    limits: QueryConfig,
}

impl<S: RunStore + ?Sized> QueryService<S> {
    pub fn new(store: Arc<S>, limits: QueryConfig) -> Self {
        Self { store, limits }
    }

    /// Filtered listing in dashboard order.
    ///
    /// `limit` defaults to the configured default and is capped at
    /// `max_list_limit`. A limit of 0 returns no runs.
    pub fn list_runs(
        &self,
        filter: &RunFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RunSummary>, EngineError> {
        let limit = limit
            .unwrap_or(self.limits.default_list_limit)
            .min(self.limits.max_list_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut records: Vec<RunRecord> = self
            .store
            .records()?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by(listing_order);
        debug!(matched = records.len(), limit, offset, "listing runs");
        Ok(records
            .iter()
            .skip(offset)
            .take(limit)
            .map(RunRecord::summary)
            .collect())
    }

    pub fn get_stats(&self) -> Result<Stats, EngineError> {
        Ok(compute_stats(&self.store.records()?))
    }

    pub fn get_run(&self, id: &str) -> Result<RunRecord, EngineError> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))
    }

    pub fn get_evidence(&self, id: &str) -> Result<Vec<EvidenceEntry>, EngineError> {
        self.store
            .evidence(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))
    }

    pub fn get_decision_log(&self, id: &str) -> Result<Vec<DecisionLogEntry>, EngineError> {
        self.store
            .decisions(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))
    }

    /// Check the hash chain and the record/log invariants of one run.
    pub fn verify_decision_log(&self, id: &str) -> Result<VerifyReport, EngineError> {
        let record = self.get_run(id)?;
        let evidence = self.get_evidence(id)?;
        let decisions = self.get_decision_log(id)?;
        let mut errors = validate_run(&record, &evidence, &decisions);
        if let Some(reason) = &record.inconsistent {
            errors.push(format!("{id}: flagged inconsistent: {reason}"));
        }
        Ok(VerifyReport {
            work_item_id: id.to_string(),
            valid: errors.is_empty(),
            entries: decisions.len(),
            errors,
        })
    }
}

//! Run store abstraction.
//!
//! The [`RunStore`] trait decouples the workflow engine from persistence.
//! [`MemoryRunStore`] keeps everything in memory and doubles as the snapshot
//! index of [`crate::io::file_store::FileRunStore`].

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::core::chain::{GENESIS, tail_hash};
use crate::core::types::{DecisionLogEntry, EvidenceEntry, RunRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("run '{0}' not found")]
    NotFound(String),
    #[error("run '{0}' already exists")]
    Duplicate(String),
    #[error("run '{work_item_id}' is at version {actual}, expected {expected}")]
    Conflict {
        work_item_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("run '{work_item_id}' left inconsistent: {reason}")]
    Inconsistent { work_item_id: String, reason: String },
    #[error("{0}")]
    Corrupt(String),
    /// Transient failure; the only kind worth retrying.
    #[error("{0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Everything one transition writes, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Version the record had when the transition was computed.
    pub expected_version: u64,
    /// Record after the transition.
    pub record: RunRecord,
    pub decision: DecisionLogEntry,
    pub evidence: Vec<EvidenceEntry>,
}

impl Commit {
    pub fn work_item_id(&self) -> &str {
        &self.record.work_item_id
    }
}

/// Cheap view of a run used to build the next commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHead {
    pub record: RunRecord,
    pub evidence_len: u64,
    pub decision_len: u64,
    pub tail_hash: String,
}

/// A run with its full logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJournal {
    pub record: RunRecord,
    pub evidence: Vec<EvidenceEntry>,
    pub decisions: Vec<DecisionLogEntry>,
}

impl RunJournal {
    pub fn new(record: RunRecord) -> Self {
        Self {
            record,
            evidence: Vec::new(),
            decisions: Vec::new(),
        }
    }

    pub fn head(&self) -> RunHead {
        RunHead {
            record: self.record.clone(),
            evidence_len: self.evidence.len() as u64,
            decision_len: self.decisions.len() as u64,
            tail_hash: tail_hash(&self.decisions).to_string(),
        }
    }

    /// Reject a commit that was not computed against this exact journal.
    pub fn check(&self, commit: &Commit) -> Result<(), StoreError> {
        let id = commit.work_item_id();
        if self.record.version != commit.expected_version {
            return Err(StoreError::Conflict {
                work_item_id: id.to_string(),
                expected: commit.expected_version,
                actual: self.record.version,
            });
        }
        let expected_seq = self.decisions.len() as u64 + 1;
        let expected_link = self
            .decisions
            .last()
            .map_or(GENESIS, |entry| entry.entry_hash.as_str());
        if commit.decision.seq != expected_seq || commit.decision.previous_hash != expected_link {
            return Err(StoreError::Conflict {
                work_item_id: id.to_string(),
                expected: commit.decision.seq.saturating_sub(1),
                actual: self.decisions.len() as u64,
            });
        }
        let next_evidence = self.evidence.len() as u64 + 1;
        if commit
            .evidence
            .iter()
            .zip(next_evidence..)
            .any(|(entry, seq)| entry.seq != seq)
        {
            return Err(StoreError::Conflict {
                work_item_id: id.to_string(),
                expected: commit.evidence.first().map_or(0, |e| e.seq.saturating_sub(1)),
                actual: self.evidence.len() as u64,
            });
        }
        Ok(())
    }

    pub fn apply(&mut self, commit: &Commit) {
        self.record = commit.record.clone();
        self.evidence.extend(commit.evidence.iter().cloned());
        self.decisions.push(commit.decision.clone());
    }
}

/// Persistence seam for runs, evidence and decision logs.
///
/// Reads must return committed state only. `commit` is atomic: after an error
/// either nothing changed, or the run is flagged inconsistent and
/// [`StoreError::Inconsistent`] is returned.
pub trait RunStore: Send + Sync {
    /// Insert a new run; [`StoreError::Duplicate`] if the id exists.
    fn create(&self, record: &RunRecord) -> Result<(), StoreError>;

    fn get(&self, work_item_id: &str) -> Result<Option<RunRecord>, StoreError>;

    fn head(&self, work_item_id: &str) -> Result<Option<RunHead>, StoreError>;

    fn records(&self) -> Result<Vec<RunRecord>, StoreError>;

    fn evidence(&self, work_item_id: &str) -> Result<Option<Vec<EvidenceEntry>>, StoreError>;

    fn decisions(&self, work_item_id: &str)
    -> Result<Option<Vec<DecisionLogEntry>>, StoreError>;

    fn commit(&self, commit: &Commit) -> Result<(), StoreError>;

    /// Flag a run inconsistent; transitions are refused until reconciled.
    fn mark_inconsistent(&self, work_item_id: &str, reason: &str) -> Result<(), StoreError>;

    /// Re-read a run from its backing storage, replacing any cached view.
    fn reload(&self, work_item_id: &str) -> Result<Option<RunJournal>, StoreError>;
}

/// In-memory store. Every operation holds the map lock only for the duration
/// of a clone or an in-place update, so readers always see whole commits.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<BTreeMap<String, RunJournal>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or insert) a whole journal.
    pub fn put_journal(&self, journal: RunJournal) {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.insert(journal.record.work_item_id.clone(), journal);
    }

    pub fn journal(&self, work_item_id: &str) -> Option<RunJournal> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.get(work_item_id).cloned()
    }

    fn read<T>(&self, work_item_id: &str, f: impl FnOnce(&RunJournal) -> T) -> Option<T> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.get(work_item_id).map(f)
    }

    /// Check a commit against the current journal without applying it.
    pub fn check(&self, commit: &Commit) -> Result<(), StoreError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let id = commit.work_item_id();
        runs.get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .check(commit)
    }
}

impl RunStore for MemoryRunStore {
    fn create(&self, record: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&record.work_item_id) {
            return Err(StoreError::Duplicate(record.work_item_id.clone()));
        }
        runs.insert(
            record.work_item_id.clone(),
            RunJournal::new(record.clone()),
        );
        Ok(())
    }

    fn get(&self, work_item_id: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.read(work_item_id, |journal| journal.record.clone()))
    }

    fn head(&self, work_item_id: &str) -> Result<Option<RunHead>, StoreError> {
        Ok(self.read(work_item_id, RunJournal::head))
    }

    fn records(&self) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.values().map(|journal| journal.record.clone()).collect())
    }

    fn evidence(&self, work_item_id: &str) -> Result<Option<Vec<EvidenceEntry>>, StoreError> {
        Ok(self.read(work_item_id, |journal| journal.evidence.clone()))
    }

    fn decisions(
        &self,
        work_item_id: &str,
    ) -> Result<Option<Vec<DecisionLogEntry>>, StoreError> {
        Ok(self.read(work_item_id, |journal| journal.decisions.clone()))
    }

    fn commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let id = commit.work_item_id();
        let journal = runs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        journal.check(commit)?;
        journal.apply(commit);
        Ok(())
    }

    fn mark_inconsistent(&self, work_item_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let journal = runs
            .get_mut(work_item_id)
            .ok_or_else(|| StoreError::NotFound(work_item_id.to_string()))?;
        journal.record.inconsistent = Some(reason.to_string());
        Ok(())
    }

    fn reload(&self, work_item_id: &str) -> Result<Option<RunJournal>, StoreError> {
        Ok(self.journal(work_item_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::RunStatus;
    use crate::test_support::{commit_for, record_in};

    #[test]
    fn create_rejects_duplicates() {
        let store = MemoryRunStore::new();
        let record = record_in("W1", RunStatus::InProgress);
        store.create(&record).expect("create");
        assert_eq!(
            store.create(&record),
            Err(StoreError::Duplicate("W1".to_string()))
        );
    }

    #[test]
    fn commit_applies_all_parts() {
        let store = MemoryRunStore::new();
        store
            .create(&record_in("W1", RunStatus::InProgress))
            .expect("create");
        let head = store.head("W1").expect("head").expect("exists");
        let commit = commit_for(&head, RunStatus::PendingApproval, 2);
        store.commit(&commit).expect("commit");

        let head = store.head("W1").expect("head").expect("exists");
        assert_eq!(head.record.status, RunStatus::PendingApproval);
        assert_eq!(head.record.version, 1);
        assert_eq!(head.decision_len, 1);
        assert_eq!(head.evidence_len, 2);
        assert_eq!(head.tail_hash, commit.decision.entry_hash);
    }

    /// A commit built from a stale head loses and changes nothing.
    #[test]
    fn stale_commit_conflicts() {
        let store = MemoryRunStore::new();
        store
            .create(&record_in("W1", RunStatus::InProgress))
            .expect("create");
        let head = store.head("W1").expect("head").expect("exists");
        let first = commit_for(&head, RunStatus::InProgress, 0);
        let second = commit_for(&head, RunStatus::NeedsInfo, 1);
        store.commit(&first).expect("first");

        let err = store.commit(&second).expect_err("stale");
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.evidence("W1").expect("evidence"), Some(Vec::new()));
        assert_eq!(
            store.get("W1").expect("get").map(|r| r.status),
            Some(RunStatus::InProgress)
        );
    }

    #[test]
    fn commit_to_missing_run_is_not_found() {
        let store = MemoryRunStore::new();
        let head = RunJournal::new(record_in("W9", RunStatus::InProgress)).head();
        let err = store
            .commit(&commit_for(&head, RunStatus::InProgress, 0))
            .expect_err("missing");
        assert_eq!(err, StoreError::NotFound("W9".to_string()));
    }

    #[test]
    fn mark_inconsistent_sets_flag() {
        let store = MemoryRunStore::new();
        store
            .create(&record_in("W1", RunStatus::InProgress))
            .expect("create");
        store.mark_inconsistent("W1", "rollback failed").expect("mark");
        let record = store.get("W1").expect("get").expect("exists");
        assert_eq!(record.inconsistent.as_deref(), Some("rollback failed"));
    }
}

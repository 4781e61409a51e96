//! Test-only helpers for constructing runs, logs and stores.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tempfile::TempDir;

use crate::core::chain::seal;
use crate::core::status::RunStatus;
use crate::core::types::{
    Actor, DecisionEvent, DecisionLogEntry, EvidenceEntry, EvidenceKind, NewRun, RunRecord,
};
use crate::io::file_store::FileRunStore;
use crate::io::init::{InitOptions, ReliquaryPaths, init_reliquary};
use crate::io::store::{Commit, MemoryRunStore, RunHead, RunJournal, RunStore, StoreError};
use crate::project::{Project, open_project};

const CREATED_AT: &str = "2026-01-01T00:00:00.000Z";
const COMPLETED_AT: &str = "2026-01-01T01:00:00.000Z";

/// Deterministic creation metadata for `id`.
pub fn new_run(id: &str) -> NewRun {
    NewRun {
        work_item_id: id.to_string(),
        repo_name: "demo".to_string(),
        ticket_title: format!("{id} title"),
        task_raw: format!("{id} task"),
    }
}

/// A record in `status` whose status-owned fields look consistent.
///
/// Attempts and version stay at zero; tests set them when they matter.
pub fn record_in(id: &str, status: RunStatus) -> RunRecord {
    let mut record = RunRecord::new(&new_run(id), 4, CREATED_AT);
    record.status = status;
    if status.is_terminal() {
        record.completed_at = Some(COMPLETED_AT.to_string());
    }
    match status {
        RunStatus::Blocked => record.failure_mode = Some("hard_failure".to_string()),
        RunStatus::NeedsInfo => record.pending_question = Some("which branch?".to_string()),
        RunStatus::InProgress | RunStatus::PendingApproval | RunStatus::Delivered => {}
    }
    record
}

/// A sealed, linked decision log with one second between entries.
pub fn decision_chain(
    id: &str,
    steps: &[(DecisionEvent, RunStatus, RunStatus)],
) -> Vec<DecisionLogEntry> {
    let mut entries: Vec<DecisionLogEntry> = Vec::with_capacity(steps.len());
    for (index, (event, from, to)) in steps.iter().enumerate() {
        let seq = index as u64 + 1;
        let previous_hash = entries
            .last()
            .map_or(crate::core::chain::GENESIS.to_string(), |e| e.entry_hash.clone());
        let actor = match event {
            DecisionEvent::InfoProvided | DecisionEvent::ApprovalDecided => Actor::Human,
            _ => Actor::System,
        };
        entries.push(seal(DecisionLogEntry {
            work_item_id: id.to_string(),
            seq,
            recorded_at: format!("2026-01-01T00:00:{seq:02}.000Z"),
            actor,
            event: *event,
            from_status: *from,
            to_status: *to,
            reason: format!("{event} #{seq}"),
            previous_hash,
            entry_hash: String::new(),
        }));
    }
    entries
}

/// A well-formed commit moving `head` to `to` with `evidence` note entries.
pub fn commit_for(head: &RunHead, to: RunStatus, evidence: usize) -> Commit {
    let id = head.record.work_item_id.clone();
    let event = match to {
        RunStatus::InProgress => DecisionEvent::AttemptCompleted,
        RunStatus::NeedsInfo => DecisionEvent::InfoRequested,
        RunStatus::PendingApproval => DecisionEvent::ApprovalRequested,
        RunStatus::Delivered => DecisionEvent::ApprovalDecided,
        RunStatus::Blocked => DecisionEvent::HardFailure,
    };
    let seq = head.decision_len + 1;
    let recorded_at = format!("2026-01-02T00:00:{seq:02}.000Z");

    let mut record = head.record.clone();
    record.status = to;
    record.version = head.record.version + 1;
    record.updated_at = recorded_at.clone();

    let evidence = (0..evidence as u64)
        .map(|offset| EvidenceEntry {
            work_item_id: id.clone(),
            seq: head.evidence_len + offset + 1,
            recorded_at: recorded_at.clone(),
            kind: EvidenceKind::Note,
            payload_ref: format!("notes/{}.md", head.evidence_len + offset + 1),
            summary: None,
            exit_code: None,
        })
        .collect();

    let decision = seal(DecisionLogEntry {
        work_item_id: id,
        seq,
        recorded_at,
        actor: Actor::System,
        event,
        from_status: head.record.status,
        to_status: to,
        reason: format!("{event} #{seq}"),
        previous_hash: head.tail_hash.clone(),
        entry_hash: String::new(),
    });

    Commit {
        expected_version: head.record.version,
        record,
        decision,
        evidence,
    }
}

/// In-memory store with injectable commit faults.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryRunStore,
    transient_failures: AtomicU32,
    tear_next: AtomicBool,
    commit_calls: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commits with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next commit land its logs but not its record, then report the
    /// run inconsistent, as a file store does when rollback fails.
    pub fn tear_next_commit(&self) {
        self.tear_next.store(true, Ordering::SeqCst);
    }

    /// Number of `commit` calls seen so far, including failed ones.
    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }
}

impl RunStore for FaultyStore {
    fn create(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.create(record)
    }

    fn get(&self, work_item_id: &str) -> Result<Option<RunRecord>, StoreError> {
        self.inner.get(work_item_id)
    }

    fn head(&self, work_item_id: &str) -> Result<Option<RunHead>, StoreError> {
        self.inner.head(work_item_id)
    }

    fn records(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.records()
    }

    fn evidence(&self, work_item_id: &str) -> Result<Option<Vec<EvidenceEntry>>, StoreError> {
        self.inner.evidence(work_item_id)
    }

    fn decisions(
        &self,
        work_item_id: &str,
    ) -> Result<Option<Vec<DecisionLogEntry>>, StoreError> {
        self.inner.decisions(work_item_id)
    }

    fn commit(&self, commit: &Commit) -> Result<(), StoreError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        if self.tear_next.swap(false, Ordering::SeqCst) {
            let id = commit.work_item_id();
            self.inner.check(commit)?;
            let mut journal = self
                .inner
                .journal(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let reason = "injected rollback failure".to_string();
            journal.evidence.extend(commit.evidence.iter().cloned());
            journal.decisions.push(commit.decision.clone());
            journal.record.inconsistent = Some(reason.clone());
            self.inner.put_journal(journal);
            return Err(StoreError::Inconsistent {
                work_item_id: id.to_string(),
                reason,
            });
        }
        self.inner.commit(commit)
    }

    fn mark_inconsistent(&self, work_item_id: &str, reason: &str) -> Result<(), StoreError> {
        self.inner.mark_inconsistent(work_item_id, reason)
    }

    fn reload(&self, work_item_id: &str) -> Result<Option<RunJournal>, StoreError> {
        self.inner.reload(work_item_id)
    }
}

/// An initialized project directory that lives as long as the value.
pub struct TestProject {
    _temp: TempDir,
    pub root: PathBuf,
    pub paths: ReliquaryPaths,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let paths = init_reliquary(&root, &InitOptions { force: false }).expect("init project");
        Self {
            _temp: temp,
            root,
            paths,
        }
    }

    pub fn open(&self) -> Project<FileRunStore> {
        open_project(&self.root).expect("open project")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

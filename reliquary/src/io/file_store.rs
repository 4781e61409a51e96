//! File-backed run store under `.reliquary/runs/`.
//!
//! Each run owns a directory with `run.json`, `evidence.jsonl` and
//! `decision_log.jsonl`. A commit appends evidence, appends the decision, then
//! atomically replaces `run.json`. If any step fails, both logs are truncated
//! back to their previous length. If that truncation fails too, an
//! `INCONSISTENT` marker is written and the run is flagged until reconciled.
//!
//! Reads are served from an in-memory index that is only updated after a
//! commit is durable, so readers never observe a half-written transition.
//!
//! Several processes may open the same project (the CLI next to a running
//! server). Writers take an exclusive lock on the run's `.lock` file and
//! compare the on-disk head with their index before writing; a run moved by
//! another process is refreshed and the stale commit fails with
//! [`StoreError::Conflict`]. Loads take the same lock shared.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use fd_lock::RwLock as FileLock;
use tracing::{debug, error, info, warn};

use crate::core::chain::tail_hash;
use crate::core::types::{DecisionLogEntry, EvidenceEntry, RunRecord, validate_work_item_id};
use crate::io::decision_log::{append_decision, load_decision_log};
use crate::io::evidence_store::{append_evidence, load_evidence};
use crate::io::init::{ReliquaryPaths, RunPaths};
use crate::io::jsonl::{create_empty, file_len, read_lines, truncate_to};
use crate::io::run_records::{load_record, write_record};
use crate::io::store::{Commit, MemoryRunStore, RunHead, RunJournal, RunStore, StoreError};

#[derive(Debug)]
pub struct FileRunStore {
    paths: ReliquaryPaths,
    index: MemoryRunStore,
    /// Runs whose `run.json` could not be read at all, with the load error.
    damaged: RwLock<BTreeMap<String, String>>,
    /// Serializes disk writes so check, write and index update happen together.
    write_lock: Mutex<()>,
}

/// Where a run's files say it is; compared against the index before writing.
#[derive(Debug, PartialEq, Eq)]
struct DiskPosition {
    version: u64,
    decision_len: u64,
    tail_hash: String,
}

impl DiskPosition {
    fn of(head: &RunHead) -> Self {
        Self {
            version: head.record.version,
            decision_len: head.decision_len,
            tail_hash: head.tail_hash.clone(),
        }
    }

    fn read(run: &RunPaths) -> Result<Self> {
        let record = load_record(&run.record_path)?;
        let decisions: Vec<DecisionLogEntry> = read_lines(&run.decision_log_path)?;
        Ok(Self {
            version: record.version,
            decision_len: decisions.len() as u64,
            tail_hash: tail_hash(&decisions).to_string(),
        })
    }
}

impl FileRunStore {
    /// Load every run under `paths.runs_dir`.
    ///
    /// A run that fails to load does not stop the others: it is flagged
    /// inconsistent with the load error, or kept out of the index entirely
    /// when not even its `run.json` is readable.
    pub fn open(paths: &ReliquaryPaths) -> Result<Self> {
        let index = MemoryRunStore::new();
        let mut damaged = BTreeMap::new();
        let entries = match fs::read_dir(&paths.runs_dir) {
            Ok(entries) => Some(entries),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", paths.runs_dir.display()));
            }
        };
        let mut loaded = 0usize;
        for entry in entries.into_iter().flatten() {
            let entry = entry.with_context(|| format!("read {}", paths.runs_dir.display()))?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(work_item_id) = name.to_str() else {
                warn!(dir = ?name, "skipping run directory with non-utf8 name");
                continue;
            };
            if let Err(reason) = validate_work_item_id(work_item_id) {
                warn!(dir = work_item_id, reason = %reason, "skipping foreign directory");
                continue;
            }
            let run = paths.run_dir(work_item_id);
            match load_shared(&run, work_item_id) {
                Ok(journal) => {
                    if let Some(reason) = &journal.record.inconsistent {
                        warn!(work_item_id, reason = %reason, "run is flagged inconsistent");
                    }
                    index.put_journal(journal);
                    loaded += 1;
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    error!(work_item_id, reason = %reason, "run failed to load");
                    match salvage_journal(&run, work_item_id, &reason) {
                        Some(journal) => index.put_journal(journal),
                        None => {
                            damaged.insert(work_item_id.to_string(), reason);
                        }
                    }
                }
            }
        }
        debug!(
            runs = loaded,
            damaged = damaged.len(),
            dir = %paths.runs_dir.display(),
            "opened run store"
        );
        Ok(Self {
            paths: paths.clone(),
            index,
            damaged: RwLock::new(damaged),
            write_lock: Mutex::new(()),
        })
    }

    fn write_commit(&self, run: &RunPaths, head: &RunHead, commit: &Commit) -> Result<()> {
        append_evidence(&run.evidence_path, head.evidence_len, &commit.evidence)?;
        append_decision(
            &run.decision_log_path,
            head.decision_len,
            &head.tail_hash,
            &commit.decision,
        )?;
        write_record(&run.record_path, &commit.record)?;
        Ok(())
    }

    fn roll_back(
        &self,
        run: &RunPaths,
        work_item_id: &str,
        lengths: (u64, u64),
        cause: &anyhow::Error,
    ) -> StoreError {
        let (evidence_len, decision_len) = lengths;
        let rolled_back = truncate_to(&run.evidence_path, evidence_len)
            .and_then(|()| truncate_to(&run.decision_log_path, decision_len));
        match rolled_back {
            Ok(()) => {
                warn!(work_item_id, err = %format!("{cause:#}"), "commit failed; rolled back");
                StoreError::Unavailable(format!("{cause:#}"))
            }
            Err(rollback_err) => {
                let reason = format!("commit failed ({cause:#}); rollback failed ({rollback_err:#})");
                error!(work_item_id, reason = %reason, "run left inconsistent");
                if let Err(err) = self.flag(run, work_item_id, &reason) {
                    error!(work_item_id, err = %format!("{err:#}"), "failed to write inconsistent marker");
                }
                StoreError::Inconsistent {
                    work_item_id: work_item_id.to_string(),
                    reason,
                }
            }
        }
    }

    fn flag(&self, run: &RunPaths, work_item_id: &str, reason: &str) -> Result<()> {
        // The index flag must be set even if the marker cannot be written.
        let indexed = self.index.mark_inconsistent(work_item_id, reason);
        fs::write(&run.inconsistent_marker_path, format!("{reason}\n")).with_context(|| {
            format!("write {}", run.inconsistent_marker_path.display())
        })?;
        indexed.map_err(anyhow::Error::from)
    }

    /// Catch the index up with commits made by another process. Caller holds
    /// the run's exclusive file lock.
    fn refresh(&self, run: &RunPaths, work_item_id: &str) -> Result<(), StoreError> {
        let cached = self
            .index
            .head(work_item_id)?
            .ok_or_else(|| StoreError::NotFound(work_item_id.to_string()))?;
        let on_disk = DiskPosition::read(run).map_err(|err| corrupt(&err))?;
        if on_disk == DiskPosition::of(&cached) {
            return Ok(());
        }
        warn!(
            work_item_id,
            cached_version = cached.record.version,
            disk_version = on_disk.version,
            "run changed on disk; refreshing index"
        );
        let journal = load_journal(run, work_item_id).map_err(|err| corrupt(&err))?;
        self.index.put_journal(journal);
        Ok(())
    }

    fn damage(&self, work_item_id: &str) -> Option<String> {
        let damaged = self.damaged.read().unwrap_or_else(PoisonError::into_inner);
        damaged.get(work_item_id).cloned()
    }

    /// Handle an index miss: report a damaged run, or adopt a run that another
    /// process created after this store was opened.
    fn on_miss(&self, work_item_id: &str) -> Result<(), StoreError> {
        if let Some(reason) = self.damage(work_item_id) {
            return Err(StoreError::Corrupt(format!(
                "run '{work_item_id}' failed to load: {reason}"
            )));
        }
        if validate_work_item_id(work_item_id).is_err() {
            return Ok(());
        }
        let run = self.paths.run_dir(work_item_id);
        // `run.json` is written last by `create`.
        if !run.record_path.is_file() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.index.get(work_item_id)?.is_some() {
            return Ok(());
        }
        let journal = load_shared(&run, work_item_id).map_err(|err| corrupt(&err))?;
        debug!(work_item_id, "adopted run created by another process");
        self.index.put_journal(journal);
        Ok(())
    }

    fn read_through<T>(
        &self,
        work_item_id: &str,
        read: impl Fn(&MemoryRunStore) -> Result<Option<T>, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        if let Some(found) = read(&self.index)? {
            return Ok(Some(found));
        }
        self.on_miss(work_item_id)?;
        read(&self.index)
    }
}

fn open_file_lock(run: &RunPaths) -> Result<FileLock<File>, StoreError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&run.lock_path)
        .map(FileLock::new)
        .map_err(|err| StoreError::Unavailable(format!("open {}: {err}", run.lock_path.display())))
}

/// Load a run while holding its file lock shared, so a concurrent writer in
/// another process is never observed halfway.
fn load_shared(run: &RunPaths, work_item_id: &str) -> Result<RunJournal> {
    let file_lock = open_file_lock(run)?;
    let _held = file_lock
        .read()
        .with_context(|| format!("lock {}", run.lock_path.display()))?;
    load_journal(run, work_item_id)
}

fn load_journal(run: &RunPaths, work_item_id: &str) -> Result<RunJournal> {
    let mut record = load_record(&run.record_path)?;
    if record.work_item_id != work_item_id {
        anyhow::bail!(
            "{}: record belongs to '{}'",
            run.record_path.display(),
            record.work_item_id
        );
    }
    let evidence = load_evidence(&run.evidence_path)?;
    let decisions = load_decision_log(&run.decision_log_path, work_item_id)?;
    match fs::read_to_string(&run.inconsistent_marker_path) {
        Ok(reason) => {
            let reason = reason.trim();
            record.inconsistent = Some(if reason.is_empty() {
                "inconsistent marker present".to_string()
            } else {
                reason.to_string()
            });
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read {}", run.inconsistent_marker_path.display()));
        }
    }
    // A torn commit whose marker was lost still shows as a log ahead of the record.
    if record.inconsistent.is_none() && record.version != decisions.len() as u64 {
        record.inconsistent = Some(format!(
            "decision log has {} entries but run.json is at version {}",
            decisions.len(),
            record.version
        ));
    }
    Ok(RunJournal {
        record,
        evidence,
        decisions,
    })
}

/// Best-effort view of a run that failed to load, flagged with the load error.
/// `None` when not even the record is usable.
fn salvage_journal(run: &RunPaths, work_item_id: &str, reason: &str) -> Option<RunJournal> {
    let mut record = load_record(&run.record_path).ok()?;
    if record.work_item_id != work_item_id {
        return None;
    }
    record.inconsistent = Some(reason.to_string());
    Some(RunJournal {
        record,
        evidence: read_lines(&run.evidence_path).unwrap_or_default(),
        decisions: read_lines(&run.decision_log_path).unwrap_or_default(),
    })
}

fn unavailable(err: &anyhow::Error) -> StoreError {
    StoreError::Unavailable(format!("{err:#}"))
}

fn corrupt(err: &anyhow::Error) -> StoreError {
    StoreError::Corrupt(format!("{err:#}"))
}

impl RunStore for FileRunStore {
    fn create(&self, record: &RunRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let id = record.work_item_id.as_str();
        if self.index.get(id)?.is_some() || self.damage(id).is_some() {
            return Err(StoreError::Duplicate(id.to_string()));
        }
        let run = self.paths.run_dir(id);
        match fs::create_dir(&run.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Duplicate(id.to_string()));
            }
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "create {}: {err}",
                    run.dir.display()
                )));
            }
        }
        let written = create_empty(&run.evidence_path)
            .and_then(|()| create_empty(&run.decision_log_path))
            .and_then(|()| write_record(&run.record_path, record));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_dir_all(&run.dir) {
                warn!(work_item_id = id, err = %cleanup, "failed to remove partial run directory");
            }
            return Err(unavailable(&err));
        }
        self.index.create(record)?;
        info!(work_item_id = id, "run created");
        Ok(())
    }

    fn get(&self, work_item_id: &str) -> Result<Option<RunRecord>, StoreError> {
        self.read_through(work_item_id, |index| index.get(work_item_id))
    }

    fn head(&self, work_item_id: &str) -> Result<Option<RunHead>, StoreError> {
        self.read_through(work_item_id, |index| index.head(work_item_id))
    }

    fn records(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.index.records()
    }

    fn evidence(&self, work_item_id: &str) -> Result<Option<Vec<EvidenceEntry>>, StoreError> {
        self.read_through(work_item_id, |index| index.evidence(work_item_id))
    }

    fn decisions(
        &self,
        work_item_id: &str,
    ) -> Result<Option<Vec<DecisionLogEntry>>, StoreError> {
        self.read_through(work_item_id, |index| index.decisions(work_item_id))
    }

    fn commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let id = commit.work_item_id();
        let run = self.paths.run_dir(id);
        let mut file_lock = open_file_lock(&run)?;
        let _held = file_lock.write().map_err(|err| {
            StoreError::Unavailable(format!("lock {}: {err}", run.lock_path.display()))
        })?;

        self.refresh(&run, id)?;
        self.index.check(commit)?;
        let head = self
            .index
            .head(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let evidence_len = file_len(&run.evidence_path).map_err(|err| unavailable(&err))?;
        let decision_len = file_len(&run.decision_log_path).map_err(|err| unavailable(&err))?;

        if let Err(err) = self.write_commit(&run, &head, commit) {
            return Err(self.roll_back(&run, id, (evidence_len, decision_len), &err));
        }

        if commit.record.inconsistent.is_none()
            && let Err(err) = fs::remove_file(&run.inconsistent_marker_path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(work_item_id = id, err = %err, "failed to remove inconsistent marker");
        }

        self.index.commit(commit)?;
        debug!(
            work_item_id = id,
            version = commit.record.version,
            evidence = commit.evidence.len(),
            "commit durable"
        );
        Ok(())
    }

    fn mark_inconsistent(&self, work_item_id: &str, reason: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.index.get(work_item_id)?.is_none() {
            return Err(StoreError::NotFound(work_item_id.to_string()));
        }
        let run = self.paths.run_dir(work_item_id);
        let mut file_lock = open_file_lock(&run)?;
        let _held = file_lock.write().map_err(|err| {
            StoreError::Unavailable(format!("lock {}: {err}", run.lock_path.display()))
        })?;
        self.flag(&run, work_item_id, reason)
            .map_err(|err| unavailable(&err))
    }

    fn reload(&self, work_item_id: &str) -> Result<Option<RunJournal>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = self.index.get(work_item_id)?;
        let damage = self.damage(work_item_id);
        if cached.is_none() && damage.is_none() {
            return Ok(None);
        }
        let run = self.paths.run_dir(work_item_id);
        let mut journal = load_shared(&run, work_item_id).map_err(|err| corrupt(&err))?;
        if journal.record.inconsistent.is_none() {
            journal.record.inconsistent = cached.and_then(|record| record.inconsistent).or(damage);
        }
        self.damaged
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(work_item_id);
        self.index.put_journal(journal.clone());
        Ok(Some(journal))
    }
}

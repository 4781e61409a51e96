//! Workflow engine: the only writer of run state.
//!
//! Every operation loads the run head, applies the state machine, and commits
//! the new record together with its decision entry (and any evidence) as one
//! unit. Operations on the same run are serialized by a per-run lock; the store
//! additionally rejects commits computed against a stale version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, instrument};

use crate::core::chain::{seal, tail_hash, verify_chain};
use crate::core::replay::project_from_log;
use crate::core::state_machine::{RunEvent, RunState, Transition, apply};
use crate::core::types::{
    Actor, DecisionEvent, DecisionLogEntry, EvidenceInput, NewRun, RunRecord,
    validate_work_item_id,
};
use crate::error::EngineError;
use crate::io::config::ReliquaryConfig;
use crate::io::evidence_store::sequence_evidence;
use crate::io::retry::RetryPolicy;
use crate::io::store::{Commit, RunStore, StoreError};

pub struct Engine<S: RunStore + ?Sized> {
    store: Arc<S>,
    max_attempts: u32,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: RunStore + ?Sized> Engine<S> {
    pub fn new(store: Arc<S>, cfg: &ReliquaryConfig) -> Self {
        Self::with_policy(store, cfg.max_attempts, RetryPolicy::from_config(&cfg.store))
    }

    pub fn with_policy(store: Arc<S>, max_attempts: u32, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_attempts,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a run in `IN_PROGRESS` with zero attempts. No decision is logged.
    #[instrument(skip_all, fields(work_item_id = %new_run.work_item_id))]
    pub fn create_run(&self, new_run: NewRun) -> Result<RunRecord, EngineError> {
        validate_work_item_id(&new_run.work_item_id).map_err(EngineError::InvalidRequest)?;
        for (field, value) in [
            ("repo_name", &new_run.repo_name),
            ("ticket_title", &new_run.ticket_title),
            ("task_raw", &new_run.task_raw),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidRequest(format!("{field} must not be empty")));
            }
        }
        let record = RunRecord::new(&new_run, self.max_attempts, &now());
        self.retry
            .run("create", || self.store.create(&record))
            .map_err(EngineError::from)?;
        info!(repo = %record.repo_name, max_attempts = record.max_attempts, "run created");
        Ok(record)
    }

    /// Record one implementation attempt with its evidence.
    ///
    /// Success delivers the run. A failure either keeps it `IN_PROGRESS` or,
    /// at the attempt ceiling, blocks it with `max_attempts_exceeded`.
    #[instrument(skip_all, fields(work_item_id = id, success = success))]
    pub fn record_attempt(
        &self,
        id: &str,
        success: bool,
        evidence: Vec<EvidenceInput>,
    ) -> Result<RunRecord, EngineError> {
        for input in &evidence {
            if input.payload_ref.trim().is_empty() {
                return Err(EngineError::InvalidRequest(
                    "evidence payload_ref must not be empty".to_string(),
                ));
            }
        }
        self.transition(
            id,
            Actor::System,
            RunEvent::AttemptCompleted { success },
            evidence,
        )
    }

    #[instrument(skip_all, fields(work_item_id = id))]
    pub fn request_info(&self, id: &str, question: &str) -> Result<RunRecord, EngineError> {
        let question = required("question", question)?;
        self.transition(
            id,
            Actor::System,
            RunEvent::InfoRequested { question },
            Vec::new(),
        )
    }

    #[instrument(skip_all, fields(work_item_id = id))]
    pub fn provide_info(&self, id: &str, answer: &str) -> Result<RunRecord, EngineError> {
        let answer = required("answer", answer)?;
        self.transition(id, Actor::Human, RunEvent::InfoProvided { answer }, Vec::new())
    }

    #[instrument(skip_all, fields(work_item_id = id))]
    pub fn request_approval(&self, id: &str) -> Result<RunRecord, EngineError> {
        self.transition(id, Actor::System, RunEvent::ApprovalRequested, Vec::new())
    }

    /// Human approval decision. A rejection must carry a reason.
    #[instrument(skip_all, fields(work_item_id = id, approved = approved))]
    pub fn decide_approval(
        &self,
        id: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<RunRecord, EngineError> {
        let reason = reason.map(str::trim).unwrap_or_default().to_string();
        if !approved && reason.is_empty() {
            return Err(EngineError::InvalidRequest(
                "a rejection requires a reason".to_string(),
            ));
        }
        self.transition(
            id,
            Actor::Human,
            RunEvent::ApprovalDecided { approved, reason },
            Vec::new(),
        )
    }

    /// Block a non-terminal run with an explicit failure mode.
    #[instrument(skip_all, fields(work_item_id = id))]
    pub fn fail_run(&self, id: &str, failure_mode: &str) -> Result<RunRecord, EngineError> {
        let reason = required("failure_mode", failure_mode)?;
        self.transition(id, Actor::System, RunEvent::HardFailure { reason }, Vec::new())
    }

    /// Rebuild a flagged run from its decision log and clear the flag.
    ///
    /// The record is re-derived from the verified log, then committed together
    /// with a `reconciled` entry that keeps the current status.
    #[instrument(skip_all, fields(work_item_id = id))]
    pub fn reconcile(&self, id: &str) -> Result<RunRecord, EngineError> {
        self.locked(id, || self.reconcile_locked(id))
    }

    fn reconcile_locked(&self, id: &str) -> Result<RunRecord, EngineError> {
        let journal = self
            .store
            .reload(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))?;
        let Some(flag) = journal.record.inconsistent.clone() else {
            return Err(EngineError::InvalidRequest(format!(
                "run '{id}' is not flagged inconsistent"
            )));
        };
        verify_chain(id, &journal.decisions)
            .map_err(|err| EngineError::Corrupt(format!("{id}: decision log: {err}")))?;

        let latest = journal
            .decisions
            .last()
            .map_or("", |entry| entry.recorded_at.as_str())
            .max(journal.record.updated_at.as_str());
        let now = now_after(latest);
        let mut record = project_from_log(&journal.record, &journal.decisions);
        record.inconsistent = None;
        record.version = journal.decisions.len() as u64 + 1;
        record.updated_at = now.clone();

        let decision = seal(DecisionLogEntry {
            work_item_id: id.to_string(),
            seq: journal.decisions.len() as u64 + 1,
            recorded_at: now,
            actor: Actor::System,
            event: DecisionEvent::Reconciled,
            from_status: record.status,
            to_status: record.status,
            reason: format!("cleared inconsistent flag: {flag}"),
            previous_hash: tail_hash(&journal.decisions).to_string(),
            entry_hash: String::new(),
        });
        let commit = Commit {
            expected_version: journal.record.version,
            record,
            decision,
            evidence: Vec::new(),
        };
        self.commit(&commit)?;
        info!(status = %commit.record.status, version = commit.record.version, "run reconciled");
        Ok(commit.record)
    }

    pub fn get_run(&self, id: &str) -> Result<RunRecord, EngineError> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))
    }

    fn transition(
        &self,
        id: &str,
        actor: Actor,
        event: RunEvent,
        evidence: Vec<EvidenceInput>,
    ) -> Result<RunRecord, EngineError> {
        self.locked(id, || self.transition_locked(id, actor, event, evidence))
    }

    fn transition_locked(
        &self,
        id: &str,
        actor: Actor,
        event: RunEvent,
        evidence: Vec<EvidenceInput>,
    ) -> Result<RunRecord, EngineError> {
        let head = self
            .store
            .head(id)?
            .ok_or_else(|| EngineError::RunNotFound(id.to_string()))?;
        if let Some(reason) = &head.record.inconsistent {
            return Err(EngineError::Inconsistent {
                work_item_id: id.to_string(),
                reason: reason.clone(),
            });
        }

        let transition = apply(
            &RunState::from(&head.record),
            &event,
            head.record.max_attempts,
        )
        .map_err(|err| {
            debug!(from = %err.from, event = %err.event, "transition rejected");
            EngineError::invalid_transition(id, err)
        })?;

        let now = now_after(&head.record.updated_at);
        let mut record = head.record.clone();
        record.status = transition.next.status;
        record.implement_attempts = transition.next.implement_attempts;
        record.pending_question = transition.next.pending_question.clone();
        record.failure_mode = transition.next.failure_mode.clone();
        record.updated_at = now.clone();
        record.version = head.record.version + 1;
        if transition.completes() {
            record.completed_at = Some(now.clone());
        }

        let decision = seal(DecisionLogEntry {
            work_item_id: id.to_string(),
            seq: head.decision_len + 1,
            recorded_at: now.clone(),
            actor,
            event: transition.event,
            from_status: transition.from,
            to_status: transition.to(),
            reason: describe(&event, &transition, head.record.max_attempts),
            previous_hash: head.tail_hash.clone(),
            entry_hash: String::new(),
        });
        let commit = Commit {
            expected_version: head.record.version,
            evidence: sequence_evidence(id, head.evidence_len, &now, evidence),
            record,
            decision,
        };
        self.commit(&commit)?;

        info!(
            event = %transition.event,
            from = %transition.from,
            to = %transition.to(),
            attempts = commit.record.implement_attempts,
            "run transitioned"
        );
        Ok(commit.record)
    }

    fn commit(&self, commit: &Commit) -> Result<(), EngineError> {
        self.retry
            .run("commit", || self.store.commit(commit))
            .map_err(|err| {
                if let StoreError::Inconsistent { reason, .. } = &err {
                    error!(reason = %reason, "commit left run inconsistent");
                }
                EngineError::from(err)
            })
    }

    /// Run `f` holding the lock of run `id`.
    ///
    /// Unknown and malformed ids are rejected before a lock is allocated, and
    /// the last holder removes the entry so the map only tracks runs in use.
    fn locked<T>(
        &self,
        id: &str,
        f: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        validate_work_item_id(id).map_err(EngineError::InvalidRequest)?;
        if self.store.get(id)?.is_none() {
            return Err(EngineError::RunNotFound(id.to_string()));
        }

        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        result
    }
}

fn required(field: &str, value: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

fn describe(event: &RunEvent, transition: &Transition, max_attempts: u32) -> String {
    match event {
        RunEvent::AttemptCompleted { success: true } => {
            format!("attempt {} succeeded", transition.next.implement_attempts)
        }
        RunEvent::AttemptCompleted { success: false } => {
            let attempt = transition.next.implement_attempts;
            if transition.completes() {
                format!("attempt {attempt} failed; max attempts ({max_attempts}) reached")
            } else {
                format!("attempt {attempt} failed")
            }
        }
        RunEvent::InfoRequested { question } => question.clone(),
        RunEvent::InfoProvided { answer } => answer.clone(),
        RunEvent::ApprovalRequested => "approval requested".to_string(),
        RunEvent::ApprovalDecided { approved, reason } => {
            if !reason.is_empty() {
                reason.clone()
            } else if *approved {
                "approved".to_string()
            } else {
                "rejected".to_string()
            }
        }
        RunEvent::HardFailure { reason } => reason.clone(),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time, never earlier than `previous` (guards against clock steps).
fn now_after(previous: &str) -> String {
    let now = now();
    if now.as_str() < previous {
        previous.to_string()
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::core::invariants::validate_run;
    use crate::core::projection::compute_stats;
    use crate::core::state_machine::{MAX_ATTEMPTS_EXCEEDED, REJECTED};
    use crate::core::status::RunStatus;
    use crate::core::types::EvidenceKind;
    use crate::io::store::MemoryRunStore;
    use crate::test_support::{FaultyStore, new_run};

    fn engine() -> Engine<MemoryRunStore> {
        Engine::with_policy(Arc::new(MemoryRunStore::new()), 4, RetryPolicy::none())
    }

    fn note(payload_ref: &str) -> EvidenceInput {
        EvidenceInput {
            kind: EvidenceKind::TestRun,
            payload_ref: payload_ref.to_string(),
            summary: Some("cargo test".to_string()),
            exit_code: Some(1),
        }
    }

    fn assert_consistent<S: RunStore + ?Sized>(engine: &Engine<S>, id: &str) {
        let record = engine.get_run(id).expect("record");
        let evidence = engine.store().evidence(id).expect("evidence").expect("run");
        let decisions = engine.store().decisions(id).expect("decisions").expect("run");
        assert_eq!(validate_run(&record, &evidence, &decisions), Vec::<String>::new());
    }

    /// Two failures then a success: delivered after three attempts.
    #[test]
    fn retries_until_delivered() {
        let engine = engine();
        engine.create_run(new_run("W1")).expect("create");
        engine
            .record_attempt("W1", false, vec![note("logs/1.txt")])
            .expect("attempt 1");
        engine
            .record_attempt("W1", false, vec![note("logs/2.txt")])
            .expect("attempt 2");
        let record = engine
            .record_attempt("W1", true, vec![note("logs/3.txt")])
            .expect("attempt 3");

        assert_eq!(record.status, RunStatus::Delivered);
        assert_eq!(record.implement_attempts, 3);
        assert!(record.completed_at.is_some());
        let decisions = engine.store().decisions("W1").expect("log").expect("run");
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[2].reason, "attempt 3 succeeded");
        assert_eq!(
            engine.store().evidence("W1").expect("evidence").map(|e| e.len()),
            Some(3)
        );
        assert_consistent(&engine, "W1");
    }

    #[test]
    fn info_round_trip_then_approval() {
        let engine = engine();
        engine.create_run(new_run("W2")).expect("create");
        let record = engine
            .request_info("W2", "which database?")
            .expect("request info");
        assert_eq!(record.status, RunStatus::NeedsInfo);
        assert_eq!(record.pending_question.as_deref(), Some("which database?"));

        let record = engine.provide_info("W2", "postgres").expect("provide");
        assert_eq!(record.status, RunStatus::InProgress);
        assert_eq!(record.pending_question, None);

        engine.request_approval("W2").expect("request approval");
        let record = engine
            .decide_approval("W2", true, None)
            .expect("approve");
        assert_eq!(record.status, RunStatus::Delivered);
        assert_eq!(record.implement_attempts, 0);

        let decisions = engine.store().decisions("W2").expect("log").expect("run");
        let actors: Vec<Actor> = decisions.iter().map(|d| d.actor).collect();
        assert_eq!(
            actors,
            vec![Actor::System, Actor::Human, Actor::System, Actor::Human]
        );
        assert_consistent(&engine, "W2");
    }

    #[test]
    fn blocks_at_attempt_ceiling() {
        let engine = engine();
        engine.create_run(new_run("W3")).expect("create");
        for _ in 0..3 {
            engine.record_attempt("W3", false, Vec::new()).expect("attempt");
        }
        let record = engine
            .record_attempt("W3", false, Vec::new())
            .expect("last attempt");
        assert_eq!(record.status, RunStatus::Blocked);
        assert_eq!(record.failure_mode.as_deref(), Some(MAX_ATTEMPTS_EXCEEDED));
        assert_eq!(record.implement_attempts, 4);

        let err = engine
            .record_attempt("W3", true, Vec::new())
            .expect_err("terminal");
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                current: RunStatus::Blocked,
                ..
            }
        ));
        assert_consistent(&engine, "W3");
    }

    #[test]
    fn rejected_transition_leaves_run_untouched() {
        let engine = engine();
        let created = engine.create_run(new_run("W4")).expect("create");
        let err = engine.provide_info("W4", "an answer").expect_err("not waiting");
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                current: RunStatus::InProgress,
                event: DecisionEvent::InfoProvided,
                ..
            }
        ));
        assert_eq!(engine.get_run("W4").expect("get"), created);
        assert_eq!(
            engine.store().decisions("W4").expect("log"),
            Some(Vec::new())
        );
    }

    #[test]
    fn approval_writes_exactly_one_entry() {
        let engine = engine();
        engine.create_run(new_run("W5")).expect("create");
        engine.request_approval("W5").expect("request");
        let before = engine.store().decisions("W5").expect("log").expect("run").len();
        let record = engine
            .decide_approval("W5", true, Some("looks good"))
            .expect("approve");
        let decisions = engine.store().decisions("W5").expect("log").expect("run");
        assert_eq!(decisions.len(), before + 1);
        assert_eq!(decisions[before].reason, "looks good");
        assert_eq!(record.completed_at.as_deref(), Some(decisions[before].recorded_at.as_str()));
    }

    #[test]
    fn rejection_requires_reason() {
        let engine = engine();
        engine.create_run(new_run("W6")).expect("create");
        engine.request_approval("W6").expect("request");
        let err = engine
            .decide_approval("W6", false, Some("   "))
            .expect_err("empty reason");
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let record = engine
            .decide_approval("W6", false, Some("breaks the API"))
            .expect("reject");
        assert_eq!(record.status, RunStatus::Blocked);
        assert_eq!(record.failure_mode.as_deref(), Some(REJECTED));
    }

    #[test]
    fn fail_run_blocks_with_given_mode() {
        let engine = engine();
        engine.create_run(new_run("W7")).expect("create");
        engine.request_info("W7", "credentials?").expect("ask");
        let record = engine.fail_run("W7", "repo_archived").expect("fail");
        assert_eq!(record.status, RunStatus::Blocked);
        assert_eq!(record.failure_mode.as_deref(), Some("repo_archived"));
        assert_eq!(record.pending_question, None);
        assert_consistent(&engine, "W7");
    }

    #[test]
    fn create_validates_input() {
        let engine = engine();
        engine.create_run(new_run("W8")).expect("create");
        assert!(matches!(
            engine.create_run(new_run("W8")),
            Err(EngineError::DuplicateRun(_))
        ));
        assert!(matches!(
            engine.create_run(new_run("../escape")),
            Err(EngineError::InvalidRequest(_))
        ));
        let mut blank = new_run("W9");
        blank.task_raw = " ".to_string();
        assert!(matches!(
            engine.create_run(blank),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.request_approval("missing"),
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[test]
    fn run_locks_are_released_after_use() {
        let engine = engine();
        for i in 0..100 {
            let id = format!("nope-{i}");
            assert!(matches!(
                engine.provide_info(&id, "answer"),
                Err(EngineError::RunNotFound(_))
            ));
        }
        assert!(matches!(
            engine.request_approval("../escape"),
            Err(EngineError::InvalidRequest(_))
        ));
        engine.create_run(new_run("L1")).expect("create");
        engine.request_approval("L1").expect("request");
        assert!(engine.request_approval("L1").is_err());
        let tracked = engine.locks.lock().unwrap_or_else(PoisonError::into_inner).len();
        assert_eq!(tracked, 0);
    }

    /// Concurrent answer and attempt: whichever order wins, the log and the
    /// record agree.
    #[test]
    fn concurrent_transitions_stay_consistent() {
        for _ in 0..20 {
            let engine = Arc::new(engine());
            engine.create_run(new_run("R1")).expect("create");
            engine.request_info("R1", "which branch?").expect("ask");

            let barrier = Arc::new(Barrier::new(2));
            let answer = {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.provide_info("R1", "main").map(|r| r.status)
                })
            };
            let attempt = {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.record_attempt("R1", false, Vec::new()).map(|r| r.status)
                })
            };

            assert!(answer.join().expect("join").is_ok());
            let attempted = attempt.join().expect("join");
            let record = engine.get_run("R1").expect("get");
            let expected_version = if attempted.is_ok() { 3 } else { 2 };
            assert_eq!(record.version, expected_version);
            assert_eq!(record.status, RunStatus::InProgress);
            assert_consistent(engine.as_ref(), "R1");
        }
    }

    #[test]
    fn transient_commit_failures_are_retried() {
        let store = Arc::new(FaultyStore::new());
        let engine = Engine::with_policy(
            Arc::clone(&store),
            4,
            RetryPolicy {
                retries: 2,
                backoff: std::time::Duration::ZERO,
            },
        );
        engine.create_run(new_run("F1")).expect("create");
        store.fail_next_commits(2);
        engine.request_approval("F1").expect("succeeds on third try");
        assert_eq!(store.commit_calls(), 3);

        store.fail_next_commits(3);
        let err = engine.decide_approval("F1", true, None).expect_err("exhausted");
        assert!(matches!(err, EngineError::StorageFailure(_)));
        assert_eq!(
            engine.get_run("F1").expect("get").status,
            RunStatus::PendingApproval
        );
    }

    /// A torn commit flags the run; it is refused and excluded from stats
    /// until reconcile rebuilds it from the log.
    #[test]
    fn torn_commit_is_flagged_then_reconciled() {
        let store = Arc::new(FaultyStore::new());
        let engine = Engine::with_policy(Arc::clone(&store), 4, RetryPolicy::none());
        engine.create_run(new_run("T1")).expect("create");
        engine.create_run(new_run("T2")).expect("create");
        engine.record_attempt("T2", true, Vec::new()).expect("deliver");

        store.tear_next_commit();
        let err = engine.request_approval("T1").expect_err("torn");
        assert!(matches!(err, EngineError::Inconsistent { .. }));

        let err = engine.record_attempt("T1", true, Vec::new()).expect_err("flagged");
        assert!(matches!(err, EngineError::Inconsistent { .. }));
        let stats = compute_stats(&store.records().expect("records"));
        assert_eq!(stats.total_runs, 1);

        assert!(matches!(
            engine.reconcile("T2"),
            Err(EngineError::InvalidRequest(_))
        ));
        let record = engine.reconcile("T1").expect("reconcile");
        assert_eq!(record.status, RunStatus::PendingApproval);
        assert_eq!(record.inconsistent, None);
        assert_eq!(record.version, 2);
        let decisions = store.decisions("T1").expect("log").expect("run");
        assert_eq!(decisions[1].event, DecisionEvent::Reconciled);
        assert_consistent(&engine, "T1");

        engine.decide_approval("T1", true, None).expect("approve");
        assert_eq!(compute_stats(&store.records().expect("records")).total_runs, 2);
    }
}

//! Append-only, hash-chained decision log files (`decision_log.jsonl`).

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::chain::{entry_hash, verify_chain};
use crate::core::types::DecisionLogEntry;
use crate::io::jsonl::{append_lines, read_lines};

/// Append one sealed entry; it must link to `expected_tail` and follow `expected_len`.
pub fn append_decision(
    path: &Path,
    expected_len: u64,
    expected_tail: &str,
    entry: &DecisionLogEntry,
) -> Result<()> {
    if entry.seq != expected_len + 1 {
        return Err(anyhow!(
            "decision seq {} does not follow {expected_len}",
            entry.seq
        ));
    }
    if entry.previous_hash != expected_tail {
        return Err(anyhow!("decision {} does not link to log tail", entry.seq));
    }
    if entry.entry_hash != entry_hash(entry) {
        return Err(anyhow!("decision {} is not sealed", entry.seq));
    }
    append_lines(path, std::slice::from_ref(entry))
}

/// Load and verify a run's decision log.
pub fn load_decision_log(path: &Path, work_item_id: &str) -> Result<Vec<DecisionLogEntry>> {
    let entries: Vec<DecisionLogEntry> = read_lines(path)?;
    verify_chain(work_item_id, &entries)
        .map_err(|err| anyhow!("{}: {err}", path.display()))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::chain::GENESIS;
    use crate::core::status::RunStatus;
    use crate::core::types::DecisionEvent;
    use crate::test_support::decision_chain;

    fn chain() -> Vec<DecisionLogEntry> {
        decision_chain(
            "W1",
            &[
                (DecisionEvent::InfoRequested, RunStatus::InProgress, RunStatus::NeedsInfo),
                (DecisionEvent::InfoProvided, RunStatus::NeedsInfo, RunStatus::InProgress),
            ],
        )
    }

    #[test]
    fn append_then_load_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("decision_log.jsonl");
        let entries = chain();
        append_decision(&path, 0, GENESIS, &entries[0]).expect("first");
        append_decision(&path, 1, &entries[0].entry_hash, &entries[1]).expect("second");
        assert_eq!(load_decision_log(&path, "W1").expect("load"), entries);
    }

    #[test]
    fn refuses_unlinked_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("decision_log.jsonl");
        let entries = chain();
        let err = append_decision(&path, 1, GENESIS, &entries[1]).expect_err("unlinked");
        assert!(err.to_string().contains("does not link"));
    }

    /// Editing a line on disk is detected on load.
    #[test]
    fn detects_tampering_on_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("decision_log.jsonl");
        let entries = chain();
        append_decision(&path, 0, GENESIS, &entries[0]).expect("first");
        append_decision(&path, 1, &entries[0].entry_hash, &entries[1]).expect("second");

        let contents = fs::read_to_string(&path).expect("read");
        let tampered = contents.replacen("IN_PROGRESS", "PENDING_APPROVAL", 1);
        fs::write(&path, tampered).expect("write");

        let err = load_decision_log(&path, "W1").expect_err("tampered");
        assert!(err.to_string().contains("hash does not match"));
    }
}

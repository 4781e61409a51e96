//! SHA-256 hash chain over decision log entries.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::status::RunStatus;
use crate::core::types::{Actor, DecisionEvent, DecisionLogEntry};

/// `previous_hash` of the first entry in every log.
pub const GENESIS: &str = "genesis";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("entry {index} has seq {found}, expected {expected}")]
    SeqGap {
        index: usize,
        expected: u64,
        found: u64,
    },
    #[error("entry {seq} belongs to run '{found}', expected '{expected}'")]
    ForeignEntry {
        seq: u64,
        expected: String,
        found: String,
    },
    #[error("entry {seq} does not link to the previous entry hash")]
    BrokenLink { seq: u64 },
    #[error("entry {seq} hash does not match its contents")]
    HashMismatch { seq: u64 },
}

#[derive(Serialize)]
struct HashInput<'a> {
    work_item_id: &'a str,
    seq: u64,
    recorded_at: &'a str,
    actor: Actor,
    event: DecisionEvent,
    from_status: RunStatus,
    to_status: RunStatus,
    reason: &'a str,
    previous_hash: &'a str,
}

/// Hash of every field except `entry_hash` itself.
pub fn entry_hash(entry: &DecisionLogEntry) -> String {
    let input = HashInput {
        work_item_id: &entry.work_item_id,
        seq: entry.seq,
        recorded_at: &entry.recorded_at,
        actor: entry.actor,
        event: entry.event,
        from_status: entry.from_status,
        to_status: entry.to_status,
        reason: &entry.reason,
        previous_hash: &entry.previous_hash,
    };
    // Serializing a struct of strings and unit enums cannot fail.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Fill in `entry_hash` for an entry whose other fields are final.
pub fn seal(mut entry: DecisionLogEntry) -> DecisionLogEntry {
    entry.entry_hash = entry_hash(&entry);
    entry
}

/// Hash the next entry must link to.
pub fn tail_hash(entries: &[DecisionLogEntry]) -> &str {
    entries
        .last()
        .map_or(GENESIS, |entry| entry.entry_hash.as_str())
}

/// Verify sequence numbers, run ownership, links and hashes of a whole log.
pub fn verify_chain(work_item_id: &str, entries: &[DecisionLogEntry]) -> Result<(), ChainError> {
    let mut previous = GENESIS;
    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u64 + 1;
        if entry.seq != expected {
            return Err(ChainError::SeqGap {
                index,
                expected,
                found: entry.seq,
            });
        }
        if entry.work_item_id != work_item_id {
            return Err(ChainError::ForeignEntry {
                seq: entry.seq,
                expected: work_item_id.to_string(),
                found: entry.work_item_id.clone(),
            });
        }
        if entry.previous_hash != previous {
            return Err(ChainError::BrokenLink { seq: entry.seq });
        }
        if entry.entry_hash != entry_hash(entry) {
            return Err(ChainError::HashMismatch { seq: entry.seq });
        }
        previous = &entry.entry_hash;
    }
    Ok(())
}

//! Append-only evidence files (`evidence.jsonl`).

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::types::{EvidenceEntry, EvidenceInput};
use crate::io::jsonl::{append_lines, read_lines};

/// Sequence evidence inputs after `existing` entries, stamped with `recorded_at`.
pub fn sequence_evidence(
    work_item_id: &str,
    existing: u64,
    recorded_at: &str,
    inputs: Vec<EvidenceInput>,
) -> Vec<EvidenceEntry> {
    inputs
        .into_iter()
        .zip(existing + 1..)
        .map(|(input, seq)| EvidenceEntry {
            work_item_id: work_item_id.to_string(),
            seq,
            recorded_at: recorded_at.to_string(),
            kind: input.kind,
            payload_ref: input.payload_ref,
            summary: input.summary,
            exit_code: input.exit_code,
        })
        .collect()
}

/// Append entries; they must continue the sequence of what is on disk.
pub fn append_evidence(path: &Path, expected_existing: u64, entries: &[EvidenceEntry]) -> Result<()> {
    if let Some(first) = entries.first()
        && first.seq != expected_existing + 1
    {
        return Err(anyhow!(
            "evidence seq {} does not follow {expected_existing}",
            first.seq
        ));
    }
    append_lines(path, entries)
}

pub fn load_evidence(path: &Path) -> Result<Vec<EvidenceEntry>> {
    let entries: Vec<EvidenceEntry> = read_lines(path)?;
    for (index, entry) in entries.iter().enumerate() {
        if entry.seq != index as u64 + 1 {
            return Err(anyhow!(
                "{}: evidence entry {} has seq {}",
                path.display(),
                index + 1,
                entry.seq
            ));
        }
    }
    Ok(entries)
}

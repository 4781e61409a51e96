//! Append-only JSON Lines files.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current size of `path` in bytes (0 if missing).
pub fn file_len(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

/// Append one JSON line per item with a single write, then sync.
pub fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item).context("serialize jsonl entry")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(())
}

/// Read every line of `path` (missing file reads as empty).
pub fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}

/// Cut `path` back to `len` bytes, undoing appends made after `len` was taken.
pub fn truncate_to(path: &Path, len: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound && len == 0 => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    file.set_len(len)
        .with_context(|| format!("truncate {} to {len} bytes", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(())
}

/// Create an empty file, failing if it already exists.
pub fn create_empty(path: &Path) -> Result<()> {
    File::create_new(path).with_context(|| format!("create {}", path.display()))?;
    Ok(())
}

//! Run record files (`.reliquary/runs/<id>/run.json`) with schema validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::types::RunRecord;

const RUN_RECORD_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/run_record/v1.schema.json"
));

static RUN_RECORD_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(RUN_RECORD_SCHEMA)
        .map_err(|err| format!("parse run record schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid run record schema: {err}"))
});

/// Load a run record, validating it against the v1 schema.
pub fn load_record(path: &Path) -> Result<RunRecord> {
    debug!(path = %path.display(), "loading run record");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse run record {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", path.display()))?;
    let record: RunRecord = serde_json::from_value(value)
        .with_context(|| format!("deserialize run record {}", path.display()))?;
    Ok(record)
}

/// Atomically write a run record (temp file + rename).
pub fn write_record(path: &Path, record: &RunRecord) -> Result<()> {
    debug!(
        path = %path.display(),
        work_item_id = %record.work_item_id,
        version = record.version,
        "writing run record"
    );
    let mut buf = serde_json::to_string_pretty(record)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp run record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace run record {}", path.display()))?;
    Ok(())
}

fn validate_schema(record: &Value) -> Result<()> {
    let validator = RUN_RECORD_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("{err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(record)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "run record schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::RunStatus;
    use crate::test_support::record_in;

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("W1").join("run.json");
        let record = record_in("W1", RunStatus::NeedsInfo);
        write_record(&path, &record).expect("write");
        assert_eq!(load_record(&path).expect("load"), record);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn rejects_unknown_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        let mut value = serde_json::to_value(record_in("W1", RunStatus::InProgress)).expect("json");
        value["status"] = Value::String("DONE".to_string());
        fs::write(&path, value.to_string()).expect("write");
        let err = load_record(&path).expect_err("schema");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        fs::write(&path, r#"{"work_item_id":"W1"}"#).expect("write");
        assert!(load_record(&path).is_err());
    }
}

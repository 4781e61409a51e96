//! Reliquary configuration stored under `.reliquary/state/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Reliquary configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReliquaryConfig {
    /// Attempt ceiling stamped onto new runs; reaching it without success blocks the run.
    pub max_attempts: u32,

    pub store: StoreConfig,

    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Extra tries for a store operation that failed with a transient error.
    pub write_retries: u32,

    /// Base delay between retries; doubled on each retry.
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
    /// Listing size when the caller gives no limit.
    pub default_list_limit: usize,

    /// Hard cap on listing size.
    pub max_list_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

impl StoreConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_list_limit: 50,
            max_list_limit: 1000,
        }
    }
}

impl Default for ReliquaryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            store: StoreConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl ReliquaryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.query.default_list_limit == 0 {
            return Err(anyhow!("query.default_list_limit must be > 0"));
        }
        if self.query.max_list_limit < self.query.default_list_limit {
            return Err(anyhow!(
                "query.max_list_limit must be >= query.default_list_limit"
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ReliquaryConfig::default()`.
pub fn load_config(path: &Path) -> Result<ReliquaryConfig> {
    if !path.exists() {
        let cfg = ReliquaryConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ReliquaryConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ReliquaryConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ReliquaryConfig::default());
        assert_eq!(cfg.max_attempts, 4);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_attempts = 2\n\n[store]\nwrite_retries = 0\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.store.write_retries, 0);
        assert_eq!(cfg.store.retry_backoff_ms, 25);
        assert_eq!(cfg.query, QueryConfig::default());
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_attempts = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_attempts must be > 0"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("config.toml");
        let cfg = ReliquaryConfig {
            max_attempts: 6,
            ..ReliquaryConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}

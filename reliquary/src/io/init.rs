//! Initialization helpers for `.reliquary/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{ReliquaryConfig, write_config};

const RELIQUARY_GITIGNORE: &str = "runs/*/run.json.tmp\nruns/*/.lock\n";

/// All canonical paths within `.reliquary/` for a project root.
#[derive(Debug, Clone)]
pub struct ReliquaryPaths {
    pub root: PathBuf,
    pub reliquary_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ReliquaryPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let reliquary_dir = root.join(".reliquary");
        let state_dir = reliquary_dir.join("state");
        Self {
            root,
            runs_dir: reliquary_dir.join("runs"),
            config_path: state_dir.join("config.toml"),
            gitignore_path: reliquary_dir.join(".gitignore"),
            state_dir,
            reliquary_dir,
        }
    }

    /// Directory holding one run's record and logs.
    pub fn run_dir(&self, work_item_id: &str) -> RunPaths {
        RunPaths::new(self.runs_dir.join(work_item_id))
    }
}

/// Files of a single run under `.reliquary/runs/<work_item_id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub evidence_path: PathBuf,
    pub decision_log_path: PathBuf,
    pub inconsistent_marker_path: PathBuf,
    /// Advisory lock file serializing writers across processes.
    pub lock_path: PathBuf,
}

impl RunPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            record_path: dir.join("run.json"),
            evidence_path: dir.join("evidence.jsonl"),
            decision_log_path: dir.join("decision_log.jsonl"),
            inconsistent_marker_path: dir.join("INCONSISTENT"),
            lock_path: dir.join(".lock"),
            dir,
        }
    }
}

/// Options for `init_reliquary`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite the config even if `.reliquary/` exists. Runs are never touched.
    pub force: bool,
}

/// Create `.reliquary/` scaffolding in `root`.
///
/// Fails if `.reliquary/` already exists unless `options.force` is set.
pub fn init_reliquary(root: &Path, options: &InitOptions) -> Result<ReliquaryPaths> {
    let paths = ReliquaryPaths::new(root);
    if paths.reliquary_dir.exists() && !paths.reliquary_dir.is_dir() {
        return Err(anyhow!(
            "reliquary init: .reliquary exists but is not a directory"
        ));
    }
    if paths.reliquary_dir.exists() && !options.force {
        return Err(anyhow!(
            "reliquary init: .reliquary already exists (use --force to rewrite config)"
        ));
    }

    for dir in [&paths.reliquary_dir, &paths.state_dir, &paths.runs_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, RELIQUARY_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &ReliquaryConfig::default())?;

    info!(root = %root.display(), "initialized .reliquary");
    Ok(paths)
}

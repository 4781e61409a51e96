//! Wiring of store, engine and query service for one project directory.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::{ReliquaryConfig, load_config};
use crate::io::file_store::FileRunStore;
use crate::io::init::ReliquaryPaths;
use crate::io::store::RunStore;
use crate::query::QueryService;
use crate::workflow::Engine;

/// Engine and query service sharing one store.
pub struct Project<S: RunStore + ?Sized> {
    pub config: ReliquaryConfig,
    pub engine: Arc<Engine<S>>,
    pub query: Arc<QueryService<S>>,
}

impl<S: RunStore + ?Sized> Project<S> {
    pub fn from_store(store: Arc<S>, config: ReliquaryConfig) -> Self {
        Self {
            engine: Arc::new(Engine::new(Arc::clone(&store), &config)),
            query: Arc::new(QueryService::new(store, config.query.clone())),
            config,
        }
    }
}

/// Open the `.reliquary/` project rooted at `root`.
pub fn open_project(root: &Path) -> Result<Project<FileRunStore>> {
    let (store, config) = open_store(root)?;
    Ok(Project::from_store(Arc::new(store), config))
}

/// Load the config and file store of the project rooted at `root`.
pub fn open_store(root: &Path) -> Result<(FileRunStore, ReliquaryConfig)> {
    let paths = ReliquaryPaths::new(root);
    if !paths.reliquary_dir.is_dir() {
        return Err(anyhow!(
            "{} is not a reliquary project (run `reliquary init`)",
            root.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    let store = FileRunStore::open(&paths)
        .with_context(|| format!("open run store {}", paths.runs_dir.display()))?;
    debug!(root = %root.display(), "opened project");
    Ok((store, config))
}

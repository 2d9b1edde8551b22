//! Resolved CLI configuration.
//!
//! Everything a command needs from flags and the environment is resolved
//! once into a [`CliConfig`] and passed down by reference. Commands never
//! read or mutate process environment themselves.
//!
//! State root resolution (highest priority first):
//! 1. `--state-dir` flag or `KINDLING_HOME` (clap resolves both)
//! 2. `~/.kindling`

use std::path::PathBuf;
use std::sync::Arc;

use kindling_common::{ClusterStateStore, ParallelExecutor};
use kindling_registry::{CliEngine, ContainerEngine, MirrorOrchestrator, RegistryManager};

use crate::{Error, GlobalArgs, Result};

const STATE_DIR_NAME: &str = ".kindling";

/// Configuration threaded through every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Root of persisted cluster state
    pub state_root: PathBuf,
    /// Container engine CLI binary
    pub engine: String,
    /// kind binary
    pub kind: String,
    /// Parallel task ceiling; 0 picks the default
    pub concurrency: usize,
}

impl CliConfig {
    /// Resolve from parsed global flags.
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        Ok(Self {
            state_root: resolve_state_root(args.state_dir.clone(), dirs::home_dir())?,
            engine: args.engine.clone(),
            kind: args.kind.clone(),
            concurrency: args.concurrency,
        })
    }

    /// Cluster state store under the state root
    pub fn state_store(&self) -> ClusterStateStore {
        ClusterStateStore::new(&self.state_root)
    }

    /// Container engine driven by the configured binary
    pub fn container_engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(CliEngine::new(&self.engine))
    }

    /// Executor honouring `--concurrency`
    pub fn executor(&self) -> ParallelExecutor {
        ParallelExecutor::new(self.concurrency)
    }

    /// Registry manager on the configured engine
    pub fn registry_manager(&self) -> Result<RegistryManager> {
        Ok(RegistryManager::new(self.container_engine())?)
    }

    /// Mirror orchestrator on the configured engine and executor
    pub fn orchestrator(&self) -> Result<MirrorOrchestrator> {
        Ok(MirrorOrchestrator::new(
            self.registry_manager()?,
            self.executor(),
        ))
    }

    /// Whether kind should be told to use podman
    pub fn is_podman(&self) -> bool {
        self.engine
            .rsplit('/')
            .next()
            .is_some_and(|bin| bin.starts_with("podman"))
    }
}

/// Pick the state root from an explicit path or the home directory.
pub fn resolve_state_root(explicit: Option<PathBuf>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }
    let home = home.ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    Ok(home.join(STATE_DIR_NAME))
}

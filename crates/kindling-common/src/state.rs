//! Creation-time cluster configuration snapshots.
//!
//! Layout under the state root:
//! - `<root>/clusters/<name>/spec.json`: the cluster spec used to create `<name>`
//!
//! Directories are created owner-only (0700) and snapshots owner read/write
//! (0600). Snapshots are written to a temporary file and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result, ResultExt};

const CLUSTERS_DIR_NAME: &str = "clusters";
const SPEC_FILE_NAME: &str = "spec.json";

/// Persists and retrieves per-cluster spec snapshots.
#[derive(Clone, Debug)]
pub struct ClusterStateStore {
    root: PathBuf,
}

impl ClusterStateStore {
    /// Store rooted at `root` (e.g. `~/.kindling`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// State root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one cluster's state
    pub fn cluster_dir(&self, name: &str) -> Result<PathBuf> {
        validate_cluster_name(name)?;
        Ok(self.root.join(CLUSTERS_DIR_NAME).join(name))
    }

    /// Path of a cluster's snapshot file
    pub fn spec_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.cluster_dir(name)?.join(SPEC_FILE_NAME))
    }

    /// Save `spec` as the snapshot for `name`, replacing any previous one.
    pub fn save_cluster_spec<S: Serialize>(&self, name: &str, spec: &S) -> Result<()> {
        let dir = self.cluster_dir(name)?;
        create_private_dir(&dir).context(format!("create state directory {}", dir.display()))?;

        let data = serde_json::to_vec_pretty(spec).context("serialize cluster spec")?;
        let path = dir.join(SPEC_FILE_NAME);
        let tmp = dir.join(format!(".{SPEC_FILE_NAME}.tmp"));

        write_private_file(&tmp, &data).context(format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).context(format!("replace {}", path.display()))?;

        debug!(cluster = %name, path = %path.display(), "Saved cluster spec");
        Ok(())
    }

    /// Load the snapshot for `name`.
    ///
    /// Returns [`Error::StateNotFound`] if none has been saved.
    pub fn load_cluster_spec<S: DeserializeOwned>(&self, name: &str) -> Result<S> {
        let path = self.spec_path(name)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StateNotFound {
                    cluster: name.to_string(),
                })
            }
            Err(e) => return Err(Error::from(e).context(format!("read {}", path.display()))),
        };
        serde_json::from_slice(&data).context(format!("parse {}", path.display()))
    }

    /// Remove all state for `name`. Missing state is not an error.
    pub fn delete_cluster_state(&self, name: &str) -> Result<()> {
        let dir = self.cluster_dir(name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(cluster = %name, "Deleted cluster state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("remove {}", dir.display()))),
        }
    }

    /// Names of all clusters with saved state, sorted.
    pub fn list_clusters(&self) -> Result<Vec<String>> {
        let dir = self.root.join(CLUSTERS_DIR_NAME);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from(e).context(format!("read {}", dir.display()))),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(SPEC_FILE_NAME).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Reject names that could escape the clusters directory.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(Error::InvalidClusterName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

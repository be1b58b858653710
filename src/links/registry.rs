//! On-disk persistence for the link stores
//!
//! Both stores are pretty-printed JSON. Writes go to a temp file in the same
//! directory and are renamed over the target, so a failed write never
//! clobbers the previous state. Reads treat malformed files as absent.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{GlobalState, ProjectState};
use crate::error::{Result, SyncError};

/// Global store file name inside the client home
pub const GLOBAL_FILE: &str = "config.json";

/// Marker file that both identifies and holds a project store
pub const PROJECT_MARKER: &str = ".assetsync.json";

/// Machine-wide link store rooted at the client home directory
#[derive(Debug, Clone)]
pub struct LinkRegistry {
    home: PathBuf,
}

impl LinkRegistry {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn global_path(&self) -> PathBuf {
        self.home.join(GLOBAL_FILE)
    }

    pub fn read_global(&self) -> Option<GlobalState> {
        read_json(&self.global_path())
    }

    pub fn write_global(&self, state: &GlobalState) -> Result<()> {
        write_json_atomic(&self.global_path(), state)
    }
}

/// Walk from `start` up to the filesystem root looking for [`PROJECT_MARKER`].
///
/// Returns the directory holding the nearest marker.
pub fn find_project_store(start: &Path) -> Option<PathBuf> {
    let start = std::path::absolute(start).unwrap_or_else(|_| start.to_path_buf());

    // ancestors() stops after the root, so this is bounded by the path depth
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_MARKER).is_file())
        .map(Path::to_path_buf)
}

pub fn read_project_store(dir: &Path) -> Option<ProjectState> {
    read_json(&dir.join(PROJECT_MARKER))
}

pub fn write_project_store(dir: &Path, state: &ProjectState) -> Result<()> {
    write_json_atomic(&dir.join(PROJECT_MARKER), state)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Cannot read {}: {}", path.display(), err);
            }
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Ignoring malformed link store {}: {}", path.display(), err);
            None
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let registry_err = |source: std::io::Error| SyncError::RegistryWrite {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(value)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(registry_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(registry_err)?;
    tmp.write_all(&json).map_err(registry_err)?;
    tmp.write_all(b"\n").map_err(registry_err)?;
    tmp.as_file().sync_all().map_err(registry_err)?;
    tmp.persist(path).map_err(|err| registry_err(err.error))?;

    debug!("Wrote link store {}", path.display());
    Ok(())
}

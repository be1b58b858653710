//! Link registry: which local file mirrors which asset
//!
//! Links live in one of two stores. The global store sits in the client
//! home and also carries client configuration; a project store is the
//! nearest `.assetsync.json` above the working directory. An asset is
//! linked in exactly one of them, picked from its install scope.

pub mod registry;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::api::{InstallScope, Machine};
use crate::config::DaemonSettings;
use crate::error::Result;

pub use registry::{
    find_project_store, read_project_store, write_project_store, LinkRegistry, GLOBAL_FILE,
    PROJECT_MARKER,
};

/// The client's memory of the last reconciled state of one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEntry {
    pub asset_id: String,
    pub asset_slug: String,
    pub local_path: PathBuf,
    /// Empty until the first successful sync
    #[serde(default)]
    pub last_hash: String,
    /// Empty until the first successful sync
    #[serde(default)]
    pub last_synced_version: String,
}

impl LinkEntry {
    pub fn new(asset_id: impl Into<String>, asset_slug: impl Into<String>, local_path: PathBuf) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_slug: asset_slug.into(),
            local_path,
            last_hash: String::new(),
            last_synced_version: String::new(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.asset_id == key || self.asset_slug == key
    }

    pub fn never_synced(&self) -> bool {
        self.last_synced_version.is_empty()
    }
}

/// Machine-wide store: client configuration plus user-scoped links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalState {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub machine: Option<Machine>,
    pub settings: DaemonSettings,
    pub links: Vec<LinkEntry>,
}

/// Project-scoped links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectState {
    pub links: Vec<LinkEntry>,
}

/// Which store a link belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkScope {
    Global,
    /// Directory holding the project marker
    Project(PathBuf),
}

impl std::fmt::Display for LinkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkScope::Global => f.write_str("global"),
            LinkScope::Project(dir) => write!(f, "project {}", dir.display()),
        }
    }
}

/// Insert `entry`, replacing any entry for the same asset.
pub fn upsert(links: &mut Vec<LinkEntry>, entry: LinkEntry) {
    match links.iter_mut().find(|l| l.asset_id == entry.asset_id) {
        Some(existing) => *existing = entry,
        None => links.push(entry),
    }
}

/// Remove every entry whose id or slug equals `key`.
pub fn remove(links: &mut Vec<LinkEntry>, key: &str) -> Vec<LinkEntry> {
    let (removed, kept): (Vec<_>, Vec<_>) =
        std::mem::take(links).into_iter().partition(|l| l.matches(key));
    *links = kept;
    removed
}

#[derive(Debug)]
struct ProjectStore {
    dir: PathBuf,
    state: ProjectState,
    dirty: bool,
}

/// Both stores, resolved once per command from a working directory
#[derive(Debug)]
pub struct LinkSet {
    registry: LinkRegistry,
    cwd: PathBuf,
    global: GlobalState,
    global_dirty: bool,
    project: Option<ProjectStore>,
}

impl LinkSet {
    pub fn load(registry: LinkRegistry, cwd: &Path) -> Self {
        let global = registry.read_global().unwrap_or_default();
        let project = find_project_store(cwd).map(|dir| ProjectStore {
            state: read_project_store(&dir).unwrap_or_default(),
            dir,
            dirty: false,
        });

        Self {
            registry,
            cwd: std::path::absolute(cwd).unwrap_or_else(|_| cwd.to_path_buf()),
            global,
            global_dirty: false,
            project,
        }
    }

    /// Drop in-memory state and read both stores again
    pub fn reload(&mut self) {
        *self = Self::load(self.registry.clone(), &self.cwd.clone());
    }

    pub fn registry(&self) -> &LinkRegistry {
        &self.registry
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn global(&self) -> &GlobalState {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut GlobalState {
        self.global_dirty = true;
        &mut self.global
    }

    pub fn project_dir(&self) -> Option<&Path> {
        self.project.as_ref().map(|p| p.dir.as_path())
    }

    /// Every link with its scope, global store first
    pub fn entries(&self) -> Vec<(LinkScope, LinkEntry)> {
        let global = self
            .global
            .links
            .iter()
            .map(|l| (LinkScope::Global, l.clone()));
        let project = self.project.iter().flat_map(|p| {
            p.state
                .links
                .iter()
                .map(|l| (LinkScope::Project(p.dir.clone()), l.clone()))
        });
        global.chain(project).collect()
    }

    pub fn find(&self, key: &str) -> Option<(LinkScope, LinkEntry)> {
        self.entries().into_iter().find(|(_, l)| l.matches(key))
    }

    /// Store an asset with the given install scope would be linked into
    pub fn scope_for(&self, install_scope: InstallScope) -> LinkScope {
        match install_scope {
            InstallScope::User => LinkScope::Global,
            InstallScope::Project => LinkScope::Project(
                self.project_dir()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.cwd.clone()),
            ),
        }
    }

    /// Link `entry` into `scope`, dropping it from the other store.
    pub fn link(&mut self, scope: LinkScope, entry: LinkEntry) {
        let other = match scope {
            LinkScope::Global => self.project.as_ref().map(|p| LinkScope::Project(p.dir.clone())),
            LinkScope::Project(_) => Some(LinkScope::Global),
        };
        if let Some(other) = other {
            let present = self
                .entries()
                .iter()
                .any(|(s, l)| *s == other && l.asset_id == entry.asset_id);
            if present {
                self.links_mut(&other)
                    .retain(|l| l.asset_id != entry.asset_id);
            }
        }
        upsert(self.links_mut(&scope), entry);
    }

    /// Remove the link matching `key` (id or slug) from whichever store has it.
    pub fn unlink(&mut self, key: &str) -> Option<(LinkScope, LinkEntry)> {
        let (scope, _) = self.find(key)?;
        remove(self.links_mut(&scope), key)
            .into_iter()
            .next()
            .map(|entry| (scope, entry))
    }

    /// Write back an entry after a push or pull.
    pub fn update(&mut self, scope: &LinkScope, entry: LinkEntry) {
        upsert(self.links_mut(scope), entry);
    }

    /// Persist every store touched since load.
    pub fn save(&mut self) -> Result<()> {
        if self.global_dirty {
            self.registry.write_global(&self.global)?;
            self.global_dirty = false;
        }
        if let Some(project) = self.project.as_mut().filter(|p| p.dirty) {
            write_project_store(&project.dir, &project.state)?;
            project.dirty = false;
        }
        Ok(())
    }

    fn links_mut(&mut self, scope: &LinkScope) -> &mut Vec<LinkEntry> {
        match scope {
            LinkScope::Global => {
                self.global_dirty = true;
                &mut self.global.links
            }
            LinkScope::Project(dir) => {
                let project = self.project.get_or_insert_with(|| ProjectStore {
                    dir: dir.clone(),
                    state: ProjectState::default(),
                    dirty: false,
                });
                project.dirty = true;
                &mut project.state.links
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, slug: &str) -> LinkEntry {
        LinkEntry::new(id, slug, PathBuf::from(format!("/work/{slug}.md")))
    }

    #[test]
    fn test_upsert_replaces_same_asset() {
        let mut links = vec![entry("a1", "one")];
        let mut updated = entry("a1", "one");
        updated.last_synced_version = "1.0.1".into();
        upsert(&mut links, updated.clone());
        upsert(&mut links, entry("a2", "two"));
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], updated);
    }

    #[test]
    fn test_remove_by_id_or_slug() {
        let mut links = vec![entry("a1", "one"), entry("a2", "two")];
        assert_eq!(remove(&mut links, "two").len(), 1);
        assert_eq!(remove(&mut links, "a1").len(), 1);
        assert!(remove(&mut links, "a1").is_empty());
        assert!(links.is_empty());
    }

    #[test]
    fn test_link_set_scopes_are_exclusive() {
        let home = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let registry = LinkRegistry::new(home.path());

        let mut set = LinkSet::load(registry.clone(), work.path());
        assert!(set.project_dir().is_none());

        set.link(LinkScope::Global, entry("a1", "one"));
        set.save().unwrap();

        // Re-linking with project scope moves the entry and creates the store on demand
        let project_scope = set.scope_for(InstallScope::Project);
        set.link(project_scope.clone(), entry("a1", "one"));
        set.save().unwrap();

        let reloaded = LinkSet::load(registry.clone(), work.path());
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].0, LinkScope::Project(_)));
        assert!(work.path().join(PROJECT_MARKER).is_file());
        assert!(registry.read_global().unwrap().links.is_empty());
    }

    #[test]
    fn test_unlink_and_update() {
        let home = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut set = LinkSet::load(LinkRegistry::new(home.path()), work.path());
        set.link(LinkScope::Global, entry("a1", "one"));
        set.link(LinkScope::Global, entry("a2", "two"));

        let (scope, mut e) = set.find("one").unwrap();
        e.last_hash = "h".into();
        set.update(&scope, e);
        assert_eq!(set.find("a1").unwrap().1.last_hash, "h");

        let (scope, removed) = set.unlink("two").unwrap();
        assert_eq!(scope, LinkScope::Global);
        assert_eq!(removed.asset_id, "a2");
        assert!(set.unlink("two").is_none());
        set.save().unwrap();
        assert_eq!(set.registry().read_global().unwrap().links.len(), 1);
    }
}

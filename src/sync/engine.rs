//! Sync orchestrator
//!
//! Reconciles every linked asset with the version authority. Each command
//! walks the links one at a time; a failing asset is logged and recorded in
//! the [`RunSummary`] while the batch moves on. Only fatal errors (the link
//! registry cannot be written, the client is unconfigured) abort a run.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::api::{
    Machine, ManifestAsset, PushRequest, RegisterMachineRequest, StorageType, SyncDirection,
    SyncReport,
};
use crate::conflict::{decide, SyncAction};
use crate::error::{Result, SyncError};
use crate::hash::{content_hash, hash_file};
use crate::links::{LinkEntry, LinkScope, LinkSet};
use crate::sync::remote::SyncRemote;

/// Told before and after the orchestrator writes a linked file, so a
/// watcher can stay deaf to the write.
pub trait LocalWriteHook: Send + Sync {
    fn suspend(&self, _path: &Path) {}
    fn resume(&self, _path: &Path) {}
}

/// Hook for one-shot commands with nothing watching
pub struct NoHook;

impl LocalWriteHook for NoHook {}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Restrict to one asset (id or slug)
    pub asset: Option<String>,
    /// Push even when the content hash is unchanged
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub asset: Option<String>,
    /// Re-download a single asset even when the server version is unchanged
    pub force: bool,
}

/// What happened to one asset during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    Pushed { version: String },
    Pulled { version: String, action: SyncAction },
    Unchanged,
    /// Nothing on disk to push
    MissingLocal,
    /// Both sides changed and the local file is newer; left alone
    Conflict { action: SyncAction },
    /// Multi-file asset; download it by hand
    Bundle { bundle_url: Option<String> },
    /// Linked locally but gone from the manifest
    NotInManifest,
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct AssetResult {
    pub asset_id: String,
    pub asset_slug: String,
    pub scope: LinkScope,
    pub outcome: AssetOutcome,
}

/// Per-asset results of one push, pull or sync
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<AssetResult>,
}

impl RunSummary {
    fn record(&mut self, scope: LinkScope, entry: &LinkEntry, outcome: AssetOutcome) {
        self.results.push(AssetResult {
            asset_id: entry.asset_id.clone(),
            asset_slug: entry.asset_slug.clone(),
            scope,
            outcome,
        });
    }

    fn count(&self, pred: impl Fn(&AssetOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn pushed(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Pushed { .. }))
    }

    pub fn pulled(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Pulled { .. }))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Conflict { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AssetOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn outcome(&self, key: &str) -> Option<&AssetOutcome> {
        self.results
            .iter()
            .find(|r| r.asset_id == key || r.asset_slug == key)
            .map(|r| &r.outcome)
    }
}

/// Where one link stands relative to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Action(SyncAction),
    NeverSynced,
    MissingLocal,
    Bundle,
    NotInManifest,
    /// The local file exists but could not be read
    Unreadable { error: String },
}

#[derive(Debug, Clone)]
pub struct AssetStatus {
    pub scope: LinkScope,
    pub entry: LinkEntry,
    pub server_version: Option<String>,
    pub status: LinkStatus,
}

struct LocalSnapshot {
    content: String,
    hash: String,
    mtime: DateTime<Utc>,
}

async fn read_local(path: &Path) -> Result<Option<LocalSnapshot>> {
    let Some((content, hash)) = hash_file(path).await? else {
        return Ok(None);
    };
    let mtime = tokio::fs::metadata(path).await?.modified()?;
    Ok(Some(LocalSnapshot {
        content,
        hash,
        mtime: mtime.into(),
    }))
}

fn local_changed(entry: &LinkEntry, local: Option<&LocalSnapshot>) -> bool {
    !entry.last_hash.is_empty() && local.is_some_and(|l| l.hash != entry.last_hash)
}

fn server_changed(entry: &LinkEntry, asset: &ManifestAsset) -> bool {
    !entry.never_synced() && asset.current_version != entry.last_synced_version
}

fn classify(entry: &LinkEntry, asset: &ManifestAsset, local: Option<&LocalSnapshot>) -> LinkStatus {
    if asset.storage_type == StorageType::Bundle {
        return LinkStatus::Bundle;
    }
    if entry.never_synced() {
        return LinkStatus::NeverSynced;
    }
    let Some(snapshot) = local else {
        return LinkStatus::MissingLocal;
    };
    LinkStatus::Action(decide(
        local_changed(entry, local),
        server_changed(entry, asset),
        snapshot.mtime,
        asset.updated_at,
    ))
}

/// Write `body` to `path` with the hook suspended around the write.
async fn write_local(path: &Path, body: &str, hook: &dyn LocalWriteHook) -> Result<()> {
    hook.suspend(path);
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, body).await
    }
    .await;
    hook.resume(path);
    Ok(result?)
}

fn targets(links: &LinkSet, key: Option<&str>) -> Result<Vec<(LinkScope, LinkEntry)>> {
    match key {
        None => Ok(links.entries()),
        Some(key) => links
            .find(key)
            .map(|found| vec![found])
            .ok_or_else(|| SyncError::NotFound(format!("no link for asset {key}"))),
    }
}

/// Stable per-host identifier sent when registering a machine
pub fn machine_identifier() -> String {
    let user = whoami::username();
    let host = whoami::fallible::hostname().unwrap_or_else(|_| whoami::devicename());
    content_hash(&format!("{user}@{host}"))
}

/// Register this host with the server and remember the machine in the global store.
pub async fn register_machine<R: SyncRemote>(
    remote: &R,
    links: &mut LinkSet,
    name: Option<String>,
) -> Result<Machine> {
    let request = RegisterMachineRequest {
        name: name.unwrap_or_else(whoami::devicename),
        identifier: machine_identifier(),
    };
    let machine = remote.register_machine(&request).await?;
    links.global_mut().machine = Some(machine.clone());
    links.save()?;
    info!("Registered machine {} ({})", machine.name, machine.id);
    Ok(machine)
}

/// Remove a link. The local file is left in place.
pub fn unlink(links: &mut LinkSet, key: &str) -> Result<(LinkScope, LinkEntry)> {
    let removed = links
        .unlink(key)
        .ok_or_else(|| SyncError::NotFound(format!("no link for asset {key}")))?;
    links.save()?;
    info!("Unlinked {} from {}", removed.1.asset_slug, removed.0);
    Ok(removed)
}

pub struct SyncEngine<R> {
    remote: R,
    machine_id: String,
}

impl<R: SyncRemote> SyncEngine<R> {
    pub fn new(remote: R, machine_id: impl Into<String>) -> Self {
        Self {
            remote,
            machine_id: machine_id.into(),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Link an asset (id or slug) to a local file.
    ///
    /// The store is chosen from the asset's install scope; the default path
    /// is the asset's primary file name under the working or project directory.
    pub async fn link(
        &self,
        links: &mut LinkSet,
        asset_ref: &str,
        local_path: Option<PathBuf>,
    ) -> Result<(LinkScope, LinkEntry)> {
        let manifest = self.remote.manifest(&self.machine_id).await?;
        let asset = manifest
            .find(asset_ref)
            .ok_or_else(|| SyncError::NotFound(format!("asset {asset_ref}")))?;

        let scope = links.scope_for(asset.install_scope);
        let path = match local_path {
            Some(path) => path,
            None => match &scope {
                LinkScope::Global => links.cwd().join(&asset.primary_file_name),
                LinkScope::Project(dir) => dir.join(&asset.primary_file_name),
            },
        };
        let path = std::path::absolute(&path)?;

        let mut entry = LinkEntry::new(&asset.id, &asset.slug, path);
        if let Some((_, existing)) = links.find(&asset.id) {
            // Re-linking the same file keeps its sync bookkeeping
            if existing.local_path == entry.local_path {
                entry = existing;
            }
        }

        links.link(scope.clone(), entry.clone());
        links.save()?;
        info!("Linked {} -> {} ({})", entry.asset_slug, entry.local_path.display(), scope);
        Ok((scope, entry))
    }

    /// Upload local edits. Unchanged files cost no network call.
    pub async fn push(&self, links: &mut LinkSet, options: &PushOptions) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for (scope, entry) in targets(links, options.asset.as_deref())? {
            let outcome = match self.push_entry(links, &scope, entry.clone(), options.force).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("Push of {} failed: {}", entry.asset_slug, err);
                    AssetOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            summary.record(scope, &entry, outcome);
        }
        Ok(summary)
    }

    /// Download new server versions, leaving newer local edits alone.
    pub async fn pull(
        &self,
        links: &mut LinkSet,
        options: &PullOptions,
        hook: &dyn LocalWriteHook,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let targets = targets(links, options.asset.as_deref())?;
        if targets.is_empty() {
            return Ok(summary);
        }
        let force = options.force && options.asset.is_some();
        let manifest = self.remote.manifest(&self.machine_id).await?;

        for (scope, entry) in targets {
            let result = match manifest.assets.iter().find(|a| a.id == entry.asset_id) {
                Some(asset) => {
                    self.pull_entry(links, &scope, entry.clone(), asset, force, hook)
                        .await
                }
                None => {
                    warn!("{} is no longer on the server", entry.asset_slug);
                    Ok(AssetOutcome::NotInManifest)
                }
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("Pull of {} failed: {}", entry.asset_slug, err);
                    AssetOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            summary.record(scope, &entry, outcome);
        }
        Ok(summary)
    }

    /// One full reconciliation: push what changed here, pull what changed there.
    pub async fn sync(&self, links: &mut LinkSet, hook: &dyn LocalWriteHook) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let targets = links.entries();
        if targets.is_empty() {
            return Ok(summary);
        }
        let manifest = self.remote.manifest(&self.machine_id).await?;

        for (scope, entry) in targets {
            let result = match manifest.assets.iter().find(|a| a.id == entry.asset_id) {
                Some(asset) => self.sync_entry(links, &scope, entry.clone(), asset, hook).await,
                None => Ok(AssetOutcome::NotInManifest),
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!("Sync of {} failed: {}", entry.asset_slug, err);
                    AssetOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            summary.record(scope, &entry, outcome);
        }
        Ok(summary)
    }

    /// Where each link stands, without changing anything
    pub async fn status(&self, links: &LinkSet) -> Result<Vec<AssetStatus>> {
        let entries = links.entries();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let manifest = self.remote.manifest(&self.machine_id).await?;

        let mut statuses = Vec::with_capacity(entries.len());
        for (scope, entry) in entries {
            let asset = manifest.assets.iter().find(|a| a.id == entry.asset_id);
            let status = match asset {
                Some(asset) => match read_local(&entry.local_path).await {
                    Ok(local) => classify(&entry, asset, local.as_ref()),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!("Cannot read {}: {}", entry.local_path.display(), err);
                        LinkStatus::Unreadable {
                            error: err.to_string(),
                        }
                    }
                },
                None => LinkStatus::NotInManifest,
            };
            statuses.push(AssetStatus {
                scope,
                server_version: asset.map(|a| a.current_version.clone()),
                entry,
                status,
            });
        }
        Ok(statuses)
    }

    async fn push_entry(
        &self,
        links: &mut LinkSet,
        scope: &LinkScope,
        mut entry: LinkEntry,
        force: bool,
    ) -> Result<AssetOutcome> {
        let Some(local) = read_local(&entry.local_path).await? else {
            debug!("{} has no local file, nothing to push", entry.asset_slug);
            return Ok(AssetOutcome::MissingLocal);
        };
        if local.hash == entry.last_hash && !force {
            return Ok(AssetOutcome::Unchanged);
        }

        let request = PushRequest {
            content: local.content,
            local_hash: local.hash.clone(),
            machine_id: self.machine_id.clone(),
        };
        let response = self.remote.push_content(&entry.asset_id, &request).await?;

        entry.last_hash = local.hash;
        entry.last_synced_version = response.version.clone();
        links.update(scope, entry.clone());
        links.save()?;

        info!("Pushed {} as {}", entry.asset_slug, response.version);
        Ok(AssetOutcome::Pushed {
            version: response.version,
        })
    }

    async fn pull_entry(
        &self,
        links: &mut LinkSet,
        scope: &LinkScope,
        entry: LinkEntry,
        asset: &ManifestAsset,
        force: bool,
        hook: &dyn LocalWriteHook,
    ) -> Result<AssetOutcome> {
        if asset.storage_type == StorageType::Bundle {
            return Ok(self.bundle_pointer(&entry, asset.bundle_url.clone()));
        }

        let server_changed = server_changed(&entry, asset);
        if !server_changed && !entry.never_synced() && !force {
            return Ok(AssetOutcome::Unchanged);
        }

        let local = read_local(&entry.local_path).await?;
        let mut action = SyncAction::Pull;
        if server_changed && local_changed(&entry, local.as_ref()) {
            if let Some(local) = &local {
                action = decide(true, true, local.mtime, asset.updated_at);
            }
            if action == SyncAction::ConflictPush {
                warn!(
                    "{} changed locally and on the server; local copy is newer, skipping pull",
                    entry.asset_slug
                );
                return Ok(AssetOutcome::Conflict { action });
            }
            warn!(
                "{} changed locally and on the server; server copy is newer, overwriting",
                entry.asset_slug
            );
        }

        self.apply_pull(links, scope, entry, action, hook).await
    }

    async fn sync_entry(
        &self,
        links: &mut LinkSet,
        scope: &LinkScope,
        entry: LinkEntry,
        asset: &ManifestAsset,
        hook: &dyn LocalWriteHook,
    ) -> Result<AssetOutcome> {
        let local = read_local(&entry.local_path).await?;
        match classify(&entry, asset, local.as_ref()) {
            LinkStatus::Bundle => Ok(self.bundle_pointer(&entry, asset.bundle_url.clone())),
            LinkStatus::NotInManifest => Ok(AssetOutcome::NotInManifest),
            LinkStatus::NeverSynced | LinkStatus::MissingLocal => {
                self.apply_pull(links, scope, entry, SyncAction::Pull, hook).await
            }
            LinkStatus::Action(SyncAction::UpToDate) => Ok(AssetOutcome::Unchanged),
            LinkStatus::Action(SyncAction::Push) => self.push_entry(links, scope, entry, false).await,
            LinkStatus::Action(action @ (SyncAction::Pull | SyncAction::ConflictPull)) => {
                self.apply_pull(links, scope, entry, action, hook).await
            }
            LinkStatus::Action(action @ SyncAction::ConflictPush) => {
                warn!(
                    "{} changed on both sides and the local copy is newer; run an explicit push to keep it",
                    entry.asset_slug
                );
                Ok(AssetOutcome::Conflict { action })
            }
        }
    }

    async fn apply_pull(
        &self,
        links: &mut LinkSet,
        scope: &LinkScope,
        mut entry: LinkEntry,
        action: SyncAction,
        hook: &dyn LocalWriteHook,
    ) -> Result<AssetOutcome> {
        let content = self.remote.asset_content(&entry.asset_id).await?;
        if content.storage_type == StorageType::Bundle {
            return Ok(self.bundle_pointer(&entry, content.bundle_url));
        }
        let body = content.content.unwrap_or_default();

        write_local(&entry.local_path, &body, hook).await?;

        let hash = content_hash(&body);
        entry.last_hash = hash.clone();
        entry.last_synced_version = content.version.clone();
        links.update(scope, entry.clone());
        links.save()?;
        info!("Pulled {} at {}", entry.asset_slug, content.version);

        let report = SyncReport {
            machine_id: self.machine_id.clone(),
            asset_id: entry.asset_id.clone(),
            synced_version: content.version.clone(),
            local_hash: Some(hash),
            install_path: Some(entry.local_path.display().to_string()),
            direction: SyncDirection::Pull,
        };
        if let Err(err) = self.remote.report_sync(&report).await {
            warn!("Pulled {} but could not report it: {}", entry.asset_slug, err);
        }

        Ok(AssetOutcome::Pulled {
            version: content.version,
            action,
        })
    }

    fn bundle_pointer(&self, entry: &LinkEntry, bundle_url: Option<String>) -> AssetOutcome {
        match &bundle_url {
            Some(url) => info!("{} is a bundle; download it from {}", entry.asset_slug, url),
            None => info!("{} is a bundle; download it manually", entry.asset_slug),
        }
        AssetOutcome::Bundle { bundle_url }
    }
}

//! In-memory version authority for orchestrator and daemon tests

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::api::{
    AssetContent, InstallScope, Machine, ManifestAsset, PushRequest, PushResponse,
    RegisterMachineRequest, StorageType, SyncManifest, SyncReport,
};
use crate::error::{Result, SyncError};
use crate::sync::remote::SyncRemote;
use crate::version::bump_patch;

pub(crate) struct FakeAsset {
    pub slug: String,
    pub version: String,
    pub content: String,
    pub storage: StorageType,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    pub assets: Mutex<HashMap<String, FakeAsset>>,
    pub calls: Mutex<Vec<String>>,
    pub reports: Mutex<Vec<SyncReport>>,
    /// Asset ids whose pushes answer 503
    pub failing: Mutex<HashSet<String>>,
}

impl FakeRemote {
    pub fn add(&self, id: &str, version: &str, content: &str) {
        self.assets.lock().insert(
            id.to_string(),
            FakeAsset {
                slug: format!("{id}-slug"),
                version: version.into(),
                content: content.into(),
                storage: StorageType::Inline,
                updated_at: Utc::now(),
            },
        );
    }

    /// Simulate another machine publishing `content` as `version`
    pub fn publish(&self, id: &str, version: &str, content: &str) {
        if let Some(asset) = self.assets.lock().get_mut(id) {
            asset.version = version.into();
            asset.content = content.into();
            asset.updated_at = Utc::now();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with("push")).count()
    }

    pub fn content(&self, id: &str) -> String {
        self.assets
            .lock()
            .get(id)
            .map(|a| a.content.clone())
            .unwrap_or_default()
    }
}

impl SyncRemote for FakeRemote {
    async fn manifest(&self, machine_id: &str) -> Result<SyncManifest> {
        self.calls.lock().push("manifest".into());
        let assets = self
            .assets
            .lock()
            .iter()
            .map(|(id, a)| ManifestAsset {
                id: id.clone(),
                slug: a.slug.clone(),
                name: a.slug.clone(),
                current_version: a.version.clone(),
                storage_type: a.storage,
                install_scope: InstallScope::User,
                primary_file_name: "SKILL.md".into(),
                bundle_url: None,
                updated_at: a.updated_at,
                sync_state: None,
            })
            .collect();
        Ok(SyncManifest {
            machine: Machine {
                id: machine_id.into(),
                name: "test".into(),
                identifier: "test".into(),
                last_active_at: None,
            },
            assets,
        })
    }

    async fn asset_content(&self, asset_id: &str) -> Result<AssetContent> {
        self.calls.lock().push(format!("content {asset_id}"));
        let assets = self.assets.lock();
        let a = assets
            .get(asset_id)
            .ok_or_else(|| SyncError::NotFound(asset_id.into()))?;
        Ok(AssetContent {
            storage_type: a.storage,
            content: Some(a.content.clone()),
            bundle_url: None,
            version: a.version.clone(),
            primary_file_name: "SKILL.md".into(),
            updated_at: a.updated_at,
        })
    }

    async fn push_content(&self, asset_id: &str, request: &PushRequest) -> Result<PushResponse> {
        self.calls.lock().push(format!("push {asset_id}"));
        if self.failing.lock().contains(asset_id) {
            return Err(SyncError::Remote {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let mut assets = self.assets.lock();
        let a = assets
            .get_mut(asset_id)
            .ok_or_else(|| SyncError::NotFound(asset_id.into()))?;
        a.version = bump_patch(&a.version)?;
        a.content = request.content.clone();
        a.updated_at = Utc::now();
        Ok(PushResponse {
            version: a.version.clone(),
        })
    }

    async fn report_sync(&self, report: &SyncReport) -> Result<()> {
        self.calls.lock().push("report".into());
        self.reports.lock().push(report.clone());
        Ok(())
    }

    async fn register_machine(&self, request: &RegisterMachineRequest) -> Result<Machine> {
        Ok(Machine {
            id: "m-registered".into(),
            name: request.name.clone(),
            identifier: request.identifier.clone(),
            last_active_at: None,
        })
    }
}

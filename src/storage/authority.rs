//! Version authority: live asset content, version bumps and the
//! append-only history of superseded versions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::db::{owned_asset, owned_machine, touch_machine, AssetRow, Database};
use super::ledger::{upsert_sync_state, SyncStamp};
use super::{StoreError, StoreResult};
use crate::api::{
    AssetContent, AssetVersionView, CreateAssetRequest, CreatedAsset, PublishRequest, PushRequest,
    StorageType, SyncDirection,
};
use crate::hash::is_valid_hash;
use crate::version::{bump_patch, Version, INITIAL_VERSION};

/// Copy the asset's current version into history before it is overwritten.
/// Re-snapshotting an existing version is a no-op.
fn snapshot(conn: &Connection, asset: &AssetRow, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO asset_versions (asset_id, version, content, changelog, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(asset_id, version) DO NOTHING",
        params![asset.id, asset.current_version, asset.content, asset.changelog, now],
    )?;
    Ok(())
}

fn parse_version(raw: &str) -> StoreResult<Version> {
    raw.parse()
        .map_err(|_| StoreError::Validation(format!("invalid version {raw:?}; expected MAJOR.MINOR.PATCH")))
}

impl Database {
    pub fn create_asset(&self, user_id: &str, request: &CreateAssetRequest) -> StoreResult<CreatedAsset> {
        let slug = request.slug.trim();
        if slug.is_empty() {
            return Err(StoreError::Validation("slug is required".into()));
        }
        if request.primary_file_name.trim().is_empty() {
            return Err(StoreError::Validation("primaryFileName is required".into()));
        }
        let version = match &request.version {
            Some(raw) => parse_version(raw)?.to_string(),
            None => INITIAL_VERSION.to_string(),
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn.lock();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM assets WHERE user_id = ?1 AND slug = ?2)",
            params![user_id, slug],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::Validation(format!("slug {slug:?} is already in use")));
        }

        conn.execute(
            "INSERT INTO assets (id, user_id, slug, name, current_version, content, storage_type,
                install_scope, primary_file_name, bundle_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                id,
                user_id,
                slug,
                request.name.as_deref().unwrap_or(slug),
                version,
                request.content,
                request.storage_type.as_str(),
                request.install_scope.as_str(),
                request.primary_file_name.trim(),
                request.bundle_url,
                now,
            ],
        )?;

        Ok(CreatedAsset {
            id,
            slug: slug.to_string(),
            current_version: version,
        })
    }

    /// Soft-delete; the asset disappears from manifests and rejects pushes
    pub fn delete_asset(&self, user_id: &str, asset_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        owned_asset(&conn, user_id, asset_id)?;
        conn.execute(
            "UPDATE assets SET deleted_at = ?1 WHERE id = ?2",
            params![Utc::now(), asset_id],
        )?;
        Ok(())
    }

    /// Current content and version. Read-only.
    pub fn asset_content(&self, user_id: &str, asset_id: &str) -> StoreResult<AssetContent> {
        let asset = owned_asset(&self.conn.lock(), user_id, asset_id)?;
        Ok(AssetContent {
            storage_type: asset.storage_type,
            content: match asset.storage_type {
                StorageType::Inline => Some(asset.content.unwrap_or_default()),
                StorageType::Bundle => None,
            },
            bundle_url: asset.bundle_url,
            version: asset.current_version,
            primary_file_name: asset.primary_file_name,
            updated_at: asset.updated_at,
        })
    }

    /// Accept pushed content: bump the patch version, snapshot the old
    /// version, overwrite the live content and record the push in the
    /// ledger, all in one transaction. Returns the new version.
    pub fn push_content(
        &self,
        user_id: &str,
        asset_id: &str,
        request: &PushRequest,
    ) -> StoreResult<String> {
        if !is_valid_hash(&request.local_hash) {
            return Err(StoreError::Validation(
                "localHash must be a hex SHA-256 digest".into(),
            ));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let asset = owned_asset(&tx, user_id, asset_id)?;
        if asset.storage_type != StorageType::Inline {
            return Err(StoreError::UnsupportedStorage(asset.storage_type));
        }
        let machine = owned_machine(&tx, user_id, &request.machine_id)?;
        let new_version = bump_patch(&asset.current_version)?;
        let now = Utc::now();

        snapshot(&tx, &asset, now)?;
        tx.execute(
            "UPDATE assets SET content = ?1, current_version = ?2, changelog = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                request.content,
                new_version,
                format!("Synced from {}", machine.name),
                now,
                asset.id,
            ],
        )?;
        upsert_sync_state(
            &tx,
            &SyncStamp {
                machine_id: &machine.id,
                asset_id: &asset.id,
                version: &new_version,
                local_hash: Some(&request.local_hash),
                install_path: None,
                direction: SyncDirection::Push,
                at: now,
            },
        )?;
        touch_machine(&tx, &machine.id, now)?;
        tx.commit()?;

        Ok(new_version)
    }

    /// Publish an explicit version, which must be greater than the current one.
    /// Content is kept unless the request carries new content.
    pub fn publish_version(
        &self,
        user_id: &str,
        asset_id: &str,
        request: &PublishRequest,
    ) -> StoreResult<String> {
        let requested = parse_version(&request.version)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let asset = owned_asset(&tx, user_id, asset_id)?;
        let current: Version = asset.current_version.parse()?;
        if requested <= current {
            return Err(StoreError::Validation(format!(
                "version {requested} must be greater than current {current}"
            )));
        }
        if request.content.is_some() && asset.storage_type != StorageType::Inline {
            return Err(StoreError::UnsupportedStorage(asset.storage_type));
        }

        let now = Utc::now();
        snapshot(&tx, &asset, now)?;
        tx.execute(
            "UPDATE assets SET content = COALESCE(?1, content), current_version = ?2,
                changelog = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                request.content,
                requested.to_string(),
                request.changelog,
                now,
                asset.id,
            ],
        )?;
        tx.commit()?;

        Ok(requested.to_string())
    }

    /// Every version of an asset, oldest first. Content is omitted.
    pub fn versions(&self, user_id: &str, asset_id: &str) -> StoreResult<Vec<AssetVersionView>> {
        let conn = self.conn.lock();
        let asset = owned_asset(&conn, user_id, asset_id)?;

        let mut stmt = conn.prepare(
            "SELECT version, changelog, created_at FROM asset_versions WHERE asset_id = ?1",
        )?;
        let mut versions = stmt
            .query_map(params![asset.id], |row| {
                Ok(AssetVersionView {
                    asset_id: asset.id.clone(),
                    version: row.get(0)?,
                    content: None,
                    changelog: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        versions.push(AssetVersionView {
            asset_id: asset.id.clone(),
            version: asset.current_version,
            content: None,
            changelog: asset.changelog,
            created_at: asset.updated_at,
        });
        versions.sort_by_key(|v| v.version.parse::<Version>().ok());
        Ok(versions)
    }

    /// Content of one version, current or historical
    pub fn version(&self, user_id: &str, asset_id: &str, version: &str) -> StoreResult<AssetVersionView> {
        let conn = self.conn.lock();
        let asset = owned_asset(&conn, user_id, asset_id)?;
        if asset.current_version == version {
            return Ok(AssetVersionView {
                asset_id: asset.id,
                version: asset.current_version,
                content: asset.content,
                changelog: asset.changelog,
                created_at: asset.updated_at,
            });
        }

        conn.query_row(
            "SELECT content, changelog, created_at FROM asset_versions
             WHERE asset_id = ?1 AND version = ?2",
            params![asset.id, version],
            |row| {
                Ok(AssetVersionView {
                    asset_id: asset.id.clone(),
                    version: version.to_string(),
                    content: row.get(0)?,
                    changelog: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("version {version} of asset {asset_id}")))
    }
}

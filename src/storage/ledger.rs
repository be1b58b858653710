//! Sync state ledger: what each machine last reconciled for each asset

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::db::{owned_asset, owned_machine, touch_machine, AssetRow, Database, ASSET_COLUMN_COUNT};
use super::{StoreError, StoreResult};
use crate::api::{ManifestAsset, SyncDirection, SyncManifest, SyncReport, SyncStateView};
use crate::hash::is_valid_hash;
use crate::version::Version;

pub(crate) struct SyncStamp<'a> {
    pub machine_id: &'a str,
    pub asset_id: &'a str,
    pub version: &'a str,
    pub local_hash: Option<&'a str>,
    pub install_path: Option<&'a str>,
    pub direction: SyncDirection,
    pub at: DateTime<Utc>,
}

/// Insert or update the ledger row for one (machine, asset) pair.
/// Fields the stamp leaves empty keep their previous value.
pub(crate) fn upsert_sync_state(conn: &Connection, stamp: &SyncStamp<'_>) -> StoreResult<()> {
    let (pushed_at, pulled_at) = match stamp.direction {
        SyncDirection::Push => (Some(stamp.at), None),
        SyncDirection::Pull => (None, Some(stamp.at)),
    };
    conn.execute(
        "INSERT INTO machine_sync_states
            (machine_id, asset_id, synced_version, local_hash, install_path,
             last_push_at, last_pull_at, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(machine_id, asset_id) DO UPDATE SET
            synced_version = excluded.synced_version,
            local_hash = COALESCE(excluded.local_hash, local_hash),
            install_path = COALESCE(excluded.install_path, install_path),
            last_push_at = COALESCE(excluded.last_push_at, last_push_at),
            last_pull_at = COALESCE(excluded.last_pull_at, last_pull_at),
            synced_at = excluded.synced_at",
        params![
            stamp.machine_id,
            stamp.asset_id,
            stamp.version,
            stamp.local_hash,
            stamp.install_path,
            pushed_at,
            pulled_at,
            stamp.at,
        ],
    )?;
    Ok(())
}

/// Ledger columns following the asset columns in a manifest row
fn sync_state_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<SyncStateView>> {
    let synced_version: Option<String> = row.get(offset)?;
    let Some(synced_version) = synced_version else {
        return Ok(None);
    };
    Ok(Some(SyncStateView {
        synced_version,
        local_hash: row.get(offset + 1)?,
        install_path: row.get(offset + 2)?,
        last_push_at: row.get(offset + 3)?,
        last_pull_at: row.get(offset + 4)?,
        synced_at: row.get(offset + 5)?,
    }))
}

fn manifest_asset(asset: AssetRow, sync_state: Option<SyncStateView>) -> ManifestAsset {
    ManifestAsset {
        id: asset.id,
        slug: asset.slug,
        name: asset.name,
        current_version: asset.current_version,
        storage_type: asset.storage_type,
        install_scope: asset.install_scope,
        primary_file_name: asset.primary_file_name,
        bundle_url: asset.bundle_url,
        updated_at: asset.updated_at,
        sync_state,
    }
}

impl Database {
    /// Record a sync the machine performed itself (a pull, or an
    /// out-of-band "mark as synced"). Idempotent.
    pub fn record_sync(&self, user_id: &str, report: &SyncReport) -> StoreResult<()> {
        if report.synced_version.parse::<Version>().is_err() {
            return Err(StoreError::Validation(format!(
                "invalid syncedVersion {:?}",
                report.synced_version
            )));
        }
        if let Some(hash) = &report.local_hash {
            if !is_valid_hash(hash) {
                return Err(StoreError::Validation(
                    "localHash must be a hex SHA-256 digest".into(),
                ));
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let machine = owned_machine(&tx, user_id, &report.machine_id)?;
        let asset = owned_asset(&tx, user_id, &report.asset_id)?;
        let now = Utc::now();

        upsert_sync_state(
            &tx,
            &SyncStamp {
                machine_id: &machine.id,
                asset_id: &asset.id,
                version: &report.synced_version,
                local_hash: report.local_hash.as_deref(),
                install_path: report.install_path.as_deref(),
                direction: report.direction,
                at: now,
            },
        )?;
        touch_machine(&tx, &machine.id, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Every visible asset plus this machine's ledger row for it
    pub fn manifest(&self, user_id: &str, machine_id: &str) -> StoreResult<SyncManifest> {
        let conn = self.conn.lock();
        let machine = owned_machine(&conn, user_id, machine_id)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {}, s.synced_version, s.local_hash, s.install_path,
                    s.last_push_at, s.last_pull_at, s.synced_at
             FROM assets a
             LEFT JOIN machine_sync_states s ON s.asset_id = a.id AND s.machine_id = ?2
             WHERE a.user_id = ?1 AND a.deleted_at IS NULL
             ORDER BY a.slug",
            super::db::ASSET_COLUMNS
        ))?;
        let assets = stmt
            .query_map(params![user_id, machine.id], |row| {
                let asset = AssetRow::from_row(row)?;
                let state = sync_state_from_row(row, ASSET_COLUMN_COUNT)?;
                Ok(manifest_asset(asset, state))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SyncManifest { machine, assets })
    }

    pub fn sync_state(
        &self,
        user_id: &str,
        machine_id: &str,
        asset_id: &str,
    ) -> StoreResult<Option<SyncStateView>> {
        let conn = self.conn.lock();
        owned_machine(&conn, user_id, machine_id)?;
        Ok(conn
            .query_row(
                "SELECT synced_version, local_hash, install_path, last_push_at, last_pull_at, synced_at
                 FROM machine_sync_states WHERE machine_id = ?1 AND asset_id = ?2",
                params![machine_id, asset_id],
                |row| sync_state_from_row(row, 0),
            )
            .optional()?
            .flatten())
    }
}

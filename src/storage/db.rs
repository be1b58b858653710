use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::{StoreError, StoreResult};
use crate::api::{InstallScope, Machine, RegisterMachineRequest, StorageType};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        api_token TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS machines (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        identifier TEXT NOT NULL,
        last_active_at TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(user_id, identifier)
    )",
    "CREATE TABLE IF NOT EXISTS assets (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        slug TEXT NOT NULL,
        name TEXT NOT NULL,
        current_version TEXT NOT NULL,
        content TEXT,
        changelog TEXT,
        storage_type TEXT NOT NULL,
        install_scope TEXT NOT NULL,
        primary_file_name TEXT NOT NULL,
        bundle_url TEXT,
        deleted_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(user_id, slug)
    )",
    "CREATE TABLE IF NOT EXISTS asset_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asset_id TEXT NOT NULL REFERENCES assets(id),
        version TEXT NOT NULL,
        content TEXT,
        changelog TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(asset_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS machine_sync_states (
        machine_id TEXT NOT NULL REFERENCES machines(id),
        asset_id TEXT NOT NULL REFERENCES assets(id),
        synced_version TEXT NOT NULL,
        local_hash TEXT,
        install_path TEXT,
        last_push_at TEXT,
        last_pull_at TEXT,
        synced_at TEXT NOT NULL,
        PRIMARY KEY(machine_id, asset_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_assets_user ON assets(user_id, slug)",
    "CREATE INDEX IF NOT EXISTS idx_sync_states_asset ON machine_sync_states(asset_id)",
];

/// Columns selected for an asset, in [`AssetRow::from_row`] order.
/// Queries alias the table as `a`.
pub(crate) const ASSET_COLUMNS: &str = "a.id, a.slug, a.name, a.current_version, a.content, \
     a.changelog, a.storage_type, a.install_scope, a.primary_file_name, a.bundle_url, a.updated_at";

pub(crate) const ASSET_COLUMN_COUNT: usize = 11;

#[derive(Debug, Clone)]
pub(crate) struct AssetRow {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub current_version: String,
    pub content: Option<String>,
    pub changelog: Option<String>,
    pub storage_type: StorageType,
    pub install_scope: InstallScope,
    pub primary_file_name: String,
    pub bundle_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AssetRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            current_version: row.get(3)?,
            content: row.get(4)?,
            changelog: row.get(5)?,
            storage_type: parse_column(row, 6)?,
            install_scope: parse_column(row, 7)?,
            primary_file_name: row.get(8)?,
            bundle_url: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

/// Read a text column through `FromStr`
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Asset owned by `user_id` and not deleted
pub(crate) fn owned_asset(conn: &Connection, user_id: &str, asset_id: &str) -> StoreResult<AssetRow> {
    conn.query_row(
        &format!(
            "SELECT {ASSET_COLUMNS} FROM assets a
             WHERE a.id = ?1 AND a.user_id = ?2 AND a.deleted_at IS NULL"
        ),
        params![asset_id, user_id],
        AssetRow::from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("asset {asset_id}")))
}

/// Fail unless `machine_id` is registered to `user_id`
pub(crate) fn owned_machine(conn: &Connection, user_id: &str, machine_id: &str) -> StoreResult<Machine> {
    conn.query_row(
        "SELECT id, name, identifier, last_active_at FROM machines WHERE id = ?1 AND user_id = ?2",
        params![machine_id, user_id],
        machine_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("machine {machine_id}")))
}

pub(crate) fn touch_machine(conn: &Connection, machine_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "UPDATE machines SET last_active_at = ?1 WHERE id = ?2",
        params![now, machine_id],
    )?;
    Ok(())
}

fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<Machine> {
    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        identifier: row.get(2)?,
        last_active_at: row.get(3)?,
    })
}

#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file and make sure the schema exists
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        debug!("Opened database {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        for statement in SCHEMA {
            conn.execute(statement, [])?;
        }
        Ok(())
    }

    /// Make sure a user with `api_token` exists and return its id
    pub fn ensure_user(&self, api_token: &str) -> StoreResult<String> {
        if api_token.trim().is_empty() {
            return Err(StoreError::Validation("API token must not be empty".into()));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, api_token, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(api_token) DO NOTHING",
            params![uuid::Uuid::new_v4().to_string(), api_token, Utc::now()],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM users WHERE api_token = ?1",
            params![api_token],
            |row| row.get(0),
        )?)
    }

    /// Resolve a bearer token to a user id
    pub fn user_for_token(&self, api_token: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM users WHERE api_token = ?1",
                params![api_token],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Register a machine. Registering the same identifier again returns
    /// the existing machine with its name refreshed.
    pub fn register_machine(
        &self,
        user_id: &str,
        request: &RegisterMachineRequest,
    ) -> StoreResult<Machine> {
        let name = request.name.trim();
        let identifier = request.identifier.trim();
        if name.is_empty() || identifier.is_empty() {
            return Err(StoreError::Validation(
                "machine name and identifier are required".into(),
            ));
        }

        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO machines (id, user_id, name, identifier, last_active_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(user_id, identifier) DO UPDATE SET
                name = excluded.name,
                last_active_at = excluded.last_active_at",
            params![uuid::Uuid::new_v4().to_string(), user_id, name, identifier, now],
        )?;
        Ok(conn.query_row(
            "SELECT id, name, identifier, last_active_at FROM machines
             WHERE user_id = ?1 AND identifier = ?2",
            params![user_id, identifier],
            machine_from_row,
        )?)
    }

    pub fn machine(&self, user_id: &str, machine_id: &str) -> StoreResult<Machine> {
        owned_machine(&self.conn.lock(), user_id, machine_id)
    }
}

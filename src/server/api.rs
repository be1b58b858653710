use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use super::auth::Principal;
use super::error::ApiError;
use super::AppState;
use crate::api::{
    Ack, AssetContent, AssetVersionView, CreateAssetRequest, CreatedAsset, Machine,
    PublishRequest, PushRequest, PushResponse, RegisterMachineRequest, SyncManifest, SyncReport,
};
use crate::storage::{Database, StoreResult};

/// Run a storage call off the async runtime
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
}

fn limit(state: &AppState, principal: &Principal, endpoint: &'static str) -> Result<(), ApiError> {
    state
        .limiter
        .check(&principal.user_id, endpoint)
        .map_err(|retry_after| ApiError::RateLimited { retry_after })
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestQuery {
    machine_id: Option<String>,
}

/// GET /api/v1/sync/manifest?machineId=
pub async fn manifest(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<ManifestQuery>,
) -> Result<Json<SyncManifest>, ApiError> {
    limit(&state, &principal, "manifest")?;
    let machine_id = query
        .machine_id
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::BadRequest("machineId is required".into()))?;
    let manifest = blocking(&state, move |db| db.manifest(&principal.user_id, &machine_id)).await?;
    Ok(Json(manifest))
}

/// GET /api/v1/assets/{id}/content
pub async fn get_content(
    State(state): State<AppState>,
    principal: Principal,
    Path(asset_id): Path<String>,
) -> Result<Json<AssetContent>, ApiError> {
    limit(&state, &principal, "content")?;
    let content = blocking(&state, move |db| db.asset_content(&principal.user_id, &asset_id)).await?;
    Ok(Json(content))
}

/// PUT /api/v1/assets/{id}/content
pub async fn push_content(
    State(state): State<AppState>,
    principal: Principal,
    Path(asset_id): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    limit(&state, &principal, "push")?;
    let id = asset_id.clone();
    let version = blocking(&state, move |db| {
        db.push_content(&principal.user_id, &id, &request)
    })
    .await?;
    info!("Accepted push for asset {} -> {}", asset_id, version);
    Ok(Json(PushResponse { version }))
}

/// POST /api/v1/sync/report
pub async fn report_sync(
    State(state): State<AppState>,
    principal: Principal,
    Json(report): Json<SyncReport>,
) -> Result<Json<Ack>, ApiError> {
    limit(&state, &principal, "report")?;
    blocking(&state, move |db| db.record_sync(&principal.user_id, &report)).await?;
    Ok(Json(Ack { success: true }))
}

/// POST /api/v1/machines
pub async fn register_machine(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<RegisterMachineRequest>,
) -> Result<Json<Machine>, ApiError> {
    limit(&state, &principal, "machines")?;
    let machine = blocking(&state, move |db| {
        db.register_machine(&principal.user_id, &request)
    })
    .await?;
    info!("Registered machine {} ({})", machine.name, machine.id);
    Ok(Json(machine))
}

/// POST /api/v1/assets
pub async fn create_asset(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<CreateAssetRequest>,
) -> Result<(StatusCode, Json<CreatedAsset>), ApiError> {
    limit(&state, &principal, "assets")?;
    let created = blocking(&state, move |db| db.create_asset(&principal.user_id, &request)).await?;
    info!("Created asset {} at {}", created.slug, created.current_version);
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /api/v1/assets/{id}
pub async fn delete_asset(
    State(state): State<AppState>,
    principal: Principal,
    Path(asset_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    limit(&state, &principal, "assets")?;
    blocking(&state, move |db| db.delete_asset(&principal.user_id, &asset_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/assets/{id}/versions
pub async fn list_versions(
    State(state): State<AppState>,
    principal: Principal,
    Path(asset_id): Path<String>,
) -> Result<Json<Vec<AssetVersionView>>, ApiError> {
    limit(&state, &principal, "versions")?;
    let versions = blocking(&state, move |db| db.versions(&principal.user_id, &asset_id)).await?;
    Ok(Json(versions))
}

/// POST /api/v1/assets/{id}/versions
pub async fn publish_version(
    State(state): State<AppState>,
    principal: Principal,
    Path(asset_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    limit(&state, &principal, "versions")?;
    let id = asset_id.clone();
    let version = blocking(&state, move |db| {
        db.publish_version(&principal.user_id, &id, &request)
    })
    .await?;
    info!("Published asset {} at {}", asset_id, version);
    Ok(Json(PushResponse { version }))
}

/// GET /api/v1/assets/{id}/versions/{version}
pub async fn get_version(
    State(state): State<AppState>,
    principal: Principal,
    Path((asset_id, version)): Path<(String, String)>,
) -> Result<Json<AssetVersionView>, ApiError> {
    limit(&state, &principal, "versions")?;
    let view = blocking(&state, move |db| {
        db.version(&principal.user_id, &asset_id, &version)
    })
    .await?;
    Ok(Json(view))
}

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use history_core::model::{BackupConfigSummary, ConfigBackupIdentifier, GroupSlug, SnapshotEntry};
use history_core::RestoreRequest;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_configs))
        .route("/scan", post(scan))
        .route("/{group}/{path}/{id}/backups", get(list_backups).delete(delete_all_backups))
        .route(
            "/{group}/{path}/{id}/backups/{filename}",
            get(get_backup).delete(delete_backup),
        )
        .route("/{group}/{path}/{id}/backups/{filename}/restore", post(restore_backup))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummaries {
    pub slug: GroupSlug,
    pub name: String,
    pub configs: Vec<BackupConfigSummary>,
}

async fn list_configs(State(state): State<Arc<AppState>>) -> Json<Vec<GroupSummaries>> {
    let mut summaries = state.engine.summaries().await;

    // Configured groups first, in configured order; groups that only exist in
    // the store (removed from the settings) follow by slug.
    let mut groups = Vec::new();
    for group in state.engine.groups() {
        let slug = group.slug();
        let configs = summaries.remove(&slug).unwrap_or_default();
        groups.push(GroupSummaries {
            name: group.name.clone(),
            slug,
            configs,
        });
    }
    groups.extend(summaries.into_iter().map(|(slug, configs)| GroupSummaries {
        name: slug.to_string(),
        slug,
        configs,
    }));

    Json(groups)
}

async fn scan(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let queued = state.engine.scan_all().await?;
    state.engine.flush().await?;
    Ok(Json(json!({ "queued": queued })))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path((group, path, id)): Path<(String, String, String)>,
) -> Result<Json<Vec<SnapshotEntry>>, AppError> {
    let entries = state
        .engine
        .list_snapshots(&GroupSlug::new(group), &ConfigBackupIdentifier::new(path, id))
        .await?;
    Ok(Json(entries))
}

async fn delete_all_backups(
    State(state): State<Arc<AppState>>,
    Path((group, path, id)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .engine
        .delete_all(&GroupSlug::new(group), &ConfigBackupIdentifier::new(path, id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path((group, path, id, filename)): Path<(String, String, String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let content = state
        .engine
        .read_snapshot(&GroupSlug::new(group), &ConfigBackupIdentifier::new(path, id), &filename)
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path((group, path, id, filename)): Path<(String, String, String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .engine
        .delete_snapshot(&GroupSlug::new(group), &ConfigBackupIdentifier::new(path, id), &filename)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path((group, path, id, filename)): Path<(String, String, String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let destination = state
        .engine
        .restore(RestoreRequest::new(GroupSlug::new(group), path, id, filename))
        .await?;
    tracing::info!(destination = %destination.display(), "Restore requested over HTTP");
    Ok(Json(json!({ "restored": destination })))
}

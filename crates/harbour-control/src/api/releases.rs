//! App, release group and deploy candidate endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::records::{AppRecord, DeployCandidateRecord, ReleaseGroupRecord};
use crate::release::{AppSpec, ReleaseGroupSpec};
use crate::types::{AppId, DeployCandidateId, ReleaseGroupId};

use super::{reject, ApiResult, AppState};

/// Request to add an app to a release group.
#[derive(Debug, Deserialize)]
pub struct AddAppRequest {
    /// App to add.
    pub app: AppId,
}

/// Store an app.
pub async fn upsert_app(
    State(state): State<AppState>,
    Json(spec): Json<AppSpec>,
) -> ApiResult<(StatusCode, Json<AppRecord>)> {
    let record = state
        .plane
        .releases()
        .upsert_app(spec)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Store a release group.
pub async fn upsert_release_group(
    State(state): State<AppState>,
    Json(spec): Json<ReleaseGroupSpec>,
) -> ApiResult<(StatusCode, Json<ReleaseGroupRecord>)> {
    let record = state
        .plane
        .releases()
        .upsert_release_group(spec)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Add an app to a release group.
pub async fn add_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<AddAppRequest>,
) -> ApiResult<Json<ReleaseGroupRecord>> {
    let record = state
        .plane
        .releases()
        .add_app(&ReleaseGroupId::new(name), &request.app)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

/// Take a deploy candidate from a release group and start its build.
pub async fn create_deploy_candidate(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<DeployCandidateRecord>)> {
    let group = ReleaseGroupId::new(name);
    info!(group = %group, "creating deploy candidate via API");

    let candidate = state
        .plane
        .releases()
        .create_deploy_candidate(&group)
        .await
        .map_err(reject)?;
    Ok((StatusCode::ACCEPTED, Json(candidate)))
}

/// List a release group's candidates.
pub async fn list_candidates(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<DeployCandidateRecord>>> {
    let candidates = state
        .plane
        .releases()
        .candidates_for_group(&ReleaseGroupId::new(name))
        .await
        .map_err(reject)?;
    Ok(Json(candidates))
}

/// Get a deploy candidate.
pub async fn get_candidate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeployCandidateRecord>> {
    let candidate = state
        .plane
        .releases()
        .deploy_candidate(&DeployCandidateId::new(id))
        .await
        .map_err(reject)?;
    Ok(Json(candidate))
}

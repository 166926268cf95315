//! Host registration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::records::{ProxyServerRecord, ServerRecord};
use crate::registry::{ProxyServerSpec, ServerSpec};
use crate::types::{HostStatus, ServerId};

use super::{reject, ApiResult, AppState};

/// Request to change a server's status.
#[derive(Debug, Deserialize)]
pub struct ServerStatusRequest {
    /// New status.
    pub status: HostStatus,
}

/// Register a proxy server.
pub async fn register_proxy_server(
    State(state): State<AppState>,
    Json(spec): Json<ProxyServerSpec>,
) -> ApiResult<(StatusCode, Json<ProxyServerRecord>)> {
    let record = state
        .plane
        .registry()
        .register_proxy_server(spec)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Register a server.
pub async fn register_server(
    State(state): State<AppState>,
    Json(spec): Json<ServerSpec>,
) -> ApiResult<(StatusCode, Json<ServerRecord>)> {
    let record = state
        .plane
        .registry()
        .register_server(spec)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// List servers.
pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerRecord>>> {
    let servers = state.plane.registry().servers().await.map_err(reject)?;
    Ok(Json(servers))
}

/// Get a server.
pub async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ServerRecord>> {
    let server = state
        .plane
        .registry()
        .server(&ServerId::new(name))
        .await
        .map_err(reject)?;
    Ok(Json(server))
}

/// Activate or deactivate a server.
pub async fn set_server_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ServerStatusRequest>,
) -> ApiResult<Json<ServerRecord>> {
    let id = ServerId::new(name);
    info!(server = %id, status = %request.status, "server status change via API");

    let registry = state.plane.registry();
    registry
        .set_server_status(&id, request.status)
        .await
        .map_err(reject)?;
    let server = registry.server(&id).await.map_err(reject)?;
    Ok(Json(server))
}
